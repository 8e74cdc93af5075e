use async_trait::async_trait;
use log::{debug, info, trace};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{Mutex, RwLock};

use crate::core::Node;
use crate::core::protocol::Response;
use crate::storage::{LogEntry, Operation, StateStore};
use crate::utils::{PdnError, Result};

use super::Acceptor;
use super::proposal::ProposalNumber;

/// What one acceptor has promised and accepted for one log index.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcceptorRecord {
    pub promised: Option<ProposalNumber>,
    pub accepted: Option<(ProposalNumber, Operation)>,
}

impl AcceptorRecord {
    /// Highest number this acceptor has promised or accepted.
    pub fn highest(&self) -> Option<ProposalNumber> {
        let accepted = self.accepted.as_ref().map(|(number, _)| *number);
        self.promised.max(accepted)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PrepareOutcome {
    Promised {
        accepted: Option<(ProposalNumber, Operation)>,
    },
    Rejected {
        highest: ProposalNumber,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcceptOutcome {
    Accepted,
    Rejected { highest: ProposalNumber },
}

/// Per-index acceptor state. Each index has its own lock; nothing is
/// serialized across indices. Indices that are committed locally are retired,
/// keeping only their highest round.
pub struct AcceptorState {
    slots: RwLock<HashMap<u64, Arc<Mutex<AcceptorRecord>>>>,
    retired_round: AtomicU64,
    store: Arc<dyn StateStore>,
}

impl AcceptorState {
    pub async fn restore(store: Arc<dyn StateStore>) -> Result<Self> {
        let slots: HashMap<u64, Arc<Mutex<AcceptorRecord>>> = store
            .load_acceptors()
            .await?
            .into_iter()
            .map(|(index, record)| (index, Arc::new(Mutex::new(record))))
            .collect();

        if !slots.is_empty() {
            info!("Restored acceptor state for {} indices", slots.len());
        }

        Ok(Self {
            slots: RwLock::new(slots),
            retired_round: AtomicU64::new(0),
            store,
        })
    }

    async fn slot(&self, index: u64) -> Arc<Mutex<AcceptorRecord>> {
        if let Some(slot) = self.slots.read().await.get(&index) {
            return slot.clone();
        }
        self.slots
            .write()
            .await
            .entry(index)
            .or_default()
            .clone()
    }

    /// Promise `number` if it beats everything seen at `index`. The promise is
    /// durable before this returns.
    pub async fn prepare(&self, index: u64, number: ProposalNumber) -> Result<PrepareOutcome> {
        let slot = self.slot(index).await;
        let mut record = slot.lock().await;

        if let Some(highest) = record.highest() {
            if number <= highest {
                trace!("index {}: reject prepare {} (seen {})", index, number, highest);
                return Ok(PrepareOutcome::Rejected { highest });
            }
        }

        let updated = AcceptorRecord {
            promised: Some(number),
            accepted: record.accepted.clone(),
        };
        self.store.save_acceptor(index, &updated).await?;
        *record = updated;

        debug!("index {}: promised {}", index, number);
        Ok(PrepareOutcome::Promised {
            accepted: record.accepted.clone(),
        })
    }

    /// Accept `(number, operation)` unless a higher number was promised.
    pub async fn accept(
        &self,
        index: u64,
        number: ProposalNumber,
        operation: Operation,
    ) -> Result<AcceptOutcome> {
        let slot = self.slot(index).await;
        let mut record = slot.lock().await;

        if let Some(highest) = record.highest() {
            if number < highest {
                trace!("index {}: reject accept {} (seen {})", index, number, highest);
                return Ok(AcceptOutcome::Rejected { highest });
            }
        }

        let updated = AcceptorRecord {
            promised: record.promised.max(Some(number)),
            accepted: Some((number, operation)),
        };
        self.store.save_acceptor(index, &updated).await?;
        *record = updated;

        debug!("index {}: accepted {}", index, number);
        Ok(AcceptOutcome::Accepted)
    }

    pub async fn record(&self, index: u64) -> Option<AcceptorRecord> {
        let slot = self.slots.read().await.get(&index).cloned()?;
        let record = slot.lock().await.clone();
        Some(record)
    }

    /// Forget the record of a committed index, in memory and on disk.
    pub async fn retire(&self, index: u64) -> Result<()> {
        let Some(slot) = self.slots.write().await.remove(&index) else {
            return Ok(());
        };
        if let Some(number) = slot.lock().await.highest() {
            self.retired_round.fetch_max(number.round, Ordering::SeqCst);
        }
        self.store.remove_acceptor(index).await?;
        trace!("index {}: acceptor record retired", index);
        Ok(())
    }

    /// Indices that still hold a record.
    pub async fn live_indices(&self) -> Vec<u64> {
        let mut indices: Vec<u64> = self.slots.read().await.keys().copied().collect();
        indices.sort_unstable();
        indices
    }

    /// Highest round seen at any index; seeds the proposer after a restart.
    pub async fn highest_round(&self) -> u64 {
        let slots: Vec<_> = self.slots.read().await.values().cloned().collect();
        let mut highest = self.retired_round.load(Ordering::SeqCst);
        for slot in slots {
            if let Some(number) = slot.lock().await.highest() {
                highest = highest.max(number.round);
            }
        }
        highest
    }
}

impl Node {
    /// A learn may commit and retire `index` while an acceptor call runs, in
    /// which case the call worked on a fresh record and its answer is void.
    async fn committed_meanwhile(&self, index: u64) -> Result<Option<LogEntry>> {
        match self.log.get(index).await {
            Some(entry) => {
                self.acceptor.retire(index).await?;
                Ok(Some(entry))
            }
            None => Ok(None),
        }
    }
}

#[async_trait]
impl Acceptor for Node {
    async fn on_prepare(&self, index: u64, proposal: ProposalNumber) -> Result<Response> {
        if self.is_faulted() {
            return Err(PdnError::Faulted);
        }
        if let Some(entry) = self.log.get(index).await {
            return Ok(Response::AlreadyCommitted { entry });
        }

        self.proposer.observe(proposal);
        let outcome = self.acceptor.prepare(index, proposal).await?;
        if let Some(entry) = self.committed_meanwhile(index).await? {
            return Ok(Response::AlreadyCommitted { entry });
        }
        Ok(match outcome {
            PrepareOutcome::Promised { accepted } => Response::Promise {
                index,
                proposal,
                accepted,
            },
            PrepareOutcome::Rejected { highest } => Response::Reject { index, highest },
        })
    }

    async fn on_accept(
        &self,
        index: u64,
        proposal: ProposalNumber,
        operation: Operation,
    ) -> Result<Response> {
        if self.is_faulted() {
            return Err(PdnError::Faulted);
        }
        if let Some(entry) = self.log.get(index).await {
            return Ok(Response::AlreadyCommitted { entry });
        }

        self.proposer.observe(proposal);
        let outcome = self.acceptor.accept(index, proposal, operation).await?;
        if let Some(entry) = self.committed_meanwhile(index).await? {
            return Ok(Response::AlreadyCommitted { entry });
        }
        Ok(match outcome {
            AcceptOutcome::Accepted => Response::Accepted { index, proposal },
            AcceptOutcome::Rejected { highest } => Response::Reject { index, highest },
        })
    }
}

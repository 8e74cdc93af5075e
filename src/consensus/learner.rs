use async_trait::async_trait;
use log::{debug, error, info, warn};
use std::sync::atomic::Ordering;
use tokio::time::timeout;

use crate::core::Node;
use crate::core::protocol::{Envelope, Request, Response};
use crate::storage::{AppendOutcome, LogEntry};
use crate::utils::Result;

use super::Learner;

impl Node {
    /// Append a committed entry and apply whatever became contiguous.
    /// Returns true when a gap still blocks application.
    pub(crate) async fn learn(&self, entry: LogEntry) -> Result<bool> {
        let index = entry.index;
        match self.log.append(entry).await {
            Ok(AppendOutcome::Appended) => self.metrics.record_entry_learned().await,
            Ok(AppendOutcome::Duplicate) => {}
            Err(e) => {
                if e.is_fatal() {
                    self.faulted.store(true, Ordering::SeqCst);
                    error!("Node {} stops proposing and accepting: {}", self.id(), e);
                }
                return Err(e);
            }
        }
        if let Err(e) = self.acceptor.retire(index).await {
            warn!("Could not retire acceptor state of index {}: {}", index, e);
        }

        let applied = self.log.apply_ready(&self.store).await;
        if !applied.is_empty() {
            self.metrics.record_entries_applied(applied.len() as u64).await;
        }
        Ok(self.log.has_gap().await)
    }

    /// Fetch missing committed entries from the other members until no one
    /// has anything new. Only one catch-up runs at a time.
    pub async fn catch_up(&self) -> usize {
        let Ok(_running) = self.catch_up_lock.try_lock() else {
            return 0;
        };

        let limit = self.config.consensus.catch_up_batch;
        let within = self.config.consensus.round_timeout();
        let peers: Vec<_> = self.membership.peers().collect();
        let start = self.log.next_index();

        loop {
            let from = self.log.next_index();
            let mut progressed = false;

            for peer in &peers {
                let envelope = Envelope::new(
                    Some(self.contact.clone()),
                    Request::FetchEntries { from, limit },
                );
                let entries = match timeout(within, self.transport.send(*peer, envelope)).await {
                    Ok(Ok(Response::Entries(entries))) => entries,
                    Ok(Ok(other)) => {
                        debug!("{} answered fetch with {:?}", peer, other);
                        continue;
                    }
                    Ok(Err(e)) => {
                        debug!("fetch from {} failed: {}", peer, e);
                        continue;
                    }
                    Err(_) => {
                        debug!("fetch from {} timed out", peer);
                        continue;
                    }
                };

                for entry in entries {
                    if let Err(e) = self.learn(entry).await {
                        warn!("Catch-up from {} stopped: {}", peer, e);
                        return (self.log.next_index() - start) as usize;
                    }
                }

                if self.log.next_index() > from {
                    progressed = true;
                    break;
                }
            }

            if !progressed {
                break;
            }
        }

        let caught_up = (self.log.next_index() - start) as usize;
        if caught_up > 0 {
            info!("Caught up {} entries, now at index {}", caught_up, self.log.next_index());
        }
        caught_up
    }
}

#[async_trait]
impl Learner for Node {
    async fn on_learn(&self, entry: LogEntry) -> Result<Response> {
        let index = entry.index;
        if self.learn(entry).await? {
            debug!("gap below index {}, catching up", index);
            self.catch_up().await;
        }
        Ok(Response::Learned { index })
    }

    fn commit_index(&self) -> Option<u64> {
        self.log.applied_index()
    }
}

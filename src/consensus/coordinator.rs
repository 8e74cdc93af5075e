use async_trait::async_trait;
use log::{debug, info, warn};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::{Instant, sleep, timeout, timeout_at};

use crate::core::Node;
use crate::core::protocol::{Envelope, Request, Response};
use crate::storage::{LogEntry, Operation};
use crate::utils::{PdnError, Result};

use super::proposal::ProposalNumber;
use super::proposer::{Backoff, RoundPhase, choose_value};
use super::{Acceptor, Learner, Proposer};

type Reply = (SocketAddr, Result<Response>);

/// How the Prepare phase of one round ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PreparePhase {
    /// A majority promised; carries what each promise reported as accepted.
    Promised(Vec<Option<(ProposalNumber, Operation)>>),
    Rejected { highest: ProposalNumber },
    /// Some acceptor already holds the index as committed.
    Committed(LogEntry),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcceptPhase {
    Accepted,
    Rejected { highest: ProposalNumber },
    Committed(LogEntry),
}

impl Node {
    /// Send `request` to the membership. The local member, when included, is
    /// answered in place rather than through the transport.
    async fn fan_out(&self, request: Request, include_local: bool) -> JoinSet<Reply> {
        let mut replies = JoinSet::new();

        if include_local {
            let local = self.membership.local();
            let reply = self.answer_locally(&request).await;
            replies.spawn(async move { (local, reply) });
        }

        let within = self.config.consensus.round_timeout();
        for peer in self.membership.peers() {
            let transport = self.transport.clone();
            let envelope = Envelope::new(Some(self.contact.clone()), request.clone());
            replies.spawn(async move {
                let reply = match timeout(within, transport.send(peer, envelope)).await {
                    Ok(reply) => reply,
                    Err(_) => Err(PdnError::Timeout(peer.to_string())),
                };
                (peer, reply)
            });
        }
        replies
    }

    async fn answer_locally(&self, request: &Request) -> Result<Response> {
        match request {
            Request::Prepare { index, proposal } => self.on_prepare(*index, *proposal).await,
            Request::Accept {
                index,
                proposal,
                operation,
            } => self.on_accept(*index, *proposal, operation.clone()).await,
            Request::Learn { entry } => self.on_learn(entry.clone()).await,
            other => Err(PdnError::InvalidResponse(format!(
                "{} is not answered locally",
                other.kind()
            ))),
        }
    }

    async fn note_failure(&self, from: SocketAddr, phase: &str, error: &PdnError) {
        debug!("{} reply from {} failed: {}", phase, from, error);
        if matches!(error, PdnError::PeerUnreachable(_) | PdnError::Timeout(_)) {
            self.metrics.record_peer_unreachable().await;
        }
    }

    /// Phase 1 of one round. Returns as soon as the outcome is decided; the
    /// remaining requests are abandoned.
    pub async fn prepare_phase(&self, index: u64, number: ProposalNumber) -> Result<PreparePhase> {
        let mut replies = self
            .fan_out(Request::Prepare { index, proposal: number }, true)
            .await;
        let mut tracker = self.membership.tracker();
        let mut promises = Vec::new();
        let deadline = Instant::now() + self.config.consensus.round_timeout();

        loop {
            let joined = match timeout_at(deadline, replies.join_next()).await {
                Ok(Some(joined)) => joined,
                Ok(None) => break,
                Err(_) => {
                    debug!("index {}: prepare {} timed out", index, number);
                    break;
                }
            };
            let Ok((from, reply)) = joined else {
                continue;
            };

            match reply {
                Ok(Response::Promise {
                    index: promised_index,
                    proposal,
                    accepted,
                }) if promised_index == index && proposal == number => {
                    promises.push(accepted);
                    if tracker.grant(from) {
                        return Ok(PreparePhase::Promised(promises));
                    }
                }
                Ok(Response::Reject { highest, .. }) => {
                    self.proposer.observe(highest);
                    tracker.reject(from, highest);
                    if tracker.is_lost() {
                        break;
                    }
                }
                Ok(Response::AlreadyCommitted { entry }) if entry.index == index => {
                    return Ok(PreparePhase::Committed(entry));
                }
                Ok(other) => debug!("index {}: ignoring prepare reply {:?}", index, other),
                Err(e) => self.note_failure(from, "prepare", &e).await,
            }
        }

        match tracker.highest_rejection() {
            Some(highest) => Ok(PreparePhase::Rejected { highest }),
            None => Err(PdnError::QuorumNotReached(format!(
                "prepare {} for index {}: {}/{} promises",
                number,
                index,
                tracker.granted(),
                tracker.needed()
            ))),
        }
    }

    /// Phase 2 of one round.
    pub async fn accept_phase(
        &self,
        index: u64,
        number: ProposalNumber,
        operation: Operation,
    ) -> Result<AcceptPhase> {
        let request = Request::Accept {
            index,
            proposal: number,
            operation,
        };
        let mut replies = self.fan_out(request, true).await;
        let mut tracker = self.membership.tracker();
        let deadline = Instant::now() + self.config.consensus.round_timeout();

        loop {
            let joined = match timeout_at(deadline, replies.join_next()).await {
                Ok(Some(joined)) => joined,
                Ok(None) => break,
                Err(_) => {
                    debug!("index {}: accept {} timed out", index, number);
                    break;
                }
            };
            let Ok((from, reply)) = joined else {
                continue;
            };

            match reply {
                Ok(Response::Accepted {
                    index: accepted_index,
                    proposal,
                }) if accepted_index == index && proposal == number => {
                    if tracker.grant(from) {
                        return Ok(AcceptPhase::Accepted);
                    }
                }
                Ok(Response::Reject { highest, .. }) => {
                    self.proposer.observe(highest);
                    tracker.reject(from, highest);
                    if tracker.is_lost() {
                        break;
                    }
                }
                Ok(Response::AlreadyCommitted { entry }) if entry.index == index => {
                    return Ok(AcceptPhase::Committed(entry));
                }
                Ok(other) => debug!("index {}: ignoring accept reply {:?}", index, other),
                Err(e) => self.note_failure(from, "accept", &e).await,
            }
        }

        match tracker.highest_rejection() {
            Some(highest) => Ok(AcceptPhase::Rejected { highest }),
            None => Err(PdnError::QuorumNotReached(format!(
                "accept {} for index {}: {}/{} acceptances",
                number,
                index,
                tracker.granted(),
                tracker.needed()
            ))),
        }
    }

    /// Learn `entry` locally, then tell every other member.
    pub async fn commit(&self, entry: LogEntry) -> Result<()> {
        self.on_learn(entry.clone()).await?;

        let index = entry.index;
        let mut replies = self.fan_out(Request::Learn { entry }, false).await;
        while let Some(joined) = replies.join_next().await {
            match joined {
                Ok((_, Ok(Response::Learned { .. }))) => {}
                Ok((from, Ok(Response::Error(e)))) => {
                    warn!("{} refused index {}: {}", from, index, e)
                }
                Ok((from, Ok(other))) => debug!("{} answered learn with {:?}", from, other),
                Ok((from, Err(e))) => self.note_failure(from, "learn", &e).await,
                Err(e) => debug!("learn task failed: {}", e),
            }
        }
        Ok(())
    }

    /// One full round for `index`. Returns whatever got committed there,
    /// which may be another proposer's value.
    pub async fn run_round(&self, index: u64, operation: &Operation) -> Result<LogEntry> {
        let result = self.try_round(index, operation).await;
        let phase = if result.is_ok() {
            RoundPhase::Committed
        } else {
            RoundPhase::Idle
        };
        self.proposer.set_phase(index, phase).await;
        result
    }

    async fn try_round(&self, index: u64, operation: &Operation) -> Result<LogEntry> {
        let number = self.proposer.next_number();
        self.proposer.set_phase(index, RoundPhase::Prepared).await;
        debug!("index {}: prepare {}", index, number);

        let promises = match self.prepare_phase(index, number).await? {
            PreparePhase::Promised(promises) => promises,
            PreparePhase::Committed(entry) => {
                self.on_learn(entry.clone()).await?;
                return Ok(entry);
            }
            PreparePhase::Rejected { highest } => {
                return Err(PdnError::StaleProposal {
                    attempted: number,
                    highest,
                });
            }
        };
        self.proposer.set_phase(index, RoundPhase::PromisedQuorum).await;

        let (value, adopted) = choose_value(promises, operation.clone());
        if adopted {
            debug!("index {}: completing previously accepted {}", index, value);
        }

        match self.accept_phase(index, number, value.clone()).await? {
            AcceptPhase::Accepted => {}
            AcceptPhase::Committed(entry) => {
                self.on_learn(entry.clone()).await?;
                return Ok(entry);
            }
            AcceptPhase::Rejected { highest } => {
                return Err(PdnError::StaleProposal {
                    attempted: number,
                    highest,
                });
            }
        }
        self.proposer.set_phase(index, RoundPhase::AcceptedQuorum).await;

        let entry = LogEntry::new(index, number, value);
        self.commit(entry.clone()).await?;
        Ok(entry)
    }

    async fn next_free_index(&self) -> u64 {
        self.log.highest_index().await.map_or(0, |highest| highest + 1)
    }
}

#[async_trait]
impl Proposer for Node {
    async fn propose(&self, operation: Operation) -> Result<LogEntry> {
        if self.is_faulted() {
            return Err(PdnError::Faulted);
        }
        let _permit = self
            .proposals
            .acquire()
            .await
            .map_err(|e| PdnError::IoError(format!("proposal limiter closed: {}", e)))?;
        let _pending = self.proposer.begin();
        self.metrics.record_proposal_started().await;

        let consensus = &self.config.consensus;
        let mut backoff = Backoff::new(consensus.backoff_base(), consensus.backoff_max());
        let mut index = self.next_free_index().await;
        let mut failures = 0u32;

        loop {
            if self.is_faulted() {
                self.metrics.record_proposal_failed().await;
                return Err(PdnError::Faulted);
            }

            match self.run_round(index, &operation).await {
                Ok(entry) if entry.operation == operation => {
                    self.metrics.record_proposal_committed().await;
                    info!("Committed {} at index {}", operation, entry.index);
                    return Ok(entry);
                }
                Ok(entry) => {
                    debug!("index {} went to {}, moving on", entry.index, entry.operation);
                    index = (entry.index + 1).max(self.next_free_index().await);
                }
                Err(e) if e.is_transient() => {
                    failures += 1;
                    self.metrics.record_round_contended().await;
                    if failures > consensus.max_retries {
                        self.metrics.record_proposal_failed().await;
                        warn!(
                            "Giving up on {} after {} failed rounds: {}",
                            operation, failures, e
                        );
                        return Err(PdnError::QuorumNotReached(format!(
                            "index {}: {} failed rounds, last: {}",
                            index, failures, e
                        )));
                    }

                    let delay: Duration = backoff.next_delay();
                    debug!(
                        "index {}: round failed ({}), retry {} in {:?}",
                        index, e, failures, delay
                    );
                    sleep(delay).await;

                    // A competitor may have finished this index meanwhile,
                    // possibly with our own value.
                    if let Some(entry) = self.log.get(index).await {
                        if entry.operation == operation {
                            self.metrics.record_proposal_committed().await;
                            return Ok(entry);
                        }
                        index = (index + 1).max(self.next_free_index().await);
                    }
                }
                Err(e) => {
                    self.metrics.record_proposal_failed().await;
                    return Err(e);
                }
            }
        }
    }

    fn pending_proposals(&self) -> usize {
        self.proposer.pending()
    }
}

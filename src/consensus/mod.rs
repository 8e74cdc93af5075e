//! Multi-decree Paxos over the replicated log.
//!
//! Every node is proposer, acceptor and learner at once; each log index is
//! decided by an independent single-decree instance. Quorums are majorities
//! of the configured membership.

pub mod acceptor;
pub mod coordinator;
pub mod learner;
pub mod proposal;
pub mod proposer;
pub mod quorum;

use async_trait::async_trait;

use crate::core::protocol::Response;
use crate::storage::{LogEntry, Operation};
use crate::utils::Result;

pub use acceptor::{AcceptOutcome, AcceptorRecord, AcceptorState, PrepareOutcome};
pub use coordinator::{AcceptPhase, PreparePhase};
pub use proposal::ProposalNumber;
pub use proposer::{Backoff, ProposerState, RoundPhase, choose_value};
pub use quorum::{Membership, QuorumTracker, majority};

#[async_trait]
pub trait Proposer {
    /// Get `operation` committed at the next free index, retrying contended
    /// rounds within the configured budget.
    async fn propose(&self, operation: Operation) -> Result<LogEntry>;

    fn pending_proposals(&self) -> usize;
}

#[async_trait]
pub trait Acceptor {
    async fn on_prepare(&self, index: u64, proposal: ProposalNumber) -> Result<Response>;

    async fn on_accept(
        &self,
        index: u64,
        proposal: ProposalNumber,
        operation: Operation,
    ) -> Result<Response>;
}

#[async_trait]
pub trait Learner {
    async fn on_learn(&self, entry: LogEntry) -> Result<Response>;

    /// Highest index applied locally.
    fn commit_index(&self) -> Option<u64>;
}

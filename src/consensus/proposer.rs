use log::trace;
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;

use crate::network::dht::NodeId;
use crate::storage::Operation;

use super::proposal::ProposalNumber;

/// Where a proposer is with one log index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum RoundPhase {
    Idle,
    Prepared,
    PromisedQuorum,
    AcceptedQuorum,
    Committed,
}

/// Proposer-side bookkeeping: the round counter, in-flight proposals and
/// the phase reached per index.
pub struct ProposerState {
    id: NodeId,
    round: AtomicU64,
    pending: Arc<AtomicUsize>,
    phases: RwLock<HashMap<u64, RoundPhase>>,
}

impl ProposerState {
    /// `restored_round` is the highest round found in durable state, so a
    /// restarted proposer never reuses a number.
    pub fn new(id: NodeId, restored_round: u64) -> Self {
        Self {
            id,
            round: AtomicU64::new(restored_round),
            pending: Arc::new(AtomicUsize::new(0)),
            phases: RwLock::new(HashMap::new()),
        }
    }

    /// A number strictly above any this node has used or observed.
    pub fn next_number(&self) -> ProposalNumber {
        let round = self.round.fetch_add(1, Ordering::SeqCst) + 1;
        ProposalNumber::new(round, self.id)
    }

    /// Raise the round counter past a number seen from another proposer.
    pub fn observe(&self, number: ProposalNumber) {
        self.round.fetch_max(number.round, Ordering::SeqCst);
    }

    pub fn current_round(&self) -> u64 {
        self.round.load(Ordering::SeqCst)
    }

    pub fn begin(&self) -> PendingGuard {
        self.pending.fetch_add(1, Ordering::SeqCst);
        PendingGuard {
            pending: self.pending.clone(),
        }
    }

    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    pub async fn set_phase(&self, index: u64, phase: RoundPhase) {
        trace!("index {}: {:?}", index, phase);
        let mut phases = self.phases.write().await;
        match phase {
            RoundPhase::Idle | RoundPhase::Committed => {
                phases.remove(&index);
            }
            _ => {
                phases.insert(index, phase);
            }
        }
    }

    /// Indices with a round in progress and the phase each one reached.
    pub async fn in_flight(&self) -> Vec<(u64, RoundPhase)> {
        let mut rounds: Vec<_> = self
            .phases
            .read()
            .await
            .iter()
            .map(|(index, phase)| (*index, *phase))
            .collect();
        rounds.sort_by_key(|(index, _)| *index);
        rounds
    }
}

/// Decrements the pending-proposal count when dropped.
pub struct PendingGuard {
    pending: Arc<AtomicUsize>,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.pending.fetch_sub(1, Ordering::SeqCst);
    }
}

/// The value to send in Accept: the highest-numbered value any promise
/// reported, else `own`. The flag tells whether `own` was displaced.
pub fn choose_value(
    promises: impl IntoIterator<Item = Option<(ProposalNumber, Operation)>>,
    own: Operation,
) -> (Operation, bool) {
    promises
        .into_iter()
        .flatten()
        .max_by_key(|(number, _)| *number)
        .map(|(_, operation)| {
            let adopted = operation != own;
            (operation, adopted)
        })
        .unwrap_or((own, false))
}

/// Capped exponential backoff with jitter in `[delay / 2, delay]`.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
            attempt: 0,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let factor = 1u32.checked_shl(self.attempt.min(16)).unwrap_or(u32::MAX);
        let delay = self.base.saturating_mul(factor).min(self.max);
        self.attempt = self.attempt.saturating_add(1);

        let ceiling = delay.as_millis() as u64;
        let floor = ceiling / 2;
        if ceiling == 0 {
            return delay;
        }
        Duration::from_millis(rand::thread_rng().gen_range(floor..=ceiling))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Key;

    fn op(value: &str) -> Operation {
        Operation::store(Key::from_name("k"), value.as_bytes().to_vec())
    }

    #[test]
    fn test_next_number_exceeds_observed() {
        let proposer = ProposerState::new(NodeId::from_name("a"), 0);
        assert_eq!(proposer.next_number().round, 1);

        proposer.observe(ProposalNumber::new(2, NodeId::from_name("b")));
        let next = proposer.next_number();
        assert_eq!(next.round, 3);
        assert!(next > ProposalNumber::new(2, NodeId::from_name("b")));

        // Observing something older never lowers the counter.
        proposer.observe(ProposalNumber::new(1, NodeId::from_name("b")));
        assert_eq!(proposer.next_number().round, 4);
    }

    #[test]
    fn test_restored_round_is_not_reused() {
        let proposer = ProposerState::new(NodeId::from_name("a"), 7);
        assert_eq!(proposer.current_round(), 7);
        assert_eq!(proposer.next_number().round, 8);
        assert_eq!(proposer.current_round(), 8);
    }

    #[test]
    fn test_pending_guard() {
        let proposer = ProposerState::new(NodeId::from_name("a"), 0);
        let first = proposer.begin();
        let second = proposer.begin();
        assert_eq!(proposer.pending(), 2);
        drop(first);
        drop(second);
        assert_eq!(proposer.pending(), 0);
    }

    #[test]
    fn test_choose_value_adopts_highest_accepted() {
        let low = ProposalNumber::new(1, NodeId::from_name("a"));
        let high = ProposalNumber::new(4, NodeId::from_name("b"));

        let (value, adopted) =
            choose_value(vec![None, Some((low, op("A"))), Some((high, op("B")))], op("C"));
        assert_eq!(value, op("B"));
        assert!(adopted);

        let (value, adopted) = choose_value(vec![None, None], op("C"));
        assert_eq!(value, op("C"));
        assert!(!adopted);
    }

    #[tokio::test]
    async fn test_phase_tracking() {
        let proposer = ProposerState::new(NodeId::from_name("a"), 0);
        proposer.set_phase(3, RoundPhase::PromisedQuorum).await;
        proposer.set_phase(1, RoundPhase::Prepared).await;
        assert_eq!(
            proposer.in_flight().await,
            vec![(1, RoundPhase::Prepared), (3, RoundPhase::PromisedQuorum)]
        );
        proposer.set_phase(3, RoundPhase::Committed).await;
        proposer.set_phase(1, RoundPhase::Idle).await;
        assert!(proposer.in_flight().await.is_empty());
    }

    #[test]
    fn test_backoff_is_capped() {
        let mut backoff = Backoff::new(Duration::from_millis(10), Duration::from_millis(80));
        let delays: Vec<Duration> = (0..8).map(|_| backoff.next_delay()).collect();

        assert!(delays[0] >= Duration::from_millis(5) && delays[0] <= Duration::from_millis(10));
        assert!(delays.iter().all(|d| *d <= Duration::from_millis(80)));
        assert!(delays[7] >= Duration::from_millis(40));
    }
}

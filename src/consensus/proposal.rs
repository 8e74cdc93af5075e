use serde::{Deserialize, Serialize};
use std::fmt;

use crate::network::dht::NodeId;

/// Orders competing rounds: by `round`, then by proposer id.
///
/// Field order matters, the derived `Ord` is lexicographic over it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ProposalNumber {
    pub round: u64,
    pub proposer: NodeId,
}

impl ProposalNumber {
    pub fn new(round: u64, proposer: NodeId) -> Self {
        Self { round, proposer }
    }
}

impl fmt::Display for ProposalNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.round, self.proposer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::ID_LEN;

    #[test]
    fn test_round_dominates_proposer() {
        let low_id = NodeId::new([0x00; ID_LEN]);
        let high_id = NodeId::new([0xFF; ID_LEN]);

        assert!(ProposalNumber::new(2, low_id) > ProposalNumber::new(1, high_id));
        assert!(ProposalNumber::new(1, high_id) > ProposalNumber::new(1, low_id));
        assert_eq!(ProposalNumber::new(1, low_id), ProposalNumber::new(1, low_id));
    }
}

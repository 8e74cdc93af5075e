use thiserror::Error;

use crate::consensus::ProposalNumber;

pub type Result<T> = std::result::Result<T, PdnError>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PdnError {
    #[error("I/O error: {0}")]
    IoError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Peer unreachable: {0}")]
    PeerUnreachable(String),

    #[error("Request to {0} timed out")]
    Timeout(String),

    #[error("Quorum not reached: {0}")]
    QuorumNotReached(String),

    #[error("Proposal {attempted} superseded by {highest}")]
    StaleProposal {
        attempted: ProposalNumber,
        highest: ProposalNumber,
    },

    #[error("Index {index} already committed with different content")]
    LogConflict { index: u64 },

    #[error("Key not found: {0}")]
    KeyNotFound(String),

    #[error("Store failed on key {key}: {acks}/{needed} acknowledgements")]
    StoreFailed {
        key: String,
        acks: usize,
        needed: usize,
    },

    #[error("Stale read: applied index {applied:?} is below required {required}")]
    StaleRead { applied: Option<u64>, required: u64 },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Message too large: {0} bytes")]
    MessageTooLarge(usize),

    #[error("Node halted after a log conflict")]
    Faulted,

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl PdnError {
    /// Errors the layer above is expected to absorb by retrying.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            PdnError::PeerUnreachable(_)
                | PdnError::Timeout(_)
                | PdnError::QuorumNotReached(_)
                | PdnError::StaleProposal { .. }
        )
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, PdnError::LogConflict { .. } | PdnError::Faulted)
    }
}

impl From<std::io::Error> for PdnError {
    fn from(err: std::io::Error) -> Self {
        PdnError::IoError(err.to_string())
    }
}

impl From<serde_json::Error> for PdnError {
    fn from(err: serde_json::Error) -> Self {
        PdnError::SerializationError(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert!(PdnError::PeerUnreachable("10.0.0.1:7400".into()).is_transient());
        assert!(PdnError::QuorumNotReached("index 3".into()).is_transient());
        assert!(!PdnError::LogConflict { index: 3 }.is_transient());
        assert!(PdnError::LogConflict { index: 3 }.is_fatal());
        assert!(!PdnError::KeyNotFound("k1".into()).is_fatal());
    }

    #[test]
    fn test_io_conversion() {
        let err: PdnError = std::io::Error::new(std::io::ErrorKind::Other, "disk gone").into();
        assert!(matches!(err, PdnError::IoError(msg) if msg.contains("disk gone")));
    }
}

use serde::{Deserialize, Serialize};

use crate::consensus::ProposalNumber;
use crate::core::node::{NodeStatus, PutReceipt};
use crate::network::dht::{Contact, DhtRequest, DhtResponse};
use crate::storage::{Key, LogEntry, LogicalAddress, Operation, StoredValue};

/// One inbound message. `from` is the sender's listening contact; clients
/// that are not part of the network leave it empty.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub from: Option<Contact>,
    /// Milliseconds since the Unix epoch, sender's clock.
    pub sent_at: i64,
    pub request: Request,
}

impl Envelope {
    pub fn new(from: Option<Contact>, request: Request) -> Self {
        Self {
            from,
            sent_at: chrono::Utc::now().timestamp_millis(),
            request,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Request {
    Dht(DhtRequest),
    Prepare {
        index: u64,
        proposal: ProposalNumber,
    },
    Accept {
        index: u64,
        proposal: ProposalNumber,
        operation: Operation,
    },
    Learn {
        entry: LogEntry,
    },
    /// Committed entries from `from` onwards, for a learner that fell behind.
    FetchEntries {
        from: u64,
        limit: usize,
    },
    Client(ClientRequest),
}

impl Request {
    pub fn kind(&self) -> &'static str {
        match self {
            Request::Dht(_) => "dht",
            Request::Prepare { .. } => "prepare",
            Request::Accept { .. } => "accept",
            Request::Learn { .. } => "learn",
            Request::FetchEntries { .. } => "fetch_entries",
            Request::Client(_) => "client",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Response {
    Dht(DhtResponse),
    Promise {
        index: u64,
        proposal: ProposalNumber,
        accepted: Option<(ProposalNumber, Operation)>,
    },
    Accepted {
        index: u64,
        proposal: ProposalNumber,
    },
    Reject {
        index: u64,
        highest: ProposalNumber,
    },
    /// The index is already decided; the proposer should learn it and move on.
    AlreadyCommitted {
        entry: LogEntry,
    },
    Learned {
        index: u64,
    },
    Entries(Vec<LogEntry>),
    Client(ClientResponse),
    Error(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ClientRequest {
    Put {
        address: LogicalAddress,
        #[serde(with = "hex::serde")]
        payload: Vec<u8>,
    },
    PutNamed {
        name: String,
        #[serde(with = "hex::serde")]
        payload: Vec<u8>,
    },
    Get {
        key: Key,
        min_index: Option<u64>,
    },
    Delete {
        key: Key,
    },
    Status,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ClientResponse {
    Committed(PutReceipt),
    Value(StoredValue),
    NotFound(Key),
    Status(Box<NodeStatus>),
    Failed(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::dht::NodeId;

    #[test]
    fn test_envelope_wire_format() {
        let entry = LogEntry::new(
            4,
            ProposalNumber::new(2, NodeId::from_name("a")),
            Operation::store(Key::from_name("k1"), b"v1".to_vec()),
        );
        let envelope = Envelope::new(None, Request::Learn { entry: entry.clone() });

        let bytes = serde_json::to_vec(&envelope).unwrap();
        let decoded: Envelope = serde_json::from_slice(&bytes).unwrap();

        assert!(decoded.from.is_none());
        assert_eq!(decoded.request.kind(), "learn");
        match decoded.request {
            Request::Learn { entry: decoded_entry } => assert_eq!(decoded_entry, entry),
            other => panic!("unexpected request: {:?}", other),
        }
    }
}

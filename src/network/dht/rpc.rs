use serde::{Deserialize, Serialize};

use crate::storage::{Key, Record};

use super::contact::Contact;
use super::node_id::NodeId;

/// DHT RPC requests. The sender travels in the enclosing envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DhtRequest {
    /// Ping - check if a node is alive
    Ping,

    /// FindNode - find K closest nodes to a target ID
    FindNode { target: NodeId },

    /// FindValue - the record for `key`, or closer nodes
    FindValue { key: Key },

    /// Store - push a replica
    Store { key: Key, record: Record },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DhtResponse {
    Pong { responder: Contact },

    Nodes(Vec<Contact>),

    /// `record` is set when the responder holds the key; `contacts` are its
    /// closest known nodes either way.
    Value {
        record: Option<Record>,
        contacts: Vec<Contact>,
    },

    /// `stored` is false when the responder already held a newer version.
    StoreAck { stored: bool },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::StoredValue;

    #[test]
    fn test_message_serialization() {
        let request = DhtRequest::Store {
            key: Key::from_name("k1"),
            record: Record::Value(StoredValue {
                payload: b"v1".to_vec(),
                version: 3,
            }),
        };

        let serialized = serde_json::to_vec(&request).unwrap();
        let deserialized: DhtRequest = serde_json::from_slice(&serialized).unwrap();

        match deserialized {
            DhtRequest::Store { key, record } => {
                assert_eq!(key, Key::from_name("k1"));
                assert_eq!(record.version(), 3);
            }
            other => panic!("unexpected request: {:?}", other),
        }
    }
}

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

use crate::consensus::ProposalNumber;
use crate::network::dht::NodeId;
use crate::utils::{CryptoUtils, ID_LEN};

/// DHT key. Lives in the same 160-bit space as node ids.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Key([u8; ID_LEN]);

impl Key {
    pub const fn new(bytes: [u8; ID_LEN]) -> Self {
        Self(bytes)
    }

    pub fn from_name(name: &str) -> Self {
        Self(CryptoUtils::digest_160(&[b"name", name.as_bytes()]))
    }

    /// Key for a (sender, recipient) conversation.
    pub fn for_address(address: &LogicalAddress) -> Self {
        Self(CryptoUtils::digest_160(&[
            b"address",
            address.sender.as_bytes(),
            address.recipient.as_bytes(),
        ]))
    }

    pub fn for_content(payload: &[u8]) -> Self {
        Self(CryptoUtils::digest_160(&[b"content", payload]))
    }

    /// The point in id space whose closest nodes hold this key.
    pub fn target(&self) -> NodeId {
        NodeId::new(self.0)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        CryptoUtils::parse_id_hex(s).map(Self)
    }
}

impl Serialize for Key {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Key {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Key({}...)", &self.to_hex()[..8])
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", &self.to_hex()[..8])
    }
}

/// User-level address of a message stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LogicalAddress {
    pub sender: String,
    pub recipient: String,
}

impl LogicalAddress {
    pub fn new(sender: impl Into<String>, recipient: impl Into<String>) -> Self {
        Self {
            sender: sender.into(),
            recipient: recipient.into(),
        }
    }

    pub fn key(&self) -> Key {
        Key::for_address(self)
    }
}

/// A payload together with the log index that wrote it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredValue {
    #[serde(with = "hex::serde")]
    pub payload: Vec<u8>,
    pub version: u64,
}

/// What a node holds for a key. Deletes leave a tombstone so that an older
/// replica push cannot resurrect the value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Record {
    Value(StoredValue),
    Tombstone { version: u64 },
}

impl Record {
    pub fn version(&self) -> u64 {
        match self {
            Record::Value(value) => value.version,
            Record::Tombstone { version } => *version,
        }
    }

    pub fn value(&self) -> Option<&StoredValue> {
        match self {
            Record::Value(value) => Some(value),
            Record::Tombstone { .. } => None,
        }
    }
}

/// A DHT mutation ordered by the replicated log.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operation {
    Store {
        key: Key,
        #[serde(with = "hex::serde")]
        payload: Vec<u8>,
    },
    Delete {
        key: Key,
    },
}

impl Operation {
    pub fn store(key: Key, payload: impl Into<Vec<u8>>) -> Self {
        Operation::Store {
            key,
            payload: payload.into(),
        }
    }

    pub fn delete(key: Key) -> Self {
        Operation::Delete { key }
    }

    pub fn key(&self) -> Key {
        match self {
            Operation::Store { key, .. } | Operation::Delete { key } => *key,
        }
    }

    /// The record this operation leaves behind when applied at `index`.
    pub fn record_at(&self, index: u64) -> Record {
        match self {
            Operation::Store { payload, .. } => Record::Value(StoredValue {
                payload: payload.clone(),
                version: index,
            }),
            Operation::Delete { .. } => Record::Tombstone { version: index },
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Store { key, payload } => write!(f, "Store({}, {} bytes)", key, payload.len()),
            Operation::Delete { key } => write!(f, "Delete({})", key),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub index: u64,
    pub proposal: ProposalNumber,
    pub operation: Operation,
}

impl LogEntry {
    pub fn new(index: u64, proposal: ProposalNumber, operation: Operation) -> Self {
        Self {
            index,
            proposal,
            operation,
        }
    }

    /// Two learners can see the same chosen value under different proposal
    /// numbers, so only the operation decides whether entries agree.
    pub fn same_content(&self, other: &LogEntry) -> bool {
        self.index == other.index && self.operation == other.operation
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_derivation_is_deterministic() {
        let address = LogicalAddress::new("alice", "bob");
        assert_eq!(address.key(), Key::for_address(&LogicalAddress::new("alice", "bob")));
        assert_ne!(address.key(), LogicalAddress::new("bob", "alice").key());
        assert_ne!(Key::from_name("k1"), Key::from_name("k2"));
        assert_ne!(Key::from_name("k1"), Key::for_content(b"k1"));
    }

    #[test]
    fn test_operation_records() {
        let key = Key::from_name("k1");
        let store = Operation::store(key, b"v1".to_vec());
        assert_eq!(
            store.record_at(4),
            Record::Value(StoredValue {
                payload: b"v1".to_vec(),
                version: 4
            })
        );
        assert_eq!(Operation::delete(key).record_at(5), Record::Tombstone { version: 5 });
        assert_eq!(Operation::delete(key).record_at(5).value(), None);
    }

    #[test]
    fn test_entry_json_uses_hex() {
        let entry = LogEntry::new(
            0,
            ProposalNumber::new(1, NodeId::from_name("a")),
            Operation::store(Key::from_name("k1"), b"v1".to_vec()),
        );
        let json = serde_json::to_string(&entry).unwrap();
        assert!(json.contains(&hex::encode(b"v1")));
        let back: LogEntry = serde_json::from_str(&json).unwrap();
        assert_eq!(back, entry);
    }
}

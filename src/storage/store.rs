use log::{debug, trace};
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;

use super::types::{Key, LogEntry, Record, StoredValue};

/// This node's shard of the DHT.
///
/// Reads reflect what has been applied here, which can trail the global
/// committed log. Read-your-writes holds only on the node that committed the
/// write; use a watermark read when a minimum log position is required.
pub struct DhtStore {
    records: RwLock<HashMap<Key, Record>>,
}

impl Default for DhtStore {
    fn default() -> Self {
        Self::new()
    }
}

impl DhtStore {
    pub fn new() -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
        }
    }

    /// Apply a committed entry. Higher index wins, so reapplying or applying
    /// after a newer replica push changes nothing.
    pub async fn apply(&self, entry: &LogEntry) {
        let record = entry.operation.record_at(entry.index);
        let key = entry.operation.key();
        if self.merge(key, record).await {
            trace!("applied index {} to key {}", entry.index, key);
        }
    }

    /// Accept a record pushed by a peer if it is newer than ours.
    pub async fn merge(&self, key: Key, record: Record) -> bool {
        let mut records = self.records.write().await;
        match records.get(&key) {
            Some(existing) if existing.version() >= record.version() => {
                debug!(
                    "kept version {} of {} over version {}",
                    existing.version(),
                    key,
                    record.version()
                );
                false
            }
            _ => {
                records.insert(key, record);
                true
            }
        }
    }

    pub async fn get(&self, key: &Key) -> Option<StoredValue> {
        self.records
            .read()
            .await
            .get(key)
            .and_then(|record| record.value().cloned())
    }

    pub async fn record(&self, key: &Key) -> Option<Record> {
        self.records.read().await.get(key).cloned()
    }

    /// Number of live (non-deleted) keys.
    pub async fn len(&self) -> usize {
        self.records
            .read()
            .await
            .values()
            .filter(|record| record.value().is_some())
            .count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn snapshot(&self) -> BTreeMap<Key, Record> {
        self.records
            .read()
            .await
            .iter()
            .map(|(key, record)| (*key, record.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::ProposalNumber;
    use crate::network::dht::NodeId;
    use crate::storage::Operation;

    fn entry(index: u64, operation: Operation) -> LogEntry {
        LogEntry::new(index, ProposalNumber::new(1, NodeId::from_name("p")), operation)
    }

    #[tokio::test]
    async fn test_store_then_delete() {
        let store = DhtStore::new();
        let key = Key::from_name("k1");

        store.apply(&entry(0, Operation::store(key, b"v1".to_vec()))).await;
        assert_eq!(store.get(&key).await.unwrap().payload, b"v1");
        assert_eq!(store.len().await, 1);

        store.apply(&entry(1, Operation::delete(key))).await;
        assert!(store.get(&key).await.is_none());
        assert!(store.is_empty().await);
        assert_eq!(store.record(&key).await, Some(Record::Tombstone { version: 1 }));
    }

    #[tokio::test]
    async fn test_last_committed_wins_by_index() {
        let store = DhtStore::new();
        let key = Key::from_name("k1");

        store.apply(&entry(5, Operation::store(key, b"new".to_vec()))).await;
        store.apply(&entry(2, Operation::store(key, b"old".to_vec()))).await;

        let value = store.get(&key).await.unwrap();
        assert_eq!(value.payload, b"new");
        assert_eq!(value.version, 5);
    }

    #[tokio::test]
    async fn test_tombstone_blocks_stale_replica() {
        let store = DhtStore::new();
        let key = Key::from_name("k1");
        store.apply(&entry(3, Operation::delete(key))).await;

        let stale = Record::Value(StoredValue {
            payload: b"zombie".to_vec(),
            version: 1,
        });
        assert!(!store.merge(key, stale).await);
        assert!(store.get(&key).await.is_none());
    }
}

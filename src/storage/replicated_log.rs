use log::{debug, error, info};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock, watch};

use crate::utils::{PdnError, Result};

use super::persistence::StateStore;
use super::store::DhtStore;
use super::types::LogEntry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    Appended,
    /// Same content was already committed at that index.
    Duplicate,
}

/// The replicated, append-only log of committed operations.
///
/// Entries may be known out of order (a Learn for index 7 can arrive before
/// index 5); application only ever advances through the gapless prefix.
pub struct ReplicatedLog {
    entries: RwLock<BTreeMap<u64, LogEntry>>,
    applied_tx: watch::Sender<Option<u64>>,
    // Single writer for the applied pointer.
    apply_lock: Mutex<()>,
    state: Arc<dyn StateStore>,
}

impl ReplicatedLog {
    /// Load committed entries from durable state. Nothing is applied yet;
    /// call [`apply_ready`](Self::apply_ready) to replay into a store.
    pub async fn restore(state: Arc<dyn StateStore>) -> Result<Self> {
        let entries: BTreeMap<u64, LogEntry> = state
            .load_entries()
            .await?
            .into_iter()
            .map(|entry| (entry.index, entry))
            .collect();

        if !entries.is_empty() {
            info!("Restored {} committed log entries", entries.len());
        }

        let (applied_tx, _) = watch::channel(None);
        Ok(Self {
            entries: RwLock::new(entries),
            applied_tx,
            apply_lock: Mutex::new(()),
            state,
        })
    }

    pub async fn append(&self, entry: LogEntry) -> Result<AppendOutcome> {
        let mut entries = self.entries.write().await;

        if let Some(existing) = entries.get(&entry.index) {
            if existing.same_content(&entry) {
                return Ok(AppendOutcome::Duplicate);
            }
            error!(
                "SAFETY VIOLATION: index {} holds {} (proposal {}) but {} (proposal {}) was also committed",
                entry.index, existing.operation, existing.proposal, entry.operation, entry.proposal
            );
            return Err(PdnError::LogConflict { index: entry.index });
        }

        self.state.save_entry(&entry).await?;
        debug!("committed index {}: {}", entry.index, entry.operation);
        entries.insert(entry.index, entry);
        Ok(AppendOutcome::Appended)
    }

    /// Apply every entry of the gapless prefix not applied yet, in index
    /// order, and return them.
    pub async fn apply_ready(&self, store: &DhtStore) -> Vec<LogEntry> {
        let _guard = self.apply_lock.lock().await;
        let mut applied = Vec::new();
        let mut next = self.next_index();

        loop {
            let entry = self.entries.read().await.get(&next).cloned();
            let Some(entry) = entry else {
                break;
            };
            store.apply(&entry).await;
            self.applied_tx.send_replace(Some(next));
            applied.push(entry);
            next += 1;
        }

        if let Some(last) = applied.last() {
            debug!("applied {} entries up to index {}", applied.len(), last.index);
        }
        applied
    }

    /// Highest index applied to the store, `None` before index 0.
    pub fn applied_index(&self) -> Option<u64> {
        *self.applied_tx.borrow()
    }

    /// First index not yet applied; also the first index a proposer may use.
    pub fn next_index(&self) -> u64 {
        self.applied_index().map_or(0, |index| index + 1)
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<u64>> {
        self.applied_tx.subscribe()
    }

    /// Wait until `index` has been applied locally.
    pub async fn wait_applied(&self, index: u64) {
        let mut rx = self.subscribe();
        // The sender lives as long as self, so this only ends by matching.
        let _ = rx
            .wait_for(|applied| applied.is_some_and(|done| done >= index))
            .await;
    }

    pub async fn get(&self, index: u64) -> Option<LogEntry> {
        self.entries.read().await.get(&index).cloned()
    }

    pub async fn entries_from(&self, from: u64, limit: usize) -> Vec<LogEntry> {
        self.entries
            .read()
            .await
            .range(from..)
            .take(limit)
            .map(|(_, entry)| entry.clone())
            .collect()
    }

    pub async fn highest_index(&self) -> Option<u64> {
        self.entries.read().await.keys().next_back().copied()
    }

    /// True when an entry beyond the applied prefix is known, meaning some
    /// index in between is missing.
    pub async fn has_gap(&self) -> bool {
        match self.highest_index().await {
            Some(highest) => highest >= self.next_index(),
            None => false,
        }
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::ProposalNumber;
    use crate::network::dht::NodeId;
    use crate::storage::{Key, MemoryStateStore, Operation};

    fn entry(index: u64, name: &str, value: &str) -> LogEntry {
        LogEntry::new(
            index,
            ProposalNumber::new(1, NodeId::from_name("p")),
            Operation::store(Key::from_name(name), value.as_bytes().to_vec()),
        )
    }

    async fn empty_log() -> ReplicatedLog {
        ReplicatedLog::restore(Arc::new(MemoryStateStore::new()))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_append_is_idempotent() {
        let log = empty_log().await;
        assert_eq!(log.append(entry(0, "k1", "v1")).await.unwrap(), AppendOutcome::Appended);

        // Same operation under a different proposal number is still the same entry.
        let mut again = entry(0, "k1", "v1");
        again.proposal = ProposalNumber::new(9, NodeId::from_name("q"));
        assert_eq!(log.append(again).await.unwrap(), AppendOutcome::Duplicate);
        assert_eq!(log.len().await, 1);
    }

    #[tokio::test]
    async fn test_conflicting_append_fails() {
        let log = empty_log().await;
        log.append(entry(0, "k1", "v1")).await.unwrap();

        let err = log.append(entry(0, "k1", "other")).await.unwrap_err();
        assert_eq!(err, PdnError::LogConflict { index: 0 });
        assert_eq!(log.get(0).await.unwrap().operation, entry(0, "k1", "v1").operation);
    }

    #[tokio::test]
    async fn test_gap_blocks_application() {
        let log = empty_log().await;
        let store = DhtStore::new();

        log.append(entry(0, "a", "1")).await.unwrap();
        log.append(entry(2, "c", "3")).await.unwrap();

        let applied = log.apply_ready(&store).await;
        assert_eq!(applied.len(), 1);
        assert_eq!(log.applied_index(), Some(0));
        assert!(log.has_gap().await);
        assert!(store.get(&Key::from_name("c")).await.is_none());

        log.append(entry(1, "b", "2")).await.unwrap();
        let applied = log.apply_ready(&store).await;
        assert_eq!(applied.iter().map(|e| e.index).collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(log.applied_index(), Some(2));
        assert!(!log.has_gap().await);
        assert!(store.get(&Key::from_name("c")).await.is_some());
    }

    #[tokio::test]
    async fn test_restore_replays_into_fresh_store() {
        let state: Arc<dyn StateStore> = Arc::new(MemoryStateStore::new());
        {
            let log = ReplicatedLog::restore(state.clone()).await.unwrap();
            log.append(entry(0, "k1", "v1")).await.unwrap();
            log.append(entry(1, "k1", "v2")).await.unwrap();
        }

        let log = ReplicatedLog::restore(state).await.unwrap();
        let store = DhtStore::new();
        assert_eq!(log.applied_index(), None);
        log.apply_ready(&store).await;

        assert_eq!(log.next_index(), 2);
        assert_eq!(store.get(&Key::from_name("k1")).await.unwrap().payload, b"v2");
    }

    #[tokio::test]
    async fn test_applying_entries_twice_matches_once() {
        let k1 = Key::from_name("k1");
        let entries = vec![
            entry(0, "k1", "v1"),
            entry(1, "k2", "x"),
            LogEntry::new(2, ProposalNumber::new(1, NodeId::from_name("p")), Operation::delete(k1)),
            entry(3, "k2", "y"),
        ];

        let once = DhtStore::new();
        for entry in &entries {
            once.apply(entry).await;
        }

        let twice = DhtStore::new();
        for entry in entries.iter().chain(&entries) {
            twice.apply(entry).await;
        }

        assert_eq!(once.snapshot().await, twice.snapshot().await);
        assert!(twice.get(&k1).await.is_none());
    }

    #[tokio::test]
    async fn test_wait_applied_wakes_up() {
        let log = Arc::new(empty_log().await);
        let store = Arc::new(DhtStore::new());

        let waiter = {
            let log = log.clone();
            tokio::spawn(async move { log.wait_applied(1).await })
        };

        log.append(entry(0, "a", "1")).await.unwrap();
        log.append(entry(1, "b", "2")).await.unwrap();
        log.apply_ready(&store).await;

        tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }
}

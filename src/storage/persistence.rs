//! Durable per-node state.
//!
//! What must survive a crash: the node id, every acceptor promise/accept per
//! log index, and the committed log. The DHT store itself is rebuilt by
//! replaying the log.
//!
//! Layout of [`FileStateStore`]:
//!
//! ```text
//! data_dir/
//!   node_id                 hex node id
//!   acceptor/<index>.json   AcceptorRecord
//!   log/<index>.json        LogEntry
//! ```

use async_trait::async_trait;
use log::{debug, info};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::fs as async_fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::consensus::AcceptorRecord;
use crate::network::dht::NodeId;
use crate::utils::{PdnError, Result};

use super::types::LogEntry;

#[async_trait]
pub trait StateStore: Send + Sync + 'static {
    async fn load_node_id(&self) -> Result<Option<NodeId>>;

    async fn save_node_id(&self, node_id: NodeId) -> Result<()>;

    /// Must be durable before the acceptor answers.
    async fn save_acceptor(&self, index: u64, record: &AcceptorRecord) -> Result<()>;

    async fn load_acceptors(&self) -> Result<BTreeMap<u64, AcceptorRecord>>;

    /// Drop the record of an index that is committed. Missing records are fine.
    async fn remove_acceptor(&self, index: u64) -> Result<()>;

    /// Must be durable before the entry is applied.
    async fn save_entry(&self, entry: &LogEntry) -> Result<()>;

    async fn load_entries(&self) -> Result<Vec<LogEntry>>;
}

pub struct FileStateStore {
    base_dir: PathBuf,
}

impl FileStateStore {
    pub async fn open(base_dir: impl Into<PathBuf>) -> Result<Self> {
        let base_dir = base_dir.into();

        for dir in [base_dir.join("acceptor"), base_dir.join("log")] {
            async_fs::create_dir_all(&dir).await.map_err(|e| {
                PdnError::IoError(format!("Failed to create {}: {}", dir.display(), e))
            })?;
        }

        info!("State store opened at: {:?}", base_dir);
        Ok(Self { base_dir })
    }

    fn indexed_path(&self, dir: &str, index: u64) -> PathBuf {
        self.base_dir.join(dir).join(format!("{:020}.json", index))
    }

    /// Write to a sibling temp file, fsync, then rename over the target.
    async fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
        let tmp = path.with_extension("tmp");

        let mut file = async_fs::File::create(&tmp)
            .await
            .map_err(|e| PdnError::IoError(format!("Failed to create {}: {}", tmp.display(), e)))?;
        file.write_all(data).await?;
        file.sync_all().await?;
        drop(file);

        async_fs::rename(&tmp, path)
            .await
            .map_err(|e| PdnError::IoError(format!("Failed to rename into {}: {}", path.display(), e)))?;
        Ok(())
    }

    async fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
        let data = serde_json::to_vec_pretty(value)?;
        Self::write_atomic(path, &data).await
    }

    async fn read_dir_json<T: DeserializeOwned>(&self, dir: &str) -> Result<Vec<T>> {
        let dir = self.base_dir.join(dir);
        let mut reader = async_fs::read_dir(&dir).await?;
        let mut paths = Vec::new();

        while let Some(item) = reader.next_entry().await? {
            let path = item.path();
            if path.extension().and_then(|ext| ext.to_str()) == Some("json") {
                paths.push(path);
            }
        }
        // Zero-padded names sort in index order.
        paths.sort();

        let mut values = Vec::with_capacity(paths.len());
        for path in paths {
            let data = async_fs::read(&path).await?;
            values.push(serde_json::from_slice(&data).map_err(|e| {
                PdnError::SerializationError(format!("{}: {}", path.display(), e))
            })?);
        }
        Ok(values)
    }
}

#[derive(serde::Deserialize)]
struct StoredAcceptor {
    index: u64,
    record: AcceptorRecord,
}

#[derive(Serialize)]
struct StoredAcceptorRef<'a> {
    index: u64,
    record: &'a AcceptorRecord,
}

#[async_trait]
impl StateStore for FileStateStore {
    async fn load_node_id(&self) -> Result<Option<NodeId>> {
        let path = self.base_dir.join("node_id");
        if !async_fs::try_exists(&path).await? {
            return Ok(None);
        }

        let text = async_fs::read_to_string(&path).await?;
        let node_id = NodeId::from_hex(text.trim())
            .map_err(|e| PdnError::SerializationError(format!("corrupt node_id file: {}", e)))?;
        Ok(Some(node_id))
    }

    async fn save_node_id(&self, node_id: NodeId) -> Result<()> {
        Self::write_atomic(&self.base_dir.join("node_id"), node_id.to_hex().as_bytes()).await
    }

    async fn save_acceptor(&self, index: u64, record: &AcceptorRecord) -> Result<()> {
        let path = self.indexed_path("acceptor", index);
        Self::write_json(&path, &StoredAcceptorRef { index, record }).await?;
        debug!("persisted acceptor state for index {}", index);
        Ok(())
    }

    async fn load_acceptors(&self) -> Result<BTreeMap<u64, AcceptorRecord>> {
        let stored: Vec<StoredAcceptor> = self.read_dir_json("acceptor").await?;
        Ok(stored.into_iter().map(|s| (s.index, s.record)).collect())
    }

    async fn remove_acceptor(&self, index: u64) -> Result<()> {
        let path = self.indexed_path("acceptor", index);
        match async_fs::remove_file(&path).await {
            Ok(()) => {
                debug!("removed acceptor state for index {}", index);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(PdnError::IoError(format!(
                "Failed to remove {}: {}",
                path.display(),
                e
            ))),
        }
    }

    async fn save_entry(&self, entry: &LogEntry) -> Result<()> {
        let path = self.indexed_path("log", entry.index);
        Self::write_json(&path, entry).await
    }

    async fn load_entries(&self) -> Result<Vec<LogEntry>> {
        self.read_dir_json("log").await
    }
}

/// Volatile state for ephemeral nodes and tests. Shared through an `Arc`, it
/// also survives a simulated restart of the node that owns it.
#[derive(Default)]
pub struct MemoryStateStore {
    inner: Mutex<MemoryState>,
}

#[derive(Default)]
struct MemoryState {
    node_id: Option<NodeId>,
    acceptors: BTreeMap<u64, AcceptorRecord>,
    entries: BTreeMap<u64, LogEntry>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn load_node_id(&self) -> Result<Option<NodeId>> {
        Ok(self.inner.lock().await.node_id)
    }

    async fn save_node_id(&self, node_id: NodeId) -> Result<()> {
        self.inner.lock().await.node_id = Some(node_id);
        Ok(())
    }

    async fn save_acceptor(&self, index: u64, record: &AcceptorRecord) -> Result<()> {
        self.inner
            .lock()
            .await
            .acceptors
            .insert(index, record.clone());
        Ok(())
    }

    async fn load_acceptors(&self) -> Result<BTreeMap<u64, AcceptorRecord>> {
        Ok(self.inner.lock().await.acceptors.clone())
    }

    async fn remove_acceptor(&self, index: u64) -> Result<()> {
        self.inner.lock().await.acceptors.remove(&index);
        Ok(())
    }

    async fn save_entry(&self, entry: &LogEntry) -> Result<()> {
        self.inner
            .lock()
            .await
            .entries
            .insert(entry.index, entry.clone());
        Ok(())
    }

    async fn load_entries(&self) -> Result<Vec<LogEntry>> {
        Ok(self.inner.lock().await.entries.values().cloned().collect())
    }
}

pub mod persistence;
pub mod replicated_log;
pub mod store;
pub mod types;

pub use persistence::{FileStateStore, MemoryStateStore, StateStore};
pub use replicated_log::{AppendOutcome, ReplicatedLog};
pub use store::DhtStore;
pub use types::{Key, LogEntry, LogicalAddress, Operation, Record, StoredValue};

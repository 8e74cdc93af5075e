//! Mini persistent, replicated messaging network.
//!
//! Nodes locate and store messages through a Kademlia-style DHT and agree on
//! one ordered history of store mutations through Paxos over a replicated log.

pub mod consensus;
pub mod core;
pub mod network;
pub mod storage;
pub mod testing;
pub mod utils;

// Re-export main types
pub use core::{Config, Node, NodeStatus, PutReceipt};
pub use network::{TcpTransport, Transport};
pub use storage::{Key, LogicalAddress, Operation, StoredValue};
pub use utils::error::{PdnError, Result};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

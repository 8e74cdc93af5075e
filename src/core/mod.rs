pub mod config;
pub mod node;
pub mod protocol;

pub use config::{Config, ConsensusConfig, DhtConfig};
pub use node::{Node, NodeStatus, PutReceipt};
pub use protocol::{ClientRequest, ClientResponse, Envelope, Request, Response};

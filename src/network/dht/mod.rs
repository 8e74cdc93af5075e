//! Kademlia-style DHT: XOR-distance routing, iterative lookup and replica
//! placement for message keys.

mod contact;
mod dht_node;
mod lookup;
mod node_id;
mod routing_table;
mod rpc;

pub use contact::Contact;
pub use dht_node::DhtNode;
pub use lookup::LookupState;
pub use node_id::{ID_BITS, NodeId};
pub use routing_table::{InsertOutcome, RoutingTable};
pub use rpc::{DhtRequest, DhtResponse};

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

use super::node_id::NodeId;

/// A peer known to the routing table.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Contact {
    pub node_id: NodeId,
    pub addr: SocketAddr,
}

impl Contact {
    pub fn new(node_id: NodeId, addr: SocketAddr) -> Self {
        Self { node_id, addr }
    }
}

// Identity is the node id; a peer that moved address is still the same peer.
impl PartialEq for Contact {
    fn eq(&self, other: &Self) -> bool {
        self.node_id == other.node_id
    }
}

impl Eq for Contact {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contact_creation() {
        let node_id = NodeId::random();
        let addr = "127.0.0.1:7400".parse().unwrap();
        let contact = Contact::new(node_id, addr);

        assert_eq!(contact.node_id, node_id);
        assert_eq!(contact.addr, addr);
    }

    #[test]
    fn test_moved_peer_is_same_contact() {
        let node_id = NodeId::random();
        let before = Contact::new(node_id, "127.0.0.1:7400".parse().unwrap());
        let after = Contact::new(node_id, "127.0.0.1:7401".parse().unwrap());

        assert_eq!(before, after);
        assert_ne!(before, Contact::new(NodeId::random(), before.addr));
    }
}

//! In-process network for tests: nodes are registered by address and
//! requests are dispatched to them directly, with injectable outages.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use tokio::sync::RwLock;

use crate::core::protocol::{Envelope, Response};
use crate::core::{Config, Node};
use crate::network::transport::{Dispatcher, Transport};
use crate::storage::{MemoryStateStore, StateStore};
use crate::utils::{PdnError, Result};

#[derive(Default)]
pub struct MemoryNetwork {
    nodes: RwLock<HashMap<SocketAddr, Weak<dyn Dispatcher>>>,
    down: RwLock<HashSet<SocketAddr>>,
}

impl MemoryNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn register(&self, addr: SocketAddr, dispatcher: Weak<dyn Dispatcher>) {
        self.nodes.write().await.insert(addr, dispatcher);
    }

    pub async fn register_node(&self, node: &Arc<Node>) {
        let dispatcher: Weak<dyn Dispatcher> = Arc::downgrade(node) as Weak<dyn Dispatcher>;
        self.register(node.contact().addr, dispatcher).await;
    }

    /// A down address neither receives nor sends.
    pub async fn set_down(&self, addr: SocketAddr, down: bool) {
        let mut set = self.down.write().await;
        if down {
            set.insert(addr);
        } else {
            set.remove(&addr);
        }
    }

    pub async fn is_down(&self, addr: &SocketAddr) -> bool {
        self.down.read().await.contains(addr)
    }
}

#[async_trait]
impl Transport for MemoryNetwork {
    async fn send(&self, to: SocketAddr, envelope: Envelope) -> Result<Response> {
        let sender_down = match &envelope.from {
            Some(from) => self.is_down(&from.addr).await,
            None => false,
        };
        if sender_down || self.is_down(&to).await {
            return Err(PdnError::PeerUnreachable(format!("{} is down", to)));
        }

        let target = self.nodes.read().await.get(&to).and_then(Weak::upgrade);
        let Some(dispatcher) = target else {
            return Err(PdnError::PeerUnreachable(format!("nothing registered at {}", to)));
        };

        // The handler runs on its own task, as it would on a remote host, so
        // an abandoned request does not cancel it halfway.
        tokio::spawn(async move { dispatcher.dispatch(envelope).await })
            .await
            .map_err(|e| PdnError::PeerUnreachable(format!("handler at {} failed: {}", to, e)))
    }
}

/// Address of the `i`-th test node.
pub fn test_addr(i: usize) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 17_400 + i as u16))
}

/// Config with timeouts short enough for tests.
pub fn test_config(i: usize, size: usize) -> Config {
    let mut config = Config {
        node_name: format!("node-{}", i),
        listen_addr: test_addr(i),
        members: (0..size).map(test_addr).collect(),
        ..Config::default()
    };
    config.dht.request_timeout_ms = 200;
    config.consensus.round_timeout_ms = 500;
    config.consensus.backoff_base_ms = 5;
    config.consensus.backoff_max_ms = 50;
    config
}

pub struct TestCluster {
    pub network: Arc<MemoryNetwork>,
    pub nodes: Vec<Arc<Node>>,
    pub states: Vec<Arc<dyn StateStore>>,
}

impl TestCluster {
    /// `size` fully meshed members with in-memory state, started.
    pub async fn start(size: usize) -> Result<Self> {
        let network = MemoryNetwork::new();
        let mut nodes = Vec::with_capacity(size);
        let mut states: Vec<Arc<dyn StateStore>> = Vec::with_capacity(size);

        for i in 0..size {
            let state: Arc<dyn StateStore> = Arc::new(MemoryStateStore::new());
            let node = Node::with_state(test_config(i, size), network.clone(), state.clone()).await?;
            network.register_node(&node).await;
            nodes.push(node);
            states.push(state);
        }
        for node in &nodes {
            node.start().await;
        }

        Ok(Self {
            network,
            nodes,
            states,
        })
    }

    pub fn node(&self, i: usize) -> &Arc<Node> {
        &self.nodes[i]
    }

    /// Replace node `i` with a fresh process over the same durable state.
    pub async fn restart(&mut self, i: usize) -> Result<Arc<Node>> {
        let size = self.nodes.len();
        let node = Node::with_state(
            test_config(i, size),
            self.network.clone(),
            self.states[i].clone(),
        )
        .await?;
        self.network.register_node(&node).await;
        self.nodes[i] = node.clone();
        Ok(node)
    }
}

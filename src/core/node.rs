use async_trait::async_trait;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::net::TcpListener;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout};

use crate::consensus::{
    Acceptor, AcceptorState, Learner, Membership, Proposer, ProposerState, RoundPhase,
};
use crate::core::config::Config;
use crate::core::protocol::{ClientRequest, ClientResponse, Envelope, Request, Response};
use crate::network::dht::{Contact, DhtNode, NodeId};
use crate::network::transport::{Dispatcher, TcpTransport, Transport};
use crate::storage::{
    DhtStore, FileStateStore, Key, LogicalAddress, MemoryStateStore, Operation, Record,
    ReplicatedLog, StateStore, StoredValue,
};
use crate::utils::{MetricsCollector, NodeMetrics, PdnError, Result};

/// What a successful write reports back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PutReceipt {
    pub key: Key,
    pub index: u64,
    /// DHT replicas that acknowledged the value beyond the committing node.
    pub replicas: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeStatus {
    pub node_id: NodeId,
    pub node_name: String,
    pub listen_addr: SocketAddr,
    pub routing_table_size: usize,
    pub commit_index: Option<u64>,
    pub highest_known_index: Option<u64>,
    pub pending_proposals: usize,
    /// Log indices this node is proposing for and the phase each reached.
    pub in_flight_rounds: Vec<(u64, RoundPhase)>,
    pub stored_keys: usize,
    pub members: Vec<SocketAddr>,
    pub faulted: bool,
    pub metrics: NodeMetrics,
}

/// A network member: DHT peer plus proposer, acceptor and learner of the
/// replicated log.
pub struct Node {
    pub(crate) config: Config,
    pub(crate) contact: Contact,
    pub(crate) membership: Membership,
    pub(crate) dht: Arc<DhtNode>,
    pub(crate) store: Arc<DhtStore>,
    pub(crate) log: ReplicatedLog,
    pub(crate) acceptor: AcceptorState,
    pub(crate) proposer: ProposerState,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) metrics: MetricsCollector,
    pub(crate) faulted: AtomicBool,
    pub(crate) proposals: Semaphore,
    pub(crate) catch_up_lock: Mutex<()>,
    inbound: Arc<Semaphore>,
}

impl Node {
    /// Open a node with durable state under `config.data_dir`, or in-memory
    /// state when none is configured.
    pub async fn open(config: Config, transport: Arc<dyn Transport>) -> Result<Arc<Self>> {
        let state: Arc<dyn StateStore> = match &config.data_dir {
            Some(dir) => Arc::new(FileStateStore::open(dir.clone()).await?),
            None => {
                warn!("No data_dir configured, state will not survive a restart");
                Arc::new(MemoryStateStore::new())
            }
        };
        Self::with_state(config, transport, state).await
    }

    /// Restore identity, acceptor promises and the committed log from
    /// `state`, and replay the log into the store, before the node answers
    /// anything.
    pub async fn with_state(
        config: Config,
        transport: Arc<dyn Transport>,
        state: Arc<dyn StateStore>,
    ) -> Result<Arc<Self>> {
        config.validate()?;

        let node_id = match state.load_node_id().await? {
            Some(node_id) => node_id,
            None => {
                let node_id = NodeId::random();
                state.save_node_id(node_id).await?;
                node_id
            }
        };
        let contact = Contact::new(node_id, config.listen_addr);
        let membership = Membership::new(config.listen_addr, config.members.iter().copied());

        let store = Arc::new(DhtStore::new());
        let log = ReplicatedLog::restore(state.clone()).await?;
        let replayed = log.apply_ready(&store).await;
        let acceptor = AcceptorState::restore(state.clone()).await?;
        for index in acceptor.live_indices().await {
            if log.get(index).await.is_some() {
                acceptor.retire(index).await?;
            }
        }

        let logged_round = log
            .entries_from(0, usize::MAX)
            .await
            .iter()
            .map(|entry| entry.proposal.round)
            .max()
            .unwrap_or(0);
        let proposer = ProposerState::new(node_id, acceptor.highest_round().await.max(logged_round));

        let metrics = MetricsCollector::new();
        let dht = Arc::new(DhtNode::new(
            contact.clone(),
            store.clone(),
            transport.clone(),
            config.dht.clone(),
            metrics.clone(),
        ));

        info!(
            "Node {} ({}) ready: {} members, {} entries replayed",
            node_id,
            config.node_name,
            membership.len(),
            replayed.len()
        );

        Ok(Arc::new(Self {
            proposals: Semaphore::new(config.max_pending_proposals),
            inbound: Arc::new(Semaphore::new(config.max_concurrent_requests)),
            config,
            contact,
            membership,
            dht,
            store,
            log,
            acceptor,
            proposer,
            transport,
            metrics,
            faulted: AtomicBool::new(false),
            catch_up_lock: Mutex::new(()),
        }))
    }

    pub fn id(&self) -> NodeId {
        self.contact.node_id
    }

    pub fn contact(&self) -> &Contact {
        &self.contact
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn membership(&self) -> &Membership {
        &self.membership
    }

    pub fn dht(&self) -> &Arc<DhtNode> {
        &self.dht
    }

    pub fn log(&self) -> &ReplicatedLog {
        &self.log
    }

    pub fn acceptor(&self) -> &AcceptorState {
        &self.acceptor
    }

    pub fn proposer(&self) -> &ProposerState {
        &self.proposer
    }

    pub fn metrics(&self) -> &MetricsCollector {
        &self.metrics
    }

    pub fn is_faulted(&self) -> bool {
        self.faulted.load(Ordering::SeqCst)
    }

    /// Join the DHT, catch up on the log and start periodic maintenance.
    pub async fn start(self: &Arc<Self>) {
        let mut seeds = self.config.bootstrap_peers.clone();
        seeds.extend(self.membership.peers());
        seeds.sort();
        seeds.dedup();

        for seed in seeds {
            if seed == self.contact.addr {
                continue;
            }
            if let Err(e) = self.dht.bootstrap(seed).await {
                warn!("Bootstrap via {} failed: {}", seed, e);
            }
        }

        self.catch_up().await;
        self.start_maintenance();
    }

    fn start_maintenance(self: &Arc<Self>) {
        let node: Weak<Self> = Arc::downgrade(self);
        let period = self.config.dht.refresh_interval();

        tokio::spawn(async move {
            let mut ticker = interval(period);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(node) = node.upgrade() else {
                    break;
                };
                node.maintain().await;
            }
        });
    }

    async fn maintain(&self) {
        self.dht.refresh().await;
        if self.log.has_gap().await {
            self.catch_up().await;
        }
        self.metrics.log_stats().await;
    }

    /// Serve inbound requests on `listener` in the background.
    pub fn serve(self: &Arc<Self>, listener: TcpListener) -> JoinHandle<()> {
        let dispatcher: Arc<dyn Dispatcher> = self.clone();
        tokio::spawn(TcpTransport::serve(
            listener,
            dispatcher,
            self.config.max_frame_bytes,
            self.inbound.clone(),
        ))
    }

    /// Listen, join and run until Ctrl+C.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        info!(
            "Starting node {} ({}) on {}",
            self.id(),
            self.config.node_name,
            self.config.listen_addr
        );

        let listener = TcpTransport::listen(self.config.listen_addr).await?;
        let server = self.serve(listener);
        self.start().await;

        tokio::select! {
            _ = server => {
                warn!("Listener stopped");
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Ctrl+C received, shutting down");
            }
        }

        Ok(())
    }

    pub async fn handle(&self, envelope: Envelope) -> Response {
        let Envelope { from, request, .. } = envelope;
        debug!("Handling {} from {:?}", request.kind(), from.as_ref().map(|c| c.addr));

        if let Some(sender) = &from {
            if sender.node_id != self.id() {
                // Shares the inbound limit; a saturated node skips the update.
                match self.inbound.clone().try_acquire_owned() {
                    Ok(permit) => {
                        let dht = self.dht.clone();
                        let (node_id, addr) = (sender.node_id, sender.addr);
                        tokio::spawn(async move {
                            dht.record_contact(node_id, addr).await;
                            drop(permit);
                        });
                    }
                    Err(_) => debug!("Too busy to record contact {}", sender.addr),
                }
            }
        }

        let result = match request {
            Request::Dht(request) => {
                return Response::Dht(self.dht.handle_request(from.as_ref(), request).await);
            }
            Request::Prepare { index, proposal } => self.on_prepare(index, proposal).await,
            Request::Accept {
                index,
                proposal,
                operation,
            } => self.on_accept(index, proposal, operation).await,
            Request::Learn { entry } => self.on_learn(entry).await,
            Request::FetchEntries { from: start, limit } => {
                let limit = limit.min(self.config.consensus.catch_up_batch);
                Ok(Response::Entries(self.log.entries_from(start, limit).await))
            }
            Request::Client(request) => Ok(Response::Client(self.handle_client(request).await)),
        };

        result.unwrap_or_else(|e| Response::Error(e.to_string()))
    }

    async fn handle_client(&self, request: ClientRequest) -> ClientResponse {
        let result = match request {
            ClientRequest::Put { address, payload } => {
                self.put(&address, payload).await.map(ClientResponse::Committed)
            }
            ClientRequest::PutNamed { name, payload } => self
                .put_named(&name, payload)
                .await
                .map(ClientResponse::Committed),
            ClientRequest::Get { key, min_index } => {
                let value = match min_index {
                    Some(min_index) => self.get_with_watermark(&key, min_index).await,
                    None => self.get(&key).await,
                };
                match value {
                    Ok(value) => Ok(ClientResponse::Value(value)),
                    Err(PdnError::KeyNotFound(_)) => Ok(ClientResponse::NotFound(key)),
                    Err(e) => Err(e),
                }
            }
            ClientRequest::Delete { key } => self.delete(&key).await.map(ClientResponse::Committed),
            ClientRequest::Status => Ok(ClientResponse::Status(Box::new(self.node_status().await))),
        };

        result.unwrap_or_else(|e| ClientResponse::Failed(e.to_string()))
    }

    /// Commit a message for `address` and replicate it in the DHT.
    pub async fn put(&self, address: &LogicalAddress, payload: Vec<u8>) -> Result<PutReceipt> {
        self.write(Operation::store(address.key(), payload)).await
    }

    pub async fn put_named(&self, name: &str, payload: Vec<u8>) -> Result<PutReceipt> {
        self.write(Operation::store(Key::from_name(name), payload)).await
    }

    pub async fn delete(&self, key: &Key) -> Result<PutReceipt> {
        self.write(Operation::delete(*key)).await
    }

    async fn write(&self, operation: Operation) -> Result<PutReceipt> {
        let key = operation.key();
        let entry = self.propose(operation).await?;

        if timeout(self.config.consensus.round_timeout(), self.log.wait_applied(entry.index))
            .await
            .is_err()
        {
            warn!("Index {} committed but not applied locally yet", entry.index);
        }

        let record: Record = entry.operation.record_at(entry.index);
        let replicas = match self.dht.replicate(key, record).await {
            Ok(acks) => acks,
            Err(e) => {
                warn!("Replication of {} after commit failed: {}", key, e);
                0
            }
        };

        Ok(PutReceipt {
            key,
            index: entry.index,
            replicas,
        })
    }

    /// Local value if present, otherwise whatever the DHT returns.
    pub async fn get(&self, key: &Key) -> Result<StoredValue> {
        let record = match self.store.record(key).await {
            Some(record) => Some(record),
            None => self.dht.find_value(*key).await,
        };

        match record {
            Some(Record::Value(value)) => Ok(value),
            _ => Err(PdnError::KeyNotFound(key.to_hex())),
        }
    }

    pub async fn get_local(&self, key: &Key) -> Option<StoredValue> {
        self.store.get(key).await
    }

    /// Read that requires this node to have applied at least `min_index`.
    pub async fn get_with_watermark(&self, key: &Key, min_index: u64) -> Result<StoredValue> {
        let behind = |applied: Option<u64>| applied.is_none_or(|applied| applied < min_index);

        if behind(self.log.applied_index()) {
            self.catch_up().await;
        }
        let applied = self.log.applied_index();
        if behind(applied) {
            return Err(PdnError::StaleRead {
                applied,
                required: min_index,
            });
        }

        self.store
            .get(key)
            .await
            .ok_or_else(|| PdnError::KeyNotFound(key.to_hex()))
    }

    pub async fn node_status(&self) -> NodeStatus {
        NodeStatus {
            node_id: self.id(),
            node_name: self.config.node_name.clone(),
            listen_addr: self.contact.addr,
            routing_table_size: self.dht.contact_count().await,
            commit_index: self.commit_index(),
            highest_known_index: self.log.highest_index().await,
            pending_proposals: self.pending_proposals(),
            in_flight_rounds: self.proposer.in_flight().await,
            stored_keys: self.store.len().await,
            members: self.membership.members().to_vec(),
            faulted: self.is_faulted(),
            metrics: self.metrics.get_metrics().await,
        }
    }
}

#[async_trait]
impl Dispatcher for Node {
    async fn dispatch(&self, envelope: Envelope) -> Response {
        self.handle(envelope).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::dht::DhtRequest;
    use crate::testing::{TestCluster, test_addr};
    use std::time::Duration;
    use tokio::time::sleep;

    fn ping_from(name: &str) -> Envelope {
        let sender = Contact::new(NodeId::from_name(name), test_addr(9));
        Envelope::new(Some(sender), Request::Dht(DhtRequest::Ping))
    }

    #[tokio::test]
    async fn test_contact_recording_respects_inbound_limit() {
        let cluster = TestCluster::start(1).await.unwrap();
        let node = cluster.node(0);
        let limit = node.config.max_concurrent_requests as u32;

        let held = node.inbound.clone().acquire_many_owned(limit).await.unwrap();
        node.handle(ping_from("busy")).await;
        sleep(Duration::from_millis(50)).await;
        assert_eq!(node.dht.contact_count().await, 0);

        drop(held);
        node.handle(ping_from("idle")).await;
        timeout(Duration::from_secs(5), async {
            while node.dht.contact_count().await == 0
                || node.inbound.available_permits() < limit as usize
            {
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }
}

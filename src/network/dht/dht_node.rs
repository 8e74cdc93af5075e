use log::{debug, info, warn};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinSet;
use tokio::time::timeout;

use crate::consensus::quorum::majority;
use crate::core::config::DhtConfig;
use crate::core::protocol::{Envelope, Request, Response};
use crate::network::transport::Transport;
use crate::storage::{DhtStore, Key, Record};
use crate::utils::{MetricsCollector, PdnError, Result};

use super::contact::Contact;
use super::lookup::LookupState;
use super::node_id::NodeId;
use super::routing_table::{InsertOutcome, RoutingTable};
use super::rpc::{DhtRequest, DhtResponse};

type StoreTask = (Contact, Result<DhtResponse>);

/// Kademlia routing, lookup and replica placement for one node.
pub struct DhtNode {
    local_contact: Contact,
    routing_table: RwLock<RoutingTable>,
    store: Arc<DhtStore>,
    transport: Arc<dyn Transport>,
    config: DhtConfig,
    metrics: MetricsCollector,
}

/// One DHT round trip, bounded by `request_timeout`.
async fn send_dht(
    transport: Arc<dyn Transport>,
    from: Contact,
    to: SocketAddr,
    request: DhtRequest,
    request_timeout: Duration,
) -> Result<DhtResponse> {
    let envelope = Envelope::new(Some(from), Request::Dht(request));
    match timeout(request_timeout, transport.send(to, envelope)).await {
        Ok(Ok(Response::Dht(response))) => Ok(response),
        Ok(Ok(Response::Error(e))) => Err(PdnError::InvalidResponse(format!("{}: {}", to, e))),
        Ok(Ok(other)) => Err(PdnError::InvalidResponse(format!(
            "{} answered a DHT request with {:?}",
            to, other
        ))),
        Ok(Err(e)) => Err(e),
        Err(_) => Err(PdnError::Timeout(to.to_string())),
    }
}

impl DhtNode {
    pub fn new(
        local_contact: Contact,
        store: Arc<DhtStore>,
        transport: Arc<dyn Transport>,
        config: DhtConfig,
        metrics: MetricsCollector,
    ) -> Self {
        info!(
            "DHT node {} at {} (k={}, alpha={})",
            local_contact.node_id, local_contact.addr, config.k, config.alpha
        );

        let routing_table = RwLock::new(RoutingTable::new(local_contact.node_id, config.k));
        Self {
            local_contact,
            routing_table,
            store,
            transport,
            config,
            metrics,
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.local_contact.node_id
    }

    pub fn local_contact(&self) -> &Contact {
        &self.local_contact
    }

    async fn call(&self, to: SocketAddr, request: DhtRequest) -> Result<DhtResponse> {
        let result = send_dht(
            self.transport.clone(),
            self.local_contact.clone(),
            to,
            request,
            self.config.request_timeout(),
        )
        .await;
        if result.is_err() {
            self.metrics.record_peer_unreachable().await;
        }
        result
    }

    /// Insert or refresh a contact. A full bucket keeps its oldest entry
    /// unless that entry fails a ping.
    pub async fn record_contact(&self, node_id: NodeId, addr: SocketAddr) -> InsertOutcome {
        let outcome = self
            .routing_table
            .write()
            .await
            .add_contact(Contact::new(node_id, addr));

        if let InsertOutcome::BucketFull { oldest, candidate } = &outcome {
            // Ping without holding the table lock.
            if self.ping(oldest.addr).await.is_ok() {
                self.routing_table.write().await.touch(&oldest.node_id);
                debug!("kept {} over {}", oldest.node_id, candidate.node_id);
            } else {
                self.routing_table
                    .write()
                    .await
                    .replace(&oldest.node_id, candidate.clone());
            }
        }
        outcome
    }

    pub async fn ping(&self, addr: SocketAddr) -> Result<Contact> {
        match self.call(addr, DhtRequest::Ping).await? {
            DhtResponse::Pong { responder } => Ok(responder),
            other => Err(PdnError::InvalidResponse(format!(
                "{} answered ping with {:?}",
                addr, other
            ))),
        }
    }

    pub async fn find_closest(&self, target: &NodeId, count: usize) -> Vec<Contact> {
        self.routing_table.read().await.find_closest(target, count)
    }

    pub async fn contact_count(&self) -> usize {
        self.routing_table.read().await.contact_count()
    }

    /// Iterative FIND_NODE. Queries `alpha` nodes per round and stops after a
    /// round that brought nothing closer. Returns up to `k` live candidates by
    /// distance; empty when no reachable node knows the target's region.
    pub async fn iterative_lookup(&self, target: NodeId) -> Vec<Contact> {
        self.metrics.record_lookup().await;
        let seeds = self.find_closest(&target, self.config.k).await;
        let mut state = LookupState::new(target, self.node_id(), seeds);

        loop {
            let batch = state.next_batch(self.config.alpha);
            if batch.is_empty() {
                break;
            }

            let mut queries = JoinSet::new();
            for contact in batch {
                let transport = self.transport.clone();
                let local = self.local_contact.clone();
                let request_timeout = self.config.request_timeout();
                queries.spawn(async move {
                    let response = send_dht(
                        transport,
                        local,
                        contact.addr,
                        DhtRequest::FindNode { target },
                        request_timeout,
                    )
                    .await;
                    (contact, response)
                });
            }

            while let Some(joined) = queries.join_next().await {
                let Ok((contact, response)) = joined else {
                    continue;
                };
                match response {
                    Ok(DhtResponse::Nodes(contacts)) => {
                        self.seen(&contact).await;
                        state.absorb(&contact.node_id, contacts);
                    }
                    Ok(other) => {
                        debug!("unexpected lookup reply from {}: {:?}", contact.addr, other);
                        state.mark_failed(&contact.node_id);
                    }
                    Err(e) => {
                        debug!("lookup query to {} failed: {}", contact.addr, e);
                        self.forget(&contact.node_id).await;
                        state.mark_failed(&contact.node_id);
                    }
                }
            }

            if !state.finish_round() {
                break;
            }
        }

        debug!(
            "lookup for {} finished after {} responses",
            target,
            state.responded()
        );
        state.into_results(self.config.k)
    }

    /// Iterative FIND_VALUE. Finishes the round in which a holder answered
    /// and returns the highest version seen, tombstones included. Gives up
    /// once a round brings nothing closer and all of the `k` closest have
    /// been asked.
    pub async fn find_value(&self, key: Key) -> Option<Record> {
        self.metrics.record_lookup().await;
        let target = key.target();
        let seeds = self.find_closest(&target, self.config.k).await;
        let mut state = LookupState::new(target, self.node_id(), seeds);
        let mut best: Option<Record> = None;

        loop {
            let batch = state.next_batch(self.config.alpha);
            if batch.is_empty() {
                break;
            }

            let mut queries = JoinSet::new();
            for contact in batch {
                let transport = self.transport.clone();
                let local = self.local_contact.clone();
                let request_timeout = self.config.request_timeout();
                queries.spawn(async move {
                    let response = send_dht(
                        transport,
                        local,
                        contact.addr,
                        DhtRequest::FindValue { key },
                        request_timeout,
                    )
                    .await;
                    (contact, response)
                });
            }

            while let Some(joined) = queries.join_next().await {
                let Ok((contact, response)) = joined else {
                    continue;
                };
                match response {
                    Ok(DhtResponse::Value { record, contacts }) => {
                        self.seen(&contact).await;
                        state.absorb(&contact.node_id, contacts);
                        if let Some(record) = record {
                            if best.as_ref().is_none_or(|b| record.version() > b.version()) {
                                best = Some(record);
                            }
                        }
                    }
                    Ok(other) => {
                        debug!("unexpected find_value reply from {}: {:?}", contact.addr, other);
                        state.mark_failed(&contact.node_id);
                    }
                    Err(e) => {
                        debug!("find_value query to {} failed: {}", contact.addr, e);
                        self.forget(&contact.node_id).await;
                        state.mark_failed(&contact.node_id);
                    }
                }
            }

            if best.is_some() {
                break;
            }
            // Without progress, still ask the rest of the k closest before
            // concluding the key is unknown.
            if !state.finish_round() && state.unqueried_within(self.config.k) == 0 {
                break;
            }
        }
        best
    }

    /// Push `record` to the first `replication` of `nodes`. Succeeds with a
    /// majority of the configured replication factor, however few candidates
    /// there are; a replica that fails is replaced by the next unused one.
    pub async fn store_at(&self, nodes: &[Contact], key: Key, record: Record) -> Result<usize> {
        let needed = majority(self.config.replication);
        let target_acks = self.config.replication.min(nodes.len());
        if target_acks == 0 {
            self.metrics.record_store_failed().await;
            return Err(PdnError::StoreFailed {
                key: key.to_hex(),
                acks: 0,
                needed,
            });
        }

        let mut candidates = nodes.iter().cloned();
        let mut pending: JoinSet<StoreTask> = JoinSet::new();
        let spawn_store = |pending: &mut JoinSet<StoreTask>, contact: Contact| {
            let transport = self.transport.clone();
            let local = self.local_contact.clone();
            let request_timeout = self.config.request_timeout();
            let record = record.clone();
            pending.spawn(async move {
                let response = send_dht(
                    transport,
                    local,
                    contact.addr,
                    DhtRequest::Store { key, record },
                    request_timeout,
                )
                .await;
                (contact, response)
            });
        };

        for contact in candidates.by_ref().take(target_acks) {
            spawn_store(&mut pending, contact);
        }

        let mut acks = 0;
        while let Some(joined) = pending.join_next().await {
            let Ok((contact, response)) = joined else {
                continue;
            };
            match response {
                Ok(DhtResponse::StoreAck { stored }) => {
                    acks += 1;
                    self.seen(&contact).await;
                    debug!("{} acked {} (stored: {})", contact.addr, key, stored);
                }
                other => {
                    debug!("store of {} at {} failed: {:?}", key, contact.addr, other);
                    if let Some(next) = candidates.next() {
                        spawn_store(&mut pending, next);
                    }
                }
            }
        }

        self.metrics.record_store_acks(acks as u64).await;
        if acks < needed {
            self.metrics.record_store_failed().await;
            return Err(PdnError::StoreFailed {
                key: key.to_hex(),
                acks,
                needed,
            });
        }
        Ok(acks)
    }

    /// Look up the nodes closest to `key` and store `record` there.
    pub async fn replicate(&self, key: Key, record: Record) -> Result<usize> {
        let nodes = self.iterative_lookup(key.target()).await;
        if nodes.is_empty() {
            debug!("no peers to replicate {} to", key);
        }
        self.store_at(&nodes, key, record).await
    }

    /// Join through a seed: ping it, then look up our own id.
    pub async fn bootstrap(&self, seed: SocketAddr) -> Result<usize> {
        info!("Bootstrapping DHT via {}", seed);

        let responder = self.ping(seed).await?;
        self.record_contact(responder.node_id, responder.addr).await;
        self.iterative_lookup(self.node_id()).await;

        let count = self.contact_count().await;
        info!("Bootstrap via {} done, {} contacts", seed, count);
        Ok(count)
    }

    pub async fn handle_request(&self, from: Option<&Contact>, request: DhtRequest) -> DhtResponse {
        let requester = from.map(|c| c.node_id);
        let closest = |contacts: Vec<Contact>| -> Vec<Contact> {
            contacts
                .into_iter()
                .filter(|c| Some(c.node_id) != requester)
                .collect()
        };

        match request {
            DhtRequest::Ping => DhtResponse::Pong {
                responder: self.local_contact.clone(),
            },
            DhtRequest::FindNode { target } => {
                DhtResponse::Nodes(closest(self.find_closest(&target, self.config.k).await))
            }
            DhtRequest::FindValue { key } => DhtResponse::Value {
                record: self.store.record(&key).await,
                contacts: closest(self.find_closest(&key.target(), self.config.k).await),
            },
            DhtRequest::Store { key, record } => {
                let stored = self.store.merge(key, record).await;
                debug!("replica push for {} (stored: {})", key, stored);
                DhtResponse::StoreAck { stored }
            }
        }
    }

    /// Ping the least-recently-seen contact of every bucket and drop the dead.
    pub async fn refresh(&self) -> usize {
        let oldest = self.routing_table.read().await.oldest_contacts();
        let mut removed = 0;

        for contact in oldest {
            match self.ping(contact.addr).await {
                Ok(_) => {
                    self.seen(&contact).await;
                }
                Err(e) => {
                    warn!("Dropping unresponsive contact {}: {}", contact.addr, e);
                    if self.forget(&contact.node_id).await {
                        removed += 1;
                    }
                }
            }
        }

        let table = self.routing_table.read().await;
        debug!(
            "DHT maintenance: {} contacts in {} buckets, {} removed",
            table.contact_count(),
            table.depth(),
            removed
        );
        removed
    }

    /// A contact answered us. Full buckets keep their entries here; probing
    /// is left to `record_contact` and `refresh`.
    async fn seen(&self, contact: &Contact) {
        let outcome = self.routing_table.write().await.add_contact(contact.clone());
        if let InsertOutcome::BucketFull { .. } = outcome {
            debug!("bucket full, not adding {}", contact.node_id);
        }
    }

    async fn forget(&self, node_id: &NodeId) -> bool {
        self.routing_table.write().await.remove_contact(node_id)
    }
}

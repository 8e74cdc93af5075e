use log::info;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeMetrics {
    pub proposals_started: u64,
    pub proposals_committed: u64,
    pub proposals_failed: u64,
    pub rounds_contended: u64,
    pub entries_learned: u64,
    pub entries_applied: u64,
    pub lookups: u64,
    pub store_acks: u64,
    pub stores_failed: u64,
    pub peers_unreachable: u64,
    pub uptime: Duration,
    #[serde(skip, default = "Instant::now")]
    pub start_time: Instant,
}

impl Default for NodeMetrics {
    fn default() -> Self {
        Self {
            proposals_started: 0,
            proposals_committed: 0,
            proposals_failed: 0,
            rounds_contended: 0,
            entries_learned: 0,
            entries_applied: 0,
            lookups: 0,
            store_acks: 0,
            stores_failed: 0,
            peers_unreachable: 0,
            uptime: Duration::new(0, 0),
            start_time: Instant::now(),
        }
    }
}

#[derive(Clone)]
pub struct MetricsCollector {
    metrics: Arc<RwLock<NodeMetrics>>,
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            metrics: Arc::new(RwLock::new(NodeMetrics::default())),
        }
    }

    pub async fn record_proposal_started(&self) {
        self.metrics.write().await.proposals_started += 1;
    }

    pub async fn record_proposal_committed(&self) {
        self.metrics.write().await.proposals_committed += 1;
    }

    pub async fn record_proposal_failed(&self) {
        self.metrics.write().await.proposals_failed += 1;
    }

    pub async fn record_round_contended(&self) {
        self.metrics.write().await.rounds_contended += 1;
    }

    pub async fn record_entry_learned(&self) {
        self.metrics.write().await.entries_learned += 1;
    }

    pub async fn record_entries_applied(&self, count: u64) {
        self.metrics.write().await.entries_applied += count;
    }

    pub async fn record_lookup(&self) {
        self.metrics.write().await.lookups += 1;
    }

    pub async fn record_store_acks(&self, acks: u64) {
        self.metrics.write().await.store_acks += acks;
    }

    pub async fn record_store_failed(&self) {
        self.metrics.write().await.stores_failed += 1;
    }

    pub async fn record_peer_unreachable(&self) {
        self.metrics.write().await.peers_unreachable += 1;
    }

    pub async fn get_metrics(&self) -> NodeMetrics {
        let mut metrics = self.metrics.read().await.clone();
        metrics.uptime = metrics.start_time.elapsed();
        metrics
    }

    pub async fn log_stats(&self) {
        let metrics = self.get_metrics().await;

        info!(
            "uptime {:.2?}: proposals {} started / {} committed / {} failed, {} contended rounds",
            metrics.uptime,
            metrics.proposals_started,
            metrics.proposals_committed,
            metrics.proposals_failed,
            metrics.rounds_contended
        );
        info!(
            "log: {} learned, {} applied; dht: {} lookups, {} store acks, {} failed stores, {} unreachable peers",
            metrics.entries_learned,
            metrics.entries_applied,
            metrics.lookups,
            metrics.store_acks,
            metrics.stores_failed,
            metrics.peers_unreachable
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_counters_accumulate() {
        let metrics = MetricsCollector::new();
        metrics.record_proposal_started().await;
        metrics.record_proposal_started().await;
        metrics.record_proposal_committed().await;
        metrics.record_entries_applied(3).await;

        let snapshot = metrics.get_metrics().await;
        assert_eq!(snapshot.proposals_started, 2);
        assert_eq!(snapshot.proposals_committed, 1);
        assert_eq!(snapshot.entries_applied, 3);
    }
}

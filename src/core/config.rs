use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::utils::{PdnError, Result};

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub node_name: String,
    pub listen_addr: SocketAddr,
    /// Durable state lives here. Without it the node keeps state in memory.
    pub data_dir: Option<PathBuf>,
    pub bootstrap_peers: Vec<SocketAddr>,
    /// The acceptor set quorums are drawn from. The local address is always
    /// part of it.
    pub members: Vec<SocketAddr>,
    pub dht: DhtConfig,
    pub consensus: ConsensusConfig,
    pub max_concurrent_requests: usize,
    pub max_pending_proposals: usize,
    pub max_frame_bytes: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node_name: "DefaultNode".to_string(),
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 7400)),
            data_dir: None,
            bootstrap_peers: Vec::new(),
            members: Vec::new(),
            dht: DhtConfig::default(),
            consensus: ConsensusConfig::default(),
            max_concurrent_requests: 256,
            max_pending_proposals: 64,
            max_frame_bytes: 4 * 1024 * 1024,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DhtConfig {
    /// Bucket capacity and lookup result size.
    pub k: usize,
    /// Lookup parallelism.
    pub alpha: usize,
    /// Replicas pushed per write.
    pub replication: usize,
    pub request_timeout_ms: u64,
    pub refresh_interval_secs: u64,
}

impl Default for DhtConfig {
    fn default() -> Self {
        Self {
            k: 20,
            alpha: 3,
            replication: 3,
            request_timeout_ms: 2_000,
            refresh_interval_secs: 60,
        }
    }
}

impl DhtConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsensusConfig {
    /// Bound on one Prepare or Accept phase.
    pub round_timeout_ms: u64,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    /// Failed rounds tolerated before a proposal gives up.
    pub max_retries: u32,
    pub catch_up_batch: usize,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            round_timeout_ms: 3_000,
            backoff_base_ms: 50,
            backoff_max_ms: 2_000,
            max_retries: 16,
            catch_up_batch: 256,
        }
    }
}

impl ConsensusConfig {
    pub fn round_timeout(&self) -> Duration {
        Duration::from_millis(self.round_timeout_ms)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }
}

impl Config {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| PdnError::ConfigError(format!("{}: {}", path.display(), e)))?;
        let config: Config = serde_json::from_str(&text)
            .map_err(|e| PdnError::ConfigError(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let checks = [
            (self.dht.k == 0, "dht.k must be positive"),
            (self.dht.alpha == 0, "dht.alpha must be positive"),
            (self.dht.replication == 0, "dht.replication must be positive"),
            (self.dht.request_timeout_ms == 0, "dht.request_timeout_ms must be positive"),
            (self.consensus.round_timeout_ms == 0, "consensus.round_timeout_ms must be positive"),
            (self.consensus.catch_up_batch == 0, "consensus.catch_up_batch must be positive"),
            (self.max_concurrent_requests == 0, "max_concurrent_requests must be positive"),
            (self.max_pending_proposals == 0, "max_pending_proposals must be positive"),
            (
                !self.members.is_empty() && self.listen_addr.ip().is_unspecified(),
                "listen_addr must be a concrete member address when members are set",
            ),
        ];

        match checks.iter().find(|(failed, _)| *failed) {
            Some((_, reason)) => Err(PdnError::ConfigError(reason.to_string())),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.dht.k, 20);
        assert_eq!(config.dht.alpha, 3);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"node_name": "n1", "listen_addr": "127.0.0.1:7001",
                "members": ["127.0.0.1:7002"], "dht": {{"replication": 5}}}}"#
        )
        .unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.node_name, "n1");
        assert_eq!(config.members.len(), 1);
        assert_eq!(config.dht.replication, 5);
        assert_eq!(config.dht.k, 20);
        assert_eq!(config.consensus.max_retries, 16);
    }

    #[test]
    fn test_zero_alpha_rejected() {
        let mut config = Config::default();
        config.dht.alpha = 0;
        assert!(matches!(config.validate(), Err(PdnError::ConfigError(_))));
    }

    #[test]
    fn test_wildcard_listen_with_members_rejected() {
        let mut config = Config {
            listen_addr: "0.0.0.0:7400".parse().unwrap(),
            members: (1..=4)
                .map(|i| format!("10.0.0.{}:7400", i).parse().unwrap())
                .collect(),
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(PdnError::ConfigError(_))));

        // A lone node may listen everywhere.
        config.members.clear();
        assert!(config.validate().is_ok());

        config.listen_addr = "10.0.0.5:7400".parse().unwrap();
        config.members = vec!["10.0.0.1:7400".parse().unwrap()];
        assert!(config.validate().is_ok());
    }
}

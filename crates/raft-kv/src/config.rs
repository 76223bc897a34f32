//! # config
//!
//! why: describe one node of a cluster in a single yaml file
//! relations: read by the binary, RaftSettings also handed straight to KvService in tests
//! what: NodeConfig and its sections, load_config, validation

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use raft_core::RaftConfig;
use serde::Deserialize;

use crate::error::{Error, Result};
use crate::NodeId;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NodeConfig {
    #[serde(default)]
    pub node: NodeSection,

    /// every other member of the cluster, by id
    #[serde(default)]
    pub peers: BTreeMap<NodeId, String>,

    #[serde(default)]
    pub raft: RaftSettings,

    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NodeSection {
    #[serde(default)]
    pub id: NodeId,

    #[serde(default = "default_listen")]
    pub listen: String,

    /// where term, vote and log live; in-memory when absent
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
}

impl Default for NodeSection {
    fn default() -> Self {
        Self {
            id: 0,
            listen: default_listen(),
            data_dir: None,
        }
    }
}

/// Consensus timing plus the bounds the service layer puts on waiting
#[derive(Debug, Clone, Deserialize)]
pub struct RaftSettings {
    #[serde(flatten)]
    pub timing: RaftConfig,

    #[serde(default = "default_rpc_timeout_ms")]
    pub rpc_timeout_ms: u64,

    #[serde(default = "default_commit_timeout_ms")]
    pub commit_timeout_ms: u64,
}

impl Default for RaftSettings {
    fn default() -> Self {
        Self {
            timing: RaftConfig::default(),
            rpc_timeout_ms: default_rpc_timeout_ms(),
            commit_timeout_ms: default_commit_timeout_ms(),
        }
    }
}

impl RaftSettings {
    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    pub fn commit_timeout(&self) -> Duration {
        Duration::from_millis(self.commit_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        self.timing.validate()?;
        if self.rpc_timeout_ms == 0 || self.commit_timeout_ms == 0 {
            return Err(Error::Config(
                "rpc_timeout_ms and commit_timeout_ms must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_level")]
    pub level: String,

    /// "text" or "json"
    #[serde(default = "default_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            format: default_format(),
        }
    }
}

fn default_listen() -> String {
    "127.0.0.1:7000".to_string()
}

fn default_rpc_timeout_ms() -> u64 {
    100
}

fn default_commit_timeout_ms() -> u64 {
    1000
}

fn default_level() -> String {
    "info".to_string()
}

fn default_format() -> String {
    "text".to_string()
}

impl NodeConfig {
    pub fn validate(&self) -> Result<()> {
        if self.peers.contains_key(&self.node.id) {
            return Err(Error::Config(format!(
                "node {} lists itself as a peer",
                self.node.id
            )));
        }
        if let Some((id, _)) = self.peers.iter().find(|(_, addr)| addr.trim().is_empty()) {
            return Err(Error::Config(format!("peer {id} has an empty address")));
        }
        if !matches!(self.logging.format.as_str(), "text" | "json") {
            return Err(Error::Config(format!(
                "unknown log format '{}'",
                self.logging.format
            )));
        }
        self.raft.validate()
    }

    /// Ids of every other member, in ascending order
    pub fn peer_ids(&self) -> Vec<NodeId> {
        self.peers.keys().copied().collect()
    }
}

/// Parse and validate a node config file
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<NodeConfig> {
    let contents = std::fs::read_to_string(path.as_ref())?;
    let config: NodeConfig =
        serde_yaml::from_str(&contents).map_err(|err| Error::Config(err.to_string()))?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
node:
  id: 1
  listen: "127.0.0.1:7101"
  data_dir: /var/lib/raft-kv/1
peers:
  2: "127.0.0.1:7102"
  3: "127.0.0.1:7103"
raft:
  election_timeout_min: 300
  election_timeout_max: 600
  rpc_timeout_ms: 200
logging:
  format: json
"#;

    #[test]
    fn parses_full_file() {
        let config: NodeConfig = serde_yaml::from_str(SAMPLE).unwrap();
        config.validate().unwrap();

        assert_eq!(config.node.id, 1);
        assert_eq!(config.node.listen, "127.0.0.1:7101");
        assert_eq!(config.peer_ids(), vec![2, 3]);
        assert_eq!(config.raft.timing.election_timeout_min, 300);
        assert_eq!(config.raft.timing.heartbeat_interval, 50);
        assert_eq!(config.raft.rpc_timeout(), Duration::from_millis(200));
        assert_eq!(config.raft.commit_timeout(), Duration::from_millis(1000));
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.logging.format, "json");
    }

    #[test]
    fn empty_file_uses_defaults() {
        let config: NodeConfig = serde_yaml::from_str("{}").unwrap();
        config.validate().unwrap();
        assert!(config.peers.is_empty());
        assert!(config.node.data_dir.is_none());
        assert_eq!(config.raft.timing, RaftConfig::default());
    }

    #[test]
    fn self_as_peer_is_rejected() {
        let mut config = NodeConfig::default();
        config.peers.insert(0, "127.0.0.1:7000".into());
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn bad_timing_is_rejected() {
        let mut config = NodeConfig::default();
        config.raft.timing.election_timeout_max = 10;
        assert!(config.validate().is_err());

        let mut config = NodeConfig::default();
        config.raft.commit_timeout_ms = 0;
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn load_config_reads_and_validates() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();
        let config = load_config(file.path()).unwrap();
        assert_eq!(config.node.id, 1);

        let mut bad = tempfile::NamedTempFile::new().unwrap();
        bad.write_all(b"logging:\n  format: xml\n").unwrap();
        assert!(matches!(load_config(bad.path()), Err(Error::Config(_))));
    }
}

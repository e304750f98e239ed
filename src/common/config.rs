//! Configuration for a quorumkv node

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable prefix (`QUORUMKV_NODE_ID`, `QUORUMKV_HTTP_ADDR`, ...)
pub const ENV_PREFIX: &str = "QUORUMKV";

/// Node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Node ID (unique identifier, also the gossip member name)
    #[serde(default = "default_node_id")]
    pub node_id: String,

    /// Bind address for the client HTTP API
    #[serde(default = "default_http_addr")]
    pub http_addr: SocketAddr,

    /// Address the gossip engine is reachable at
    #[serde(default = "default_gossip_addr")]
    pub gossip_addr: String,

    /// Address used for log replication
    #[serde(default = "default_raft_addr")]
    pub raft_addr: String,

    /// Gossip data directory
    #[serde(default = "default_gossip_data_dir")]
    pub gossip_data_dir: PathBuf,

    /// Raft data directory
    #[serde(default = "default_raft_data_dir")]
    pub raft_data_dir: PathBuf,

    /// Seed nodes bootstrap the cluster instead of joining it
    #[serde(default)]
    pub is_seed: bool,

    /// Gossip addresses to join at startup
    #[serde(default)]
    pub join_addrs: Vec<String>,

    /// Upper bound on a replicated write
    #[serde(default = "default_apply_timeout")]
    pub apply_timeout_ms: u64,

    /// Upper bound on a voter reconfiguration
    #[serde(default = "default_reconfig_timeout")]
    pub reconfig_timeout_ms: u64,

    /// Logging level
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_node_id() -> String {
    "node-1".to_string()
}
fn default_http_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}
fn default_gossip_addr() -> String {
    "127.0.0.1:7946".to_string()
}
fn default_raft_addr() -> String {
    "127.0.0.1:9000".to_string()
}
fn default_gossip_data_dir() -> PathBuf {
    PathBuf::from("./data/gossip")
}
fn default_raft_data_dir() -> PathBuf {
    PathBuf::from("./data/raft")
}
fn default_apply_timeout() -> u64 {
    5_000
}
fn default_reconfig_timeout() -> u64 {
    10_000
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            http_addr: default_http_addr(),
            gossip_addr: default_gossip_addr(),
            raft_addr: default_raft_addr(),
            gossip_data_dir: default_gossip_data_dir(),
            raft_data_dir: default_raft_data_dir(),
            is_seed: false,
            join_addrs: Vec::new(),
            apply_timeout_ms: default_apply_timeout(),
            reconfig_timeout_ms: default_reconfig_timeout(),
            log_level: default_log_level(),
        }
    }
}

impl NodeConfig {
    /// Load config from an optional TOML file, then `QUORUMKV_*` environment variables.
    ///
    /// The result is not validated: callers apply their overrides first and
    /// then call [`NodeConfig::validate`].
    pub fn load(path: Option<&Path>) -> crate::Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        let settings = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("join_addrs"),
            )
            .build()?;
        Ok(settings.try_deserialize()?)
    }

    pub fn validate(&self) -> crate::Result<()> {
        if self.node_id.trim().is_empty() {
            return Err(crate::Error::InvalidConfig("node_id must not be empty".into()));
        }
        if self.raft_addr.trim().is_empty() {
            return Err(crate::Error::InvalidConfig("raft_addr must not be empty".into()));
        }
        if !self.is_seed && self.join_addrs.is_empty() {
            return Err(crate::Error::InvalidConfig(
                "non-seed nodes need at least one join address".into(),
            ));
        }
        if self.apply_timeout_ms == 0 {
            return Err(crate::Error::InvalidConfig(
                "apply_timeout_ms must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn apply_timeout(&self) -> Duration {
        Duration::from_millis(self.apply_timeout_ms)
    }

    pub fn reconfig_timeout(&self) -> Duration {
        Duration::from_millis(self.reconfig_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let conf = NodeConfig::default();
        assert_eq!(conf.apply_timeout(), Duration::from_secs(5));
        assert!(!conf.is_seed);
    }

    #[test]
    fn test_validate_rejects_orphan_follower() {
        let conf = NodeConfig::default();
        assert!(matches!(
            conf.validate(),
            Err(crate::Error::InvalidConfig(_))
        ));

        let seed = NodeConfig {
            is_seed: true,
            ..Default::default()
        };
        assert!(seed.validate().is_ok());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            "node_id = \"n2\"\nraft_addr = \"10.0.0.2:9000\"\njoin_addrs = [\"10.0.0.1:7946\"]"
        )
        .unwrap();

        let conf = NodeConfig::load(Some(&path)).unwrap();
        assert_eq!(conf.node_id, "n2");
        assert_eq!(conf.raft_addr, "10.0.0.2:9000");
        assert_eq!(conf.join_addrs, vec!["10.0.0.1:7946".to_string()]);
        assert_eq!(conf.apply_timeout_ms, 5_000);
        assert!(conf.validate().is_ok());
    }

    #[test]
    fn test_load_without_file_uses_defaults() {
        let conf = NodeConfig::load(None).unwrap();
        assert_eq!(conf.http_addr, default_http_addr());
        assert_eq!(conf.gossip_data_dir, PathBuf::from("./data/gossip"));
    }
}

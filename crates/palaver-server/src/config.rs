use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use palaver_cluster::{ClusterConfig, PeerConfig};
use palaver_core::NodeId;
use palaver_engine::EngineConfig;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("cannot parse {path}: {source}")]
    Parse {
        path: String,
        source: serde_json::Error,
    },
    #[error("node {0} is not listed in cluster.nodes")]
    UnknownSelf(String),
}

/// Server configuration, loadable from a JSON file. Every field has a
/// default so a missing file means a single-node server on the default
/// port.
#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    /// Client-facing bind address.
    pub listen: String,
    pub send_queue: usize,
    pub topic_queue: usize,
    pub idle_kill_secs: u64,
    pub call_timeout_secs: u64,
    pub cluster: Option<ClusterSettings>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let engine = EngineConfig::default();
        Self {
            listen: "0.0.0.0:6060".into(),
            send_queue: engine.send_queue,
            topic_queue: engine.topic_queue,
            idle_kill_secs: engine.idle_kill.as_secs(),
            call_timeout_secs: engine.call_timeout.as_secs(),
            cluster: None,
        }
    }
}

/// Cluster section: the full node list plus which entry is this process.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClusterSettings {
    /// Name of this node; must appear in `nodes`.
    pub self_name: String,
    pub nodes: Vec<NodeEntry>,
    #[serde(default = "default_replicas")]
    pub replicas: usize,
    #[serde(default = "default_heartbeat_ms")]
    pub heartbeat_ms: u64,
    #[serde(default = "default_max_missed")]
    pub max_missed: u32,
    #[serde(default = "default_election_timeout_ms")]
    pub election_timeout_ms: u64,
    #[serde(default = "default_peer_queue")]
    pub peer_queue: usize,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NodeEntry {
    pub name: String,
    /// Peer-facing address, used both for listening (own entry) and
    /// dialing (other entries).
    pub addr: String,
}

fn default_replicas() -> usize {
    20
}
fn default_heartbeat_ms() -> u64 {
    500
}
fn default_max_missed() -> u32 {
    3
}
fn default_election_timeout_ms() -> u64 {
    1500
}
fn default_peer_queue() -> usize {
    256
}

impl ServerConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let cfg: Self = serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if let Some(cluster) = &self.cluster {
            if !cluster.nodes.iter().any(|n| n.name == cluster.self_name) {
                return Err(ConfigError::UnknownSelf(cluster.self_name.clone()));
            }
        }
        Ok(())
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            send_queue: self.send_queue,
            topic_queue: self.topic_queue,
            idle_kill: Duration::from_secs(self.idle_kill_secs),
            call_timeout: Duration::from_secs(self.call_timeout_secs),
            ..EngineConfig::default()
        }
    }

    /// Cluster layer configuration, `None` for a single-node server.
    pub fn cluster_config(&self) -> Option<ClusterConfig> {
        let cluster = self.cluster.as_ref()?;
        let own = cluster
            .nodes
            .iter()
            .find(|n| n.name == cluster.self_name)?;
        let peers = cluster
            .nodes
            .iter()
            .filter(|n| n.name != cluster.self_name)
            .map(|n| PeerConfig {
                name: NodeId::new(n.name.clone()),
                addr: n.addr.clone(),
            })
            .collect();
        Some(ClusterConfig {
            node: NodeId::new(cluster.self_name.clone()),
            listen: own.addr.clone(),
            peers,
            replicas: cluster.replicas,
            heartbeat: Duration::from_millis(cluster.heartbeat_ms),
            max_missed: cluster.max_missed,
            election_timeout: Duration::from_millis(cluster.election_timeout_ms),
            peer_queue: cluster.peer_queue,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_single_node() {
        let cfg = ServerConfig::default();
        assert!(cfg.cluster.is_none());
        assert!(cfg.cluster_config().is_none());
        assert_eq!(cfg.engine_config().send_queue, cfg.send_queue);
    }

    #[test]
    fn parses_a_cluster_section() {
        let json = r#"{
            "listen": "0.0.0.0:7070",
            "cluster": {
                "self_name": "beta",
                "nodes": [
                    { "name": "alpha", "addr": "10.0.0.1:12000" },
                    { "name": "beta", "addr": "10.0.0.2:12000" },
                    { "name": "gamma", "addr": "10.0.0.3:12000" }
                ]
            }
        }"#;
        let cfg: ServerConfig = serde_json::from_str(json).unwrap();
        cfg.validate().unwrap();
        let cc = cfg.cluster_config().unwrap();
        assert_eq!(cc.node, NodeId::new("beta"));
        assert_eq!(cc.listen, "10.0.0.2:12000");
        assert_eq!(cc.peers.len(), 2, "own entry is not a peer");
        assert!(cc.peers.iter().all(|p| p.name != NodeId::new("beta")));
        assert_eq!(cc.replicas, 20, "defaulted");
    }

    #[test]
    fn self_name_must_be_listed() {
        let json = r#"{
            "cluster": {
                "self_name": "delta",
                "nodes": [ { "name": "alpha", "addr": "10.0.0.1:12000" } ]
            }
        }"#;
        let cfg: ServerConfig = serde_json::from_str(json).unwrap();
        assert!(matches!(cfg.validate(), Err(ConfigError::UnknownSelf(_))));
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let json = r#"{ "listne": "0.0.0.0:7070" }"#;
        assert!(serde_json::from_str::<ServerConfig>(json).is_err());
    }
}

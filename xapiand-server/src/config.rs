use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use xapiand_wal::WalOptions;

use crate::discovery::DiscoveryOptions;
use crate::node::Node;
use crate::pool::PoolOptions;
use crate::raft::RaftOptions;
use crate::resolver::ResolverOptions;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub cluster_name: String,
    /// Fixed node name; when unset a name is generated and renames are
    /// allowed on conflict.
    pub node_name: Option<String>,
    pub host: String,
    pub data_dir: PathBuf,
    pub http_port: u16,
    pub binary_port: u16,
    pub region: i32,
    pub discovery: DiscoveryConfig,
    pub raft: RaftConfig,
    pub pool: PoolConfig,
    pub wal: WalConfig,
    pub workers: WorkersConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cluster_name: "Xapiand".into(),
            node_name: None,
            host: "127.0.0.1".into(),
            data_dir: PathBuf::from("./data"),
            http_port: crate::HTTP_SERVERPORT,
            binary_port: crate::BINARY_SERVERPORT,
            region: 0,
            discovery: DiscoveryConfig::default(),
            raft: RaftConfig::default(),
            pool: PoolConfig::default(),
            wal: WalConfig::default(),
            workers: WorkersConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub group: Ipv4Addr,
    pub port: u16,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            group: Ipv4Addr::new(239, 192, 168, 70),
            port: 58870,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RaftConfig {
    pub group: Ipv4Addr,
    pub port: u16,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            group: Ipv4Addr::new(239, 192, 168, 80),
            port: 58880,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub limit: usize,
    pub threshold: usize,
    pub checkout_timeout_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            limit: 10,
            threshold: 5,
            checkout_timeout_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WalConfig {
    /// Group-commit window in milliseconds; 0 fsyncs every write.
    pub sync_window_ms: u64,
    pub max_file_size: u64,
    pub max_file_entries: u64,
}

impl Default for WalConfig {
    fn default() -> Self {
        Self {
            sync_window_ms: 0,
            max_file_size: xapiand_wal::WAL_FILE_MAX_SIZE,
            max_file_entries: xapiand_wal::WAL_FILE_MAX_ENTRIES,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkersConfig {
    pub committers: usize,
    pub fsynchers: usize,
    pub updaters: usize,
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            committers: 0, // 0 means CPU count
            fsynchers: 2,
            updaters: 2,
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// The node this server announces, with a generated name when none
    /// is configured.
    pub fn local_node(&self) -> Node {
        let name = self.node_name.clone().unwrap_or_else(|| {
            let host = hostname();
            format!("{host}-{}", std::process::id())
        });
        let mut node = Node::new(name, self.host.clone());
        node.http_port = self.http_port;
        node.binary_port = self.binary_port;
        node.region = self.region;
        node
    }

    pub fn wal_options(&self) -> WalOptions {
        WalOptions {
            sync_window: Duration::from_millis(self.wal.sync_window_ms),
            max_file_size: self.wal.max_file_size,
            max_file_entries: self.wal.max_file_entries,
        }
    }

    pub fn pool_options(&self) -> PoolOptions {
        PoolOptions {
            limit: self.pool.limit,
            threshold: self.pool.threshold,
            checkout_timeout: Duration::from_millis(self.pool.checkout_timeout_ms),
            wal: self.wal_options(),
        }
    }

    pub fn discovery_options(&self) -> DiscoveryOptions {
        DiscoveryOptions {
            group: self.discovery.group,
            port: self.discovery.port,
            cluster_name: self.cluster_name.clone(),
        }
    }

    pub fn raft_options(&self) -> RaftOptions {
        RaftOptions {
            group: self.raft.group,
            port: self.raft.port,
            cluster_name: self.cluster_name.clone(),
        }
    }

    pub fn resolver_options(&self) -> ResolverOptions {
        ResolverOptions::default()
    }

    pub fn committer_threads(&self) -> usize {
        if self.workers.committers > 0 {
            self.workers.committers
        } else {
            std::thread::available_parallelism()
                .map(|cores| cores.get())
                .unwrap_or(4)
        }
    }
}

fn hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "xapiand".into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_round_trip_through_json() {
        let config = Config::default();
        let raw = serde_json::to_string(&config).unwrap();
        let back: Config = serde_json::from_str(&raw).unwrap();
        assert_eq!(back.cluster_name, "Xapiand");
        assert_eq!(back.binary_port, crate::BINARY_SERVERPORT);
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let raw = r#"{ "cluster_name": "test-ring", "region": 2 }"#;
        let config: Config = serde_json::from_str(raw).unwrap();
        assert_eq!(config.cluster_name, "test-ring");
        assert_eq!(config.region, 2);
        assert_eq!(config.pool.limit, 10);
        assert_eq!(config.wal.max_file_entries, 1016);
    }
}

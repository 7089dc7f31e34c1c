use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::election::ElectionConfig;

/// Process-level settings for one `ballot node`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    /// Base URLs of every node in the cluster, this one included.
    pub hosts: Vec<String>,
    pub min_await_secs: u64,
    pub max_await_secs: u64,
    pub heartbeat_interval_secs: u64,
    pub probe_interval_ms: u64,
    pub rpc_timeout_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".to_string(),
            port: 8080,
            hosts: vec![],
            min_await_secs: 15,
            max_await_secs: 30,
            heartbeat_interval_secs: 5,
            probe_interval_ms: 1000,
            rpc_timeout_ms: 2000,
        }
    }
}

impl Config {
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse config file {}", path.display()))
    }

    pub fn election_config(&self) -> ElectionConfig {
        ElectionConfig::new(
            Duration::from_secs(self.min_await_secs),
            Duration::from_secs(self.max_await_secs),
            Duration::from_secs(self.heartbeat_interval_secs),
        )
        .with_rpc_timeout(self.rpc_timeout())
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }

    pub fn listen_addr(&self) -> anyhow::Result<SocketAddr> {
        let raw = format!("{}:{}", self.bind, self.port);
        raw.parse()
            .with_context(|| format!("invalid listen address {raw}"))
    }

    /// Falls back to a single-node cluster made of the listen address.
    pub fn effective_hosts(&self) -> Vec<String> {
        if self.hosts.is_empty() {
            vec![format!("http://{}:{}", self.bind, self.port)]
        } else {
            self.hosts.clone()
        }
    }
}

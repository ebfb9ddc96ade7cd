use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{DriverError, DriverResult};

/// Default number of pooled connections per node
pub const DEFAULT_POOL_SIZE: usize = 4;

/// Connection settings for one cluster member
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NodeConfig {
    /// Display name; defaults to `host:port`
    pub name: Option<String>,

    pub host: String,

    pub port: u16,

    /// Fixed capacity of the node's connection pool
    pub pool_size: usize,

    pub connect_timeout_ms: u64,

    pub read_timeout_ms: u64,

    pub write_timeout_ms: u64,

    /// A socket unused for longer than this is reconnected before its next write
    pub idle_timeout_ms: u64,

    /// How long a caller waits for a pooled connection
    pub acquire_timeout_ms: u64,

    /// Scratch buffers kept around for reuse by the node's connections
    pub buffer_pool_size: usize,
}

impl NodeConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Self::default()
        }
    }

    /// Parse a `host:port` address, tolerating copy-pasted URL prefixes.
    pub fn from_address(addr: &str) -> DriverResult<Self> {
        let addr = strip_scheme(addr.trim());
        let (host, port) = addr
            .rsplit_once(':')
            .ok_or_else(|| DriverError::Config(format!("Address '{}' has no port", addr)))?;
        let port = port
            .parse::<u16>()
            .map_err(|e| DriverError::Config(format!("Invalid port in '{}': {}", addr, e)))?;
        Ok(Self::new(host, port))
    }

    pub fn name(&self) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| format!("{}:{}", self.host, self.port))
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    pub fn validate(&self) -> DriverResult<()> {
        if self.host.trim().is_empty() {
            return Err(DriverError::Config("Node host is empty".to_string()));
        }
        if self.port == 0 {
            return Err(DriverError::Config(format!(
                "Node {} has port 0",
                self.name()
            )));
        }
        if self.pool_size == 0 {
            return Err(DriverError::Config(format!(
                "Node {} has pool_size 0",
                self.name()
            )));
        }
        Ok(())
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: None,
            host: "127.0.0.1".to_string(),
            port: 8087,
            pool_size: DEFAULT_POOL_SIZE,
            connect_timeout_ms: 4_000,
            read_timeout_ms: 4_000,
            write_timeout_ms: 4_000,
            idle_timeout_ms: 60_000,
            acquire_timeout_ms: 1_000,
            buffer_pool_size: 8,
        }
    }
}

/// Cluster-wide settings plus the static node list
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ClusterConfig {
    pub nodes: Vec<NodeConfig>,

    /// Retries used by `Cluster::execute` when the caller gives none
    pub default_retry_count: usize,

    /// Pause between retry attempts
    pub retry_wait_ms: u64,

    /// Pause between health-monitor passes over offline nodes
    pub node_poll_ms: u64,

    /// Identity announced on every connection checkout, if set
    pub client_id: Option<String>,
}

impl ClusterConfig {
    pub fn new(nodes: Vec<NodeConfig>) -> Self {
        Self {
            nodes,
            ..Self::default()
        }
    }

    pub fn from_toml_str(s: &str) -> DriverResult<Self> {
        let config: Self = toml::from_str(s)
            .map_err(|e| DriverError::Config(format!("Invalid TOML config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_str(s: &str) -> DriverResult<Self> {
        let config: Self = serde_json::from_str(s)
            .map_err(|e| DriverError::Config(format!("Invalid JSON config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a `.toml` or `.json` file.
    pub fn from_file(path: impl AsRef<Path>) -> DriverResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            DriverError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;

        match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => Self::from_json_str(&content),
            Some("toml") | None => Self::from_toml_str(&content),
            Some(other) => Err(DriverError::Config(format!(
                "Unsupported config format '.{}'",
                other
            ))),
        }
    }

    pub fn retry_wait(&self) -> Duration {
        Duration::from_millis(self.retry_wait_ms)
    }

    pub fn node_poll_interval(&self) -> Duration {
        Duration::from_millis(self.node_poll_ms)
    }

    pub fn validate(&self) -> DriverResult<()> {
        if self.nodes.is_empty() {
            return Err(DriverError::Config("No nodes configured".to_string()));
        }

        let mut names = HashSet::new();
        for node in &self.nodes {
            node.validate()?;
            if !names.insert(node.name()) {
                return Err(DriverError::Config(format!(
                    "Duplicate node name '{}'",
                    node.name()
                )));
            }
        }

        if self.node_poll_ms == 0 {
            return Err(DriverError::Config("node_poll_ms must be > 0".to_string()));
        }
        Ok(())
    }
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            nodes: Vec::new(),
            default_retry_count: 3,
            retry_wait_ms: 200,
            node_poll_ms: 5_000,
            client_id: None,
        }
    }
}

fn strip_scheme(addr: &str) -> &str {
    addr.strip_prefix("http://")
        .or_else(|| addr.strip_prefix("https://"))
        .or_else(|| addr.strip_prefix("tcp://"))
        .unwrap_or(addr)
        .trim_end_matches('/')
}

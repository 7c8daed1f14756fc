//! Client and server configuration, parsed from a TOML file.
//!
//! ```toml
//! [discovery]
//! discovery_ip = "BROADCAST_ALL"
//! access_clusters = "lab"
//! hosts_denied = "BADHOST"
//!
//! [lite]
//! datagram_size = 1450
//! ```
use std::{
    fs, io,
    net::SocketAddr,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    discovery::{ConnectionStrategy, DEFAULT_DISCOVERY_PORT, DEFAULT_MULTICAST_TTL, DISCOVERY_TIMEOUT},
    protocol::{DATAGRAM_SIZE, DEFAULT_POOL_CAPACITY, QUERY_TIMEOUT, ServerOptions},
};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path:?}: {source}")]
    Read { path: PathBuf, source: io::Error },

    #[error("invalid config {path:?}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClientConfig {
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub lite: LiteConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

/// Settings for locating a node on the local network.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// Identity announced in discovery requests.
    #[serde(default = "default_node_id")]
    pub node_id: String,
    /// Unset targets the default multicast group; `BROADCAST_ALL` or an
    /// empty string targets every local broadcast address; anything else is
    /// a comma separated list of addresses.
    pub discovery_ip: Option<String>,
    #[serde(default = "default_discovery_port")]
    pub discovery_port: u16,
    /// `ALL`, or a comma separated list of local addresses. Unset means the
    /// default local address.
    pub multicast_interfaces: Option<String>,
    pub access_clusters: Option<String>,
    pub hosts_permitted: Option<String>,
    pub hosts_denied: Option<String>,
    #[serde(default)]
    pub connection_strategy: ConnectionStrategy,
    #[serde(default = "default_discovery_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_ttl")]
    pub ttl: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiteConfig {
    #[serde(default = "default_datagram_size")]
    pub datagram_size: usize,
    #[serde(default = "default_query_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_pool_capacity")]
    pub pool_capacity: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_server_address")]
    pub address: SocketAddr,
    #[serde(default = "default_datagram_size")]
    pub datagram_size: usize,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_pool_capacity")]
    pub pool_capacity: usize,
}

fn default_node_id() -> String {
    seeker_node_id(&host_name())
}

/// Local host name from the environment, then `/etc/hostname`.
fn host_name() -> String {
    ["HOSTNAME", "COMPUTERNAME"]
        .iter()
        .find_map(|var| std::env::var(var).ok().filter(|host| !host.trim().is_empty()))
        .or_else(|| std::fs::read_to_string("/etc/hostname").ok())
        .map(|host| host.trim().to_string())
        .filter(|host| !host.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}

fn seeker_node_id(host: &str) -> String {
    let host: String = host
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_')
        .collect();
    format!("ClientSeeker_{host}")
}
fn default_discovery_port() -> u16 {
    DEFAULT_DISCOVERY_PORT
}
fn default_discovery_timeout_ms() -> u64 {
    DISCOVERY_TIMEOUT.as_millis() as u64
}
fn default_ttl() -> u32 {
    DEFAULT_MULTICAST_TTL
}
fn default_datagram_size() -> usize {
    DATAGRAM_SIZE
}
fn default_query_timeout_ms() -> u64 {
    QUERY_TIMEOUT.as_millis() as u64
}
fn default_pool_capacity() -> usize {
    DEFAULT_POOL_CAPACITY
}
fn default_server_address() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], crate::discovery::DEFAULT_NODE_PORT))
}
fn default_workers() -> usize {
    8
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            discovery_ip: None,
            discovery_port: default_discovery_port(),
            multicast_interfaces: None,
            access_clusters: None,
            hosts_permitted: None,
            hosts_denied: None,
            connection_strategy: ConnectionStrategy::default(),
            timeout_ms: default_discovery_timeout_ms(),
            ttl: default_ttl(),
        }
    }
}

impl DiscoveryConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for LiteConfig {
    fn default() -> Self {
        Self {
            datagram_size: default_datagram_size(),
            timeout_ms: default_query_timeout_ms(),
            pool_capacity: default_pool_capacity(),
        }
    }
}

impl LiteConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: default_server_address(),
            datagram_size: default_datagram_size(),
            workers: default_workers(),
            pool_capacity: default_pool_capacity(),
        }
    }
}

impl From<&ServerConfig> for ServerOptions {
    fn from(value: &ServerConfig) -> Self {
        ServerOptions {
            datagram_size: value.datagram_size,
            workers: value.workers,
            pool_capacity: value.pool_capacity,
        }
    }
}

impl ClientConfig {
    pub fn parse(content: &str, path: &Path) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Loads the config at `path`, or the defaults if there is no file.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&content, path)
    }
}

//! Configuration file loading.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::Error;
use crate::rules::RawRules;

/// Default DNS port appended to upstreams given without one.
pub const DEFAULT_DNS_PORT: u16 = 53;

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Address for the UDP and TCP listeners.
    #[serde(default = "default_addr")]
    pub addr: SocketAddr,

    /// Upstream resolvers in initial preference order.
    #[serde(default)]
    pub servers: Vec<String>,

    /// Per-upstream exchange timeout in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Log level filter (e.g. "info", "sdns=debug,warn").
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Seconds between stats lines; 0 disables them.
    #[serde(default = "default_stats_interval_secs")]
    pub stats_interval_secs: u64,

    /// Fixed address for `self` targets, skipping discovery.
    #[serde(default)]
    pub self_addr: Option<Ipv4Addr>,

    /// Addresses probed, in order, to discover this host's LAN address.
    #[serde(default = "default_probe_targets")]
    pub probe_targets: Vec<String>,

    /// Override rules.
    #[serde(default)]
    pub rules: RawRules,
}

fn default_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], DEFAULT_DNS_PORT))
}

fn default_timeout_ms() -> u64 {
    2000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_stats_interval_secs() -> u64 {
    60
}

fn default_probe_targets() -> Vec<String> {
    vec!["8.8.8.8:80".to_string(), "10.10.10.10:80".to_string()]
}

impl Config {
    /// Read, parse and validate a config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| Error::ConfigRead {
            path: path.to_path_buf(),
            source,
        })?;

        Self::from_toml(&contents)
    }

    /// Parse and validate config text.
    ///
    /// Upstreams without a port get port 53.
    pub fn from_toml(contents: &str) -> Result<Self, Error> {
        let mut config: Self = toml::from_str(contents)?;

        if config.servers.is_empty() {
            return Err(Error::NoUpstream);
        }
        for server in &mut config.servers {
            *server = normalize_upstream(server);
        }

        Ok(config)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Append the default port to an upstream address that has none.
///
/// Bare IPv6 addresses are bracketed so the result is a valid `host:port`.
pub fn normalize_upstream(server: &str) -> String {
    let server = server.trim();
    if let Ok(ip) = server.parse::<IpAddr>() {
        return SocketAddr::new(ip, DEFAULT_DNS_PORT).to_string();
    }
    if server.contains(':') {
        server.to_string()
    } else {
        format!("{server}:{DEFAULT_DNS_PORT}")
    }
}

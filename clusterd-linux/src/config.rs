//! Load and validate the cluster config: TOML file plus environment overrides.

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clusterd_core::{Role, SyncInterval};
use serde::Deserialize;

/// Default config file.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/clusterd/cluster.toml";

/// Required length of the shared key.
pub const KEY_LEN: usize = 32;

/// Cluster configuration. Read once at startup, never mutated.
/// Env overrides: CLUSTERD_BIND_ADDR, CLUSTERD_PORT, CLUSTERD_KEY.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClusterConfig {
    /// Cluster is switched off; the daemon exits at startup.
    #[serde(default)]
    pub disabled: bool,
    pub name: String,
    pub node_name: String,
    pub node_type: Role,
    /// Shared secret; all nodes must use the same one.
    pub key: String,
    #[serde(default = "default_bind_addr")]
    pub bind_addr: IpAddr,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Every node of the cluster, master included.
    pub nodes: Vec<String>,
    #[serde(default = "default_interval")]
    pub interval: SyncInterval,
    /// Seconds a peer may stay silent before its connection is dropped.
    #[serde(default = "default_socket_timeout")]
    pub socket_timeout: u64,
    #[serde(default = "default_sync_dir")]
    pub sync_dir: PathBuf,
    /// Run on the master after a round that changed its files.
    #[serde(default)]
    pub restart_command: Option<String>,
    #[serde(default)]
    pub log_file: Option<PathBuf>,
}

fn default_bind_addr() -> IpAddr {
    IpAddr::from([0, 0, 0, 0])
}
fn default_port() -> u16 {
    1516
}
fn default_interval() -> SyncInterval {
    SyncInterval::minutes(2)
}
fn default_socket_timeout() -> u64 {
    100
}
fn default_sync_dir() -> PathBuf {
    PathBuf::from("/var/lib/clusterd/shared")
}

impl ClusterConfig {
    pub fn socket_timeout(&self) -> Duration {
        Duration::from_secs(self.socket_timeout)
    }

    /// Configured nodes as addresses. Call after [`ClusterConfig::validate`].
    pub fn node_addrs(&self) -> Vec<IpAddr> {
        self.nodes.iter().filter_map(|n| n.trim().parse().ok()).collect()
    }

    /// Check everything the daemon relies on before it binds.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::Invalid("cluster name is empty".into()));
        }
        if self.node_name.trim().is_empty() {
            return Err(ConfigError::Invalid("node name is empty".into()));
        }
        if self.key.chars().count() != KEY_LEN {
            return Err(ConfigError::Invalid(format!(
                "key must be {KEY_LEN} characters long"
            )));
        }
        if self.port == 0 {
            return Err(ConfigError::Invalid("port must not be 0".into()));
        }
        if self.nodes.is_empty() {
            return Err(ConfigError::Invalid("no nodes configured".into()));
        }
        if let Some(bad) = self
            .nodes
            .iter()
            .find(|n| n.trim().parse::<IpAddr>().is_err())
        {
            return Err(ConfigError::Invalid(format!(
                "node {bad:?} is not an IP address"
            )));
        }
        if self.interval.magnitude == 0 {
            return Err(ConfigError::Invalid("interval must be greater than 0".into()));
        }
        if self.socket_timeout == 0 {
            return Err(ConfigError::Invalid(
                "socket_timeout must be greater than 0".into(),
            ));
        }
        Ok(())
    }
}

/// Read the config: explicit path, else the default path, then env overrides.
/// A missing file means the node is not part of a cluster.
pub fn read_config(path: Option<&Path>) -> Result<ClusterConfig, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new(DEFAULT_CONFIG_PATH));
    if !path.exists() {
        return Err(ConfigError::NotConfigured);
    }
    let s = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let mut c = parse(&s).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    apply_env(&mut c, |k| std::env::var(k).ok());
    Ok(c)
}

pub fn parse(s: &str) -> Result<ClusterConfig, toml::de::Error> {
    toml::from_str::<ClusterConfig>(s)
}

fn apply_env(c: &mut ClusterConfig, var: impl Fn(&str) -> Option<String>) {
    if let Some(s) = var("CLUSTERD_BIND_ADDR") {
        if let Ok(a) = s.parse::<IpAddr>() {
            c.bind_addr = a;
        }
    }
    if let Some(s) = var("CLUSTERD_PORT") {
        if let Ok(p) = s.parse::<u16>() {
            c.port = p;
        }
    }
    if let Some(s) = var("CLUSTERD_KEY") {
        c.key = s;
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cluster is not configured")]
    NotConfigured,
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("cannot parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid cluster configuration: {0}")]
    Invalid(String),
}

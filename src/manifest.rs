//! Configuration file parsing for netferry
//!
//! Parses `netferry.toml` agent configuration files using serde

use crate::error::{Error, Result};
use ipnet::Ipv4Net;
use serde::Deserialize;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

/// Load configuration from a file
///
/// A missing file yields the built-in defaults so a fresh host can run the
/// agent without writing any configuration first.
pub fn load(path: &Path) -> Result<AgentConfig> {
    let config = match fs::read_to_string(path) {
        Ok(content) => toml::from_str(&content)?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => AgentConfig::default(),
        Err(e) => {
            return Err(Error::ConfigRead {
                path: path.to_path_buf(),
                source: e,
            });
        }
    };

    config.validate()?;
    Ok(config)
}

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Address the agent API listens on
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,

    /// Directory holding the namespace handle files
    #[serde(default = "default_netns_dir")]
    pub netns_dir: PathBuf,

    /// JSON document backing the key-value store
    #[serde(default = "default_state_file")]
    pub state_file: PathBuf,

    /// Directory for rendezvous sockets (defaults to the system temp dir)
    #[serde(default)]
    pub runtime_dir: Option<PathBuf>,

    /// Hostname recorded on endpoints created by this agent
    #[serde(default = "default_public_hostname")]
    pub public_hostname: String,

    /// Host IP recorded on endpoints created by this agent
    #[serde(default = "default_public_ip")]
    pub public_ip: String,

    /// Range given to networks created without an explicit one
    #[serde(default = "default_ip_range")]
    pub default_ip_range: String,

    /// Overlay reconciler settings
    #[serde(default)]
    pub reconcile: ReconcileConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            netns_dir: default_netns_dir(),
            state_file: default_state_file(),
            runtime_dir: None,
            public_hostname: default_public_hostname(),
            public_ip: default_public_ip(),
            default_ip_range: default_ip_range(),
            reconcile: ReconcileConfig::default(),
        }
    }
}

impl AgentConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.default_ip_range.parse::<Ipv4Net>().map_err(|e| {
            Error::ConfigValidation(format!(
                "default_ip_range '{}' is not an IPv4 CIDR: {}",
                self.default_ip_range, e
            ))
        })?;

        if self.netns_dir.as_os_str().is_empty() {
            return Err(Error::ConfigValidation("netns_dir must not be empty".into()));
        }

        if self.state_file.as_os_str().is_empty() {
            return Err(Error::ConfigValidation("state_file must not be empty".into()));
        }

        if self.reconcile.interval_secs == 0 {
            return Err(Error::ConfigValidation(
                "reconcile.interval_secs must be greater than zero".into(),
            ));
        }

        Ok(())
    }

    /// Directory where rendezvous sockets are created
    pub fn runtime_dir(&self) -> PathBuf {
        self.runtime_dir.clone().unwrap_or_else(std::env::temp_dir)
    }

    /// Per-network lock files live next to the state file, so every
    /// process sharing the state also shares the locks
    pub fn lock_dir(&self) -> PathBuf {
        match self.state_file.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.join("locks"),
            _ => PathBuf::from("locks"),
        }
    }
}

fn default_listen() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 9999))
}

fn default_netns_dir() -> PathBuf {
    PathBuf::from("/var/run/netferry/netns")
}

fn default_state_file() -> PathBuf {
    PathBuf::from("/var/lib/netferry/state.json")
}

fn default_public_hostname() -> String {
    nix::unistd::gethostname()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "localhost".into())
}

fn default_public_ip() -> String {
    "127.0.0.1".into()
}

fn default_ip_range() -> String {
    "10.0.0.0/24".into()
}

fn default_interval_secs() -> u64 {
    30
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    60000
}

fn default_max_attempts() -> u8 {
    10
}

fn default_failure_threshold() -> usize {
    5
}

/// Overlay reconciler configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ReconcileConfig {
    /// Seconds between two reconciliation passes
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,

    /// Base delay before retrying a failed network
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Maximum retry delay
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Maximum retries before waiting for the next pass
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u8,

    /// Consecutive failures that open a network's circuit breaker
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: usize,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            max_attempts: default_max_attempts(),
            failure_threshold: default_failure_threshold(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal_config() {
        let config: AgentConfig = toml::from_str("").unwrap();
        assert_eq!(config.listen.port(), 9999);
        assert_eq!(config.default_ip_range, "10.0.0.0/24");
        assert_eq!(config.reconcile.interval_secs, 30);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_full_config() {
        let toml = r#"
listen = "0.0.0.0:7000"
netns_dir = "/run/ferry/ns"
state_file = "/srv/ferry/state.json"
runtime_dir = "/run/ferry"
public_hostname = "node-1"
public_ip = "192.168.10.4"
default_ip_range = "172.16.0.0/24"

[reconcile]
interval_secs = 10
failure_threshold = 3
"#;

        let config: AgentConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.listen.port(), 7000);
        assert_eq!(config.public_hostname, "node-1");
        assert_eq!(config.runtime_dir(), PathBuf::from("/run/ferry"));
        assert_eq!(config.lock_dir(), PathBuf::from("/srv/ferry/locks"));
        assert_eq!(config.reconcile.interval_secs, 10);
        assert_eq!(config.reconcile.failure_threshold, 3);
        assert_eq!(config.reconcile.max_attempts, 10);
    }

    #[test]
    fn test_invalid_range_rejected() {
        let config: AgentConfig = toml::from_str(r#"default_ip_range = "not-a-cidr""#).unwrap();
        assert!(matches!(config.validate(), Err(Error::ConfigValidation(_))));
    }

    #[test]
    fn test_zero_interval_rejected() {
        let config: AgentConfig = toml::from_str("[reconcile]\ninterval_secs = 0").unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.state_file, PathBuf::from("/var/lib/netferry/state.json"));
        assert_eq!(config.lock_dir(), PathBuf::from("/var/lib/netferry/locks"));
    }
}

//! Transport configuration.
//!
//! Configuration is loaded in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML config file (if specified via RSOCKET_CONFIG)
//! 3. Environment variables

use rsocket_core::{LeasePolicy, MIN_FRAGMENT_SIZE};
use rsocket_protocol::{DEFAULT_PORT, MAX_FRAME_LENGTH, MAX_REQUEST_N};
use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Transport configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Network configuration.
    pub network: NetworkConfig,
    /// Per-connection protocol settings.
    pub connection: ConnectionConfig,
    /// Lease configuration.
    pub lease: LeaseConfig,
}

impl Config {
    /// Loads configuration from file, then applies environment variable overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(path) = std::env::var("RSOCKET_CONFIG") {
            config = Self::from_file(&path)?;
        }

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        let config: Config = serde_yaml::from_str(&content)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        Ok(config)
    }

    /// Loads configuration from environment variables only.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    fn apply_env_overrides(&mut self) {
        self.network.apply_env_overrides();
        self.connection.apply_env_overrides();
        self.lease.apply_env_overrides();
    }

    /// Saves configuration to a YAML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let content = serde_yaml::to_string(self)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        std::fs::write(path, content).map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        Ok(())
    }

    /// Checks cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.connection.validate()?;
        self.lease.validate()?;
        if self.network.max_connections == 0 {
            return Err(ConfigError::ValidationError(
                "max_connections must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Network configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address to bind to.
    #[serde(with = "socket_addr_serde")]
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Time allowed for a new connection to send SETUP, in milliseconds.
    pub setup_timeout_ms: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, DEFAULT_PORT)),
            max_connections: 1000,
            setup_timeout_ms: 10_000,
        }
    }
}

impl NetworkConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(addr) = std::env::var("RSOCKET_BIND") {
            if let Ok(parsed) = addr.parse() {
                self.bind_addr = parsed;
            }
        }

        if let Ok(max) = std::env::var("RSOCKET_MAX_CONNECTIONS") {
            if let Ok(n) = max.parse() {
                self.max_connections = n;
            }
        }

        if let Ok(timeout) = std::env::var("RSOCKET_SETUP_TIMEOUT_MS") {
            if let Ok(ms) = timeout.parse() {
                self.setup_timeout_ms = ms;
            }
        }
    }

    pub fn setup_timeout(&self) -> Duration {
        Duration::from_millis(self.setup_timeout_ms)
    }
}

/// Protocol settings applied to each connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Maximum outbound frame size in bytes, 64 to 16 MiB - 1. 0 fragments
    /// only payloads too large for a single frame.
    pub fragment_size: usize,
    /// Interval between KEEPALIVE frames sent by the client, in milliseconds.
    pub keepalive_interval_ms: u32,
    /// Silence after which the peer is considered dead, in milliseconds.
    pub max_lifetime_ms: u32,
    /// Default initial request N for streams opened by the client.
    pub initial_request_n: u32,
    /// MIME type announced for payload data.
    pub data_mime_type: String,
    /// MIME type announced for payload metadata.
    pub metadata_mime_type: String,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            fragment_size: 0,
            keepalive_interval_ms: 20_000,
            max_lifetime_ms: 90_000,
            initial_request_n: MAX_REQUEST_N,
            data_mime_type: "application/octet-stream".to_string(),
            metadata_mime_type: "application/octet-stream".to_string(),
        }
    }
}

impl ConnectionConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(size) = std::env::var("RSOCKET_FRAGMENT_SIZE") {
            if let Ok(n) = size.parse() {
                self.fragment_size = n;
            }
        }

        if let Ok(interval) = std::env::var("RSOCKET_KEEPALIVE_MS") {
            if let Ok(ms) = interval.parse() {
                self.keepalive_interval_ms = ms;
            }
        }

        if let Ok(lifetime) = std::env::var("RSOCKET_MAX_LIFETIME_MS") {
            if let Ok(ms) = lifetime.parse() {
                self.max_lifetime_ms = ms;
            }
        }

        if let Ok(n) = std::env::var("RSOCKET_INITIAL_REQUEST_N") {
            if let Ok(n) = n.parse() {
                self.initial_request_n = n;
            }
        }

        if let Ok(mime) = std::env::var("RSOCKET_DATA_MIME_TYPE") {
            self.data_mime_type = mime;
        }

        if let Ok(mime) = std::env::var("RSOCKET_METADATA_MIME_TYPE") {
            self.metadata_mime_type = mime;
        }
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_millis(u64::from(self.keepalive_interval_ms))
    }

    pub fn max_lifetime(&self) -> Duration {
        Duration::from_millis(u64::from(self.max_lifetime_ms))
    }

    /// Validates connection settings.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.fragment_size != 0 && self.fragment_size < MIN_FRAGMENT_SIZE {
            return Err(ConfigError::ValidationError(format!(
                "fragment_size must be 0 or at least {MIN_FRAGMENT_SIZE}, got {}",
                self.fragment_size
            )));
        }
        if self.fragment_size > MAX_FRAME_LENGTH {
            return Err(ConfigError::ValidationError(format!(
                "fragment_size must not exceed {MAX_FRAME_LENGTH}, got {}",
                self.fragment_size
            )));
        }
        if self.keepalive_interval_ms == 0 {
            return Err(ConfigError::ValidationError(
                "keepalive_interval_ms must be positive".to_string(),
            ));
        }
        if self.max_lifetime_ms < self.keepalive_interval_ms {
            return Err(ConfigError::ValidationError(
                "max_lifetime_ms must not be shorter than keepalive_interval_ms".to_string(),
            ));
        }
        if self.initial_request_n == 0 {
            return Err(ConfigError::ValidationError(
                "initial_request_n must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// How a requester behaves when the peer's lease is exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeaseMode {
    /// Hold requests until the next LEASE arrives.
    Queue,
    /// Fail requests immediately with REJECTED.
    Reject,
}

/// Lease configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LeaseConfig {
    /// Request lease semantics in SETUP (client) or honor them (server).
    pub enabled: bool,
    /// Requester behavior without budget.
    pub mode: LeaseMode,
    /// Maximum requests queued awaiting budget.
    pub max_pending: usize,
    /// Requests granted to the peer per LEASE frame.
    pub grant_requests: u32,
    /// Validity of each grant, in milliseconds. A new grant is issued when
    /// the previous one expires.
    pub ttl_ms: u32,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            mode: LeaseMode::Queue,
            max_pending: 256,
            grant_requests: 1000,
            ttl_ms: 30_000,
        }
    }
}

impl LeaseConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(enabled) = std::env::var("RSOCKET_LEASE_ENABLED") {
            self.enabled = enabled == "1" || enabled.to_lowercase() == "true";
        }

        if let Ok(mode) = std::env::var("RSOCKET_LEASE_MODE") {
            self.mode = match mode.to_lowercase().as_str() {
                "reject" => LeaseMode::Reject,
                _ => LeaseMode::Queue,
            };
        }

        if let Ok(max) = std::env::var("RSOCKET_LEASE_MAX_PENDING") {
            if let Ok(n) = max.parse() {
                self.max_pending = n;
            }
        }

        if let Ok(grant) = std::env::var("RSOCKET_LEASE_GRANT") {
            if let Ok(n) = grant.parse() {
                self.grant_requests = n;
            }
        }

        if let Ok(ttl) = std::env::var("RSOCKET_LEASE_TTL_MS") {
            if let Ok(ms) = ttl.parse() {
                self.ttl_ms = ms;
            }
        }
    }

    /// Engine policy for the configured mode.
    pub fn policy(&self) -> LeasePolicy {
        match self.mode {
            LeaseMode::Queue => LeasePolicy::Queue {
                max_pending: self.max_pending,
            },
            LeaseMode::Reject => LeasePolicy::Reject,
        }
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_millis(u64::from(self.ttl_ms))
    }

    /// Validates lease settings.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.enabled && self.ttl_ms == 0 {
            return Err(ConfigError::ValidationError(
                "lease enabled but ttl_ms is 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Configuration error.
#[derive(Debug)]
pub enum ConfigError {
    IoError(PathBuf, std::io::Error),
    ParseError(PathBuf, String),
    ValidationError(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::IoError(path, e) => {
                write!(f, "failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::ParseError(path, e) => {
                write!(f, "failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::ValidationError(msg) => {
                write!(f, "configuration validation failed: {}", msg)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

/// SocketAddr as a plain string in YAML.
mod socket_addr_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::net::SocketAddr;

    pub fn serialize<S>(addr: &SocketAddr, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&addr.to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<SocketAddr, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.network.bind_addr.port(), DEFAULT_PORT);
        assert_eq!(config.connection.fragment_size, 0);
        assert_eq!(config.connection.initial_request_n, MAX_REQUEST_N);
        assert!(!config.lease.enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_yaml_roundtrip() {
        let mut config = Config::default();
        config.lease.mode = LeaseMode::Reject;
        config.connection.fragment_size = 1024;
        let yaml = serde_yaml::to_string(&config).unwrap();
        let parsed: Config = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed.network.bind_addr, config.network.bind_addr);
        assert_eq!(parsed.lease.mode, LeaseMode::Reject);
        assert_eq!(parsed.connection.fragment_size, 1024);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            "network:\n  bind_addr: \"0.0.0.0:9000\"\nlease:\n  enabled: true\n  mode: reject"
        )
        .unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.network.bind_addr.port(), 9000);
        assert_eq!(config.network.max_connections, 1000);
        assert!(config.lease.enabled);
        assert_eq!(config.lease.policy(), LeasePolicy::Reject);
        assert_eq!(config.connection.keepalive_interval_ms, 20_000);
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rsocket.yaml");
        let mut config = Config::default();
        config.connection.max_lifetime_ms = 120_000;
        config.save(&path).unwrap();

        let loaded = Config::from_file(&path).unwrap();
        assert_eq!(loaded.connection.max_lifetime_ms, 120_000);
    }

    #[test]
    fn test_invalid_yaml_reports_path() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "network: [not, a, map]").unwrap();
        let err = Config::from_file(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::ParseError(ref p, _) if p == file.path()));
    }

    #[test]
    fn test_fragment_size_validation() {
        let mut config = ConnectionConfig::default();
        config.fragment_size = 32;
        assert!(config.validate().is_err());
        config.fragment_size = MIN_FRAGMENT_SIZE;
        assert!(config.validate().is_ok());
        config.fragment_size = 0;
        assert!(config.validate().is_ok());
        config.fragment_size = MAX_FRAME_LENGTH;
        assert!(config.validate().is_ok());
        config.fragment_size = MAX_FRAME_LENGTH + 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_lifetime_shorter_than_keepalive_rejected() {
        let config = ConnectionConfig {
            keepalive_interval_ms: 10_000,
            max_lifetime_ms: 5_000,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_lease_policy_mapping() {
        let lease = LeaseConfig {
            max_pending: 8,
            ..Default::default()
        };
        assert_eq!(lease.policy(), LeasePolicy::Queue { max_pending: 8 });

        let lease = LeaseConfig {
            enabled: true,
            ttl_ms: 0,
            ..Default::default()
        };
        assert!(lease.validate().is_err());
    }
}

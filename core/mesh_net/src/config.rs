//! Node configuration
//!
//! Loaded from a JSON file; every field has a default so a config file only
//! needs to name what it changes:
//!
//! ```json
//! {
//!   "internal_port": 7000,
//!   "external_host": "0.0.0.0",
//!   "external_port": 9000,
//!   "peers": { "directory": { "host": "127.0.0.1", "port": 7100 } }
//! }
//! ```

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::protocol::{PeerType, MAX_PAYLOAD_LEN};

// ============================================================================
// Defaults
// ============================================================================

pub const DEFAULT_TICK_INTERVAL_MS: u64 = 10;
pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 10_000;
pub const DEFAULT_SHUTDOWN_TICK_MS: u64 = 1_000;
pub const DEFAULT_SHUTDOWN_TIME_MS: u64 = 60_000;
pub const DEFAULT_RTT_TOLERANCE_MS: i64 = 10;

/// Lower bound on the heartbeat timer period
const MIN_HEARTBEAT_PERIOD_MS: u64 = 1_000;

// ============================================================================
// Config Types
// ============================================================================

/// Static address of a well-known peer role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerEndpoint {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Role tick period
    pub tick_interval_ms: u64,
    /// Heartbeat period; connections silent for twice this long are dropped
    pub heartbeat_interval_ms: u64,

    /// Bind address of the peer-facing listener
    pub internal_host: String,
    /// 0 picks an ephemeral port
    pub internal_port: u16,
    /// Address advertised to peers, defaults to `internal_host`
    pub internal_exposed_host: Option<String>,

    /// Bind address of the client-facing listener, none disables it
    pub external_host: Option<String>,
    pub external_port: u16,
    /// Address advertised to clients, defaults to `external_host`
    pub external_exposed_host: Option<String>,

    /// Addresses allowed on the internal listener (`10.0.0.5` or `10.0.*`)
    pub server_addresses: Vec<String>,

    /// Static endpoints keyed by peer type name (`directory`, `gateway`, ...)
    pub peers: BTreeMap<String, PeerEndpoint>,

    pub shutdown_tick_ms: u64,
    /// Grace period between SIGTERM and exit
    pub shutdown_time_ms: u64,

    /// Background worker threads
    pub threads: usize,
    /// Gateways whose RTT is within this of the fastest are considered equal
    pub rtt_tolerance_ms: i64,
    /// Log every frame sent and received
    pub debug_packet: bool,
    /// Largest accepted frame payload
    pub max_payload_len: usize,
    /// Worker id embedded in connection ids
    pub worker_id: u16,
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig {
            tick_interval_ms: DEFAULT_TICK_INTERVAL_MS,
            heartbeat_interval_ms: DEFAULT_HEARTBEAT_INTERVAL_MS,
            internal_host: "localhost".to_string(),
            internal_port: 0,
            internal_exposed_host: None,
            external_host: None,
            external_port: 0,
            external_exposed_host: None,
            server_addresses: vec!["127.0.0.1".to_string()],
            peers: BTreeMap::new(),
            shutdown_tick_ms: DEFAULT_SHUTDOWN_TICK_MS,
            shutdown_time_ms: DEFAULT_SHUTDOWN_TIME_MS,
            threads: 1,
            rtt_tolerance_ms: DEFAULT_RTT_TOLERANCE_MS,
            debug_packet: false,
            max_payload_len: MAX_PAYLOAD_LEN,
            worker_id: crate::ids::DEFAULT_WORKER_ID,
        }
    }
}

impl NodeConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: NodeConfig = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.internal_host.is_empty() {
            return Err(ConfigError::Invalid("internal_host is empty".into()));
        }
        if self.max_payload_len == 0 || self.max_payload_len > MAX_PAYLOAD_LEN {
            return Err(ConfigError::Invalid(format!(
                "max_payload_len must be in 1..={}",
                MAX_PAYLOAD_LEN
            )));
        }
        if self.threads == 0 {
            return Err(ConfigError::Invalid("threads must be at least 1".into()));
        }
        for name in self.peers.keys() {
            name.parse::<PeerType>().map_err(ConfigError::Invalid)?;
        }
        Ok(())
    }

    /// Static endpoint configured for `peer_type`.
    pub fn peer_endpoint(&self, peer_type: PeerType) -> Option<&PeerEndpoint> {
        self.peers.get(peer_type.name())
    }

    /// Static endpoints with parsed keys. Unknown names are skipped.
    pub fn peer_endpoints(&self) -> BTreeMap<PeerType, PeerEndpoint> {
        self.peers
            .iter()
            .filter_map(|(name, ep)| name.parse().ok().map(|t| (t, ep.clone())))
            .collect()
    }

    pub fn tick_period(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }

    /// Drain period of a SIGTERM shutdown.
    pub fn shutdown_period(&self) -> Duration {
        Duration::from_millis(self.shutdown_time_ms)
    }

    pub fn heartbeat_period(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms.max(MIN_HEARTBEAT_PERIOD_MS))
    }

    pub fn internal_exposed(&self) -> &str {
        self.internal_exposed_host
            .as_deref()
            .unwrap_or(&self.internal_host)
    }

    pub fn external_exposed(&self) -> &str {
        self.external_exposed_host
            .as_deref()
            .or(self.external_host.as_deref())
            .unwrap_or("")
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = NodeConfig::from_json("{}").unwrap();
        assert_eq!(config.tick_interval_ms, 10);
        assert_eq!(config.heartbeat_interval_ms, 10_000);
        assert_eq!(config.shutdown_tick_ms, 1_000);
        assert_eq!(config.shutdown_time_ms, 60_000);
        assert_eq!(config.threads, 1);
        assert_eq!(config.max_payload_len, MAX_PAYLOAD_LEN);
        assert_eq!(config.server_addresses, vec!["127.0.0.1"]);
        assert!(config.external_host.is_none());
    }

    #[test]
    fn test_timer_periods_clamped() {
        let config = NodeConfig {
            tick_interval_ms: 0,
            heartbeat_interval_ms: 10,
            ..Default::default()
        };
        assert_eq!(config.tick_period(), Duration::from_millis(1));
        assert_eq!(config.heartbeat_period(), Duration::from_millis(1_000));
    }

    #[test]
    fn test_from_file_with_peers() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "internal_port": 7000,
                "external_host": "0.0.0.0",
                "external_port": 9000,
                "external_exposed_host": "203.0.113.9",
                "peers": {{ "directory": {{ "host": "127.0.0.1", "port": 7100 }} }}
            }}"#
        )
        .unwrap();

        let config = NodeConfig::from_file(file.path()).unwrap();
        assert_eq!(config.internal_port, 7000);
        assert_eq!(config.external_exposed(), "203.0.113.9");
        assert_eq!(config.internal_exposed(), "localhost");
        assert_eq!(
            config.peer_endpoint(PeerType::Directory),
            Some(&PeerEndpoint {
                host: "127.0.0.1".into(),
                port: 7100
            })
        );
        assert_eq!(config.peer_endpoints().len(), 1);
    }

    #[test]
    fn test_invalid_values() {
        assert!(matches!(
            NodeConfig::from_json(r#"{"threads": 0}"#),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            NodeConfig::from_json(r#"{"max_payload_len": 70000}"#),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            NodeConfig::from_json(r#"{"peers": {"wizard": {"host": "h", "port": 1}}}"#),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            NodeConfig::from_json("not json"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_missing_file() {
        let err = NodeConfig::from_file("/nonexistent/mesh.json").unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}

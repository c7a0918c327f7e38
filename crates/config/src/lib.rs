//! Capmesh Configuration Module
//!
//! Defaults and file-backed configuration for the capmesh node: the
//! reconciliation timings, the P2P stream limits, and the bootstrap network
//! description that seeds the node before the on-chain registry is reachable.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Reconciliation tick interval.
pub const DEFAULT_TICK_INTERVAL_SECS: u64 = 12;

/// Bootstrap discovery retry budget for a not-yet-published local trigger.
pub const DEFAULT_DISCOVERY_RETRY_ATTEMPTS: u32 = 60;
pub const DEFAULT_DISCOVERY_RETRY_DELAY_MS: u64 = 1_000;

/// Remote trigger registration maintenance intervals.
pub const DEFAULT_REGISTRATION_REFRESH_MS: u64 = 20_000;
pub const DEFAULT_REGISTRATION_EXPIRY_MS: u64 = 60_000;

/// Per-request timeout for remote target execution.
pub const DEFAULT_TARGET_REQUEST_TIMEOUT_SECS: u64 = 60;

/// P2P stream limits
pub const DEFAULT_INCOMING_BUFFER_BYTES: usize = 1_000_000;
pub const DEFAULT_OUTGOING_BUFFER_BYTES: usize = 1_000_000;
pub const DEFAULT_MAX_MESSAGE_LEN_BYTES: usize = 100_000;

/// P2P token-bucket rate limits
pub const DEFAULT_MESSAGE_RATE_PER_SEC: f64 = 100.0;
pub const DEFAULT_MESSAGE_BURST: u64 = 1_000;
pub const DEFAULT_BYTES_RATE_PER_SEC: f64 = 100_000.0;
pub const DEFAULT_BYTES_BURST: u64 = 1_000_000;

/// Configuration errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Timing knobs of the reconciliation loop; every field is overridable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncerConfig {
    pub tick_interval_secs: u64,
    pub discovery_retry_attempts: u32,
    pub discovery_retry_delay_ms: u64,
    pub registration_refresh_ms: u64,
    pub registration_expiry_ms: u64,
    pub target_request_timeout_secs: u64,
}

impl Default for SyncerConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: DEFAULT_TICK_INTERVAL_SECS,
            discovery_retry_attempts: DEFAULT_DISCOVERY_RETRY_ATTEMPTS,
            discovery_retry_delay_ms: DEFAULT_DISCOVERY_RETRY_DELAY_MS,
            registration_refresh_ms: DEFAULT_REGISTRATION_REFRESH_MS,
            registration_expiry_ms: DEFAULT_REGISTRATION_EXPIRY_MS,
            target_request_timeout_secs: DEFAULT_TARGET_REQUEST_TIMEOUT_SECS,
        }
    }
}

impl SyncerConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs)
    }

    pub fn discovery_retry_delay(&self) -> Duration {
        Duration::from_millis(self.discovery_retry_delay_ms)
    }

    pub fn registration_refresh(&self) -> Duration {
        Duration::from_millis(self.registration_refresh_ms)
    }

    pub fn registration_expiry(&self) -> Duration {
        Duration::from_millis(self.registration_expiry_ms)
    }

    pub fn target_request_timeout(&self) -> Duration {
        Duration::from_secs(self.target_request_timeout_secs)
    }
}

/// Static description of one DON, as written in the config file.
///
/// Peer ids stay in text form here; parsing into typed identities happens
/// where the bootstrap state is assembled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DonDescriptor {
    pub id: u32,
    pub f: u8,
    pub members: Vec<String>,
}

fn default_trigger_capability_name() -> String {
    "streams-trigger".to_string()
}

fn default_trigger_capability_version() -> String {
    "1.0.0".to_string()
}

/// Static network description used to seed the node before the on-chain
/// registry has produced a snapshot. Supplied entirely by configuration;
/// nothing here is compiled in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BootstrapConfig {
    /// Extra peers to keep connected regardless of registry content.
    #[serde(default)]
    pub static_peers: Vec<String>,

    /// The workflow DON this network starts with.
    pub workflow_don: DonDescriptor,

    /// The trigger capability DON this network starts with.
    pub trigger_don: DonDescriptor,

    /// Signer addresses (hex, 0x-prefixed) aligned with `trigger_don.members`.
    pub trigger_don_signers: Vec<String>,

    /// Labelled name of the bootstrap trigger capability.
    #[serde(default = "default_trigger_capability_name")]
    pub trigger_capability_name: String,

    /// Version of the bootstrap trigger capability.
    #[serde(default = "default_trigger_capability_version")]
    pub trigger_capability_version: String,
}

fn default_contract_name() -> String {
    "capability_registry".to_string()
}

/// Where the registry contract lives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistryConfig {
    #[serde(default = "default_contract_name")]
    pub contract_name: String,
    pub contract_address: String,
}

/// Top-level node configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeConfig {
    /// This node's own P2P identity (base58).
    pub peer_id: String,

    #[serde(default)]
    pub syncer: SyncerConfig,

    pub registry: RegistryConfig,

    pub bootstrap: BootstrapConfig,
}

impl NodeConfig {
    /// Parses a configuration from TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Loads a configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
peer_id = "4vJ9JU1bJJE96FWSJKvHsmmFADCg4gpZQff4P3bkLKi"

[registry]
contract_address = "0x1234567890abcdef1234567890abcdef12345678"

[syncer]
tick_interval_secs = 3

[bootstrap]
static_peers = ["8qbHbw2BbbTHBW1sbeqakYXVKRQM8Ne7pLK7m6CVfeR"]
trigger_don_signers = ["0x9CcE7293a4Cc2621b61193135A95928735e4795F"]

[bootstrap.workflow_don]
id = 100
f = 1
members = ["4vJ9JU1bJJE96FWSJKvHsmmFADCg4gpZQff4P3bkLKi"]

[bootstrap.trigger_don]
id = 200
f = 0
members = ["8qbHbw2BbbTHBW1sbeqakYXVKRQM8Ne7pLK7m6CVfeR"]
"#;

    #[test]
    fn syncer_defaults_match_constants() {
        let cfg = SyncerConfig::default();
        assert_eq!(cfg.tick_interval(), Duration::from_secs(12));
        assert_eq!(cfg.discovery_retry_attempts, 60);
        assert_eq!(cfg.discovery_retry_delay(), Duration::from_millis(1_000));
        assert_eq!(cfg.registration_refresh(), Duration::from_millis(20_000));
        assert_eq!(cfg.registration_expiry(), Duration::from_millis(60_000));
        assert_eq!(cfg.target_request_timeout(), Duration::from_secs(60));
    }

    #[test]
    fn parses_sample_and_applies_defaults() {
        let cfg = NodeConfig::from_toml_str(SAMPLE).expect("valid config");
        assert_eq!(cfg.syncer.tick_interval_secs, 3);
        // Unset fields fall back to defaults.
        assert_eq!(cfg.syncer.discovery_retry_attempts, 60);
        assert_eq!(cfg.bootstrap.trigger_capability_name, "streams-trigger");
        assert_eq!(cfg.bootstrap.trigger_capability_version, "1.0.0");
        assert_eq!(cfg.registry.contract_name, "capability_registry");
        assert_eq!(cfg.bootstrap.workflow_don.id, 100);
        assert_eq!(cfg.bootstrap.trigger_don.f, 0);
    }

    #[test]
    fn missing_required_section_fails() {
        let err = NodeConfig::from_toml_str("peer_id = \"x\"").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn loads_from_file() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        file.write_all(SAMPLE.as_bytes()).expect("write");
        let cfg = NodeConfig::load(file.path()).expect("load");
        assert_eq!(
            cfg.peer_id,
            "4vJ9JU1bJJE96FWSJKvHsmmFADCg4gpZQff4P3bkLKi"
        );
    }
}

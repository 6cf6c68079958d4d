//! Engine configuration
//!
//! Every field has a default, so a config file only lists what it changes.
//! Durations are stored in milliseconds and read back through accessors.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ChainData;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid config: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Socket, Tor client and circuit pool settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TorConfig {
    /// Bridge every transport dials
    pub bridge_endpoint: String,
    pub socket_pool_capacity: usize,
    pub tor_pool_capacity: usize,
    pub circuit_pool_capacity: usize,
    pub dial_timeout_ms: u64,
    /// Flat delay between failed dials
    pub dial_retry_delay_ms: u64,
    pub handshake_timeout_ms: u64,
    pub create_timeout_ms: u64,
    pub microdesc_timeout_ms: u64,
    pub extend_timeout_ms: u64,
    /// Relay picks per hop before the circuit build is abandoned
    pub extend_attempts: u32,
    /// Plain HTTP endpoint every new circuit must reach
    pub self_test_url: String,
    pub self_test_rounds: u32,
    pub self_test_timeout_ms: u64,
}

impl Default for TorConfig {
    fn default() -> Self {
        Self {
            bridge_endpoint: "wss://snowflake.torproject.net/".to_string(),
            socket_pool_capacity: 2,
            tor_pool_capacity: 2,
            circuit_pool_capacity: 8,
            dial_timeout_ms: 2_000,
            dial_retry_delay_ms: 1_000,
            handshake_timeout_ms: 2_000,
            create_timeout_ms: 1_000,
            microdesc_timeout_ms: 1_000,
            extend_timeout_ms: 1_000,
            extend_attempts: 3,
            self_test_url: "http://detectportal.firefox.com".to_string(),
            self_test_rounds: 3,
            self_test_timeout_ms: 1_000,
        }
    }
}

impl TorConfig {
    pub fn dial_timeout(&self) -> Duration {
        Duration::from_millis(self.dial_timeout_ms)
    }

    pub fn dial_retry_delay(&self) -> Duration {
        Duration::from_millis(self.dial_retry_delay_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn create_timeout(&self) -> Duration {
        Duration::from_millis(self.create_timeout_ms)
    }

    pub fn microdesc_timeout(&self) -> Duration {
        Duration::from_millis(self.microdesc_timeout_ms)
    }

    pub fn extend_timeout(&self) -> Duration {
        Duration::from_millis(self.extend_timeout_ms)
    }

    pub fn self_test_timeout(&self) -> Duration {
        Duration::from_millis(self.self_test_timeout_ms)
    }
}

/// Multi-path fetch settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct FetchConfig {
    /// Bound on waiting for one pool slot during a fetch
    pub acquire_timeout_ms: u64,
    /// Per-attempt timeout is this many times the current ping estimate
    pub ping_multiplier: u32,
    /// Ping estimate before any circuit has been measured
    pub initial_ping_ms: u64,
    /// Wait imposed on a socket connection after it failed
    pub socket_cooldown_ms: u64,
    /// Bound on opening a WebSocket RPC connection
    pub connect_timeout_ms: u64,
    /// Connections built per RPC endpoint
    pub connections_per_endpoint: usize,
    /// Refetch cooldown stamped on fetched data
    pub data_cooldown_ms: u64,
    /// Expiration stamped on fetched data
    pub data_expiration_ms: u64,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            acquire_timeout_ms: 1_000,
            ping_multiplier: 5,
            initial_ping_ms: 1_000,
            socket_cooldown_ms: 1_000,
            connect_timeout_ms: 5_000,
            connections_per_endpoint: 3,
            data_cooldown_ms: 60 * 1_000,
            data_expiration_ms: 365 * 24 * 60 * 60 * 1_000,
        }
    }
}

impl FetchConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    pub fn initial_ping(&self) -> Duration {
        Duration::from_millis(self.initial_ping_ms)
    }

    pub fn socket_cooldown(&self) -> Duration {
        Duration::from_millis(self.socket_cooldown_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn data_cooldown(&self) -> Duration {
        Duration::from_millis(self.data_cooldown_ms)
    }

    pub fn data_expiration(&self) -> Duration {
        Duration::from_millis(self.data_expiration_ms)
    }
}

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrumeConfig {
    pub tor: TorConfig,
    pub fetch: FetchConfig,
    pub chains: Vec<ChainData>,
}

impl BrumeConfig {
    /// Parse and validate a JSON config
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a JSON config file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let capacities = [
            ("tor.socketPoolCapacity", self.tor.socket_pool_capacity),
            ("tor.torPoolCapacity", self.tor.tor_pool_capacity),
            ("tor.circuitPoolCapacity", self.tor.circuit_pool_capacity),
            ("fetch.connectionsPerEndpoint", self.fetch.connections_per_endpoint),
        ];
        for (name, capacity) in capacities {
            if capacity == 0 {
                return Err(ConfigError::Invalid(format!("{} must be at least 1", name)));
            }
        }
        if self.tor.extend_attempts == 0 {
            return Err(ConfigError::Invalid("tor.extendAttempts must be at least 1".to_string()));
        }
        for chain in &self.chains {
            if chain.urls.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "chain {} has no RPC endpoints",
                    chain.chain_id
                )));
            }
        }
        Ok(())
    }
}

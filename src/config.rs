//! Node configuration
//!
//! All sections deserialize from a single JSON document; missing fields take
//! their defaults, so an empty object `{}` is a valid configuration.

use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use serde::{Deserialize, Serialize};
use crate::{Result, QkdNetError};

/// EtherType carrying key-protocol control frames
pub const DEFAULT_CONTROL_ETHERTYPE: u16 = 0x88B5;

/// Controller (key custodian) settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Address the push ingest listener binds to
    pub push_listen_addr: String,
    /// Concurrent push exchanges admitted before answering `ERR:BUSY`
    pub max_concurrent_pushes: usize,
    /// Largest push payload read from one connection, in bytes
    pub max_push_payload: usize,
    /// EtherType of key-protocol control frames
    pub control_ethertype: u16,
    /// Pause before flooding a key reply
    pub flood_delay_ms: u64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            push_listen_addr: "127.0.0.1:7001".to_string(),
            max_concurrent_pushes: 64,
            max_push_payload: 65535,
            control_ethertype: DEFAULT_CONTROL_ETHERTYPE,
            flood_delay_ms: 500,
        }
    }
}

impl ControllerConfig {
    pub fn flood_delay(&self) -> Duration {
        Duration::from_millis(self.flood_delay_ms)
    }
}

/// Relay requester / consumer settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// How long the requester waits for the controller's reply
    pub reply_deadline_secs: u64,
    /// Receive poll granularity while waiting for the reply
    pub poll_interval_ms: u64,
    /// UDP port the key is forwarded to
    pub downstream_port: u16,
    /// Address the consumer binds to
    pub consumer_listen_addr: String,
    /// EtherType of key-protocol control frames
    pub control_ethertype: u16,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            reply_deadline_secs: 20,
            poll_interval_ms: 1000,
            downstream_port: 6000,
            consumer_listen_addr: "0.0.0.0:6000".to_string(),
            control_ethertype: DEFAULT_CONTROL_ETHERTYPE,
        }
    }
}

impl RelayConfig {
    pub fn reply_deadline(&self) -> Duration {
        Duration::from_secs(self.reply_deadline_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn consumer_addr(&self) -> Result<SocketAddr> {
        self.consumer_listen_addr.parse().map_err(|e| {
            QkdNetError::Config(format!("Invalid consumer address {}: {}", self.consumer_listen_addr, e))
        })
    }
}

/// Key agreement settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HandshakeConfig {
    /// Bounded wait for each peer message
    pub wait_timeout_ms: u64,
    /// Pause between attempts
    pub pause_ms: u64,
    /// Attempts allowed for one key position before giving up
    pub max_attempts_per_position: u32,
    /// First backoff step after a failed attempt
    pub backoff_base_ms: u64,
    /// Backoff ceiling
    pub backoff_max_ms: u64,
    /// Confirm matches with the literal bit value (`seq:0:bit`)
    pub disclose_bits: bool,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            wait_timeout_ms: 2000,
            pause_ms: 50,
            max_attempts_per_position: 64,
            backoff_base_ms: 10,
            backoff_max_ms: 1000,
            disclose_bits: true,
        }
    }
}

impl HandshakeConfig {
    pub fn wait_timeout(&self) -> Duration {
        Duration::from_millis(self.wait_timeout_ms)
    }

    pub fn pause(&self) -> Duration {
        Duration::from_millis(self.pause_ms)
    }

    /// Backoff after the `failures`-th consecutive failed attempt
    pub fn backoff(&self, failures: u32) -> Duration {
        let factor = 1u64.checked_shl(failures.saturating_sub(1)).unwrap_or(u64::MAX);
        let ms = self.backoff_base_ms.saturating_mul(factor).min(self.backoff_max_ms);
        Duration::from_millis(ms)
    }
}

/// Full node configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub controller: ControllerConfig,
    pub relay: RelayConfig,
    pub handshake: HandshakeConfig,
}

impl NodeConfig {
    /// Load config from a JSON file
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .map_err(|e| QkdNetError::Config(format!("Failed to read config file: {}", e)))?;

        Self::parse(&content)
    }

    /// Parse JSON config content
    pub fn parse(content: &str) -> Result<Self> {
        let config: NodeConfig = serde_json::from_str(content)
            .map_err(|e| QkdNetError::Config(format!("Invalid config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `path` when given, defaults otherwise
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => {
                log::debug!("Loading configuration from {:?}", path);
                Self::load_from_file(path)
            }
            None => Ok(Self::default()),
        }
    }

    fn validate(&self) -> Result<()> {
        if self.controller.max_concurrent_pushes == 0 {
            return Err(QkdNetError::Config("max_concurrent_pushes must be at least 1".into()));
        }
        if self.handshake.max_attempts_per_position == 0 {
            return Err(QkdNetError::Config("max_attempts_per_position must be at least 1".into()));
        }
        if self.relay.poll_interval_ms == 0 {
            return Err(QkdNetError::Config("poll_interval_ms must be positive".into()));
        }
        Ok(())
    }
}

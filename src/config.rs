//! Client configuration

use crate::error::Result;
use crate::types::{ConnectionInfo, DEFAULT_PORT};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Default ping period
pub const KEEPALIVE_INTERVAL_MS: u64 = 5000;

/// Unanswered pings tolerated before the connection is declared dead
pub const MAX_OUTSTANDING_PINGS: u32 = 5;

/// Liveness check settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepaliveConfig {
    pub interval: Duration,
    pub max_outstanding: u32,
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(KEEPALIVE_INTERVAL_MS),
            max_outstanding: MAX_OUTSTANDING_PINGS,
        }
    }
}

/// On-disk client configuration (JSON). Every field is optional.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    pub address: String,
    pub port: u16,
    pub token: String,
    pub keepalive_interval_ms: u64,
    pub max_outstanding_pings: u32,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            address: String::new(),
            port: DEFAULT_PORT,
            token: String::new(),
            keepalive_interval_ms: KEEPALIVE_INTERVAL_MS,
            max_outstanding_pings: MAX_OUTSTANDING_PINGS,
        }
    }
}

impl ControlConfig {
    /// Load from a JSON file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let data = std::fs::read_to_string(path)?;
        Self::from_json(&data)
    }

    pub fn from_json(data: &str) -> Result<Self> {
        Ok(serde_json::from_str(data)?)
    }

    pub fn connection_info(&self) -> ConnectionInfo {
        ConnectionInfo::new(self.address.as_str(), self.port, self.token.as_str())
    }

    pub fn keepalive(&self) -> KeepaliveConfig {
        KeepaliveConfig {
            interval: Duration::from_millis(self.keepalive_interval_ms),
            max_outstanding: self.max_outstanding_pings,
        }
    }
}

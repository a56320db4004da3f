//! Peripheral configuration and connect options

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::gatt::types::PhyMask;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Durations are written as integer milliseconds in config files.
mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

/// Tunables for one peripheral's state machine.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PeripheralConfig {
    /// Pause between direct connect attempts.
    #[serde(with = "millis", rename = "retry_delay_ms")]
    pub retry_delay: Duration,
    /// How long `disconnect` waits for the disconnection event before
    /// releasing the link anyway.
    #[serde(with = "millis", rename = "disconnect_timeout_ms")]
    pub disconnect_timeout: Duration,
    /// Default deadline for a direct connect attempt.
    #[serde(with = "millis", rename = "connect_timeout_ms")]
    pub connect_timeout: Duration,
    /// Capacity of the forwarded event channel.
    pub event_capacity: usize,
}

impl Default for PeripheralConfig {
    fn default() -> Self {
        Self {
            retry_delay: Duration::from_secs(1),
            disconnect_timeout: Duration::from_millis(500),
            connect_timeout: Duration::from_secs(30),
            event_capacity: 256,
        }
    }
}

impl PeripheralConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: PeripheralConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.event_capacity == 0 {
            return Err(ConfigError::Invalid(
                "event_capacity must be at least 1".to_string(),
            ));
        }
        if self.connect_timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "connect_timeout_ms must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Direct connect options using this config's timeout.
    pub fn direct(&self, retry: u32) -> ConnectOptions {
        ConnectOptions::direct(self.connect_timeout, retry)
    }
}

/// How a connection is established.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectMode {
    /// One bounded attempt, repeated `retry` more times on disconnection.
    Direct {
        #[serde(with = "millis", rename = "timeout_ms")]
        timeout: Duration,
        retry: u32,
    },
    /// Let the platform connect whenever the device shows up. No deadline;
    /// the link survives later disconnections and may come back on its own.
    Auto,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectOptions {
    pub mode: ConnectMode,
    #[serde(default)]
    pub preferred_phy: PhyMask,
}

impl ConnectOptions {
    pub fn direct(timeout: Duration, retry: u32) -> Self {
        Self {
            mode: ConnectMode::Direct { timeout, retry },
            preferred_phy: PhyMask::default(),
        }
    }

    pub fn auto() -> Self {
        Self {
            mode: ConnectMode::Auto,
            preferred_phy: PhyMask::default(),
        }
    }

    pub fn with_preferred_phy(mut self, phy: PhyMask) -> Self {
        self.preferred_phy = phy;
        self
    }

    pub fn is_auto(&self) -> bool {
        matches!(self.mode, ConnectMode::Auto)
    }
}

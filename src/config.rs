//! Channel and connection configuration.

use crate::error::{MqError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default channel name used by `Connection::default_channel`.
pub const DEFAULT_CHANNEL_NAME: &str = "default";

/// Per-channel options.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelOptions {
    /// Max size of the collection in bytes.
    /// Default: 5MB
    pub capacity_bytes: u64,

    /// Max number of records in the collection (None = bounded by bytes only).
    pub max_count: Option<u64>,

    /// How long a tailing read waits before re-checking for records.
    /// Default: 200ms
    pub retry_interval_ms: u64,

    /// Re-provision and resume tailing after a broken cursor.
    /// Default: true
    pub recreate: bool,

    /// Pause between a broken cursor and the recreate attempt.
    /// Kept separate from `retry_interval_ms`. Default: 1000ms
    pub recreate_delay_ms: u64,

    /// Sync published records before acknowledging.
    /// Default: true
    pub durable_publish: bool,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            capacity_bytes: 5 * 1024 * 1024,
            max_count: None,
            retry_interval_ms: 200,
            recreate: true,
            recreate_delay_ms: 1000,
            durable_publish: true,
        }
    }
}

impl ChannelOptions {
    pub fn with_capacity_bytes(mut self, bytes: u64) -> Self {
        self.capacity_bytes = bytes;
        self
    }

    pub fn with_max_count(mut self, max: u64) -> Self {
        self.max_count = Some(max);
        self
    }

    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval_ms = millis_ceil(interval);
        self
    }

    pub fn with_recreate(mut self, recreate: bool) -> Self {
        self.recreate = recreate;
        self
    }

    pub fn with_recreate_delay(mut self, delay: Duration) -> Self {
        self.recreate_delay_ms = millis_ceil(delay);
        self
    }

    pub fn with_durable_publish(mut self, durable: bool) -> Self {
        self.durable_publish = durable;
        self
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    pub fn recreate_delay(&self) -> Duration {
        Duration::from_millis(self.recreate_delay_ms)
    }

    /// Bounds handed to the store when provisioning.
    pub fn collection_options(&self) -> CollectionOptions {
        CollectionOptions {
            capacity_bytes: self.capacity_bytes,
            max_count: self.max_count,
        }
    }

    /// Reject options no store could honour.
    pub fn validate(&self) -> Result<()> {
        if self.capacity_bytes == 0 {
            return Err(MqError::InvalidConfig("capacity_bytes must be > 0".into()));
        }
        if self.max_count == Some(0) {
            return Err(MqError::InvalidConfig("max_count must be > 0".into()));
        }
        if self.retry_interval_ms == 0 {
            return Err(MqError::InvalidConfig("retry_interval_ms must be > 0".into()));
        }
        Ok(())
    }
}

/// Bounds of a capped collection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CollectionOptions {
    pub capacity_bytes: u64,
    pub max_count: Option<u64>,
}

impl Default for CollectionOptions {
    fn default() -> Self {
        ChannelOptions::default().collection_options()
    }
}

/// Connection-wide configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Name used by `Connection::default_channel`.
    pub default_channel: String,

    /// Options for channels opened without explicit options.
    pub channel_defaults: ChannelOptions,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            default_channel: DEFAULT_CHANNEL_NAME.to_string(),
            channel_defaults: ChannelOptions::default(),
        }
    }
}

impl ConnectionConfig {
    /// Parse from JSON; missing fields take their defaults.
    pub fn from_json_str(s: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(s)
            .map_err(|e| MqError::InvalidConfig(e.to_string()))?;
        config.channel_defaults.validate()?;
        Ok(config)
    }
}

/// Whole milliseconds, rounding any sub-millisecond remainder up.
fn millis_ceil(duration: Duration) -> u64 {
    duration.as_nanos().div_ceil(1_000_000) as u64
}

//! Bus configuration
//!
//! No config files, just code: construct a [`BusConfig`] with the fluent
//! setters and hand it to the builder. Every knob has a production default.

use serde::{Deserialize, Serialize};

/// Configuration for a bus instance
///
/// # Example
///
/// ```
/// use vayla_bus::BusConfig;
///
/// let config = BusConfig::default()
///     .max_retained(500)
///     .rate_limit_per_client(100)
///     .allow_global_wildcard(false);
/// assert_eq!(config.max_retained, 500);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Maximum retained entries before eviction kicks in
    pub max_retained: usize,
    /// Maximum serialized envelope size in bytes
    pub max_message_size: usize,
    /// Maximum serialized payload (`data`) size in bytes
    pub max_payload_size: usize,
    /// Per-client publish budget, messages per second
    pub rate_limit_per_client: u64,
    /// Whether `"*"` subscriptions are accepted
    pub allow_global_wildcard: bool,
    /// Period of the background bookkeeping sweep in milliseconds
    pub cleanup_interval_ms: u64,
    /// Default `request()` timeout in milliseconds
    pub request_timeout_ms: u64,
    /// Maximum depth of nested publishes triggered by route actions
    pub max_publish_depth: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            max_retained: 1000,
            max_message_size: 1024 * 1024,
            max_payload_size: 512 * 1024,
            rate_limit_per_client: 1000,
            allow_global_wildcard: true,
            cleanup_interval_ms: 30_000,
            request_timeout_ms: 5_000,
            max_publish_depth: 16,
        }
    }
}

impl BusConfig {
    /// Set the retained-store capacity
    pub fn max_retained(mut self, max: usize) -> Self {
        self.max_retained = max;
        self
    }

    /// Set the serialized envelope size limit in bytes
    pub fn max_message_size(mut self, bytes: usize) -> Self {
        self.max_message_size = bytes;
        self
    }

    /// Set the serialized payload size limit in bytes
    pub fn max_payload_size(mut self, bytes: usize) -> Self {
        self.max_payload_size = bytes;
        self
    }

    /// Set the per-client publish budget in messages per second
    pub fn rate_limit_per_client(mut self, per_second: u64) -> Self {
        self.rate_limit_per_client = per_second;
        self
    }

    /// Allow or refuse global `"*"` subscriptions
    pub fn allow_global_wildcard(mut self, allow: bool) -> Self {
        self.allow_global_wildcard = allow;
        self
    }

    /// Set the background sweep interval in milliseconds
    pub fn cleanup_interval_ms(mut self, ms: u64) -> Self {
        self.cleanup_interval_ms = ms;
        self
    }

    /// Set the default request timeout in milliseconds
    pub fn request_timeout_ms(mut self, ms: u64) -> Self {
        self.request_timeout_ms = ms;
        self
    }
}

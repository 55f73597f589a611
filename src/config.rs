//! Engine configuration.
//!
//! Built programmatically or deserialized from JSON. Every field has a
//! default, so partial documents are accepted:
//!
//! ```
//! use fieldsync::config::SyncConfig;
//!
//! let config = SyncConfig::from_json_str(r#"{
//!     "queue": { "max_retries": 8, "coalesce": "supersede_pending" },
//!     "attempt_timeout_ms": 15000
//! }"#).unwrap();
//! assert_eq!(config.queue.max_retries, 8);
//! assert_eq!(config.queue.backoff.base_delay_ms, 1000);
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::{backoff::Backoff, queue::QueueConfig};

/// Coordinator and queue settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Retry limit, coalescing and backoff.
    pub queue: QueueConfig,
    /// Upper bound for one processor call; exceeding it fails the attempt.
    pub attempt_timeout_ms: u64,
    /// Capacity of the command channel.
    pub command_buffer: usize,
    /// Capacity of the event broadcast channel.
    pub event_buffer: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            queue: QueueConfig::default(),
            attempt_timeout_ms: 30_000,
            command_buffer: 256,
            event_buffer: 1024,
        }
    }
}

impl SyncConfig {
    /// Parses a JSON document.
    pub fn from_json_str(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    /// Millisecond-scale timers so tests finish quickly.
    pub fn for_testing() -> Self {
        Self {
            queue: QueueConfig {
                max_retries: 3,
                backoff: Backoff::testing(),
                ..QueueConfig::default()
            },
            attempt_timeout_ms: 200,
            ..Self::default()
        }
    }

    /// [`Self::attempt_timeout_ms`] as a `Duration`.
    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use crate::core::queue::CoalescePolicy;

    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = SyncConfig::default();
        assert_eq!(config.queue.max_retries, 5);
        assert_eq!(config.queue.coalesce, CoalescePolicy::KeepAll);
        assert_eq!(config.queue.backoff.max_delay_ms, 32_000);
        assert_eq!(config.attempt_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn empty_document_is_default() {
        assert_eq!(SyncConfig::from_json_str("{}").expect("parse"), SyncConfig::default());
    }

    #[test]
    fn rejects_unknown_policy() {
        assert!(SyncConfig::from_json_str(r#"{"queue":{"coalesce":"newest"}}"#).is_err());
    }
}

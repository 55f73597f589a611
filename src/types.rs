//! Shared primitive IDs, timestamps and the mutation status enum.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Globally unique mutation identifier.
pub type MutationId = String;
/// Milliseconds since the Unix epoch.
pub type TimestampMs = u64;
/// Record version counter used for conflict detection.
pub type Version = u64;

/// Lifecycle state of a queued mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationStatus {
    /// Waiting for its first attempt.
    Pending,
    /// An attempt is in flight.
    Processing,
    /// Delivered; terminal.
    Completed,
    /// Last attempt failed.
    Failed,
}

impl MutationStatus {
    /// Stable lowercase name, also used as the SQLite column value.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for MutationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Current wall-clock time in milliseconds.
pub fn now_ms() -> TimestampMs {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

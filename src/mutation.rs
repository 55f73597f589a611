//! Mutation record and its persistence envelope.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{MutationId, MutationStatus, TimestampMs};

/// Version number for serialized [`StoredMutationEnvelope`] payloads.
pub const MUTATION_FORMAT_VERSION: u16 = 1;

/// A queued state change awaiting delivery to the remote authority.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mutation {
    /// Unique id assigned at enqueue time.
    pub id: MutationId,
    /// Opaque operation tag understood by the processor.
    #[serde(rename = "type")]
    pub kind: String,
    /// Opaque operation data.
    pub payload: Value,
    /// Lifecycle state.
    pub status: MutationStatus,
    /// Number of failed attempts so far.
    pub retry_count: u32,
    /// Creation time in milliseconds.
    pub created_at_ms: TimestampMs,
    /// Start time of the most recent attempt.
    #[serde(default)]
    pub last_attempt_at_ms: Option<TimestampMs>,
    /// Last failure message, only set while failed.
    #[serde(default)]
    pub error: Option<String>,
    /// Logical entity this mutation targets, if any.
    #[serde(default)]
    pub entity: Option<String>,
    /// Earliest time the scheduler may retry a failed mutation.
    #[serde(default)]
    pub next_attempt_at_ms: Option<TimestampMs>,
    /// Set when the last failure needs a human to pick a resolution.
    #[serde(default)]
    pub requires_resolution: bool,
}

impl Mutation {
    /// Builds a fresh pending mutation.
    pub fn new(
        id: MutationId,
        kind: impl Into<String>,
        payload: Value,
        entity: Option<String>,
        created_at_ms: TimestampMs,
    ) -> Self {
        Self {
            id,
            kind: kind.into(),
            payload,
            status: MutationStatus::Pending,
            retry_count: 0,
            created_at_ms,
            last_attempt_at_ms: None,
            error: None,
            entity,
            next_attempt_at_ms: None,
            requires_resolution: false,
        }
    }

    /// True once the mutation has failed `max_retries` times.
    pub fn is_abandoned(&self, max_retries: u32) -> bool {
        self.status == MutationStatus::Failed && self.retry_count >= max_retries
    }

    /// True when no further processing can change this mutation.
    pub fn is_terminal(&self, max_retries: u32) -> bool {
        self.status == MutationStatus::Completed || self.is_abandoned(max_retries)
    }
}

/// Versioned wrapper for stable on-disk payload decoding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredMutationEnvelope {
    /// Payload format version.
    pub format_version: u16,
    /// Wrapped mutation.
    pub mutation: Mutation,
}

impl StoredMutationEnvelope {
    /// Constructs an envelope using [`MUTATION_FORMAT_VERSION`].
    pub fn new(mutation: Mutation) -> Self {
        Self {
            format_version: MUTATION_FORMAT_VERSION,
            mutation,
        }
    }
}

//! Runtime event stream payloads.

use crate::{
    core::queue::QueueStats,
    types::{MutationId, TimestampMs},
};

/// Events emitted from the coordinator loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    /// A mutation was queued.
    Enqueued {
        /// New mutation id.
        id: MutationId,
    },
    /// An older unsent mutation was dropped in favour of a newer one.
    Superseded {
        /// Dropped mutation id.
        id: MutationId,
    },
    /// A mutation left `processing` on restart and was marked failed.
    Recovered {
        /// Interrupted mutation id.
        id: MutationId,
    },
    /// An attempt was handed to the processor.
    AttemptStarted {
        /// Mutation id.
        id: MutationId,
        /// 1-based attempt number.
        attempt: u32,
    },
    /// The processor confirmed delivery.
    Completed {
        /// Mutation id.
        id: MutationId,
    },
    /// An attempt failed and will be retried.
    Failed {
        /// Mutation id.
        id: MutationId,
        /// Failed attempts so far.
        retry_count: u32,
        /// Failure message.
        error: String,
        /// When the next attempt becomes eligible.
        next_attempt_at_ms: Option<TimestampMs>,
    },
    /// Retries are exhausted; the mutation needs manual attention.
    Abandoned {
        /// Mutation id.
        id: MutationId,
        /// Failed attempts.
        retry_count: u32,
    },
    /// A conflict needs a human to pick a resolution.
    ResolutionRequired {
        /// Mutation id.
        id: MutationId,
        /// Conflict description.
        error: String,
    },
    /// Network state changed.
    OnlineChanged {
        /// New state.
        online: bool,
    },
    /// Nothing is eligible right now; remaining work waits on backoff or
    /// manual action.
    Drained {
        /// Queue snapshot at the end of the cycle.
        stats: QueueStats,
    },
    /// Writing to the durable store failed; the full queue is rewritten on
    /// the next successful write.
    PersistFailed {
        /// Store error text.
        message: String,
    },
}

//! In-memory mutation queue, id generation and retry backoff.

/// Exponential backoff with jitter.
pub mod backoff;
/// Mutation id generation.
pub mod ids;
/// Ordered mutation queue and its statistics.
pub mod queue;

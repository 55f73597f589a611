//! Single-writer sync coordinator and its event stream.

/// Event stream types emitted by the coordinator.
pub mod events;
/// Handle and coordinator loop implementation.
pub mod handle;

//! Processor seam and the single-attempt processing wrapper.

/// Attempt state transitions and the `process` wrapper.
pub mod process;
/// Processor trait and its error type.
pub mod traits;

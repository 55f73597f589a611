use std::{future::Future, time::Duration};

use serde_json::Value;
use thiserror::Error;

use crate::conflict::ConflictError;

/// Failure reported by a processor or imposed on an attempt by the coordinator.
#[derive(Debug, Error)]
pub enum ProcessorError {
    /// Transport or server rejection; retried with backoff.
    #[error("{0}")]
    Failed(String),
    /// The attempt exceeded the coordinator's time bound.
    #[error("attempt timed out after {0:?}")]
    TimedOut(Duration),
    /// The remote copy diverged and the configured strategy could not settle it.
    #[error(transparent)]
    Conflict(#[from] ConflictError),
}

impl ProcessorError {
    /// Shorthand for [`ProcessorError::Failed`].
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }

    /// True when a human has to choose a resolution before another attempt.
    pub fn requires_resolution(&self) -> bool {
        matches!(self, Self::Conflict(ConflictError::ManualResolutionRequired { .. }))
    }
}

/// Delivers one mutation to the remote authority.
///
/// `Ok(true)` means delivered, `Ok(false)` or `Err` means the attempt failed.
/// Implementations must be idempotent per mutation id, since a retry can
/// redeliver a mutation the server already applied.
pub trait MutationProcessor: Send + Sync + 'static {
    /// Sends `payload` tagged with `kind`.
    fn process(
        &self,
        kind: &str,
        payload: &Value,
    ) -> impl Future<Output = Result<bool, ProcessorError>> + Send;
}

impl<F, Fut> MutationProcessor for F
where
    F: Fn(String, Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<bool, ProcessorError>> + Send + 'static,
{
    fn process(
        &self,
        kind: &str,
        payload: &Value,
    ) -> impl Future<Output = Result<bool, ProcessorError>> + Send {
        self(kind.to_string(), payload.clone())
    }
}

use crate::{
    mutation::Mutation,
    types::{MutationStatus, TimestampMs, now_ms},
};

use super::traits::{MutationProcessor, ProcessorError};

/// Error text stored when a processor resolves to `false`.
pub const PROCESSOR_RETURNED_FALSE: &str = "Processor returned false";

/// Result of one processor invocation.
pub type AttemptOutcome = Result<bool, ProcessorError>;

/// Failed mutations with retries left are eligible; pending ones go through
/// the normal claim path and never count as retries.
pub fn should_retry(mutation: &Mutation, max_retries: u32) -> bool {
    mutation.status == MutationStatus::Failed && mutation.retry_count < max_retries
}

/// Moves a mutation into `processing` at `now`.
pub fn mark_processing(mutation: &mut Mutation, now: TimestampMs) {
    mutation.status = MutationStatus::Processing;
    mutation.last_attempt_at_ms = Some(now);
    mutation.error = None;
    mutation.next_attempt_at_ms = None;
    mutation.requires_resolution = false;
}

/// Applies an attempt outcome to a mutation that is `processing`.
pub fn record_outcome(mutation: &mut Mutation, outcome: &AttemptOutcome) {
    match outcome {
        Ok(true) => {
            mutation.status = MutationStatus::Completed;
            mutation.error = None;
        }
        Ok(false) => fail(mutation, PROCESSOR_RETURNED_FALSE.to_string(), false),
        Err(err) => fail(mutation, err.to_string(), err.requires_resolution()),
    }
}

fn fail(mutation: &mut Mutation, message: String, requires_resolution: bool) {
    mutation.status = MutationStatus::Failed;
    mutation.retry_count = mutation.retry_count.saturating_add(1);
    mutation.error = Some(message);
    mutation.requires_resolution = requires_resolution;
}

/// Runs exactly one attempt of `mutation` through `processor`.
///
/// Never retries; scheduling the next attempt is the coordinator's job.
pub async fn process<P: MutationProcessor>(mut mutation: Mutation, processor: &P) -> Mutation {
    mark_processing(&mut mutation, now_ms());
    let outcome = processor.process(&mutation.kind, &mutation.payload).await;
    record_outcome(&mut mutation, &outcome);
    mutation
}

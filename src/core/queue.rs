use hashbrown::{HashMap, HashSet};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::{
    engine::process::{AttemptOutcome, mark_processing, record_outcome, should_retry},
    mutation::Mutation,
    persist::{MutationStore, PersistResult},
    types::{MutationId, MutationStatus, TimestampMs, now_ms},
};

use super::{backoff::Backoff, ids::generate_mutation_id};

/// Error text stored on mutations found mid-attempt after a restart.
pub const INTERRUPTED_ERROR: &str = "Attempt interrupted before completion";

/// Queue operation failures. None of these come from the processor path.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueError {
    /// Programmer error in the enqueued data.
    #[error("malformed mutation: {0}")]
    MalformedMutation(String),
    /// No mutation with this id.
    #[error("unknown mutation {0}")]
    MissingMutation(MutationId),
    /// The mutation's current status forbids the requested action.
    #[error("mutation {id} cannot {action} while {status}")]
    InvalidTransition {
        /// Mutation id.
        id: MutationId,
        /// Status at the time of the request.
        status: MutationStatus,
        /// What was attempted.
        action: &'static str,
    },
}

/// What to do with older unsent mutations when a newer one targets the same
/// entity and kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoalescePolicy {
    /// Keep every mutation.
    #[default]
    KeepAll,
    /// Drop older `pending` mutations that were never attempted.
    SupersedePending,
}

/// Retry and coalescing rules for a [`MutationQueue`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Failed attempts after which a mutation is abandoned.
    pub max_retries: u32,
    /// Handling of superseded unsent mutations.
    pub coalesce: CoalescePolicy,
    /// Retry delay schedule.
    pub backoff: Backoff,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            coalesce: CoalescePolicy::KeepAll,
            backoff: Backoff::default(),
        }
    }
}

/// Aggregate snapshot for badges and diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct QueueStats {
    /// Waiting for a first attempt, or resent.
    pub pending: usize,
    /// Attempt in flight.
    pub processing: usize,
    /// Delivered.
    pub completed: usize,
    /// All failed mutations, abandoned ones included.
    pub failed: usize,
    /// Failed mutations with no retries left.
    pub abandoned: usize,
    /// Every queued mutation.
    pub total: usize,
    /// Creation time of the oldest pending mutation.
    pub oldest_pending_ms: Option<TimestampMs>,
}

/// A change the durable store has not seen yet.
#[derive(Debug, Clone, PartialEq)]
pub enum QueueWrite {
    /// Insert or replace, keeping the original queue position.
    Upsert(Mutation),
    /// Delete by id.
    Remove(MutationId),
}

/// Ordered mutation queue with status bookkeeping.
///
/// Pure in-memory state; every change is also recorded as a [`QueueWrite`]
/// that the owner drains and persists before acknowledging the caller.
#[derive(Debug, Default)]
pub struct MutationQueue {
    records: HashMap<MutationId, Mutation>,
    order: Vec<MutationId>,
    pending_writes: Vec<QueueWrite>,
    config: QueueConfig,
}

impl MutationQueue {
    /// Empty queue.
    pub fn new(config: QueueConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    /// Rebuilds a queue from mutations already in enqueue order.
    pub fn from_mutations(config: QueueConfig, mutations: Vec<Mutation>) -> Self {
        let mut queue = Self::new(config);
        for mutation in mutations {
            if queue.records.contains_key(&mutation.id) {
                continue;
            }
            queue.order.push(mutation.id.clone());
            queue.records.insert(mutation.id.clone(), mutation);
        }
        queue
    }

    /// Loads the queue from `store` and writes back any restart recovery.
    pub fn load(store: &mut dyn MutationStore, config: QueueConfig) -> PersistResult<Self> {
        let mut queue = Self::from_mutations(config, store.load_all()?);
        queue.recover_interrupted(now_ms());
        let recovered: Vec<Mutation> = queue
            .drain_pending_writes()
            .into_iter()
            .filter_map(|w| match w {
                QueueWrite::Upsert(m) => Some(m),
                QueueWrite::Remove(_) => None,
            })
            .collect();
        store.upsert(&recovered)?;
        Ok(queue)
    }

    /// Retry and coalescing rules in effect.
    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Appends a fresh `pending` mutation with no entity.
    ///
    /// Fails only on an empty `kind`; connectivity never matters here.
    pub fn enqueue(&mut self, kind: &str, payload: Value) -> Result<Mutation, QueueError> {
        self.push(None, kind, payload).map(|(m, _)| m)
    }

    /// Enqueues a mutation for `entity`, applying the coalescing policy.
    ///
    /// Returns the new mutation and the ids it superseded.
    pub fn enqueue_for(
        &mut self,
        entity: &str,
        kind: &str,
        payload: Value,
    ) -> Result<(Mutation, Vec<MutationId>), QueueError> {
        if entity.trim().is_empty() {
            return Err(QueueError::MalformedMutation("empty entity key".to_string()));
        }
        self.push(Some(entity.to_string()), kind, payload)
    }

    fn push(
        &mut self,
        entity: Option<String>,
        kind: &str,
        payload: Value,
    ) -> Result<(Mutation, Vec<MutationId>), QueueError> {
        if kind.trim().is_empty() {
            return Err(QueueError::MalformedMutation("empty mutation type".to_string()));
        }

        let superseded = match (&entity, self.config.coalesce) {
            (Some(entity), CoalescePolicy::SupersedePending) => self.supersede(entity, kind),
            _ => Vec::new(),
        };

        let mutation = Mutation::new(generate_mutation_id(), kind, payload, entity, now_ms());
        self.order.push(mutation.id.clone());
        self.records.insert(mutation.id.clone(), mutation.clone());
        self.pending_writes.push(QueueWrite::Upsert(mutation.clone()));
        Ok((mutation, superseded))
    }

    fn supersede(&mut self, entity: &str, kind: &str) -> Vec<MutationId> {
        let stale: Vec<MutationId> = self
            .iter()
            .filter(|m| {
                m.status == MutationStatus::Pending
                    && m.last_attempt_at_ms.is_none()
                    && m.kind == kind
                    && m.entity.as_deref() == Some(entity)
            })
            .map(|m| m.id.clone())
            .collect();
        for id in &stale {
            self.remove_record(id);
        }
        stale
    }

    /// Borrows a mutation by id.
    pub fn get(&self, id: &str) -> Option<&Mutation> {
        self.records.get(id)
    }

    /// Owned copy of a mutation by id.
    pub fn get_cloned(&self, id: &str) -> Option<Mutation> {
        self.get(id).cloned()
    }

    /// Mutations in enqueue order.
    pub fn iter(&self) -> impl Iterator<Item = &Mutation> + '_ {
        self.order.iter().filter_map(|id| self.records.get(id))
    }

    /// Owned copies of every mutation in enqueue order.
    pub fn export(&self) -> Vec<Mutation> {
        self.iter().cloned().collect()
    }

    /// Number of queued mutations, completed ones included.
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// True when nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Per-status counts. Pure read.
    pub fn stats(&self) -> QueueStats {
        let mut stats = QueueStats::default();
        for m in self.iter() {
            stats.total += 1;
            match m.status {
                MutationStatus::Pending => {
                    stats.pending += 1;
                    stats.oldest_pending_ms = Some(
                        stats
                            .oldest_pending_ms
                            .map_or(m.created_at_ms, |t| t.min(m.created_at_ms)),
                    );
                }
                MutationStatus::Processing => stats.processing += 1,
                MutationStatus::Completed => stats.completed += 1,
                MutationStatus::Failed => {
                    stats.failed += 1;
                    if m.is_abandoned(self.config.max_retries) {
                        stats.abandoned += 1;
                    }
                }
            }
        }
        stats
    }

    /// Claims a mutation for an attempt. Backoff timing is not checked here.
    pub fn begin_attempt(&mut self, id: &str, now: TimestampMs) -> Result<Mutation, QueueError> {
        let max_retries = self.config.max_retries;
        let m = self
            .records
            .get_mut(id)
            .ok_or_else(|| QueueError::MissingMutation(id.to_string()))?;

        let claimable = m.status == MutationStatus::Pending || should_retry(m, max_retries);
        if !claimable {
            return Err(QueueError::InvalidTransition {
                id: m.id.clone(),
                status: m.status,
                action: "begin an attempt",
            });
        }

        mark_processing(m, now);
        let out = m.clone();
        self.pending_writes.push(QueueWrite::Upsert(out.clone()));
        Ok(out)
    }

    /// Records the outcome of an attempt started with [`Self::begin_attempt`]
    /// and schedules the next retry on failure.
    pub fn finish_attempt(
        &mut self,
        id: &str,
        outcome: &AttemptOutcome,
    ) -> Result<Mutation, QueueError> {
        let backoff = &self.config.backoff;
        let m = self
            .records
            .get_mut(id)
            .ok_or_else(|| QueueError::MissingMutation(id.to_string()))?;

        if m.status != MutationStatus::Processing {
            return Err(QueueError::InvalidTransition {
                id: m.id.clone(),
                status: m.status,
                action: "finish an attempt",
            });
        }

        record_outcome(m, outcome);
        if m.status == MutationStatus::Failed {
            let attempted_at = m.last_attempt_at_ms.unwrap_or_else(now_ms);
            let delay = backoff.compute_delay(m.retry_count).as_millis() as u64;
            m.next_attempt_at_ms = Some(attempted_at.saturating_add(delay));
        }

        let out = m.clone();
        self.pending_writes.push(QueueWrite::Upsert(out.clone()));
        Ok(out)
    }

    /// True when the scheduler may claim `m` at `now`, ignoring entity order.
    pub fn is_eligible(&self, m: &Mutation, now: TimestampMs) -> bool {
        match m.status {
            MutationStatus::Pending => true,
            MutationStatus::Failed => {
                should_retry(m, self.config.max_retries)
                    && !m.requires_resolution
                    && m.next_attempt_at_ms.is_none_or(|t| t <= now)
            }
            MutationStatus::Processing | MutationStatus::Completed => false,
        }
    }

    /// First claimable mutation in enqueue order.
    ///
    /// A mutation whose entity has an earlier unfinished mutation waits
    /// behind it, so per-entity application order matches creation order.
    pub fn next_eligible(&self, now: TimestampMs) -> Option<&Mutation> {
        let mut blocked: HashSet<&str> = HashSet::new();
        for m in self.iter() {
            if m.status == MutationStatus::Completed {
                continue;
            }
            let entity = m.entity.as_deref();
            if entity.is_some_and(|e| blocked.contains(e)) {
                continue;
            }
            if self.is_eligible(m, now) {
                return Some(m);
            }
            if let Some(e) = entity {
                blocked.insert(e);
            }
        }
        None
    }

    /// Earliest backoff expiry after `now` among retryable failed mutations.
    ///
    /// Expired deadlines are skipped: such a mutation is either eligible
    /// already or waiting behind an earlier one for its entity.
    pub fn next_wake_at(&self, now: TimestampMs) -> Option<TimestampMs> {
        self.iter()
            .filter(|m| should_retry(m, self.config.max_retries) && !m.requires_resolution)
            .filter_map(|m| m.next_attempt_at_ms)
            .filter(|t| *t > now)
            .min()
    }

    /// Replaces the payload of an unfinished mutation, typically with a
    /// conflict-resolved record, and returns it to `pending`.
    pub fn rebase(&mut self, id: &str, payload: Value) -> Result<Mutation, QueueError> {
        let m = self.reset_for_retry(id, "be rebased")?;
        m.payload = payload;
        let out = m.clone();
        self.pending_writes.push(QueueWrite::Upsert(out.clone()));
        Ok(out)
    }

    /// Returns a failed mutation to `pending` for another attempt.
    ///
    /// The retry count is kept, so an abandoned mutation gets one more try.
    pub fn resend(&mut self, id: &str) -> Result<Mutation, QueueError> {
        let out = self.reset_for_retry(id, "be resent")?.clone();
        self.pending_writes.push(QueueWrite::Upsert(out.clone()));
        Ok(out)
    }

    fn reset_for_retry(&mut self, id: &str, action: &'static str) -> Result<&mut Mutation, QueueError> {
        let m = self
            .records
            .get_mut(id)
            .ok_or_else(|| QueueError::MissingMutation(id.to_string()))?;
        match m.status {
            MutationStatus::Pending | MutationStatus::Failed => {}
            status => {
                return Err(QueueError::InvalidTransition {
                    id: m.id.clone(),
                    status,
                    action,
                });
            }
        }
        m.status = MutationStatus::Pending;
        m.error = None;
        m.next_attempt_at_ms = None;
        m.requires_resolution = false;
        Ok(m)
    }

    /// Drops a mutation that is not mid-attempt.
    pub fn discard(&mut self, id: &str) -> Result<Mutation, QueueError> {
        let m = self
            .records
            .get(id)
            .ok_or_else(|| QueueError::MissingMutation(id.to_string()))?;
        if m.status == MutationStatus::Processing {
            return Err(QueueError::InvalidTransition {
                id: m.id.clone(),
                status: m.status,
                action: "be discarded",
            });
        }
        self.remove_record(id)
            .ok_or_else(|| QueueError::MissingMutation(id.to_string()))
    }

    /// Removes every completed mutation; returns how many were removed.
    pub fn purge_completed(&mut self) -> usize {
        let done: Vec<MutationId> = self
            .iter()
            .filter(|m| m.status == MutationStatus::Completed)
            .map(|m| m.id.clone())
            .collect();
        for id in &done {
            self.remove_record(id);
        }
        done.len()
    }

    /// Marks mutations left in `processing` by a crash as failed attempts.
    ///
    /// They become retryable immediately if retries remain.
    pub fn recover_interrupted(&mut self, now: TimestampMs) -> Vec<MutationId> {
        let mut recovered = Vec::new();
        for id in &self.order {
            let Some(m) = self.records.get_mut(id) else {
                continue;
            };
            if m.status != MutationStatus::Processing {
                continue;
            }
            m.status = MutationStatus::Failed;
            m.retry_count = m.retry_count.saturating_add(1);
            m.error = Some(INTERRUPTED_ERROR.to_string());
            m.next_attempt_at_ms = Some(now);
            self.pending_writes.push(QueueWrite::Upsert(m.clone()));
            recovered.push(id.clone());
        }
        recovered
    }

    /// Takes the writes recorded since the last call, oldest first.
    pub fn drain_pending_writes(&mut self) -> Vec<QueueWrite> {
        std::mem::take(&mut self.pending_writes)
    }

    fn remove_record(&mut self, id: &str) -> Option<Mutation> {
        let removed = self.records.remove(id)?;
        if let Some(pos) = self.order.iter().position(|x| x == id) {
            self.order.remove(pos);
        }
        self.pending_writes.push(QueueWrite::Remove(removed.id.clone()));
        Some(removed)
    }
}

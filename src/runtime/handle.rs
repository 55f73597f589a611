use std::{future::Future, ops::ControlFlow, pin::Pin, sync::Arc};

use serde_json::Value;
use thiserror::Error;
use tokio::{
    sync::{Mutex, broadcast, mpsc, oneshot, watch},
    time::{Duration, Instant},
};
use tracing::{debug, error, info, warn};

use crate::{
    config::SyncConfig,
    core::queue::{MutationQueue, QueueError, QueueStats, QueueWrite},
    engine::{
        process::AttemptOutcome,
        traits::{MutationProcessor, ProcessorError},
    },
    mutation::Mutation,
    persist::{MutationStore, PersistError, PersistResult},
    types::{MutationId, MutationStatus, now_ms},
};

use super::events::SyncEvent;

/// Errors returned through [`SyncHandle`].
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// The queue refused the request.
    #[error(transparent)]
    Queue(#[from] QueueError),
    /// The durable store failed during `flush` or `shutdown`.
    #[error(transparent)]
    Persist(#[from] PersistError),
    /// The coordinator task has exited.
    #[error("sync runtime is no longer running")]
    ChannelClosed,
}

type SharedStore = Arc<Mutex<Box<dyn MutationStore>>>;
type InFlight = Pin<Box<dyn Future<Output = (MutationId, AttemptOutcome)> + Send>>;

/// Cloneable handle to the coordinator task.
pub struct SyncHandle {
    cmd_tx: mpsc::Sender<Command>,
    events_tx: broadcast::Sender<SyncEvent>,
}

impl Clone for SyncHandle {
    fn clone(&self) -> Self {
        Self {
            cmd_tx: self.cmd_tx.clone(),
            events_tx: self.events_tx.clone(),
        }
    }
}

enum Command {
    Enqueue {
        entity: Option<String>,
        kind: String,
        payload: Value,
        resp: oneshot::Sender<Result<Mutation, RuntimeError>>,
    },
    Get {
        id: MutationId,
        resp: oneshot::Sender<Option<Mutation>>,
    },
    List {
        resp: oneshot::Sender<Vec<Mutation>>,
    },
    Stats {
        resp: oneshot::Sender<QueueStats>,
    },
    Drain {
        resp: oneshot::Sender<QueueStats>,
    },
    Resend {
        id: MutationId,
        resp: oneshot::Sender<Result<Mutation, RuntimeError>>,
    },
    Rebase {
        id: MutationId,
        payload: Value,
        resp: oneshot::Sender<Result<Mutation, RuntimeError>>,
    },
    Discard {
        id: MutationId,
        resp: oneshot::Sender<Result<Mutation, RuntimeError>>,
    },
    PurgeCompleted {
        resp: oneshot::Sender<usize>,
    },
    Flush {
        resp: oneshot::Sender<Result<(), RuntimeError>>,
    },
    Shutdown {
        resp: oneshot::Sender<Result<(), RuntimeError>>,
    },
}

/// Spawns the coordinator that owns `queue` and drains it through
/// `processor` whenever `network` reports online.
///
/// Load the queue with [`MutationQueue::load`] first so interrupted attempts
/// are recovered before anything is retried.
///
/// The queue's own [`QueueConfig`](crate::core::queue::QueueConfig) is
/// authoritative for retry limits, coalescing and backoff; `config.queue`
/// is overwritten with it.
pub fn spawn_sync<P: MutationProcessor>(
    queue: MutationQueue,
    store: Option<Box<dyn MutationStore>>,
    processor: P,
    network: watch::Receiver<bool>,
    mut config: SyncConfig,
) -> SyncHandle {
    if config.queue != *queue.config() {
        debug!(
            queue_max_retries = queue.config().max_retries,
            config_max_retries = config.queue.max_retries,
            "sync config queue settings differ from the queue; using the queue's"
        );
        config.queue = queue.config().clone();
    }
    let (cmd_tx, cmd_rx) = mpsc::channel::<Command>(config.command_buffer.max(1));
    let (events_tx, _) = broadcast::channel::<SyncEvent>(config.event_buffer.max(1));

    let coordinator = Coordinator {
        online: *network.borrow(),
        queue,
        store: store.map(|s| Arc::new(Mutex::new(s))),
        store_dirty: false,
        processor: Arc::new(processor),
        events_tx: events_tx.clone(),
        config,
        drain_waiters: Vec::new(),
        busy: false,
    };
    tokio::spawn(coordinator.run(cmd_rx, network));

    SyncHandle { cmd_tx, events_tx }
}

impl SyncHandle {
    /// Subscribes to coordinator events from this point on.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events_tx.subscribe()
    }

    /// Queues a mutation. Succeeds offline; only malformed input is rejected.
    pub async fn enqueue(&self, kind: impl Into<String>, payload: Value) -> Result<Mutation, RuntimeError> {
        self.send_enqueue(None, kind.into(), payload).await
    }

    /// Queues a mutation tied to a logical entity.
    pub async fn enqueue_for(
        &self,
        entity: impl Into<String>,
        kind: impl Into<String>,
        payload: Value,
    ) -> Result<Mutation, RuntimeError> {
        self.send_enqueue(Some(entity.into()), kind.into(), payload).await
    }

    async fn send_enqueue(
        &self,
        entity: Option<String>,
        kind: String,
        payload: Value,
    ) -> Result<Mutation, RuntimeError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Enqueue {
                entity,
                kind,
                payload,
                resp: tx,
            })
            .await
            .map_err(|_| RuntimeError::ChannelClosed)?;
        rx.await.map_err(|_| RuntimeError::ChannelClosed)?
    }

    /// Current state of one mutation.
    pub async fn get(&self, id: impl Into<MutationId>) -> Result<Option<Mutation>, RuntimeError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Get { id: id.into(), resp: tx })
            .await
            .map_err(|_| RuntimeError::ChannelClosed)?;
        rx.await.map_err(|_| RuntimeError::ChannelClosed)
    }

    /// Every queued mutation in enqueue order.
    pub async fn list(&self) -> Result<Vec<Mutation>, RuntimeError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::List { resp: tx })
            .await
            .map_err(|_| RuntimeError::ChannelClosed)?;
        rx.await.map_err(|_| RuntimeError::ChannelClosed)
    }

    /// Queue counts, including an in-flight attempt as `processing`.
    pub async fn stats(&self) -> Result<QueueStats, RuntimeError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Stats { resp: tx })
            .await
            .map_err(|_| RuntimeError::ChannelClosed)?;
        rx.await.map_err(|_| RuntimeError::ChannelClosed)
    }

    /// Resolves once nothing is eligible to run right now, or immediately
    /// when offline.
    pub async fn drain(&self) -> Result<QueueStats, RuntimeError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Drain { resp: tx })
            .await
            .map_err(|_| RuntimeError::ChannelClosed)?;
        rx.await.map_err(|_| RuntimeError::ChannelClosed)
    }

    /// Returns a failed mutation to `pending`, keeping its retry count.
    pub async fn resend(&self, id: impl Into<MutationId>) -> Result<Mutation, RuntimeError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Resend { id: id.into(), resp: tx })
            .await
            .map_err(|_| RuntimeError::ChannelClosed)?;
        rx.await.map_err(|_| RuntimeError::ChannelClosed)?
    }

    /// Replaces the payload of an unfinished mutation, e.g. with a
    /// conflict-resolved record.
    pub async fn rebase(&self, id: impl Into<MutationId>, payload: Value) -> Result<Mutation, RuntimeError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Rebase {
                id: id.into(),
                payload,
                resp: tx,
            })
            .await
            .map_err(|_| RuntimeError::ChannelClosed)?;
        rx.await.map_err(|_| RuntimeError::ChannelClosed)?
    }

    /// Drops a mutation that is not mid-attempt.
    pub async fn discard(&self, id: impl Into<MutationId>) -> Result<Mutation, RuntimeError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Discard { id: id.into(), resp: tx })
            .await
            .map_err(|_| RuntimeError::ChannelClosed)?;
        rx.await.map_err(|_| RuntimeError::ChannelClosed)?
    }

    /// Removes completed mutations and returns how many were removed.
    pub async fn purge_completed(&self) -> Result<usize, RuntimeError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::PurgeCompleted { resp: tx })
            .await
            .map_err(|_| RuntimeError::ChannelClosed)?;
        rx.await.map_err(|_| RuntimeError::ChannelClosed)
    }

    /// Makes every acknowledged change durable, surfacing store errors.
    pub async fn flush(&self) -> Result<(), RuntimeError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Flush { resp: tx })
            .await
            .map_err(|_| RuntimeError::ChannelClosed)?;
        rx.await.map_err(|_| RuntimeError::ChannelClosed)?
    }

    /// Lets an in-flight attempt finish, flushes the store and stops the loop.
    pub async fn shutdown(&self) -> Result<(), RuntimeError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Shutdown { resp: tx })
            .await
            .map_err(|_| RuntimeError::ChannelClosed)?;
        rx.await.map_err(|_| RuntimeError::ChannelClosed)?
    }
}

struct Coordinator<P> {
    queue: MutationQueue,
    store: Option<SharedStore>,
    store_dirty: bool,
    processor: Arc<P>,
    events_tx: broadcast::Sender<SyncEvent>,
    config: SyncConfig,
    online: bool,
    drain_waiters: Vec<oneshot::Sender<QueueStats>>,
    busy: bool,
}

impl<P: MutationProcessor> Coordinator<P> {
    async fn run(mut self, mut cmd_rx: mpsc::Receiver<Command>, mut network: watch::Receiver<bool>) {
        let mut in_flight: Option<InFlight> = None;
        let mut network_open = true;

        let recovered = self.queue.recover_interrupted(now_ms());
        if !recovered.is_empty() {
            self.persist().await;
        }
        let max_retries = self.queue.config().max_retries;
        for id in recovered {
            warn!(mutation_id = %id, "attempt interrupted by restart; marked failed");
            let abandoned = self
                .queue
                .get(&id)
                .filter(|m| m.is_abandoned(max_retries))
                .map(|m| m.retry_count);
            self.emit(SyncEvent::Recovered { id: id.clone() });
            if let Some(retry_count) = abandoned {
                warn!(mutation_id = %id, retry_count, "interrupted attempt was the last; mutation abandoned");
                self.emit(SyncEvent::Abandoned { id, retry_count });
            }
        }

        loop {
            if in_flight.is_none() && self.online {
                in_flight = self.start_next_attempt().await;
            }
            if in_flight.is_none() {
                self.settle_idle();
            }

            let now = now_ms();
            let wake_at = if self.online && in_flight.is_none() {
                self.queue.next_wake_at(now)
            } else {
                None
            };
            let deadline =
                wake_at.map(|t| Instant::now() + Duration::from_millis(t.saturating_sub(now)));

            tokio::select! {
                cmd = cmd_rx.recv() => {
                    let Some(cmd) = cmd else { break; };
                    if self.handle_command(cmd, &mut in_flight).await.is_break() {
                        break;
                    }
                }
                (id, outcome) = poll_in_flight(&mut in_flight), if in_flight.is_some() => {
                    in_flight = None;
                    self.finish_attempt(&id, outcome).await;
                }
                changed = network.changed(), if network_open => {
                    match changed {
                        Ok(()) => {
                            let online = *network.borrow_and_update();
                            self.set_online(online);
                        }
                        Err(_) => {
                            warn!(online = self.online, "network status source closed; keeping last state");
                            network_open = false;
                        }
                    }
                }
                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {}
            }
        }

        for waiter in self.drain_waiters.drain(..) {
            let _ = waiter.send(self.queue.stats());
        }
    }

    async fn handle_command(
        &mut self,
        cmd: Command,
        in_flight: &mut Option<InFlight>,
    ) -> ControlFlow<()> {
        match cmd {
            Command::Enqueue {
                entity,
                kind,
                payload,
                resp,
            } => {
                let res = match entity {
                    Some(entity) => self.queue.enqueue_for(&entity, &kind, payload),
                    None => self.queue.enqueue(&kind, payload).map(|m| (m, Vec::new())),
                };
                let res = match res {
                    Ok((mutation, superseded)) => {
                        self.persist().await;
                        for id in superseded {
                            debug!(mutation_id = %id, "superseded by newer mutation");
                            self.emit(SyncEvent::Superseded { id });
                        }
                        debug!(mutation_id = %mutation.id, kind = %mutation.kind, "enqueued");
                        self.emit(SyncEvent::Enqueued {
                            id: mutation.id.clone(),
                        });
                        Ok(mutation)
                    }
                    Err(err) => Err(RuntimeError::from(err)),
                };
                let _ = resp.send(res);
            }
            Command::Get { id, resp } => {
                let _ = resp.send(self.queue.get_cloned(&id));
            }
            Command::List { resp } => {
                let _ = resp.send(self.queue.export());
            }
            Command::Stats { resp } => {
                let _ = resp.send(self.queue.stats());
            }
            Command::Drain { resp } => {
                if self.online {
                    self.drain_waiters.push(resp);
                } else {
                    let _ = resp.send(self.queue.stats());
                }
            }
            Command::Resend { id, resp } => {
                let res = self.queue.resend(&id).map_err(RuntimeError::from);
                self.persist().await;
                let _ = resp.send(res);
            }
            Command::Rebase { id, payload, resp } => {
                let res = self.queue.rebase(&id, payload).map_err(RuntimeError::from);
                self.persist().await;
                let _ = resp.send(res);
            }
            Command::Discard { id, resp } => {
                let res = self.queue.discard(&id).map_err(RuntimeError::from);
                self.persist().await;
                let _ = resp.send(res);
            }
            Command::PurgeCompleted { resp } => {
                let removed = self.queue.purge_completed();
                self.persist().await;
                let _ = resp.send(removed);
            }
            Command::Flush { resp } => {
                let _ = resp.send(self.flush_store().await);
            }
            Command::Shutdown { resp } => {
                if let Some(attempt) = in_flight.take() {
                    let (id, outcome) = attempt.await;
                    self.finish_attempt(&id, outcome).await;
                }
                info!("sync runtime shutting down");
                let _ = resp.send(self.flush_store().await);
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    async fn start_next_attempt(&mut self) -> Option<InFlight> {
        let now = now_ms();
        let id = self.queue.next_eligible(now)?.id.clone();
        let mutation = match self.queue.begin_attempt(&id, now) {
            Ok(m) => m,
            Err(err) => {
                error!(mutation_id = %id, %err, "eligible mutation could not be claimed");
                return None;
            }
        };
        self.persist().await;

        let attempt = mutation.retry_count + 1;
        debug!(mutation_id = %id, kind = %mutation.kind, attempt, "starting attempt");
        self.emit(SyncEvent::AttemptStarted { id, attempt });
        self.busy = true;

        let processor = Arc::clone(&self.processor);
        let limit = self.config.attempt_timeout();
        Some(Box::pin(async move {
            let outcome = match tokio::time::timeout(
                limit,
                processor.process(&mutation.kind, &mutation.payload),
            )
            .await
            {
                Ok(outcome) => outcome,
                Err(_) => Err(ProcessorError::TimedOut(limit)),
            };
            (mutation.id, outcome)
        }))
    }

    async fn finish_attempt(&mut self, id: &str, outcome: AttemptOutcome) {
        let mutation = match self.queue.finish_attempt(id, &outcome) {
            Ok(m) => m,
            Err(err) => {
                error!(mutation_id = %id, %err, "attempt outcome could not be recorded");
                return;
            }
        };
        self.persist().await;

        let max_retries = self.queue.config().max_retries;
        match mutation.status {
            MutationStatus::Completed => {
                debug!(mutation_id = %mutation.id, "completed");
                self.emit(SyncEvent::Completed { id: mutation.id });
            }
            _ => {
                let message = mutation.error.clone().unwrap_or_default();
                if mutation.requires_resolution {
                    warn!(mutation_id = %mutation.id, error = %message, "conflict needs manual resolution");
                    self.emit(SyncEvent::ResolutionRequired {
                        id: mutation.id,
                        error: message,
                    });
                } else if mutation.is_abandoned(max_retries) {
                    warn!(
                        mutation_id = %mutation.id,
                        retry_count = mutation.retry_count,
                        error = %message,
                        "retries exhausted; mutation abandoned"
                    );
                    self.emit(SyncEvent::Abandoned {
                        id: mutation.id,
                        retry_count: mutation.retry_count,
                    });
                } else {
                    info!(
                        mutation_id = %mutation.id,
                        retry_count = mutation.retry_count,
                        error = %message,
                        "attempt failed; backing off"
                    );
                    self.emit(SyncEvent::Failed {
                        id: mutation.id,
                        retry_count: mutation.retry_count,
                        error: message,
                        next_attempt_at_ms: mutation.next_attempt_at_ms,
                    });
                }
            }
        }
    }

    fn set_online(&mut self, online: bool) {
        if online == self.online {
            return;
        }
        info!(online, "network status changed");
        self.online = online;
        self.emit(SyncEvent::OnlineChanged { online });
        if !online {
            for waiter in self.drain_waiters.drain(..) {
                let _ = waiter.send(self.queue.stats());
            }
        }
    }

    fn settle_idle(&mut self) {
        if !self.busy && self.drain_waiters.is_empty() {
            return;
        }
        let stats = self.queue.stats();
        if self.busy {
            self.busy = false;
            debug!(pending = stats.pending, failed = stats.failed, "drain cycle finished");
            self.emit(SyncEvent::Drained { stats });
        }
        for waiter in self.drain_waiters.drain(..) {
            let _ = waiter.send(stats);
        }
    }

    async fn persist(&mut self) {
        let writes = self.queue.drain_pending_writes();
        let Some(store) = self.store.as_ref() else {
            return;
        };
        if writes.is_empty() && !self.store_dirty {
            return;
        }

        let snapshot = self.store_dirty.then(|| self.queue.export());
        let store = Arc::clone(store);
        let result = tokio::task::spawn_blocking(move || {
            let mut store = store.blocking_lock();
            match snapshot {
                Some(all) => store.save_all(&all),
                None => apply_writes(store.as_mut(), writes),
            }
        })
        .await
        .map_err(|e| PersistError::Message(format!("join error: {e}")))
        .and_then(|r| r);

        match result {
            Ok(()) => self.store_dirty = false,
            Err(err) => {
                error!(%err, "failed to persist mutation queue");
                self.store_dirty = true;
                self.emit(SyncEvent::PersistFailed {
                    message: err.to_string(),
                });
            }
        }
    }

    async fn flush_store(&mut self) -> Result<(), RuntimeError> {
        self.persist().await;
        if self.store_dirty {
            return Err(RuntimeError::Persist(PersistError::Message(
                "mutation queue could not be persisted".to_string(),
            )));
        }
        let Some(store) = self.store.as_ref() else {
            return Ok(());
        };
        let store = Arc::clone(store);
        tokio::task::spawn_blocking(move || {
            let mut store = store.blocking_lock();
            store.flush()
        })
        .await
        .map_err(|e| PersistError::Message(format!("join error: {e}")))??;
        Ok(())
    }

    fn emit(&self, event: SyncEvent) {
        let _ = self.events_tx.send(event);
    }
}

async fn poll_in_flight(in_flight: &mut Option<InFlight>) -> (MutationId, AttemptOutcome) {
    match in_flight {
        Some(attempt) => attempt.as_mut().await,
        None => std::future::pending().await,
    }
}

/// Applies queue writes in order, batching consecutive upserts and removals.
fn apply_writes(store: &mut dyn MutationStore, writes: Vec<QueueWrite>) -> PersistResult<()> {
    let mut upserts: Vec<Mutation> = Vec::new();
    let mut removals: Vec<MutationId> = Vec::new();
    for write in writes {
        match write {
            QueueWrite::Upsert(m) => {
                if !removals.is_empty() {
                    store.remove(&std::mem::take(&mut removals))?;
                }
                upserts.push(m);
            }
            QueueWrite::Remove(id) => {
                if !upserts.is_empty() {
                    store.upsert(&std::mem::take(&mut upserts))?;
                }
                removals.push(id);
            }
        }
    }
    store.upsert(&upserts)?;
    store.remove(&removals)?;
    Ok(())
}

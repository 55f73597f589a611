//! Offline-first mutation queue with backoff retry and conflict resolution.
//!
//! # Examples
//!
//! In-memory usage with [`core::queue::MutationQueue`]:
//! ```
//! use fieldsync::core::queue::{MutationQueue, QueueConfig};
//! use serde_json::json;
//!
//! let mut queue = MutationQueue::new(QueueConfig::default());
//! queue.enqueue("check_in", json!({"site": "reef-3"})).expect("enqueue");
//! queue.enqueue("location_update", json!({"lat": -8.5})).expect("enqueue");
//! assert_eq!(queue.stats().pending, 2);
//! ```
//!
//! Runtime usage with a SQLite store:
//! ```no_run
//! use fieldsync::{
//!     config::SyncConfig,
//!     core::queue::MutationQueue,
//!     engine::traits::ProcessorError,
//!     persist::{sqlite::SqliteMutationStore, MutationStore},
//!     runtime::handle::spawn_sync,
//! };
//! use serde_json::{json, Value};
//! use tokio::sync::watch;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let config = SyncConfig::default();
//! let mut store = SqliteMutationStore::open("fieldsync.db").expect("open sqlite");
//! let queue = MutationQueue::load(&mut store, config.queue.clone()).expect("load");
//! let (online_tx, online_rx) = watch::channel(false);
//!
//! let processor = |kind: String, payload: Value| async move {
//!     // hand off to the transport layer here
//!     let _ = (kind, payload);
//!     Ok::<bool, ProcessorError>(true)
//! };
//! let handle = spawn_sync(queue, Some(Box::new(store)), processor, online_rx, config);
//! handle.enqueue("check_in", json!({"site": "reef-3"})).await.expect("enqueue");
//! online_tx.send(true).expect("network");
//! handle.drain().await.expect("drain");
//! handle.shutdown().await.expect("shutdown");
//! # }
//! ```
#![deny(missing_docs)]

/// Version-based conflict detection and resolution.
pub mod conflict;
/// Coordinator and queue configuration.
pub mod config;
/// In-memory queue, ids and backoff.
pub mod core;
/// Processor seam and single-attempt wrapper.
pub mod engine;
/// Mutation record and persistence envelope.
pub mod mutation;
/// Persistence abstraction and SQLite implementation.
pub mod persist;
/// Single-writer coordinator runtime and events.
pub mod runtime;
/// Shared primitive types.
pub mod types;

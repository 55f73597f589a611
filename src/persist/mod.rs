/// SQLite implementation of [`MutationStore`].
pub mod sqlite;

use thiserror::Error;

use crate::{mutation::Mutation, types::MutationId};

/// Persistence failures.
#[derive(Debug, Error)]
pub enum PersistError {
    /// SQLite rejected a statement.
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    /// A row payload failed to encode or decode.
    #[error("serde: {0}")]
    Serde(#[from] serde_json::Error),
    /// Anything else, e.g. a worker join failure.
    #[error("{0}")]
    Message(String),
}

/// Result alias for persistence calls.
pub type PersistResult<T> = Result<T, PersistError>;

/// Durable home of the mutation queue.
///
/// Every method is one atomic unit: either all of its writes land or none do.
pub trait MutationStore: Send {
    /// All stored mutations in enqueue order.
    fn load_all(&mut self) -> PersistResult<Vec<Mutation>>;
    /// Replaces the stored queue with `mutations`.
    fn save_all(&mut self, mutations: &[Mutation]) -> PersistResult<()>;
    /// Inserts or updates `mutations`, keeping existing ones in place.
    fn upsert(&mut self, mutations: &[Mutation]) -> PersistResult<()>;
    /// Deletes the given ids; unknown ids are ignored.
    fn remove(&mut self, ids: &[MutationId]) -> PersistResult<usize>;
    /// Forces buffered writes to stable storage.
    fn flush(&mut self) -> PersistResult<()> {
        Ok(())
    }
}

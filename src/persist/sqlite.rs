//! SQLite-backed mutation queue store.

use std::path::Path;

use rusqlite::{Connection, Transaction, params};
use tracing::{debug, warn};

use crate::{
    mutation::{MUTATION_FORMAT_VERSION, Mutation, StoredMutationEnvelope},
    types::MutationId,
};

use super::{MutationStore, PersistError, PersistResult};

const UPSERT_SQL: &str = "INSERT INTO mutations(id, kind, status, entity, created_at_ms, payload)
     VALUES (?1, ?2, ?3, ?4, ?5, ?6)
     ON CONFLICT(id) DO UPDATE SET
         kind = excluded.kind,
         status = excluded.status,
         entity = excluded.entity,
         payload = excluded.payload";

/// SQLite implementation of [`crate::persist::MutationStore`].
pub struct SqliteMutationStore {
    conn: Connection,
}

impl SqliteMutationStore {
    /// Opens or creates a store at `path`.
    ///
    /// Enables WAL mode and sets `synchronous=NORMAL`.
    pub fn open(path: impl AsRef<Path>) -> PersistResult<Self> {
        let conn = Connection::open(path)?;
        Self::init_connection(conn)
    }

    /// Opens an in-memory store.
    pub fn open_in_memory() -> PersistResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init_connection(conn)
    }

    fn init_connection(conn: Connection) -> PersistResult<Self> {
        conn.execute_batch(include_str!("schema.sql"))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        Ok(Self { conn })
    }

    /// Number of stored rows.
    pub fn count(&self) -> PersistResult<usize> {
        let n: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM mutations", [], |row| row.get(0))?;
        Ok(n as usize)
    }
}

impl MutationStore for SqliteMutationStore {
    fn load_all(&mut self) -> PersistResult<Vec<Mutation>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, payload FROM mutations ORDER BY seq ASC")?;

        let rows = stmt.query_map([], |row| {
            let id: String = row.get(0)?;
            let payload: Vec<u8> = row.get(1)?;
            Ok((id, payload))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (id, payload) = row?;
            let mutation = decode_mutation_payload(&payload)
                .map_err(|err| PersistError::Message(format!("mutation {id}: {err}")))?;
            out.push(mutation);
        }
        debug!(count = out.len(), "loaded mutation queue");
        Ok(out)
    }

    fn save_all(&mut self, mutations: &[Mutation]) -> PersistResult<()> {
        let tx = self.conn.transaction()?;
        tx.execute("DELETE FROM mutations", [])?;
        write_rows(&tx, mutations)?;
        tx.commit()?;
        debug!(count = mutations.len(), "rewrote mutation queue");
        Ok(())
    }

    fn upsert(&mut self, mutations: &[Mutation]) -> PersistResult<()> {
        if mutations.is_empty() {
            return Ok(());
        }
        let tx = self.conn.transaction()?;
        write_rows(&tx, mutations)?;
        tx.commit()?;
        Ok(())
    }

    fn remove(&mut self, ids: &[MutationId]) -> PersistResult<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        let tx = self.conn.transaction()?;
        let mut removed = 0;
        {
            let mut stmt = tx.prepare("DELETE FROM mutations WHERE id = ?1")?;
            for id in ids {
                removed += stmt.execute(params![id])?;
            }
        }
        tx.commit()?;
        Ok(removed)
    }

    fn flush(&mut self) -> PersistResult<()> {
        self.conn.execute_batch("PRAGMA wal_checkpoint(PASSIVE);")?;
        Ok(())
    }
}

fn write_rows(tx: &Transaction<'_>, mutations: &[Mutation]) -> PersistResult<()> {
    let mut stmt = tx.prepare(UPSERT_SQL)?;
    for mutation in mutations {
        let payload = serde_json::to_vec(&StoredMutationEnvelope::new(mutation.clone()))?;
        stmt.execute(params![
            mutation.id,
            mutation.kind,
            mutation.status.as_str(),
            mutation.entity,
            mutation.created_at_ms as i64,
            payload,
        ])?;
    }
    Ok(())
}

fn decode_mutation_payload(payload: &[u8]) -> Result<Mutation, String> {
    let envelope: StoredMutationEnvelope = serde_json::from_slice(payload)
        .map_err(|e| format!("mutation payload decode failed: {e}"))?;
    if envelope.format_version != MUTATION_FORMAT_VERSION {
        warn!(version = envelope.format_version, "unsupported mutation format");
        return Err(format!(
            "unsupported mutation format version: {}",
            envelope.format_version
        ));
    }
    Ok(envelope.mutation)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn upsert_keeps_original_position() {
        let mut store = SqliteMutationStore::open_in_memory().expect("open");
        let a = Mutation::new("a".to_string(), "k", json!({}), None, 1);
        let b = Mutation::new("b".to_string(), "k", json!({}), None, 2);
        store.upsert(&[a.clone(), b.clone()]).expect("insert");

        let mut a2 = a.clone();
        a2.payload = json!({"v": 2});
        store.upsert(&[a2.clone()]).expect("update");

        let loaded = store.load_all().expect("load");
        assert_eq!(loaded, vec![a2, b]);
        assert_eq!(store.count().expect("count"), 2);
    }

    #[test]
    fn remove_ignores_unknown_ids() {
        let mut store = SqliteMutationStore::open_in_memory().expect("open");
        let a = Mutation::new("a".to_string(), "k", json!({}), None, 1);
        store.upsert(&[a]).expect("insert");
        let removed = store
            .remove(&["a".to_string(), "zzz".to_string()])
            .expect("remove");
        assert_eq!(removed, 1);
        assert!(store.load_all().expect("load").is_empty());
    }

    #[test]
    fn rejects_future_format_versions() {
        let mut store = SqliteMutationStore::open_in_memory().expect("open");
        let m = Mutation::new("a".to_string(), "k", json!({}), None, 1);
        let mut env = serde_json::to_value(StoredMutationEnvelope::new(m)).expect("env");
        env["format_version"] = json!(99);
        let payload = serde_json::to_vec(&env).expect("bytes");
        store
            .conn
            .execute(
                "INSERT INTO mutations(id, kind, status, entity, created_at_ms, payload) VALUES ('a', 'k', 'pending', NULL, 1, ?1)",
                params![payload],
            )
            .expect("raw insert");
        assert!(matches!(store.load_all(), Err(PersistError::Message(_))));
    }
}

//! SQLite-backed document store for durable local deployments.
//!
//! Documents are stored as JSON rows keyed by (collection, id). A single
//! connection behind a mutex serializes all access, so transactions commit
//! without conflicts; the optimistic-retry path lives in the memory backend.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use rusqlite::{params, Connection, OptionalExtension, Transaction};
use serde_json::Value;
use tracing::{info, warn};

use super::{merge_fields, Document, Filter, Store, StoreError, StoreTxn, WriteMode, WriteOp};
use crate::config::now_ms;
use crate::error::EngineError;

pub struct SqliteStore {
    conn: Mutex<Connection>,
    next_id: AtomicU64,
}

impl SqliteStore {
    /// Open (or create) a document store at the given path.
    pub fn open(path: &str) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        create_tables(&conn)?;
        info!("[STORE] document store initialized at {}", path);
        Ok(Self::with_connection(conn))
    }

    /// Ephemeral store for tests and dry runs.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        create_tables(&conn)?;
        Ok(Self::with_connection(conn))
    }

    fn with_connection(conn: Connection) -> Self {
        Self {
            conn: Mutex::new(conn),
            // Seed from the clock so ids stay unique across restarts
            next_id: AtomicU64::new(now_ms() as u64),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Create the documents table and indexes.
fn create_tables(conn: &Connection) -> Result<(), StoreError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS documents (
            collection TEXT NOT NULL,
            id TEXT NOT NULL,
            data TEXT NOT NULL,
            updated_at INTEGER NOT NULL,
            PRIMARY KEY (collection, id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_documents_collection ON documents(collection)",
        [],
    )?;
    Ok(())
}

fn read_document(conn: &Connection, collection: &str, id: &str) -> Result<Option<Value>, StoreError> {
    let text: Option<String> = conn
        .query_row(
            "SELECT data FROM documents WHERE collection = ?1 AND id = ?2",
            params![collection, id],
            |row| row.get(0),
        )
        .optional()?;
    match text {
        Some(text) => Ok(Some(serde_json::from_str(&text)?)),
        None => Ok(None),
    }
}

fn write_document(
    conn: &Connection,
    collection: &str,
    id: &str,
    data: &Value,
) -> Result<(), StoreError> {
    conn.execute(
        "INSERT OR REPLACE INTO documents (collection, id, data, updated_at)
         VALUES (?1, ?2, ?3, ?4)",
        params![collection, id, data.to_string(), now_ms()],
    )?;
    Ok(())
}

/// Apply one write op; returns false (with a warning) when the target state
/// does not admit the op, mirroring the tolerant batch semantics of the
/// memory backend.
fn apply_write(conn: &Connection, op: &WriteOp) -> Result<bool, StoreError> {
    match op.mode {
        WriteMode::Update => match read_document(conn, &op.collection, &op.id)? {
            Some(mut data) => {
                merge_fields(&mut data, &op.fields);
                write_document(conn, &op.collection, &op.id, &data)?;
                Ok(true)
            }
            None => {
                warn!(
                    "[STORE] skipping update of missing document {}/{}",
                    op.collection, op.id
                );
                Ok(false)
            }
        },
        WriteMode::Create => {
            if read_document(conn, &op.collection, &op.id)?.is_some() {
                warn!(
                    "[STORE] skipping create of existing document {}/{}",
                    op.collection, op.id
                );
                return Ok(false);
            }
            write_document(conn, &op.collection, &op.id, &op.fields)?;
            Ok(true)
        }
        WriteMode::Set => {
            write_document(conn, &op.collection, &op.id, &op.fields)?;
            Ok(true)
        }
    }
}

impl Store for SqliteStore {
    fn get(&self, collection: &str, id: &str) -> Result<Option<Document>, StoreError> {
        let conn = self.lock();
        Ok(read_document(&conn, collection, id)?.map(|data| Document::new(id, data)))
    }

    fn list(&self, collection: &str, filter: Option<&Filter>) -> Result<Vec<Document>, StoreError> {
        let conn = self.lock();
        let mut stmt =
            conn.prepare("SELECT id, data FROM documents WHERE collection = ?1")?;
        let rows = stmt.query_map(params![collection], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut documents = Vec::new();
        for row in rows {
            let (id, text) = row?;
            let data: Value = serde_json::from_str(&text)?;
            if filter.map(|f| f.matches(&data)).unwrap_or(true) {
                documents.push(Document::new(id, data));
            }
        }
        Ok(documents)
    }

    fn batch_write(&self, writes: &[WriteOp]) -> Result<usize, StoreError> {
        let conn = self.lock();
        let tx = conn.unchecked_transaction()?;
        let mut applied = 0;
        for op in writes {
            if apply_write(&tx, op)? {
                applied += 1;
            }
        }
        tx.commit()?;
        Ok(applied)
    }

    fn transact(
        &self,
        body: &mut dyn FnMut(&mut dyn StoreTxn) -> Result<(), EngineError>,
    ) -> Result<(), EngineError> {
        let conn = self.lock();
        let tx = conn.unchecked_transaction().map_err(StoreError::from)?;
        {
            let mut txn = SqliteTxn { tx: &tx };
            // A body error drops the transaction uncommitted (rollback)
            body(&mut txn)?;
        }
        tx.commit().map_err(StoreError::from)?;
        Ok(())
    }

    fn allocate_id(&self, collection: &str) -> String {
        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        format!("{collection}-{n:x}")
    }
}

struct SqliteTxn<'a> {
    tx: &'a Transaction<'a>,
}

impl StoreTxn for SqliteTxn<'_> {
    fn get(&mut self, collection: &str, id: &str) -> Result<Option<Document>, StoreError> {
        Ok(read_document(self.tx, collection, id)?.map(|data| Document::new(id, data)))
    }

    fn update(&mut self, collection: &str, id: &str, fields: Value) -> Result<(), StoreError> {
        match read_document(self.tx, collection, id)? {
            Some(mut data) => {
                merge_fields(&mut data, &fields);
                write_document(self.tx, collection, id, &data)
            }
            None => Err(StoreError::NotFound {
                collection: collection.to_string(),
                id: id.to_string(),
            }),
        }
    }

    fn create(&mut self, collection: &str, id: &str, data: Value) -> Result<(), StoreError> {
        if read_document(self.tx, collection, id)?.is_some() {
            return Err(StoreError::AlreadyExists {
                collection: collection.to_string(),
                id: id.to_string(),
            });
        }
        write_document(self.tx, collection, id, &data)
    }
}

// =============================================================================
// TESTS
// =============================================================================

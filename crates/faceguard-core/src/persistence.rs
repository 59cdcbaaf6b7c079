//! Named snapshot storage for the registry and the ledger.
//!
//! Each collection is saved as one opaque blob under a fixed name and
//! replaced wholesale on every save.

use rusqlite::{params, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use thiserror::Error;

pub const IDENTITIES: &str = "identities";
pub const ATTENDANCE_RECORDS: &str = "attendance_records";

#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("could not create data directory {path}: {source}")]
    DataDir {
        path: String,
        source: std::io::Error,
    },
    #[error("store lock poisoned")]
    Poisoned,
    #[error("write rejected: {0}")]
    Rejected(String),
}

/// Whole-blob load/save keyed by snapshot name.
///
/// `save` must be all-or-nothing: after a failed save the previous blob is
/// still what `load` returns.
pub trait SnapshotStore: Send + Sync {
    fn load(&self, name: &str) -> Result<Option<Vec<u8>>, PersistenceError>;
    fn save(&self, name: &str, blob: &[u8]) -> Result<(), PersistenceError>;
}

/// Load a JSON collection. Missing or unreadable snapshots yield an empty Vec.
pub fn load_collection<T: DeserializeOwned>(store: &dyn SnapshotStore, name: &str) -> Vec<T> {
    let blob = match store.load(name) {
        Ok(Some(blob)) => blob,
        Ok(None) => return Vec::new(),
        Err(e) => {
            tracing::warn!(snapshot = name, error = %e, "snapshot load failed; starting empty");
            return Vec::new();
        }
    };
    match serde_json::from_slice(&blob) {
        Ok(items) => items,
        Err(e) => {
            tracing::warn!(snapshot = name, error = %e, "snapshot unparsable; starting empty");
            Vec::new()
        }
    }
}

pub fn save_collection<T: Serialize>(
    store: &dyn SnapshotStore,
    name: &str,
    items: &[T],
) -> Result<(), PersistenceError> {
    let blob = serde_json::to_vec(items)?;
    store.save(name, &blob)?;
    tracing::debug!(snapshot = name, count = items.len(), bytes = blob.len(), "snapshot saved");
    Ok(())
}

/// SQLite-backed snapshot store (one row per snapshot name).
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) the database file, creating the parent directory.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, PersistenceError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| PersistenceError::DataDir {
                path: parent.display().to_string(),
                source,
            })?;
        }

        let conn = Connection::open(path)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = FULL;
             PRAGMA busy_timeout = 5000;",
        )?;
        Self::migrate(&conn)?;

        tracing::info!(path = %path.display(), "snapshot store opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory database, mainly for tests.
    pub fn open_in_memory() -> Result<Self, PersistenceError> {
        let conn = Connection::open_in_memory()?;
        Self::migrate(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn migrate(conn: &Connection) -> Result<(), PersistenceError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS snapshots (
                name     TEXT PRIMARY KEY,
                payload  BLOB NOT NULL,
                saved_at TEXT NOT NULL
            );",
        )?;
        Ok(())
    }
}

impl SnapshotStore for SqliteStore {
    fn load(&self, name: &str) -> Result<Option<Vec<u8>>, PersistenceError> {
        let conn = self.conn.lock().map_err(|_| PersistenceError::Poisoned)?;
        let blob = conn
            .query_row(
                "SELECT payload FROM snapshots WHERE name = ?1",
                params![name],
                |row| row.get::<_, Vec<u8>>(0),
            )
            .optional()?;
        Ok(blob)
    }

    fn save(&self, name: &str, blob: &[u8]) -> Result<(), PersistenceError> {
        let mut conn = self.conn.lock().map_err(|_| PersistenceError::Poisoned)?;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT OR REPLACE INTO snapshots (name, payload, saved_at) VALUES (?1, ?2, ?3)",
            params![name, blob, chrono::Utc::now().to_rfc3339()],
        )?;
        tx.commit()?;
        Ok(())
    }
}

/// In-memory store for tests and ephemeral kiosks.
#[derive(Default)]
pub struct MemoryStore {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
    fail_saves: std::sync::atomic::AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent save fail (without touching stored blobs).
    pub fn set_fail_saves(&self, fail: bool) {
        self.fail_saves
            .store(fail, std::sync::atomic::Ordering::SeqCst);
    }

    /// Put raw bytes under a name, bypassing serialization.
    pub fn insert_raw(&self, name: &str, blob: Vec<u8>) {
        if let Ok(mut blobs) = self.blobs.lock() {
            blobs.insert(name.to_string(), blob);
        }
    }
}

impl SnapshotStore for MemoryStore {
    fn load(&self, name: &str) -> Result<Option<Vec<u8>>, PersistenceError> {
        let blobs = self.blobs.lock().map_err(|_| PersistenceError::Poisoned)?;
        Ok(blobs.get(name).cloned())
    }

    fn save(&self, name: &str, blob: &[u8]) -> Result<(), PersistenceError> {
        if self.fail_saves.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(PersistenceError::Rejected(format!("save of {name} refused")));
        }
        let mut blobs = self.blobs.lock().map_err(|_| PersistenceError::Poisoned)?;
        blobs.insert(name.to_string(), blob.to_vec());
        Ok(())
    }
}

//! Snapshot persistence.
//!
//! The reaper periodically writes the manager's `user -> resource id` map so a
//! restarted broker knows which cloud resources it may have left behind. The
//! snapshot is always replaced in full, never patched.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rusqlite::{params, Connection};
use thiserror::Error;
use tracing::debug;
use vmlease_id::{ResourceId, UserId};

/// `user -> resource id` for every tracked resource.
pub type Snapshot = BTreeMap<UserId, ResourceId>;

/// Errors from snapshot storage.
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt snapshot row: {0}")]
    Corrupt(String),

    #[error("snapshot task failed: {0}")]
    Task(String),
}

/// Persistence bridge for snapshots.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Replace the stored snapshot with `snapshot`.
    async fn write_snapshot(&self, snapshot: &Snapshot) -> Result<(), SnapshotError>;

    /// Read the stored snapshot. Empty when nothing was ever written.
    async fn read_snapshot(&self) -> Result<Snapshot, SnapshotError>;
}

/// SQLite-backed snapshot store.
#[derive(Clone)]
pub struct SqliteSnapshotStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteSnapshotStore {
    /// Open or create a store at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, SnapshotError> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        Self::init(conn)
    }

    /// Open an in-memory store (for testing).
    pub fn open_in_memory() -> Result<Self, SnapshotError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, SnapshotError> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS resource_snapshot (
                user_id TEXT PRIMARY KEY,
                resource_id INTEGER NOT NULL UNIQUE
            );
            "#,
        )?;

        debug!("Snapshot schema initialized");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T, SnapshotError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, SnapshotError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            f(&mut conn)
        })
        .await
        .map_err(|e| SnapshotError::Task(e.to_string()))?
    }
}

#[async_trait]
impl SnapshotStore for SqliteSnapshotStore {
    async fn write_snapshot(&self, snapshot: &Snapshot) -> Result<(), SnapshotError> {
        let rows: Vec<(String, u32)> = snapshot
            .iter()
            .map(|(user_id, resource_id)| (user_id.to_string(), resource_id.value()))
            .collect();

        self.blocking(move |conn| {
            let tx = conn.transaction()?;
            tx.execute("DELETE FROM resource_snapshot", [])?;
            {
                let mut stmt = tx.prepare(
                    "INSERT INTO resource_snapshot (user_id, resource_id) VALUES (?1, ?2)",
                )?;
                for (user_id, resource_id) in &rows {
                    stmt.execute(params![user_id, resource_id])?;
                }
            }
            tx.commit()?;
            debug!(entries = rows.len(), "Snapshot written");
            Ok(())
        })
        .await
    }

    async fn read_snapshot(&self) -> Result<Snapshot, SnapshotError> {
        self.blocking(|conn| {
            let mut stmt = conn.prepare("SELECT user_id, resource_id FROM resource_snapshot")?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, u32>(1)?))
            })?;

            let mut snapshot = Snapshot::new();
            for row in rows {
                let (user_id, resource_id) = row?;
                let user_id = UserId::parse(&user_id)
                    .map_err(|e| SnapshotError::Corrupt(format!("user_id {user_id:?}: {e}")))?;
                snapshot.insert(user_id, ResourceId::new(resource_id));
            }
            Ok(snapshot)
        })
        .await
    }
}

/// In-memory snapshot store.
#[derive(Debug, Default)]
pub struct MemorySnapshotStore {
    snapshot: Mutex<Snapshot>,
    writes: Mutex<u64>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store pre-populated with `snapshot`, as if left by a previous process.
    pub fn with_snapshot(snapshot: Snapshot) -> Self {
        Self {
            snapshot: Mutex::new(snapshot),
            writes: Mutex::new(0),
        }
    }

    /// Number of `write_snapshot` calls so far.
    pub fn writes(&self) -> u64 {
        *self.writes.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl SnapshotStore for MemorySnapshotStore {
    async fn write_snapshot(&self, snapshot: &Snapshot) -> Result<(), SnapshotError> {
        *self
            .snapshot
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = snapshot.clone();
        *self.writes.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) += 1;
        Ok(())
    }

    async fn read_snapshot(&self) -> Result<Snapshot, SnapshotError> {
        Ok(self
            .snapshot
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone())
    }
}

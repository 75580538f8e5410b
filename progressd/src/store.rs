//! SQLite-backed snapshot store for the named test sets.
//!
//! Each [`TestSet`] lives in its own table and owns its own writer
//! connection, so replacing one set never waits on the other. A separate
//! reader connection serves point-in-time reads; with WAL journaling it only
//! ever sees committed snapshots.

use chrono::{DateTime, Utc};
use progress_common::{ProgressCounts, TestIdentifierSet, TestSet};
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// How long a connection waits on a locked database before failing.
const BUSY_TIMEOUT: Duration = Duration::from_secs(10);

/// Errors raised by the snapshot store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to open snapshot store at {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: rusqlite::Error,
    },

    #[error("failed to create directory for snapshot store {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("connection lock for {0} connection poisoned")]
    Poisoned(&'static str),

    #[error("storage task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

fn table_name(set: TestSet) -> &'static str {
    match set {
        TestSet::Total => "all_tests",
        TestSet::Passing => "passing_tests",
    }
}

struct StoreInner {
    total: Mutex<Connection>,
    passing: Mutex<Connection>,
    reader: Mutex<Connection>,
}

/// Durable `TestSet -> identifiers` store with atomic whole-set replacement.
#[derive(Clone)]
pub struct SnapshotStore {
    inner: Arc<StoreInner>,
}

impl SnapshotStore {
    /// Open (or create) the store at `path` and ensure both tables exist.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| StoreError::CreateDir {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let writer_total = open_connection(path)?;
        init_schema(&writer_total)?;
        let writer_passing = open_connection(path)?;
        let reader = open_connection(path)?;

        debug!(path = %path.display(), "Snapshot store opened");

        Ok(Self {
            inner: Arc::new(StoreInner {
                total: Mutex::new(writer_total),
                passing: Mutex::new(writer_passing),
                reader: Mutex::new(reader),
            }),
        })
    }

    fn writer(&self, set: TestSet) -> Result<MutexGuard<'_, Connection>, StoreError> {
        let lock = match set {
            TestSet::Total => &self.inner.total,
            TestSet::Passing => &self.inner.passing,
        };
        lock.lock().map_err(|_| StoreError::Poisoned(set.as_str()))
    }

    fn reader(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.inner
            .reader
            .lock()
            .map_err(|_| StoreError::Poisoned("reader"))
    }

    /// Atomically replace the contents of `set` with `identifiers`.
    ///
    /// Runs as a single transaction: delete everything, bulk insert, then
    /// stamp the replacement time. If any statement fails the transaction is
    /// rolled back and the previous snapshot is left untouched.
    pub fn replace(&self, set: TestSet, identifiers: &TestIdentifierSet) -> Result<(), StoreError> {
        let table = table_name(set);
        let mut conn = self.writer(set)?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute(&format!("DELETE FROM {table}"), [])?;
        {
            let mut insert = tx.prepare(&format!("INSERT INTO {table} (name) VALUES (?1)"))?;
            for identifier in identifiers {
                insert.execute(params![identifier])?;
            }
        }
        tx.execute(
            "INSERT INTO snapshots (name, replaced_at) VALUES (?1, ?2)
             ON CONFLICT(name) DO UPDATE SET replaced_at = excluded.replaced_at",
            params![set.as_str(), Utc::now().timestamp()],
        )?;
        tx.commit()?;

        debug!(set = %set, count = identifiers.len(), "Snapshot replaced");
        Ok(())
    }

    /// Read the committed snapshot of `set`.
    pub fn read(&self, set: TestSet) -> Result<TestIdentifierSet, StoreError> {
        let conn = self.reader()?;
        let mut stmt = conn.prepare(&format!("SELECT name FROM {}", table_name(set)))?;
        let names = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut identifiers = TestIdentifierSet::new();
        for name in names {
            identifiers.insert(name?);
        }
        Ok(identifiers)
    }

    /// Number of distinct identifiers in `set`.
    pub fn size(&self, set: TestSet) -> Result<usize, StoreError> {
        let conn = self.reader()?;
        let count: i64 = conn.query_row(
            &format!("SELECT COUNT(DISTINCT name) FROM {}", table_name(set)),
            [],
            |row| row.get(0),
        )?;
        Ok(usize::try_from(count).unwrap_or(0))
    }

    /// Sizes of both sets. A never-populated store reports `0/0`.
    pub fn counts(&self) -> Result<ProgressCounts, StoreError> {
        Ok(ProgressCounts {
            total: self.size(TestSet::Total)?,
            passing: self.size(TestSet::Passing)?,
        })
    }

    /// When `set` was last replaced, or `None` if it never has been.
    pub fn replaced_at(&self, set: TestSet) -> Result<Option<DateTime<Utc>>, StoreError> {
        let conn = self.reader()?;
        let secs: Option<i64> = conn
            .query_row(
                "SELECT replaced_at FROM snapshots WHERE name = ?1",
                params![set.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(secs.and_then(|secs| DateTime::from_timestamp(secs, 0)))
    }

    /// Counts for display, or `None` while neither set has ever been stored.
    pub fn published_counts(&self) -> Result<Option<ProgressCounts>, StoreError> {
        for set in TestSet::ALL {
            if self.replaced_at(set)?.is_some() {
                return self.counts().map(Some);
            }
        }
        Ok(None)
    }

    /// [`SnapshotStore::replace`] on the blocking pool.
    pub async fn replace_blocking(
        &self,
        set: TestSet,
        identifiers: TestIdentifierSet,
    ) -> Result<(), StoreError> {
        let store = self.clone();
        tokio::task::spawn_blocking(move || store.replace(set, &identifiers)).await?
    }

    /// [`SnapshotStore::published_counts`] on the blocking pool.
    pub async fn published_counts_blocking(&self) -> Result<Option<ProgressCounts>, StoreError> {
        let store = self.clone();
        tokio::task::spawn_blocking(move || store.published_counts()).await?
    }
}

fn open_connection(path: &Path) -> Result<Connection, StoreError> {
    let conn = Connection::open(path).map_err(|source| StoreError::Open {
        path: path.to_path_buf(),
        source,
    })?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    let _mode: String = conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;
    Ok(conn)
}

fn init_schema(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS all_tests (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS passing_tests (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS snapshots (
            name TEXT PRIMARY KEY,
            replaced_at INTEGER NOT NULL
        );
        "#,
    )?;
    Ok(())
}

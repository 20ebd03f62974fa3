//! Local SQLite database layer.
//!
//! Uses rusqlite with WAL mode. Holds the two durable tables of the sync
//! core: `local_cache` (per-collection record store with tombstones) and
//! `outbox` (pending mutation intents). Provides schema migrations and a
//! shared `DbState` handed to the cache, outbox, and sync engine.

use rusqlite::Connection;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::{info, warn};

use crate::error::SyncError;

/// Shared state holding the database connection.
pub struct DbState {
    pub conn: Mutex<Connection>,
    pub db_path: PathBuf,
}

impl DbState {
    /// Acquire the connection lock, mapping poisoning to a storage error.
    pub fn lock(&self) -> Result<MutexGuard<'_, Connection>, SyncError> {
        self.conn
            .lock()
            .map_err(|_| SyncError::Storage("connection lock poisoned".into()))
    }
}

/// Current schema version. Bump when adding new migrations.
const CURRENT_SCHEMA_VERSION: i32 = 3;

/// Initialize the database at `{data_dir}/ledger.db`.
///
/// Creates the directory if needed, opens the connection, sets pragmas,
/// and runs any pending migrations. On corruption or open failure,
/// deletes the file and retries once.
pub fn init(data_dir: &Path) -> Result<DbState, SyncError> {
    fs::create_dir_all(data_dir)
        .map_err(|e| SyncError::Storage(format!("create data dir: {e}")))?;

    let db_path = data_dir.join("ledger.db");
    info!("Opening database at {}", db_path.display());

    let conn = match open_and_configure(&db_path) {
        Ok(c) => c,
        Err(first_err) => {
            warn!(
                "Database open failed ({}), deleting and retrying once",
                first_err
            );
            if db_path.exists() {
                let _ = fs::remove_file(&db_path);
                let _ = fs::remove_file(db_path.with_extension("db-wal"));
                let _ = fs::remove_file(db_path.with_extension("db-shm"));
            }
            open_and_configure(&db_path)
                .map_err(|e| SyncError::Storage(format!("open after retry: {e}")))?
        }
    };

    run_migrations(&conn)?;

    info!("Database initialized (schema v{CURRENT_SCHEMA_VERSION})");

    Ok(DbState {
        conn: Mutex::new(conn),
        db_path,
    })
}

/// Open the database file and apply pragmas.
fn open_and_configure(path: &Path) -> Result<Connection, SyncError> {
    let conn =
        Connection::open(path).map_err(|e| SyncError::Storage(format!("sqlite open: {e}")))?;

    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = NORMAL;",
    )
    .map_err(|e| SyncError::Storage(format!("pragma setup: {e}")))?;

    Ok(conn)
}

/// Run all pending migrations up to `CURRENT_SCHEMA_VERSION`.
fn run_migrations(conn: &Connection) -> Result<(), SyncError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT DEFAULT (datetime('now'))
        );",
    )
    .map_err(|e| SyncError::Storage(format!("create schema_version: {e}")))?;

    let current: i32 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    if current >= CURRENT_SCHEMA_VERSION {
        return Ok(());
    }

    info!("Migrating database from v{current} to v{CURRENT_SCHEMA_VERSION}");

    if current < 1 {
        migrate_v1(conn)?;
    }
    if current < 2 {
        migrate_v2(conn)?;
    }
    if current < 3 {
        migrate_v3(conn)?;
    }

    Ok(())
}

/// Migration v1: local cache and outbox tables.
fn migrate_v1(conn: &Connection) -> Result<(), SyncError> {
    conn.execute_batch(
        "
        -- local_cache: one row per (collection, record id); the whole
        -- record payload is replaced on every put so a reader never sees
        -- a partially-updated document.
        CREATE TABLE IF NOT EXISTS local_cache (
            collection TEXT NOT NULL,
            record_id TEXT NOT NULL,
            payload TEXT NOT NULL,
            deleted INTEGER NOT NULL DEFAULT 0,
            updated_at TEXT DEFAULT (datetime('now')),
            PRIMARY KEY (collection, record_id)
        );

        -- outbox: pending mutation intents. One entry per record id;
        -- a second local edit replaces the payload instead of appending.
        CREATE TABLE IF NOT EXISTS outbox (
            collection TEXT NOT NULL,
            record_id TEXT NOT NULL,
            action TEXT NOT NULL CHECK (action IN ('create', 'update')),
            payload TEXT NOT NULL,
            idempotency_key TEXT UNIQUE NOT NULL,
            seq INTEGER NOT NULL,
            enqueued_at TEXT NOT NULL,
            PRIMARY KEY (collection, record_id)
        );

        -- Monotonic sequence feeding outbox drain order.
        CREATE TABLE IF NOT EXISTS outbox_seq (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            next_seq INTEGER NOT NULL
        );
        INSERT OR IGNORE INTO outbox_seq (id, next_seq) VALUES (1, 1);

        INSERT INTO schema_version (version) VALUES (1);
        ",
    )
    .map_err(|e| SyncError::Storage(format!("migration v1: {e}")))?;
    Ok(())
}

/// Migration v2: read-path indexes.
fn migrate_v2(conn: &Connection) -> Result<(), SyncError> {
    conn.execute_batch(
        "
        CREATE INDEX IF NOT EXISTS idx_cache_live
            ON local_cache(collection, deleted);
        CREATE INDEX IF NOT EXISTS idx_outbox_seq
            ON outbox(collection, seq);

        INSERT INTO schema_version (version) VALUES (2);
        ",
    )
    .map_err(|e| SyncError::Storage(format!("migration v2: {e}")))?;
    Ok(())
}

/// Migration v3: outbox payload generation. Bumped every time a pending
/// entry's payload is replaced, so the drain can tell whether the entry
/// it just applied was edited while in flight.
fn migrate_v3(conn: &Connection) -> Result<(), SyncError> {
    conn.execute_batch(
        "
        ALTER TABLE outbox ADD COLUMN generation INTEGER NOT NULL DEFAULT 0;

        INSERT INTO schema_version (version) VALUES (3);
        ",
    )
    .map_err(|e| SyncError::Storage(format!("migration v3: {e}")))?;
    Ok(())
}

/// Test helper: run all migrations on an arbitrary connection.
pub fn run_migrations_for_test(conn: &Connection) {
    run_migrations(conn).expect("run_migrations should succeed in test");
}

/// Test helper: fully-migrated in-memory database.
pub fn open_in_memory_for_test() -> DbState {
    let conn = Connection::open_in_memory().expect("open in-memory db");
    conn.execute_batch(
        "PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = NORMAL;",
    )
    .expect("pragma setup");
    run_migrations_for_test(&conn);
    DbState {
        conn: Mutex::new(conn),
        db_path: PathBuf::from(":memory:"),
    }
}

// ===========================================================================
// Tests
// ===========================================================================

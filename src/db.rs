//! Local SQLite database layer for the courier agent.
//!
//! Uses rusqlite with WAL mode. Holds the durable action queue, the
//! read-through assignment cache, cash collection records and a small
//! category/key/value settings table.

use chrono::Utc;
use rusqlite::{params, Connection, ErrorCode};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::{error, info};

use crate::error::SyncError;

/// Shared database handle. Lock only around synchronous statements.
pub struct DbState {
    pub conn: Mutex<Connection>,
    pub db_path: PathBuf,
    /// Where an unreadable database was moved aside at startup, if it was.
    pub recovered_from: Option<PathBuf>,
}

impl DbState {
    /// Lock the connection. The guard must not be held across an `.await`.
    pub fn lock(&self) -> Result<MutexGuard<'_, Connection>, SyncError> {
        self.conn
            .lock()
            .map_err(|e| SyncError::Storage(format!("db lock poisoned: {e}")))
    }
}

/// Current schema version. Bump when adding new migrations.
const CURRENT_SCHEMA_VERSION: i32 = 3;

const DB_FILE_NAME: &str = "courier.db";

/// Initialize the database at `{data_dir}/courier.db`.
///
/// Creates the directory if needed, opens the connection, sets pragmas,
/// and runs any pending migrations. A file SQLite reports as corrupt or not
/// a database is renamed aside and replaced by a fresh one. Every other
/// failure is returned and the file is left untouched.
pub fn init(data_dir: &Path) -> Result<DbState, String> {
    fs::create_dir_all(data_dir).map_err(|e| format!("Failed to create data dir: {e}"))?;

    let db_path = data_dir.join(DB_FILE_NAME);
    info!("Opening database at {}", db_path.display());

    let (conn, recovered_from) = match open_and_configure(&db_path) {
        Ok(c) => (c, None),
        Err(e) if is_corruption(&e) => {
            let moved = quarantine(&db_path)?;
            let conn = open_and_configure(&db_path)
                .map_err(|e| format!("Database open failed after recovery: {e}"))?;
            (conn, Some(moved))
        }
        Err(e) => return Err(format!("sqlite open: {e}")),
    };
    run_migrations(&conn)?;

    info!("Database initialized (schema v{CURRENT_SCHEMA_VERSION})");

    Ok(DbState {
        conn: Mutex::new(conn),
        db_path,
        recovered_from,
    })
}

fn is_corruption(e: &rusqlite::Error) -> bool {
    matches!(
        e.sqlite_error_code(),
        Some(ErrorCode::DatabaseCorrupt | ErrorCode::NotADatabase)
    )
}

/// Move an unreadable database (and its WAL/SHM files) to
/// `courier.db.corrupt-<timestamp>` so nothing is deleted.
fn quarantine(db_path: &Path) -> Result<PathBuf, String> {
    let stamp = Utc::now().format("%Y%m%dT%H%M%SZ");
    let moved = db_path.with_extension(format!("db.corrupt-{stamp}"));
    fs::rename(db_path, &moved).map_err(|e| {
        format!(
            "Database at {} is unreadable and could not be moved aside: {e}",
            db_path.display()
        )
    })?;
    for suffix in ["wal", "shm"] {
        let side = db_path.with_extension(format!("db-{suffix}"));
        if side.exists() {
            let _ = fs::rename(&side, moved.with_extension(format!("corrupt-{stamp}-{suffix}")));
        }
    }
    error!(
        preserved_at = %moved.display(),
        "Database was unreadable; started a fresh one. Queued actions and unsynced \
         cash collections in the old file were not loaded"
    );
    Ok(moved)
}

/// Open the database file and apply pragmas.
fn open_and_configure(path: &Path) -> Result<Connection, rusqlite::Error> {
    let conn = Connection::open(path)?;
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = NORMAL;",
    )?;
    // The header is read lazily; touch the schema so a bad file fails here.
    conn.query_row("SELECT COUNT(*) FROM sqlite_master", [], |row| {
        row.get::<_, i64>(0)
    })?;
    Ok(conn)
}

/// Run all pending migrations up to `CURRENT_SCHEMA_VERSION`.
fn run_migrations(conn: &Connection) -> Result<(), String> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT DEFAULT (datetime('now'))
        );",
    )
    .map_err(|e| format!("create schema_version: {e}"))?;

    let current: i32 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    if current >= CURRENT_SCHEMA_VERSION {
        info!("Database schema up to date (v{current})");
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

/// Migration v1: queue, assignment cache, cash collections, settings.
fn migrate_v1(conn: &Connection) -> Result<(), String> {
    conn.execute_batch(
        "
        -- local_settings (category/key/value store)
        CREATE TABLE IF NOT EXISTS local_settings (
            setting_category TEXT NOT NULL,
            setting_key TEXT NOT NULL,
            setting_value TEXT NOT NULL,
            updated_at TEXT DEFAULT (datetime('now')),
            PRIMARY KEY (setting_category, setting_key)
        );

        -- action_queue (pending mutating actions, FIFO by created_at then id)
        CREATE TABLE IF NOT EXISTS action_queue (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            kind TEXT NOT NULL CHECK(kind IN ('location_update','order_status_update','payment_collection')),
            payload TEXT NOT NULL,
            idempotency_key TEXT UNIQUE NOT NULL,
            attempt_count INTEGER NOT NULL DEFAULT 0,
            last_error TEXT,
            created_at TEXT NOT NULL,
            last_attempt_at TEXT
        );

        -- order_assignments (read-through cache with two-phase status)
        CREATE TABLE IF NOT EXISTS order_assignments (
            order_id TEXT PRIMARY KEY,
            confirmed_status TEXT NOT NULL,
            optimistic_status TEXT,
            payment_method TEXT NOT NULL CHECK(payment_method IN ('prepaid','cash_on_delivery')),
            total_cents INTEGER NOT NULL,
            payment_collected INTEGER NOT NULL DEFAULT 0,
            updated_at TEXT NOT NULL
        );

        -- payment_collections (one terminal record per order)
        CREATE TABLE IF NOT EXISTS payment_collections (
            id TEXT PRIMARY KEY,
            order_id TEXT UNIQUE NOT NULL,
            order_total_cents INTEGER NOT NULL,
            collected_cents INTEGER NOT NULL,
            change_cents INTEGER NOT NULL CHECK(change_cents >= 0),
            notes TEXT,
            collected_at TEXT NOT NULL,
            sync_state TEXT NOT NULL DEFAULT 'pending' CHECK(sync_state IN ('pending','confirmed'))
        );

        CREATE INDEX IF NOT EXISTS idx_action_queue_created ON action_queue(created_at, id);

        INSERT INTO schema_version (version) VALUES (1);
        ",
    )
    .map_err(|e| {
        error!("Migration v1 failed: {e}");
        format!("migration v1: {e}")
    })?;

    info!("Applied migration v1 (core tables)");
    Ok(())
}

fn column_exists(conn: &Connection, table: &str, column: &str) -> Result<bool, String> {
    let mut stmt = conn
        .prepare(&format!("PRAGMA table_info({table})"))
        .map_err(|e| format!("table_info {table}: {e}"))?;
    let mut rows = stmt
        .query([])
        .map_err(|e| format!("table_info query: {e}"))?;
    while let Some(row) = rows.next().map_err(|e| format!("table_info next: {e}"))? {
        let name: String = row.get(1).map_err(|e| format!("table_info name: {e}"))?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Migration v2: per-order lookup on the action queue.
///
/// Adds `order_id` so the queue can answer "is anything still pending for
/// this order" without decoding payloads.
fn migrate_v2(conn: &Connection) -> Result<(), String> {
    if !column_exists(conn, "action_queue", "order_id")? {
        conn.execute_batch("ALTER TABLE action_queue ADD COLUMN order_id TEXT;")
            .map_err(|e| format!("migration v2 add order_id: {e}"))?;
    }

    conn.execute_batch(
        "
        CREATE INDEX IF NOT EXISTS idx_action_queue_order ON action_queue(order_id);

        INSERT INTO schema_version (version) VALUES (2);
        ",
    )
    .map_err(|e| {
        error!("Migration v2 failed: {e}");
        format!("migration v2: {e}")
    })?;

    info!("Applied migration v2 (action_queue order_id)");
    Ok(())
}

/// Migration v3: cash collections that ran out of retries are kept and
/// flagged for manual reconciliation instead of being resent.
fn migrate_v3(conn: &Connection) -> Result<(), String> {
    if !column_exists(conn, "payment_collections", "needs_review")? {
        conn.execute_batch(
            "ALTER TABLE payment_collections ADD COLUMN needs_review INTEGER NOT NULL DEFAULT 0;",
        )
        .map_err(|e| format!("migration v3 add needs_review: {e}"))?;
    }

    conn.execute_batch("INSERT INTO schema_version (version) VALUES (3);")
        .map_err(|e| {
            error!("Migration v3 failed: {e}");
            format!("migration v3: {e}")
        })?;

    info!("Applied migration v3 (payment_collections needs_review)");
    Ok(())
}

// ---------------------------------------------------------------------------
// Settings helpers
// ---------------------------------------------------------------------------

/// Get a single setting value.
pub fn get_setting(conn: &Connection, category: &str, key: &str) -> Option<String> {
    conn.query_row(
        "SELECT setting_value FROM local_settings WHERE setting_category = ?1 AND setting_key = ?2",
        params![category, key],
        |row| row.get(0),
    )
    .ok()
}

/// Insert or update a setting.
pub fn set_setting(conn: &Connection, category: &str, key: &str, value: &str) -> Result<(), String> {
    conn.execute(
        "INSERT INTO local_settings (setting_category, setting_key, setting_value, updated_at)
         VALUES (?1, ?2, ?3, datetime('now'))
         ON CONFLICT(setting_category, setting_key) DO UPDATE SET
            setting_value = excluded.setting_value,
            updated_at = excluded.updated_at",
        params![category, key, value],
    )
    .map_err(|e| format!("set_setting: {e}"))?;
    Ok(())
}

/// Delete a single setting. Succeeds if it does not exist.
pub fn delete_setting(conn: &Connection, category: &str, key: &str) -> Result<(), String> {
    conn.execute(
        "DELETE FROM local_settings WHERE setting_category = ?1 AND setting_key = ?2",
        params![category, key],
    )
    .map_err(|e| format!("delete_setting: {e}"))?;
    Ok(())
}

/// In-memory database with the full schema (test helper, not public API).
#[cfg(test)]
pub fn test_db() -> std::sync::Arc<DbState> {
    let conn = Connection::open_in_memory().expect("open in-memory db");
    conn.execute_batch(
        "PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = NORMAL;",
    )
    .expect("pragma setup");
    run_migrations(&conn).expect("run_migrations should succeed in test");
    std::sync::Arc::new(DbState {
        conn: Mutex::new(conn),
        db_path: PathBuf::from(":memory:"),
        recovered_from: None,
    })
}

// ===========================================================================
// Tests
// ===========================================================================

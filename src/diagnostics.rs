//! Diagnostics for the courier agent.
//!
//! Provides:
//! - **About info**: version, platform
//! - **Sync health**: queue backlog by kind, cached orders, unconfirmed
//!   collections, schema version
//! - **Diagnostics export**: the above plus recent queue errors as a single
//!   JSON file, optionally redacted
//! - **Log rotation helpers**: used by `lib.rs` to place and prune log files.

use crate::db::DbState;
use rusqlite::{params, Connection};
use serde_json::{json, Value};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Maximum number of log files to retain.
pub const MAX_LOG_FILES: usize = 10;

/// File name prefix of the daily rolling log (`courier-agent.YYYY-MM-DD`).
pub const LOG_FILE_PREFIX: &str = "courier-agent";

const RECENT_ERROR_LIMIT: i64 = 20;

// ---------------------------------------------------------------------------
// About info
// ---------------------------------------------------------------------------

pub fn get_about_info() -> Value {
    json!({
        "name": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
        "platform": std::env::consts::OS,
        "arch": std::env::consts::ARCH,
        "rustVersion": env!("CARGO_PKG_RUST_VERSION"),
    })
}

// ---------------------------------------------------------------------------
// Sync health
// ---------------------------------------------------------------------------

/// Snapshot of the local sync state for support screens and the headless
/// status log.
pub fn get_sync_health(db: &DbState) -> Result<Value, String> {
    let conn = db.lock().map_err(|e| e.to_string())?;

    let schema_version: i32 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    let active_orders = count(&conn, "SELECT COUNT(*) FROM order_assignments");
    let awaiting_confirmation = count(
        &conn,
        "SELECT COUNT(*) FROM order_assignments WHERE optimistic_status IS NOT NULL",
    );
    let unconfirmed_payments = count(
        &conn,
        "SELECT COUNT(*) FROM payment_collections WHERE sync_state = 'pending'",
    );
    let payments_needing_review = count(
        &conn,
        "SELECT COUNT(*) FROM payment_collections WHERE needs_review = 1",
    );
    let db_size = fs::metadata(&db.db_path).map(|m| m.len()).unwrap_or(0);

    Ok(json!({
        "schemaVersion": schema_version,
        "queueBacklog": get_queue_backlog(&conn),
        "activeOrders": active_orders,
        "awaitingConfirmation": awaiting_confirmation,
        "unconfirmedPayments": unconfirmed_payments,
        "paymentsNeedingReview": payments_needing_review,
        "recoveredFrom": db.recovered_from.as_ref().map(|p| p.display().to_string()),
        "dbSizeBytes": db_size,
    }))
}

fn count(conn: &Connection, sql: &str) -> i64 {
    conn.query_row(sql, [], |row| row.get(0)).unwrap_or(0)
}

fn get_queue_backlog(conn: &Connection) -> Value {
    let mut result = json!({});
    if let Ok(mut stmt) = conn.prepare("SELECT kind, COUNT(*) FROM action_queue GROUP BY kind") {
        if let Ok(rows) = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        }) {
            for (kind, n) in rows.flatten() {
                result[kind] = json!(n);
            }
        }
    }
    result
}

fn get_recent_queue_errors(conn: &Connection, limit: i64) -> Vec<Value> {
    let mut errors = Vec::new();
    if let Ok(mut stmt) = conn.prepare(
        "SELECT id, kind, order_id, idempotency_key, attempt_count, last_error,
                created_at, last_attempt_at
         FROM action_queue
         WHERE last_error IS NOT NULL AND last_error != ''
         ORDER BY last_attempt_at DESC LIMIT ?1",
    ) {
        if let Ok(rows) = stmt.query_map(params![limit], |row| {
            Ok(json!({
                "id": row.get::<_, i64>(0)?,
                "kind": row.get::<_, String>(1)?,
                "orderId": row.get::<_, Option<String>>(2)?,
                "idempotencyKey": row.get::<_, String>(3)?,
                "attemptCount": row.get::<_, i64>(4)?,
                "lastError": row.get::<_, String>(5)?,
                "createdAt": row.get::<_, String>(6)?,
                "lastAttemptAt": row.get::<_, Option<String>>(7)?,
            }))
        }) {
            for row in rows.flatten() {
                errors.push(row);
            }
        }
    }
    errors
}

// ---------------------------------------------------------------------------
// Diagnostics export
// ---------------------------------------------------------------------------

/// Write a diagnostics bundle (`courier-diagnostics-<timestamp>.json`) to
/// `output_dir` and return its path.
pub fn export_diagnostics(db: &DbState, output_dir: &Path, redact: bool) -> Result<PathBuf, String> {
    let health = get_sync_health(db)?;
    let recent_errors = {
        let conn = db.lock().map_err(|e| e.to_string())?;
        get_recent_queue_errors(&conn, RECENT_ERROR_LIMIT)
    };

    let mut bundle = json!({
        "about": get_about_info(),
        "syncHealth": health,
        "recentQueueErrors": recent_errors,
        "generatedAt": chrono::Utc::now().to_rfc3339(),
    });
    if redact {
        bundle = redact_sensitive_fields(bundle);
    }

    fs::create_dir_all(output_dir).map_err(|e| format!("Failed to create output dir: {e}"))?;
    let timestamp = chrono::Utc::now().format("%Y%m%d_%H%M%S").to_string();
    let path = output_dir.join(format!("courier-diagnostics-{timestamp}.json"));
    let body = serde_json::to_string_pretty(&bundle).map_err(|e| e.to_string())?;
    fs::write(&path, body).map_err(|e| format!("Failed to write diagnostics: {e}"))?;

    info!("Diagnostics written to {}", path.display());
    Ok(path)
}

fn redact_sensitive_fields(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut redacted = serde_json::Map::new();
            for (key, value) in map {
                if should_redact_key(&key) {
                    redacted.insert(key, Value::String("[REDACTED]".to_string()));
                } else {
                    redacted.insert(key, redact_sensitive_fields(value));
                }
            }
            Value::Object(redacted)
        }
        Value::Array(items) => {
            Value::Array(items.into_iter().map(redact_sensitive_fields).collect())
        }
        other => other,
    }
}

fn should_redact_key(key: &str) -> bool {
    let normalized = key.to_ascii_lowercase();
    let sensitive_markers = [
        "api_key",
        "apikey",
        "secret",
        "password",
        "token",
        "authorization",
        "idempotency",
        "orderid",
    ];
    sensitive_markers
        .iter()
        .any(|marker| normalized.contains(marker))
}

// ---------------------------------------------------------------------------
// Log rotation
// ---------------------------------------------------------------------------

/// Log directory under the agent's data directory.
pub fn get_log_dir(data_dir: &Path) -> PathBuf {
    data_dir.join("logs")
}

/// Prune old log files, keeping only the most recent `MAX_LOG_FILES`.
pub fn prune_old_logs(log_dir: &Path) {
    if !log_dir.exists() {
        return;
    }

    let mut log_files: Vec<(PathBuf, std::time::SystemTime)> = Vec::new();
    if let Ok(entries) = fs::read_dir(log_dir) {
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if name.starts_with(LOG_FILE_PREFIX) {
                let modified = entry
                    .metadata()
                    .ok()
                    .and_then(|m| m.modified().ok())
                    .unwrap_or(std::time::UNIX_EPOCH);
                log_files.push((path, modified));
            }
        }
    }

    // Newest first
    log_files.sort_by(|a, b| b.1.cmp(&a.1));

    for (path, _) in log_files.iter().skip(MAX_LOG_FILES) {
        if let Err(e) = fs::remove_file(path) {
            warn!("Failed to prune log file {}: {e}", path.display());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_db;
    use std::time::{Duration, SystemTime};

    #[test]
    fn test_about_info_has_required_fields() {
        let info = get_about_info();
        assert_eq!(info["name"], json!("courier-sync"));
        assert!(info.get("version").is_some());
        assert!(info.get("platform").is_some());
        assert!(info.get("arch").is_some());
    }

    #[test]
    fn test_sync_health_counts_backlog_by_kind() {
        let db = test_db();
        {
            let conn = db.lock().unwrap();
            conn.execute_batch(
                "INSERT INTO action_queue (kind, payload, idempotency_key, created_at, order_id)
                 VALUES ('order_status_update', '{}', 'order:o1:status:picked_up', '2026-01-01T00:00:00Z', 'o1'),
                        ('order_status_update', '{}', 'order:o2:status:picked_up', '2026-01-01T00:00:01Z', 'o2'),
                        ('location_update', '{}', 'location:1', '2026-01-01T00:00:02Z', NULL);
                 INSERT INTO order_assignments (order_id, confirmed_status, optimistic_status,
                        payment_method, total_cents, updated_at)
                 VALUES ('o1', 'accepted', 'picked_up', 'prepaid', 1000, '2026-01-01T00:00:00Z');",
            )
            .unwrap();
        }

        let health = get_sync_health(&db).unwrap();
        assert_eq!(health["schemaVersion"], json!(3));
        assert_eq!(health["queueBacklog"]["order_status_update"], json!(2));
        assert_eq!(health["queueBacklog"]["location_update"], json!(1));
        assert_eq!(health["activeOrders"], json!(1));
        assert_eq!(health["awaitingConfirmation"], json!(1));
        assert_eq!(health["unconfirmedPayments"], json!(0));
        assert_eq!(health["paymentsNeedingReview"], json!(0));
        assert_eq!(health["recoveredFrom"], Value::Null);
    }

    #[test]
    fn test_export_diagnostics_writes_redacted_bundle() {
        let db = test_db();
        {
            let conn = db.lock().unwrap();
            conn.execute(
                "INSERT INTO action_queue (kind, payload, idempotency_key, attempt_count,
                        last_error, created_at, last_attempt_at, order_id)
                 VALUES ('payment_collection', '{}', 'payment:o9', 2, 'HTTP 503',
                        '2026-01-01T00:00:00Z', '2026-01-01T00:01:00Z', 'o9')",
                [],
            )
            .unwrap();
        }
        let dir = tempfile::tempdir().unwrap();

        let path = export_diagnostics(&db, dir.path(), true).unwrap();
        let bundle: Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();

        let error = &bundle["recentQueueErrors"][0];
        assert_eq!(error["lastError"], json!("HTTP 503"));
        assert_eq!(error["attemptCount"], json!(2));
        assert_eq!(error["orderId"], json!("[REDACTED]"));
        assert_eq!(error["idempotencyKey"], json!("[REDACTED]"));
        assert!(bundle["about"].get("version").is_some());
    }

    #[test]
    fn test_should_redact_key_matches_sensitive_markers() {
        assert!(should_redact_key("api_key"));
        assert!(should_redact_key("Authorization"));
        assert!(should_redact_key("X-Agent-Api-Key"));
        assert!(!should_redact_key("status"));
        assert!(!should_redact_key("lastError"));
    }

    #[test]
    fn test_prune_old_logs_keeps_newest() {
        let dir = tempfile::tempdir().unwrap();
        let base = SystemTime::now() - Duration::from_secs(86_400 * 30);
        for day in 0..(MAX_LOG_FILES + 3) {
            let path = dir.path().join(format!("{LOG_FILE_PREFIX}.2026-01-{:02}", day + 1));
            let file = fs::File::create(&path).unwrap();
            file.set_modified(base + Duration::from_secs(86_400 * day as u64))
                .unwrap();
        }
        fs::write(dir.path().join("unrelated.txt"), "keep").unwrap();

        prune_old_logs(dir.path());

        let mut remaining: Vec<String> = fs::read_dir(dir.path())
            .unwrap()
            .flatten()
            .map(|e| e.file_name().to_string_lossy().to_string())
            .collect();
        remaining.sort();
        assert_eq!(remaining.len(), MAX_LOG_FILES + 1);
        assert!(remaining.contains(&"unrelated.txt".to_string()));
        assert!(!remaining.contains(&format!("{LOG_FILE_PREFIX}.2026-01-01")));
        assert!(remaining.contains(&format!("{LOG_FILE_PREFIX}.2026-01-13")));
    }

    #[test]
    fn test_log_dir_is_under_data_dir() {
        let dir = get_log_dir(Path::new("/var/lib/courier"));
        assert_eq!(dir, PathBuf::from("/var/lib/courier/logs"));
    }
}

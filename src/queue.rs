//! Durable offline action queue.
//!
//! Mutating actions that cannot reach the backend are persisted to the
//! `action_queue` table and drained in FIFO order (created_at, then id) when
//! connectivity returns or the safety timer fires. Delivery is at-least-once;
//! the backend deduplicates on the idempotency key.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::db::DbState;
use crate::error::SyncError;
use crate::model::{LocationSample, OrderStatus, PaymentCollection};
use crate::notices::{Notice, NoticeBus};

// ---------------------------------------------------------------------------
// Action types
// ---------------------------------------------------------------------------

/// A mutating action awaiting delivery. Stored as the JSON payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ActionKind {
    LocationUpdate {
        sample: LocationSample,
    },
    OrderStatusUpdate {
        order_id: String,
        target_status: OrderStatus,
    },
    PaymentCollection {
        collection: PaymentCollection,
    },
}

impl ActionKind {
    pub fn tag(&self) -> ActionKindTag {
        match self {
            ActionKind::LocationUpdate { .. } => ActionKindTag::LocationUpdate,
            ActionKind::OrderStatusUpdate { .. } => ActionKindTag::OrderStatusUpdate,
            ActionKind::PaymentCollection { .. } => ActionKindTag::PaymentCollection,
        }
    }

    pub fn order_id(&self) -> Option<&str> {
        match self {
            ActionKind::LocationUpdate { .. } => None,
            ActionKind::OrderStatusUpdate { order_id, .. } => Some(order_id),
            ActionKind::PaymentCollection { collection } => Some(&collection.order_id),
        }
    }

    /// Stable identity the backend deduplicates on.
    pub fn idempotency_key(&self) -> String {
        match self {
            ActionKind::LocationUpdate { sample } => {
                format!("location:{}", sample.captured_at.timestamp_millis())
            }
            ActionKind::OrderStatusUpdate {
                order_id,
                target_status,
            } => status_idempotency_key(order_id, *target_status),
            ActionKind::PaymentCollection { collection } => {
                format!("payment:{}", collection.order_id)
            }
        }
    }
}

pub fn status_idempotency_key(order_id: &str, target: OrderStatus) -> String {
    format!("order:{order_id}:status:{}", target.as_str())
}

/// Payload-free discriminant, used in notices and statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKindTag {
    LocationUpdate,
    OrderStatusUpdate,
    PaymentCollection,
}

impl ActionKindTag {
    pub fn as_str(self) -> &'static str {
        match self {
            ActionKindTag::LocationUpdate => "location_update",
            ActionKindTag::OrderStatusUpdate => "order_status_update",
            ActionKindTag::PaymentCollection => "payment_collection",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueuedAction {
    pub id: i64,
    pub kind: ActionKind,
    pub idempotency_key: String,
    pub attempt_count: u32,
    pub created_at: DateTime<Utc>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// Whether a submission reached the backend or was parked in the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SubmissionState {
    Confirmed,
    Queued { action_id: i64 },
}

/// Result of one delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered,
    /// Transient failure; counts toward the retry cap.
    Failed(String),
    /// Terminal; removed without further attempts.
    Rejected(String),
}

/// Delivers queued actions to the backend and applies their side effects.
#[async_trait]
pub trait ActionSink: Send + Sync {
    async fn deliver(&self, action: &QueuedAction) -> DeliveryOutcome;

    /// Called once the action is removed after its final failed attempt.
    async fn exhausted(&self, _action: &QueuedAction, _last_error: &str) {}
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DrainReport {
    pub delivered: usize,
    pub retained: usize,
    pub dropped: usize,
    pub rejected: usize,
    /// Skipped this pass behind an undelivered action for the same order.
    pub held: usize,
    /// Another drain was already running; this call did nothing.
    pub coalesced: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    pub total: usize,
    pub location_updates: usize,
    pub status_updates: usize,
    pub payments: usize,
    pub oldest_created_at: Option<String>,
    pub max_attempt_count: u32,
}

// ---------------------------------------------------------------------------
// In-flight guard
// ---------------------------------------------------------------------------

/// Holds an `AtomicBool` flag for its lifetime.
pub(crate) struct InFlightGuard<'a>(&'a AtomicBool);

impl<'a> InFlightGuard<'a> {
    pub(crate) fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::Relaxed)
            .ok()
            .map(|_| InFlightGuard(flag))
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

// ---------------------------------------------------------------------------
// Queue
// ---------------------------------------------------------------------------

/// Row as read from the table; the payload may fail to decode.
struct RawRow {
    id: i64,
    kind: String,
    payload: String,
    idempotency_key: String,
    attempt_count: u32,
    last_error: Option<String>,
    created_at: String,
    last_attempt_at: Option<String>,
    order_id: Option<String>,
}

impl RawRow {
    fn decode(&self) -> Result<QueuedAction, String> {
        let kind: ActionKind = serde_json::from_str(&self.payload)
            .map_err(|e| format!("undecodable {} payload: {e}", self.kind))?;
        Ok(QueuedAction {
            id: self.id,
            kind,
            idempotency_key: self.idempotency_key.clone(),
            attempt_count: self.attempt_count,
            created_at: parse_timestamp(&self.created_at).unwrap_or_else(Utc::now),
            last_attempt_at: self.last_attempt_at.as_deref().and_then(parse_timestamp),
            last_error: self.last_error.clone(),
        })
    }
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

fn now_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub struct OfflineActionQueue {
    db: Arc<DbState>,
    max_attempts: u32,
    draining: AtomicBool,
    notices: NoticeBus,
}

impl OfflineActionQueue {
    pub fn new(db: Arc<DbState>, max_attempts: u32, notices: NoticeBus) -> Self {
        Self {
            db,
            max_attempts: max_attempts.max(1),
            draining: AtomicBool::new(false),
            notices,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Persist an action. Durable before returning.
    ///
    /// An action whose idempotency key is already queued is not inserted
    /// twice; the existing entry is returned instead.
    pub fn enqueue(&self, kind: ActionKind) -> Result<QueuedAction, SyncError> {
        let key = kind.idempotency_key();
        let tag = kind.tag();
        let order_id = kind.order_id().map(str::to_string);
        let payload = serde_json::to_string(&kind)?;

        let (inserted, row) = {
            let conn = self.db.lock()?;
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO action_queue
                    (kind, payload, idempotency_key, attempt_count, created_at, order_id)
                 VALUES (?1, ?2, ?3, 0, ?4, ?5)",
                params![tag.as_str(), payload, key, now_timestamp(), order_id],
            )? > 0;
            let row = load_row_by_key(&conn, &key)?;
            (inserted, row)
        };

        let row = row.ok_or_else(|| SyncError::Storage(format!("queued action {key} vanished")))?;
        let action = row.decode().map_err(SyncError::Storage)?;

        if inserted {
            info!(
                action_id = action.id,
                kind = tag.as_str(),
                order_id = order_id.as_deref().unwrap_or(""),
                "Action queued for sync"
            );
            self.notices.publish(Notice::QueuedForSync {
                action_id: action.id,
                kind: tag,
                order_id,
            });
        } else {
            debug!(idempotency_key = %key, "Action already queued");
        }
        Ok(action)
    }

    /// All decodable entries in drain order.
    pub fn pending(&self) -> Result<Vec<QueuedAction>, SyncError> {
        let rows = {
            let conn = self.db.lock()?;
            load_rows(&conn)?
        };
        Ok(rows
            .iter()
            .filter_map(|row| match row.decode() {
                Ok(action) => Some(action),
                Err(e) => {
                    warn!(action_id = row.id, error = %e, "Skipping unreadable queue entry");
                    None
                }
            })
            .collect())
    }

    pub fn len(&self) -> Result<usize, SyncError> {
        let conn = self.db.lock()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM action_queue", [], |row| {
            row.get(0)
        })?;
        Ok(count as usize)
    }

    pub fn is_empty(&self) -> Result<bool, SyncError> {
        Ok(self.len()? == 0)
    }

    /// Whether any undelivered action references the order.
    pub fn has_pending_for(&self, order_id: &str) -> Result<bool, SyncError> {
        let conn = self.db.lock()?;
        let exists: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM action_queue WHERE order_id = ?1)",
            params![order_id],
            |row| row.get(0),
        )?;
        Ok(exists)
    }

    pub fn stats(&self) -> Result<QueueStats, SyncError> {
        let conn = self.db.lock()?;
        let mut stats = QueueStats::default();
        let mut stmt = conn.prepare("SELECT kind, COUNT(*) FROM action_queue GROUP BY kind")?;
        let counts = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        for entry in counts {
            let (kind, count) = entry?;
            let count = count as usize;
            stats.total += count;
            match kind.as_str() {
                "location_update" => stats.location_updates = count,
                "order_status_update" => stats.status_updates = count,
                "payment_collection" => stats.payments = count,
                _ => {}
            }
        }
        let (oldest, max_attempts): (Option<String>, Option<i64>) = conn.query_row(
            "SELECT MIN(created_at), MAX(attempt_count) FROM action_queue",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        stats.oldest_created_at = oldest;
        stats.max_attempt_count = max_attempts.unwrap_or(0) as u32;
        Ok(stats)
    }

    /// Remove every queued action for an order. Returns the number removed.
    pub fn discard_for_order(&self, order_id: &str) -> Result<usize, SyncError> {
        let conn = self.db.lock()?;
        let removed = conn.execute(
            "DELETE FROM action_queue WHERE order_id = ?1",
            params![order_id],
        )?;
        if removed > 0 {
            info!(order_id = %order_id, removed, "Discarded queued actions for order");
        }
        Ok(removed)
    }

    /// Remove queued status updates for an order, leaving its payment.
    pub fn discard_status_updates_for(&self, order_id: &str) -> Result<usize, SyncError> {
        let conn = self.db.lock()?;
        let removed = conn.execute(
            "DELETE FROM action_queue WHERE order_id = ?1 AND kind = ?2",
            params![order_id, ActionKindTag::OrderStatusUpdate.as_str()],
        )?;
        if removed > 0 {
            info!(order_id = %order_id, removed, "Discarded queued status updates for order");
        }
        Ok(removed)
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }

    /// Attempt every queued action once, in FIFO order.
    ///
    /// Only one pass runs at a time; a call made while another pass is in
    /// progress returns immediately with `coalesced` set. Within a pass, once
    /// an action for an order is not delivered, later actions for the same
    /// order wait for the next pass.
    pub async fn drain(&self, sink: &dyn ActionSink) -> Result<DrainReport, SyncError> {
        let Some(_guard) = InFlightGuard::acquire(&self.draining) else {
            debug!("Drain already in progress; coalescing");
            return Ok(DrainReport {
                coalesced: true,
                ..DrainReport::default()
            });
        };

        let snapshot = {
            let conn = self.db.lock()?;
            load_rows(&conn)?
        };
        if snapshot.is_empty() {
            return Ok(DrainReport::default());
        }
        debug!(pending = snapshot.len(), "Draining action queue");

        let mut report = DrainReport::default();
        let mut held_orders: HashSet<String> = HashSet::new();

        for row in snapshot {
            if let Some(order_id) = row.order_id.as_deref() {
                if held_orders.contains(order_id) {
                    report.held += 1;
                    continue;
                }
            }

            let action = match row.decode() {
                Ok(action) => action,
                Err(e) => {
                    warn!(action_id = row.id, error = %e, "Removing unreadable queue entry");
                    if let Some(order_id) = row.order_id.clone() {
                        held_orders.insert(order_id);
                    }
                    self.remove(row.id)?;
                    self.notices.publish(Notice::ActionRejected {
                        action_id: row.id,
                        kind: tag_from_str(&row.kind),
                        order_id: row.order_id,
                        reason: e,
                    });
                    report.rejected += 1;
                    continue;
                }
            };

            // Discarded mid-pass (e.g. a conflict purged the order).
            if !self.exists(action.id)? {
                continue;
            }

            let tag = action.kind.tag();
            let order_id = action.kind.order_id().map(str::to_string);

            match sink.deliver(&action).await {
                DeliveryOutcome::Delivered => {
                    self.remove(action.id)?;
                    debug!(action_id = action.id, kind = tag.as_str(), "Queued action delivered");
                    report.delivered += 1;
                }
                DeliveryOutcome::Failed(error) => {
                    if let Some(order_id) = order_id.clone() {
                        held_orders.insert(order_id);
                    }
                    let attempts = self.record_failure(action.id, &error)?;
                    if attempts >= self.max_attempts {
                        self.remove(action.id)?;
                        warn!(
                            action_id = action.id,
                            kind = tag.as_str(),
                            attempts,
                            error = %error,
                            "Queued action dropped after max retries"
                        );
                        sink.exhausted(&action, &error).await;
                        self.notices.publish(Notice::ActionDropped {
                            action_id: action.id,
                            kind: tag,
                            order_id,
                            attempts,
                            last_error: error,
                        });
                        report.dropped += 1;
                    } else {
                        debug!(
                            action_id = action.id,
                            attempts,
                            max = self.max_attempts,
                            error = %error,
                            "Queued action failed; will retry"
                        );
                        report.retained += 1;
                    }
                }
                DeliveryOutcome::Rejected(reason) => {
                    if let Some(order_id) = order_id.clone() {
                        held_orders.insert(order_id);
                    }
                    self.remove(action.id)?;
                    warn!(
                        action_id = action.id,
                        kind = tag.as_str(),
                        reason = %reason,
                        "Queued action rejected by server"
                    );
                    self.notices.publish(Notice::ActionRejected {
                        action_id: action.id,
                        kind: tag,
                        order_id,
                        reason,
                    });
                    report.rejected += 1;
                }
            }
        }

        if report.delivered > 0 || report.dropped > 0 || report.rejected > 0 {
            info!(
                delivered = report.delivered,
                retained = report.retained,
                dropped = report.dropped,
                rejected = report.rejected,
                held = report.held,
                "Drain pass complete"
            );
        }
        Ok(report)
    }

    fn exists(&self, id: i64) -> Result<bool, SyncError> {
        let conn = self.db.lock()?;
        let exists: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM action_queue WHERE id = ?1)",
            params![id],
            |row| row.get(0),
        )?;
        Ok(exists)
    }

    fn remove(&self, id: i64) -> Result<(), SyncError> {
        let conn = self.db.lock()?;
        conn.execute("DELETE FROM action_queue WHERE id = ?1", params![id])?;
        Ok(())
    }

    /// Bump the attempt counter; returns the new count.
    fn record_failure(&self, id: i64, error: &str) -> Result<u32, SyncError> {
        let conn = self.db.lock()?;
        conn.execute(
            "UPDATE action_queue
             SET attempt_count = attempt_count + 1, last_error = ?2, last_attempt_at = ?3
             WHERE id = ?1",
            params![id, error, now_timestamp()],
        )?;
        let attempts: Option<i64> = conn
            .query_row(
                "SELECT attempt_count FROM action_queue WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(attempts.unwrap_or(i64::from(self.max_attempts)) as u32)
    }
}

fn tag_from_str(kind: &str) -> ActionKindTag {
    match kind {
        "location_update" => ActionKindTag::LocationUpdate,
        "payment_collection" => ActionKindTag::PaymentCollection,
        _ => ActionKindTag::OrderStatusUpdate,
    }
}

const ROW_COLUMNS: &str = "id, kind, payload, idempotency_key, attempt_count, last_error,
                           created_at, last_attempt_at, order_id";

fn map_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRow> {
    Ok(RawRow {
        id: row.get(0)?,
        kind: row.get(1)?,
        payload: row.get(2)?,
        idempotency_key: row.get(3)?,
        attempt_count: row.get::<_, i64>(4)?.max(0) as u32,
        last_error: row.get(5)?,
        created_at: row.get(6)?,
        last_attempt_at: row.get(7)?,
        order_id: row.get(8)?,
    })
}

fn load_rows(conn: &Connection) -> Result<Vec<RawRow>, SyncError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {ROW_COLUMNS} FROM action_queue ORDER BY created_at ASC, id ASC"
    ))?;
    let rows = stmt
        .query_map([], map_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn load_row_by_key(conn: &Connection, key: &str) -> Result<Option<RawRow>, SyncError> {
    let row = conn
        .query_row(
            &format!("SELECT {ROW_COLUMNS} FROM action_queue WHERE idempotency_key = ?1"),
            params![key],
            map_row,
        )
        .optional()?;
    Ok(row)
}

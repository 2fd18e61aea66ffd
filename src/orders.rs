//! Order lifecycle controller and the local assignment cache.
//!
//! Status changes are two-phase: the requested status is written as the
//! optimistic value before anything goes over the network, and becomes the
//! confirmed value only when the server acknowledges it. Conflicts roll the
//! order back to what the server reports.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

use crate::backend::{with_timeout, AssignmentSnapshot, OrderBackend};
use crate::connectivity::ConnectivityMonitor;
use crate::db::DbState;
use crate::error::{BackendError, SyncError, ValidationError};
use crate::model::{Money, OrderAssignment, OrderStatus, PaymentMethod, RemoteAssignment};
use crate::notices::{Notice, NoticeBus, RemovalReason};
use crate::queue::{status_idempotency_key, ActionKind, OfflineActionQueue};

// ---------------------------------------------------------------------------
// Assignment cache
// ---------------------------------------------------------------------------

/// Read-through cache of the orders assigned to this agent, backed by the
/// `order_assignments` table.
pub struct OrderCache {
    db: Arc<DbState>,
}

type AssignmentRow = (String, String, Option<String>, String, i64, bool, String);

const ASSIGNMENT_COLUMNS: &str = "order_id, confirmed_status, optimistic_status, payment_method,
                                  total_cents, payment_collected, updated_at";

fn read_assignment_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<AssignmentRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get::<_, i64>(5)? != 0,
        row.get(6)?,
    ))
}

fn assignment_from_row(row: AssignmentRow) -> Option<OrderAssignment> {
    let (order_id, confirmed, optimistic, method, total_cents, collected, updated_at) = row;
    let Some(confirmed_status) = OrderStatus::parse(&confirmed) else {
        warn!(order_id = %order_id, status = %confirmed, "Ignoring cached order with unknown status");
        return None;
    };
    let payment_method = PaymentMethod::parse(&method)?;
    Some(OrderAssignment {
        order_id,
        confirmed_status,
        optimistic_status: optimistic.as_deref().and_then(OrderStatus::parse),
        payment_method,
        total_amount: Money::from_cents(total_cents),
        payment_collected: collected,
        updated_at: DateTime::parse_from_rfc3339(&updated_at)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
    })
}

pub(crate) fn load_assignment(
    conn: &Connection,
    order_id: &str,
) -> Result<Option<OrderAssignment>, SyncError> {
    let row = conn
        .query_row(
            &format!("SELECT {ASSIGNMENT_COLUMNS} FROM order_assignments WHERE order_id = ?1"),
            params![order_id],
            read_assignment_row,
        )
        .optional()?;
    Ok(row.and_then(assignment_from_row))
}

fn write_optimistic(
    conn: &Connection,
    order_id: &str,
    status: Option<OrderStatus>,
) -> Result<(), SyncError> {
    conn.execute(
        "UPDATE order_assignments SET optimistic_status = ?2, updated_at = ?3 WHERE order_id = ?1",
        params![order_id, status.map(OrderStatus::as_str), Utc::now().to_rfc3339()],
    )?;
    Ok(())
}

/// Set the collected flag inside a caller-managed transaction.
pub(crate) fn write_payment_collected(
    conn: &Connection,
    order_id: &str,
    collected: bool,
) -> Result<usize, SyncError> {
    let updated = conn.execute(
        "UPDATE order_assignments SET payment_collected = ?2, updated_at = ?3 WHERE order_id = ?1",
        params![order_id, collected as i64, Utc::now().to_rfc3339()],
    )?;
    Ok(updated)
}

impl OrderCache {
    pub fn new(db: Arc<DbState>) -> Self {
        Self { db }
    }

    pub fn get(&self, order_id: &str) -> Result<Option<OrderAssignment>, SyncError> {
        let conn = self.db.lock()?;
        load_assignment(&conn, order_id)
    }

    /// Orders still on the agent's list, oldest first.
    pub fn active(&self) -> Result<Vec<OrderAssignment>, SyncError> {
        let conn = self.db.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {ASSIGNMENT_COLUMNS} FROM order_assignments ORDER BY updated_at ASC, order_id ASC"
        ))?;
        let rows = stmt
            .query_map([], read_assignment_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows.into_iter().filter_map(assignment_from_row).collect())
    }

    pub fn upsert(&self, order: &OrderAssignment) -> Result<(), SyncError> {
        let conn = self.db.lock()?;
        conn.execute(
            "INSERT INTO order_assignments
                (order_id, confirmed_status, optimistic_status, payment_method,
                 total_cents, payment_collected, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(order_id) DO UPDATE SET
                confirmed_status = excluded.confirmed_status,
                optimistic_status = excluded.optimistic_status,
                payment_method = excluded.payment_method,
                total_cents = excluded.total_cents,
                payment_collected = excluded.payment_collected,
                updated_at = excluded.updated_at",
            params![
                order.order_id,
                order.confirmed_status.as_str(),
                order.optimistic_status.map(OrderStatus::as_str),
                order.payment_method.as_str(),
                order.total_amount.cents(),
                order.payment_collected as i64,
                order.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Returns `true` when a row was removed.
    pub fn remove(&self, order_id: &str) -> Result<bool, SyncError> {
        let conn = self.db.lock()?;
        let removed = conn.execute(
            "DELETE FROM order_assignments WHERE order_id = ?1",
            params![order_id],
        )?;
        Ok(removed > 0)
    }

    pub fn set_optimistic(
        &self,
        order_id: &str,
        status: Option<OrderStatus>,
    ) -> Result<(), SyncError> {
        let conn = self.db.lock()?;
        write_optimistic(&conn, order_id, status)
    }

    /// Record a server-acknowledged status. The optimistic value is cleared
    /// unless it is still ahead of the confirmed one.
    pub fn set_confirmed(&self, order_id: &str, status: OrderStatus) -> Result<(), SyncError> {
        let conn = self.db.lock()?;
        let Some(current) = load_assignment(&conn, order_id)? else {
            return Ok(());
        };
        let optimistic = current
            .optimistic_status
            .filter(|pending| status.precedes(*pending));
        conn.execute(
            "UPDATE order_assignments
             SET confirmed_status = ?2, optimistic_status = ?3, updated_at = ?4
             WHERE order_id = ?1",
            params![
                order_id,
                status.as_str(),
                optimistic.map(OrderStatus::as_str),
                Utc::now().to_rfc3339()
            ],
        )?;
        Ok(())
    }

    pub fn set_payment_collected(&self, order_id: &str, collected: bool) -> Result<(), SyncError> {
        let conn = self.db.lock()?;
        write_payment_collected(&conn, order_id, collected)?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum TransitionOutcome {
    /// The server acknowledged the new status.
    Confirmed,
    /// Parked in the offline queue; the optimistic status stays visible.
    Queued { action_id: i64 },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileReport {
    pub added: usize,
    pub updated: usize,
    pub removed: usize,
}

pub struct OrderLifecycleController {
    cache: OrderCache,
    queue: Arc<OfflineActionQueue>,
    backend: Arc<dyn OrderBackend>,
    connectivity: Arc<ConnectivityMonitor>,
    notices: NoticeBus,
    request_timeout: Duration,
    /// One submission slot per order, taken for the whole of a direct
    /// submission. The map entry exists while the slot is held or awaited.
    turns: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

/// Exclusive right to submit for one order. Later requests for the same
/// order wait on it, in arrival order.
pub(crate) struct OrderTurn<'a> {
    turns: &'a Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
    order_id: String,
    _slot: OwnedMutexGuard<()>,
}

impl Drop for OrderTurn<'_> {
    fn drop(&mut self) {
        let Ok(mut turns) = self.turns.lock() else {
            return;
        };
        // The map and this guard hold the only references when nobody waits.
        let idle = turns
            .get(&self.order_id)
            .is_some_and(|slot| Arc::strong_count(slot) <= 2);
        if idle {
            turns.remove(&self.order_id);
        }
    }
}

impl OrderLifecycleController {
    pub fn new(
        db: Arc<DbState>,
        queue: Arc<OfflineActionQueue>,
        backend: Arc<dyn OrderBackend>,
        connectivity: Arc<ConnectivityMonitor>,
        notices: NoticeBus,
        request_timeout: Duration,
    ) -> Self {
        Self {
            cache: OrderCache::new(db),
            queue,
            backend,
            connectivity,
            notices,
            request_timeout,
            turns: Mutex::new(HashMap::new()),
        }
    }

    pub fn cache(&self) -> &OrderCache {
        &self.cache
    }

    pub fn get(&self, order_id: &str) -> Result<Option<OrderAssignment>, SyncError> {
        self.cache.get(order_id)
    }

    pub fn active_orders(&self) -> Result<Vec<OrderAssignment>, SyncError> {
        self.cache.active()
    }

    /// Check a requested transition against the cached order. No I/O
    /// besides the cache read.
    pub fn validate_transition(
        order: &OrderAssignment,
        target: OrderStatus,
    ) -> Result<(), ValidationError> {
        let current = order.status();
        if current.next() != Some(target) {
            return Err(ValidationError::InvalidTransition {
                order_id: order.order_id.clone(),
                from: current,
                to: target,
            });
        }
        if target == OrderStatus::Delivered
            && order.requires_cash_collection()
            && !order.payment_collected
        {
            return Err(ValidationError::PaymentRequired(order.order_id.clone()));
        }
        Ok(())
    }

    /// Validate and apply the optimistic status in one locked step.
    fn begin_transition(&self, order_id: &str, target: OrderStatus) -> Result<(), SyncError> {
        let conn = self.cache.db.lock()?;
        let order = load_assignment(&conn, order_id)?
            .ok_or_else(|| ValidationError::UnknownOrder(order_id.to_string()))?;
        Self::validate_transition(&order, target)?;
        write_optimistic(&conn, order_id, Some(target))?;
        Ok(())
    }

    /// Wait for the order's submission slot.
    pub(crate) async fn take_turn(&self, order_id: &str) -> Result<OrderTurn<'_>, SyncError> {
        let slot = {
            let mut turns = self
                .turns
                .lock()
                .map_err(|_| SyncError::Storage("order submission lock poisoned".into()))?;
            turns.entry(order_id.to_string()).or_default().clone()
        };
        let guard = slot.lock_owned().await;
        Ok(OrderTurn {
            turns: &self.turns,
            order_id: order_id.to_string(),
            _slot: guard,
        })
    }

    /// Whether a direct submission for the order is running or waiting.
    fn is_in_flight(&self, order_id: &str) -> bool {
        self.turns
            .lock()
            .map(|turns| turns.contains_key(order_id))
            .unwrap_or(false)
    }

    /// After waiting for an earlier submission, the requested status must
    /// still be the pending one. A conflict or rejection in between undoes it.
    fn ensure_still_requested(&self, order_id: &str, target: OrderStatus) -> Result<(), SyncError> {
        let order = self
            .cache
            .get(order_id)?
            .ok_or_else(|| ValidationError::UnknownOrder(order_id.to_string()))?;
        if order.optimistic_status == Some(target) {
            return Ok(());
        }
        Err(SyncError::Conflict {
            order_id: order_id.to_string(),
            server_status: Some(order.confirmed_status),
            message: format!("{target} was undone by an earlier update for this order"),
        })
    }

    /// Request the next status for an order.
    ///
    /// Invalid requests fail without any network call. Accepted requests
    /// show the new status immediately, then go to the backend when online
    /// and nothing else is pending for the order, or to the queue otherwise.
    pub async fn request_transition(
        &self,
        order_id: &str,
        target: OrderStatus,
    ) -> Result<TransitionOutcome, SyncError> {
        self.begin_transition(order_id, target)?;
        debug!(order_id = %order_id, target = %target, "Optimistic status applied");

        let action = ActionKind::OrderStatusUpdate {
            order_id: order_id.to_string(),
            target_status: target,
        };

        // Held until this request is confirmed or queued, so a later
        // request for the same order always lands after it.
        let _turn = self.take_turn(order_id).await?;
        self.ensure_still_requested(order_id, target)?;

        if !self.connectivity.is_online() || self.queue.has_pending_for(order_id)? {
            let queued = self.queue.enqueue(action)?;
            return Ok(TransitionOutcome::Queued {
                action_id: queued.id,
            });
        }

        let key = status_idempotency_key(order_id, target);
        let result = with_timeout(
            self.request_timeout,
            self.backend.transition_status(order_id, target, &key),
        )
        .await;

        match result {
            Ok(()) => {
                self.apply_confirmation(order_id, target)?;
                Ok(TransitionOutcome::Confirmed)
            }
            Err(BackendError::Transient(reason)) => {
                warn!(order_id = %order_id, target = %target, error = %reason, "Status update failed; queueing");
                let queued = self.queue.enqueue(action)?;
                Ok(TransitionOutcome::Queued {
                    action_id: queued.id,
                })
            }
            Err(BackendError::Conflict {
                server_status,
                message,
            }) => {
                self.apply_conflict(order_id, server_status, &message)?;
                Err(SyncError::Conflict {
                    order_id: order_id.to_string(),
                    server_status,
                    message,
                })
            }
            Err(BackendError::Rejected(reason)) => {
                self.apply_rejection(order_id, target, &reason)?;
                Err(SyncError::Rejected {
                    order_id: order_id.to_string(),
                    reason,
                })
            }
        }
    }

    /// The server acknowledged `status`. Delivered orders leave the list.
    pub fn apply_confirmation(&self, order_id: &str, status: OrderStatus) -> Result<(), SyncError> {
        if status == OrderStatus::Delivered {
            if self.cache.remove(order_id)? {
                info!(order_id = %order_id, "Order delivered");
                self.notices.publish(Notice::OrderRemoved {
                    order_id: order_id.to_string(),
                    reason: RemovalReason::Delivered,
                });
            }
            return Ok(());
        }
        self.cache.set_confirmed(order_id, status)?;
        info!(order_id = %order_id, status = %status, "Order status confirmed");
        Ok(())
    }

    /// The server state diverged. Roll back to the server's status, drop
    /// anything still queued for the order and tell the agent.
    pub fn apply_conflict(
        &self,
        order_id: &str,
        server_status: Option<OrderStatus>,
        message: &str,
    ) -> Result<(), SyncError> {
        warn!(
            order_id = %order_id,
            server_status = server_status.map(OrderStatus::as_str).unwrap_or("unknown"),
            message,
            "Order conflict; rolling back to server state"
        );
        self.queue.discard_for_order(order_id)?;

        match server_status {
            Some(OrderStatus::Delivered) => self.remove_order(order_id, RemovalReason::Delivered)?,
            Some(OrderStatus::Cancelled) => self.remove_order(order_id, RemovalReason::Cancelled)?,
            Some(status) => {
                self.cache.set_optimistic(order_id, None)?;
                self.cache.set_confirmed(order_id, status)?;
            }
            None => self.cache.set_optimistic(order_id, None)?,
        }

        self.notices.publish(Notice::OrderConflict {
            order_id: order_id.to_string(),
            server_status,
            message: message.to_string(),
        });
        Ok(())
    }

    /// Terminal failure of a status update: undo the optimistic value and
    /// drop any later status updates queued on top of it.
    pub fn apply_rejection(
        &self,
        order_id: &str,
        target: OrderStatus,
        reason: &str,
    ) -> Result<(), SyncError> {
        warn!(order_id = %order_id, target = %target, reason, "Status update rejected");
        self.queue.discard_status_updates_for(order_id)?;
        if let Some(order) = self.cache.get(order_id)? {
            let built_on_target = order
                .optimistic_status
                .is_some_and(|pending| pending == target || target.precedes(pending));
            if built_on_target {
                self.cache.set_optimistic(order_id, None)?;
            }
        }
        Ok(())
    }

    fn remove_order(&self, order_id: &str, reason: RemovalReason) -> Result<(), SyncError> {
        if self.cache.remove(order_id)? {
            info!(order_id = %order_id, ?reason, "Order removed from active list");
            self.notices.publish(Notice::OrderRemoved {
                order_id: order_id.to_string(),
                reason,
            });
        }
        Ok(())
    }

    /// Merge a server snapshot into the cache.
    ///
    /// New orders are added. Cancelled and delivered orders leave the list,
    /// as do cached orders the server no longer lists (reassigned) unless
    /// actions for them are still pending. A server status behind the
    /// confirmed one is ignored. A pending optimistic status survives only
    /// while the server is behind it and its submission is still queued or
    /// in flight.
    pub fn reconcile(&self, snapshot: &AssignmentSnapshot) -> Result<ReconcileReport, SyncError> {
        let cached: HashMap<String, OrderAssignment> = self
            .cache
            .active()?
            .into_iter()
            .map(|order| (order.order_id.clone(), order))
            .collect();
        let mut report = ReconcileReport::default();
        let mut seen: HashSet<&str> = HashSet::new();

        for remote in &snapshot.orders {
            seen.insert(remote.order_id.as_str());
            match cached.get(&remote.order_id) {
                None => {
                    if remote.status.is_terminal() {
                        continue;
                    }
                    self.cache.upsert(&OrderAssignment::new(
                        remote.order_id.clone(),
                        remote.status,
                        remote.payment_method,
                        remote.total_amount,
                    ))?;
                    info!(order_id = %remote.order_id, status = %remote.status, "New order assigned");
                    report.added += 1;
                }
                Some(local) => match remote.status {
                    OrderStatus::Cancelled => {
                        self.queue.discard_for_order(&remote.order_id)?;
                        self.remove_order(&remote.order_id, RemovalReason::Cancelled)?;
                        report.removed += 1;
                    }
                    OrderStatus::Delivered => {
                        self.remove_order(&remote.order_id, RemovalReason::Delivered)?;
                        report.removed += 1;
                    }
                    _ => {
                        if self.merge_remote(local, remote)? {
                            report.updated += 1;
                        }
                    }
                },
            }
        }

        for order_id in cached.keys() {
            if seen.contains(order_id.as_str()) {
                continue;
            }
            if self.queue.has_pending_for(order_id)? || self.is_in_flight(order_id) {
                debug!(order_id = %order_id, "Order missing from server list but actions pending");
                continue;
            }
            self.remove_order(order_id, RemovalReason::Reassigned)?;
            report.removed += 1;
        }

        if report != ReconcileReport::default() {
            info!(
                added = report.added,
                updated = report.updated,
                removed = report.removed,
                "Order list reconciled"
            );
        }
        Ok(report)
    }

    fn merge_remote(
        &self,
        local: &OrderAssignment,
        remote: &RemoteAssignment,
    ) -> Result<bool, SyncError> {
        // A response fetched before a confirmation landed is older than the
        // cache. Backward moves arrive as conflicts, not through polling.
        let confirmed = if remote.status.precedes(local.confirmed_status) {
            debug!(
                order_id = %local.order_id,
                server_status = %remote.status,
                confirmed = %local.confirmed_status,
                "Ignoring status older than the confirmed one"
            );
            local.confirmed_status
        } else {
            remote.status
        };
        let optimistic = match local.optimistic_status {
            Some(pending) if confirmed.precedes(pending) => {
                let submitting = self.queue.has_pending_for(&local.order_id)?
                    || self.is_in_flight(&local.order_id);
                submitting.then_some(pending)
            }
            _ => None,
        };

        let merged = OrderAssignment {
            order_id: local.order_id.clone(),
            confirmed_status: confirmed,
            optimistic_status: optimistic,
            payment_method: remote.payment_method,
            total_amount: remote.total_amount,
            payment_collected: local.payment_collected,
            updated_at: local.updated_at,
        };
        if merged == *local {
            return Ok(false);
        }
        self.cache.upsert(&OrderAssignment {
            updated_at: Utc::now(),
            ..merged
        })?;
        Ok(true)
    }
}

//! Cash-on-delivery collection workflow.
//!
//! Records the cash handed over at the door, computes change, and chains
//! into the Delivered transition. The collection is stored in
//! `payment_collections` (one per order) and submitted before the status
//! update, either directly or through the offline queue.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::backend::{with_timeout, OrderBackend};
use crate::connectivity::ConnectivityMonitor;
use crate::db::DbState;
use crate::error::{BackendError, SyncError, ValidationError};
use crate::model::{Money, OrderAssignment, OrderStatus, PaymentCollection, PaymentMethod};
use crate::orders::{
    load_assignment, write_payment_collected, OrderLifecycleController, TransitionOutcome,
};
use crate::queue::{ActionKind, OfflineActionQueue, SubmissionState};

/// Validate a collection against the order and compute the change.
///
/// Nothing is computed unless the order is out for delivery, cash on
/// delivery, not yet collected, and the amount covers the total.
pub fn compute_collection(
    order: &OrderAssignment,
    collected: Money,
    notes: Option<String>,
    now: DateTime<Utc>,
) -> Result<PaymentCollection, ValidationError> {
    if order.payment_method != PaymentMethod::CashOnDelivery {
        return Err(ValidationError::NotCashOnDelivery(order.order_id.clone()));
    }
    if order.status() != OrderStatus::OutForDelivery {
        return Err(ValidationError::NotOutForDelivery {
            order_id: order.order_id.clone(),
            status: order.status(),
        });
    }
    if order.payment_collected {
        return Err(ValidationError::AlreadyCollected(order.order_id.clone()));
    }
    if collected < order.total_amount {
        return Err(ValidationError::InsufficientPayment {
            order_id: order.order_id.clone(),
            total: order.total_amount,
            collected,
        });
    }

    let change_given = collected
        .checked_sub(order.total_amount)
        .filter(|change| !change.is_negative())
        .ok_or_else(|| ValidationError::InsufficientPayment {
            order_id: order.order_id.clone(),
            total: order.total_amount,
            collected,
        })?;

    Ok(PaymentCollection {
        id: Uuid::new_v4(),
        order_id: order.order_id.clone(),
        order_total: order.total_amount,
        collected_amount: collected,
        change_given,
        notes: notes
            .map(|n| n.trim().to_string())
            .filter(|n| !n.is_empty()),
        collected_at: now,
    })
}

/// Outcome of `PaymentWorkflow::collect`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionReceipt {
    pub collection: PaymentCollection,
    pub payment: SubmissionState,
    pub delivery: TransitionOutcome,
}

pub struct PaymentWorkflow {
    db: Arc<DbState>,
    controller: Arc<OrderLifecycleController>,
    queue: Arc<OfflineActionQueue>,
    backend: Arc<dyn OrderBackend>,
    connectivity: Arc<ConnectivityMonitor>,
    request_timeout: Duration,
}

impl PaymentWorkflow {
    pub fn new(
        db: Arc<DbState>,
        controller: Arc<OrderLifecycleController>,
        queue: Arc<OfflineActionQueue>,
        backend: Arc<dyn OrderBackend>,
        connectivity: Arc<ConnectivityMonitor>,
        request_timeout: Duration,
    ) -> Self {
        Self {
            db,
            controller,
            queue,
            backend,
            connectivity,
            request_timeout,
        }
    }

    /// Record a cash collection and deliver the order.
    ///
    /// Two backend submissions follow, payment first, then the Delivered
    /// transition. Offline, both are queued in that order.
    pub async fn collect(
        &self,
        order_id: &str,
        collected: Money,
        notes: Option<String>,
    ) -> Result<CollectionReceipt, SyncError> {
        let collection = self.record(order_id, collected, notes)?;
        info!(
            order_id = %order_id,
            payment_id = %collection.id,
            total = %collection.order_total,
            collected = %collection.collected_amount,
            change = %collection.change_given,
            "Cash collected"
        );

        let payment = self.submit(&collection).await?;
        let delivery = self
            .controller
            .request_transition(order_id, OrderStatus::Delivered)
            .await?;

        Ok(CollectionReceipt {
            collection,
            payment,
            delivery,
        })
    }

    /// Validate and persist the collection together with the order's
    /// collected flag.
    fn record(
        &self,
        order_id: &str,
        collected: Money,
        notes: Option<String>,
    ) -> Result<PaymentCollection, SyncError> {
        let conn = self.db.lock()?;
        let order = load_assignment(&conn, order_id)?
            .ok_or_else(|| ValidationError::UnknownOrder(order_id.to_string()))?;
        // A collection flagged for review may be recorded again.
        let replaces_flagged = match load_review_flag(&conn, order_id)? {
            Some(true) => true,
            Some(false) => {
                return Err(ValidationError::AlreadyCollected(order_id.to_string()).into())
            }
            None => false,
        };
        let collection = compute_collection(&order, collected, notes, Utc::now())?;

        conn.execute_batch("BEGIN IMMEDIATE")?;
        let result = (|| -> Result<(), SyncError> {
            if replaces_flagged {
                conn.execute(
                    "DELETE FROM payment_collections WHERE order_id = ?1",
                    params![order_id],
                )?;
            }
            conn.execute(
                "INSERT INTO payment_collections (
                    id, order_id, order_total_cents, collected_cents, change_cents,
                    notes, collected_at, sync_state
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'pending')",
                params![
                    collection.id.to_string(),
                    collection.order_id,
                    collection.order_total.cents(),
                    collection.collected_amount.cents(),
                    collection.change_given.cents(),
                    collection.notes,
                    collection.collected_at.to_rfc3339(),
                ],
            )?;
            write_payment_collected(&conn, order_id, true)?;
            Ok(())
        })();

        match result {
            Ok(()) => {
                conn.execute_batch("COMMIT")?;
                Ok(collection)
            }
            Err(e) => {
                let _ = conn.execute_batch("ROLLBACK");
                Err(e)
            }
        }
    }

    async fn submit(&self, collection: &PaymentCollection) -> Result<SubmissionState, SyncError> {
        let order_id = collection.order_id.as_str();
        let action = ActionKind::PaymentCollection {
            collection: collection.clone(),
        };

        // A Delivered request made meanwhile waits for this to land or queue.
        let _turn = self.controller.take_turn(order_id).await?;

        if !self.connectivity.is_online() || self.queue.has_pending_for(order_id)? {
            let queued = self.queue.enqueue(action)?;
            return Ok(SubmissionState::Queued {
                action_id: queued.id,
            });
        }

        let result =
            with_timeout(self.request_timeout, self.backend.submit_payment(collection)).await;
        match result {
            Ok(()) => {
                self.mark_confirmed(order_id)?;
                Ok(SubmissionState::Confirmed)
            }
            Err(BackendError::Transient(reason)) => {
                warn!(order_id = %order_id, error = %reason, "Payment submission failed; queueing");
                let queued = self.queue.enqueue(action)?;
                Ok(SubmissionState::Queued {
                    action_id: queued.id,
                })
            }
            Err(BackendError::Conflict {
                server_status,
                message,
            }) => {
                self.discard_collection(order_id)?;
                self.controller
                    .apply_conflict(order_id, server_status, &message)?;
                Err(SyncError::Conflict {
                    order_id: order_id.to_string(),
                    server_status,
                    message,
                })
            }
            Err(BackendError::Rejected(reason)) => {
                self.apply_rejection(order_id, &reason)?;
                Err(SyncError::Rejected {
                    order_id: order_id.to_string(),
                    reason,
                })
            }
        }
    }

    /// The stored collection for an order, if any.
    pub fn collection_for(&self, order_id: &str) -> Result<Option<PaymentCollection>, SyncError> {
        let conn = self.db.lock()?;
        load_collection(&conn, order_id)
    }

    /// Whether the server has acknowledged the collection.
    pub fn is_confirmed(&self, order_id: &str) -> Result<bool, SyncError> {
        let conn = self.db.lock()?;
        let state: Option<String> = conn
            .query_row(
                "SELECT sync_state FROM payment_collections WHERE order_id = ?1",
                params![order_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(state.as_deref() == Some("confirmed"))
    }

    pub fn mark_confirmed(&self, order_id: &str) -> Result<(), SyncError> {
        let conn = self.db.lock()?;
        conn.execute(
            "UPDATE payment_collections SET sync_state = 'confirmed' WHERE order_id = ?1",
            params![order_id],
        )?;
        info!(order_id = %order_id, "Payment confirmed by server");
        Ok(())
    }

    /// Delete the local record and clear the order's collected flag.
    pub fn discard_collection(&self, order_id: &str) -> Result<(), SyncError> {
        let conn = self.db.lock()?;
        conn.execute_batch("BEGIN IMMEDIATE")?;
        let result = (|| -> Result<(), SyncError> {
            conn.execute(
                "DELETE FROM payment_collections WHERE order_id = ?1",
                params![order_id],
            )?;
            write_payment_collected(&conn, order_id, false)?;
            Ok(())
        })();
        match result {
            Ok(()) => {
                conn.execute_batch("COMMIT")?;
                warn!(order_id = %order_id, "Payment collection discarded");
                Ok(())
            }
            Err(e) => {
                let _ = conn.execute_batch("ROLLBACK");
                Err(e)
            }
        }
    }

    /// Whether the collection ran out of retries and awaits manual
    /// reconciliation.
    pub fn needs_review(&self, order_id: &str) -> Result<bool, SyncError> {
        let conn = self.db.lock()?;
        Ok(load_review_flag(&conn, order_id)?.unwrap_or(false))
    }

    /// The payment was dropped after its last retry. The record is kept and
    /// flagged, the order loses its collected flag, and the Delivered
    /// transition queued behind it is undone so the order cannot be closed
    /// without a payment reaching the server.
    pub fn apply_exhausted(&self, order_id: &str, last_error: &str) -> Result<(), SyncError> {
        {
            let conn = self.db.lock()?;
            conn.execute_batch("BEGIN IMMEDIATE")?;
            let result = (|| -> Result<(), SyncError> {
                conn.execute(
                    "UPDATE payment_collections SET needs_review = 1 WHERE order_id = ?1",
                    params![order_id],
                )?;
                write_payment_collected(&conn, order_id, false)?;
                Ok(())
            })();
            match result {
                Ok(()) => conn.execute_batch("COMMIT")?,
                Err(e) => {
                    let _ = conn.execute_batch("ROLLBACK");
                    return Err(e);
                }
            }
        }
        error!(
            order_id = %order_id,
            last_error,
            "Payment could not be sent; collection kept for manual reconciliation"
        );
        self.queue.discard_for_order(order_id)?;
        self.controller
            .apply_rejection(order_id, OrderStatus::Delivered, last_error)
    }

    /// Terminal server rejection of a payment. The order can no longer be
    /// delivered on this collection, so anything queued behind it goes too.
    pub fn apply_rejection(&self, order_id: &str, reason: &str) -> Result<(), SyncError> {
        warn!(order_id = %order_id, reason, "Payment rejected by server");
        self.discard_collection(order_id)?;
        self.queue.discard_for_order(order_id)?;
        self.controller
            .apply_rejection(order_id, OrderStatus::Delivered, reason)
    }
}

/// `None` when no collection is stored for the order.
fn load_review_flag(conn: &Connection, order_id: &str) -> Result<Option<bool>, SyncError> {
    let flag: Option<i64> = conn
        .query_row(
            "SELECT needs_review FROM payment_collections WHERE order_id = ?1",
            params![order_id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(flag.map(|f| f != 0))
}

fn load_collection(
    conn: &Connection,
    order_id: &str,
) -> Result<Option<PaymentCollection>, SyncError> {
    let row = conn
        .query_row(
            "SELECT id, order_id, order_total_cents, collected_cents, change_cents,
                    notes, collected_at
             FROM payment_collections WHERE order_id = ?1",
            params![order_id],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, i64>(4)?,
                    row.get::<_, Option<String>>(5)?,
                    row.get::<_, String>(6)?,
                ))
            },
        )
        .optional()?;

    let Some((id, order_id, total, collected, change, notes, collected_at)) = row else {
        return Ok(None);
    };
    let id = Uuid::parse_str(&id)
        .map_err(|e| SyncError::Storage(format!("payment id {id}: {e}")))?;
    let collected_at = DateTime::parse_from_rfc3339(&collected_at)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| SyncError::Storage(format!("payment timestamp {collected_at}: {e}")))?;
    Ok(Some(PaymentCollection {
        id,
        order_id,
        order_total: Money::from_cents(total),
        collected_amount: Money::from_cents(collected),
        change_given: Money::from_cents(change),
        notes,
        collected_at,
    }))
}

// ===========================================================================
// Tests
// ===========================================================================

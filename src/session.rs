//! Agent sync context.
//!
//! One `AgentSyncContext` owns every component for a signed-in agent. It is
//! built at session start and torn down with [`AgentSyncContext::shutdown`]
//! at sign-out or process exit. Background work (connectivity watcher,
//! safety drain, order polling, location tracking) runs as tokio tasks
//! cancelled through a shared token.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::{with_timeout, OrderBackend};
use crate::config::SyncConfig;
use crate::connectivity::{ConnectivityMonitor, ConnectivityState};
use crate::db::{self, DbState};
use crate::error::{BackendError, SensorError, SyncError};
use crate::location::{BatterySensor, LocationSensor, LocationTracker};
use crate::model::{Money, OrderAssignment, OrderStatus};
use crate::notices::{Notice, NoticeBus};
use crate::orders::{OrderLifecycleController, TransitionOutcome};
use crate::payments::{CollectionReceipt, PaymentWorkflow};
use crate::polling::ResilientPoller;
use crate::queue::{
    ActionKind, ActionSink, DeliveryOutcome, DrainReport, OfflineActionQueue, QueueStats,
    QueuedAction,
};

const TRACKING_SETTING_CATEGORY: &str = "tracking";
const TRACKING_SETTING_KEY: &str = "enabled";

/// Device sensors available to this session. Both are optional; without a
/// location sensor tracking is unsupported, without a battery sensor the
/// baseline cadence applies.
#[derive(Default, Clone)]
pub struct SessionDevices {
    pub location: Option<Arc<dyn LocationSensor>>,
    pub battery: Option<Arc<dyn BatterySensor>>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub connectivity: ConnectivityState,
    pub queue: QueueStats,
    pub draining: bool,
    pub last_drain_at: Option<DateTime<Utc>>,
    pub poll_interval_ms: u64,
    pub consecutive_poll_failures: u32,
    pub last_poll_success_at: Option<DateTime<Utc>>,
    pub tracking: bool,
    pub location_interval_ms: Option<u64>,
    pub active_orders: usize,
}

// ---------------------------------------------------------------------------
// Queue dispatch
// ---------------------------------------------------------------------------

/// Sends queued actions to the backend and applies the outcome to the
/// component that owns the action.
pub struct SessionDispatcher {
    backend: Arc<dyn OrderBackend>,
    controller: Arc<OrderLifecycleController>,
    payments: Arc<PaymentWorkflow>,
    request_timeout: Duration,
}

impl SessionDispatcher {
    pub fn new(
        backend: Arc<dyn OrderBackend>,
        controller: Arc<OrderLifecycleController>,
        payments: Arc<PaymentWorkflow>,
        request_timeout: Duration,
    ) -> Self {
        Self {
            backend,
            controller,
            payments,
            request_timeout,
        }
    }

    async fn send(&self, action: &QueuedAction) -> Result<(), BackendError> {
        let limit = self.request_timeout;
        match &action.kind {
            ActionKind::LocationUpdate { sample } => {
                with_timeout(limit, self.backend.push_location(sample)).await
            }
            ActionKind::OrderStatusUpdate {
                order_id,
                target_status,
            } => {
                with_timeout(
                    limit,
                    self.backend
                        .transition_status(order_id, *target_status, &action.idempotency_key),
                )
                .await
            }
            ActionKind::PaymentCollection { collection } => {
                with_timeout(limit, self.backend.submit_payment(collection)).await
            }
        }
    }

    fn on_delivered(&self, kind: &ActionKind) -> Result<(), SyncError> {
        match kind {
            ActionKind::LocationUpdate { .. } => Ok(()),
            ActionKind::OrderStatusUpdate {
                order_id,
                target_status,
            } => self.controller.apply_confirmation(order_id, *target_status),
            ActionKind::PaymentCollection { collection } => {
                self.payments.mark_confirmed(&collection.order_id)
            }
        }
    }

    fn on_conflict(
        &self,
        kind: &ActionKind,
        server_status: Option<OrderStatus>,
        message: &str,
    ) -> Result<(), SyncError> {
        match kind {
            ActionKind::LocationUpdate { .. } => {
                warn!(message, "Location update conflicted; dropping sample");
                Ok(())
            }
            ActionKind::OrderStatusUpdate { order_id, .. } => {
                self.controller
                    .apply_conflict(order_id, server_status, message)
            }
            ActionKind::PaymentCollection { collection } => {
                self.payments.discard_collection(&collection.order_id)?;
                self.controller
                    .apply_conflict(&collection.order_id, server_status, message)
            }
        }
    }

    fn on_exhausted(&self, kind: &ActionKind, last_error: &str) -> Result<(), SyncError> {
        match kind {
            ActionKind::LocationUpdate { .. } => Ok(()),
            ActionKind::OrderStatusUpdate {
                order_id,
                target_status,
            } => self
                .controller
                .apply_rejection(order_id, *target_status, last_error),
            ActionKind::PaymentCollection { collection } => self
                .payments
                .apply_exhausted(&collection.order_id, last_error),
        }
    }

    fn on_rejected(&self, kind: &ActionKind, reason: &str) -> Result<(), SyncError> {
        match kind {
            ActionKind::LocationUpdate { .. } => Ok(()),
            ActionKind::OrderStatusUpdate {
                order_id,
                target_status,
            } => self
                .controller
                .apply_rejection(order_id, *target_status, reason),
            ActionKind::PaymentCollection { collection } => {
                self.payments.apply_rejection(&collection.order_id, reason)
            }
        }
    }
}

#[async_trait]
impl ActionSink for SessionDispatcher {
    async fn deliver(&self, action: &QueuedAction) -> DeliveryOutcome {
        match self.send(action).await {
            Ok(()) => {
                if let Err(e) = self.on_delivered(&action.kind) {
                    warn!(action_id = action.id, error = %e, "Failed to apply delivered action locally");
                }
                DeliveryOutcome::Delivered
            }
            Err(BackendError::Transient(reason)) => DeliveryOutcome::Failed(reason),
            Err(BackendError::Conflict {
                server_status,
                message,
            }) => {
                if let Err(e) = self.on_conflict(&action.kind, server_status, &message) {
                    warn!(action_id = action.id, error = %e, "Failed to apply conflict locally");
                }
                DeliveryOutcome::Rejected(message)
            }
            Err(BackendError::Rejected(reason)) => {
                if let Err(e) = self.on_rejected(&action.kind, &reason) {
                    warn!(action_id = action.id, error = %e, "Failed to apply rejection locally");
                }
                DeliveryOutcome::Rejected(reason)
            }
        }
    }

    async fn exhausted(&self, action: &QueuedAction, last_error: &str) {
        if let Err(e) = self.on_exhausted(&action.kind, last_error) {
            warn!(action_id = action.id, error = %e, "Failed to apply dropped action locally");
        }
    }
}

// ---------------------------------------------------------------------------
// Context
// ---------------------------------------------------------------------------

pub struct AgentSyncContext {
    config: SyncConfig,
    db: Arc<DbState>,
    notices: NoticeBus,
    connectivity: Arc<ConnectivityMonitor>,
    queue: Arc<OfflineActionQueue>,
    controller: Arc<OrderLifecycleController>,
    payments: Arc<PaymentWorkflow>,
    poller: Arc<ResilientPoller>,
    tracker: Option<Arc<LocationTracker>>,
    dispatcher: SessionDispatcher,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    last_drain_at: Mutex<Option<DateTime<Utc>>>,
}

impl AgentSyncContext {
    /// Build every component. Nothing runs until [`start`](Self::start).
    pub fn new(
        config: SyncConfig,
        db: Arc<DbState>,
        backend: Arc<dyn OrderBackend>,
        devices: SessionDevices,
    ) -> Self {
        let notices = NoticeBus::new(config.notice_capacity);
        let request_timeout = config.request_timeout();
        let connectivity = Arc::new(ConnectivityMonitor::new(notices.clone()));
        let queue = Arc::new(OfflineActionQueue::new(
            db.clone(),
            config.max_retry_attempts,
            notices.clone(),
        ));
        let controller = Arc::new(OrderLifecycleController::new(
            db.clone(),
            queue.clone(),
            backend.clone(),
            connectivity.clone(),
            notices.clone(),
            request_timeout,
        ));
        let payments = Arc::new(PaymentWorkflow::new(
            db.clone(),
            controller.clone(),
            queue.clone(),
            backend.clone(),
            connectivity.clone(),
            request_timeout,
        ));
        let poller = Arc::new(ResilientPoller::new(
            backend.clone(),
            controller.clone(),
            notices.clone(),
            config.backoff(),
            request_timeout,
        ));
        let tracker = devices.location.map(|sensor| {
            Arc::new(LocationTracker::new(
                sensor,
                devices.battery,
                backend.clone(),
                queue.clone(),
                connectivity.clone(),
                notices.clone(),
                config.cadence(),
                config.sensor_timeout(),
                request_timeout,
            ))
        });
        let dispatcher =
            SessionDispatcher::new(backend, controller.clone(), payments.clone(), request_timeout);

        Self {
            config,
            db,
            notices,
            connectivity,
            queue,
            controller,
            payments,
            poller,
            tracker,
            dispatcher,
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
            last_drain_at: Mutex::new(None),
        }
    }

    /// Spawn the background tasks and restore location tracking if the
    /// agent left it on.
    pub async fn start(self: &Arc<Self>) -> Result<(), SyncError> {
        let watcher = self.spawn_connectivity_watcher();
        let safety = self.spawn_safety_drain();
        let polling = tokio::spawn(self.poller.clone().run(self.cancel.child_token()));
        self.tasks
            .lock()
            .map_err(|e| SyncError::Storage(format!("session tasks poisoned: {e}")))?
            .extend([watcher, safety, polling]);

        if self.tracking_enabled_setting()? {
            match &self.tracker {
                Some(tracker) => {
                    if let Err(e) = tracker.start().await {
                        warn!(error = %e, "Could not restore location tracking");
                    }
                }
                None => warn!("Tracking was enabled but this device has no location sensor"),
            }
        }

        info!(
            connectivity = ?self.connectivity.current(),
            pending = self.queue.len()?,
            "Agent sync session started"
        );
        Ok(())
    }

    /// On every transition to Online: one drain attempt, one immediate poll.
    fn spawn_connectivity_watcher(self: &Arc<Self>) -> JoinHandle<()> {
        let ctx = self.clone();
        let cancel = self.cancel.child_token();
        let mut rx = self.connectivity.subscribe();
        rx.borrow_and_update();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    changed = rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
                let state = *rx.borrow_and_update();
                if state != ConnectivityState::Online {
                    continue;
                }
                ctx.poller.poll_now();
                if let Err(e) = ctx.drain_now().await {
                    warn!(error = %e, "Drain after reconnect failed");
                }
            }
            debug!("Connectivity watcher stopped");
        })
    }

    fn spawn_safety_drain(self: &Arc<Self>) -> JoinHandle<()> {
        let ctx = self.clone();
        let cancel = self.cancel.child_token();
        let every = self.config.safety_drain_interval();
        tokio::spawn(async move {
            info!("Safety drain started (interval: {}s)", every.as_secs());
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(every) => {}
                }
                if !ctx.connectivity.is_online() {
                    continue;
                }
                if let Err(e) = ctx.drain_now().await {
                    warn!(error = %e, "Safety drain failed");
                }
            }
            info!("Safety drain stopped");
        })
    }

    /// Run one drain pass now. Coalesces with a pass already in progress.
    pub async fn drain_now(&self) -> Result<DrainReport, SyncError> {
        let report = self.queue.drain(&self.dispatcher).await?;
        if !report.coalesced {
            if let Ok(mut at) = self.last_drain_at.lock() {
                *at = Some(Utc::now());
            }
        }
        Ok(report)
    }

    pub async fn request_transition(
        &self,
        order_id: &str,
        target: OrderStatus,
    ) -> Result<TransitionOutcome, SyncError> {
        self.controller.request_transition(order_id, target).await
    }

    pub async fn collect_payment(
        &self,
        order_id: &str,
        collected: Money,
        notes: Option<String>,
    ) -> Result<CollectionReceipt, SyncError> {
        self.payments.collect(order_id, collected, notes).await
    }

    /// Turn location tracking on or off. The choice survives restarts.
    pub async fn set_tracking(&self, enabled: bool) -> Result<(), SyncError> {
        let Some(tracker) = &self.tracker else {
            if enabled {
                self.notices.publish(Notice::TrackingHalted {
                    reason: SensorError::Unsupported,
                });
                return Err(SensorError::Unsupported.into());
            }
            return Ok(());
        };

        if enabled {
            tracker.start().await?;
        } else {
            tracker.stop();
        }
        self.persist_tracking(enabled)
    }

    pub fn is_tracking(&self) -> bool {
        self.tracker.as_ref().is_some_and(|t| t.is_tracking())
    }

    fn tracking_enabled_setting(&self) -> Result<bool, SyncError> {
        let conn = self.db.lock()?;
        Ok(
            db::get_setting(&conn, TRACKING_SETTING_CATEGORY, TRACKING_SETTING_KEY).as_deref()
                == Some("true"),
        )
    }

    fn persist_tracking(&self, enabled: bool) -> Result<(), SyncError> {
        let conn = self.db.lock()?;
        db::set_setting(
            &conn,
            TRACKING_SETTING_CATEGORY,
            TRACKING_SETTING_KEY,
            if enabled { "true" } else { "false" },
        )
        .map_err(SyncError::Storage)
    }

    /// Feed a reachability reading from the OS or a probe.
    pub fn report_connectivity(&self, state: ConnectivityState) -> bool {
        self.connectivity.report(state)
    }

    pub fn active_orders(&self) -> Result<Vec<OrderAssignment>, SyncError> {
        self.controller.active_orders()
    }

    pub fn subscribe_notices(&self) -> broadcast::Receiver<Notice> {
        self.notices.subscribe()
    }

    pub fn connectivity(&self) -> Arc<ConnectivityMonitor> {
        self.connectivity.clone()
    }

    pub fn queue(&self) -> &OfflineActionQueue {
        &self.queue
    }

    pub fn payments(&self) -> &PaymentWorkflow {
        &self.payments
    }

    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.child_token()
    }

    pub fn status(&self) -> Result<SyncStatus, SyncError> {
        let polling = self.poller.state();
        let last_drain_at = self.last_drain_at.lock().ok().and_then(|at| *at);
        Ok(SyncStatus {
            connectivity: self.connectivity.current(),
            queue: self.queue.stats()?,
            draining: self.queue.is_draining(),
            last_drain_at,
            poll_interval_ms: polling.interval.as_millis() as u64,
            consecutive_poll_failures: polling.consecutive_failures,
            last_poll_success_at: polling.last_success_at,
            tracking: self.is_tracking(),
            location_interval_ms: self
                .tracker
                .as_ref()
                .filter(|t| t.is_tracking())
                .map(|t| t.current_interval().as_millis() as u64),
            active_orders: self.controller.active_orders()?.len(),
        })
    }

    /// Stop tracking, cancel every background task and wait for them.
    /// Queued actions stay on disk for the next session.
    pub async fn shutdown(&self) {
        info!("Shutting down agent sync session");
        if let Some(tracker) = &self.tracker {
            tracker.stop();
        }
        self.cancel.cancel();
        let tasks = match self.tasks.lock() {
            Ok(mut tasks) => std::mem::take(&mut *tasks),
            Err(_) => Vec::new(),
        };
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Background task ended abnormally");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::AssignmentSnapshot;
    use crate::model::{PaymentMethod, RemoteAssignment};
    use crate::notices::RemovalReason;
    use crate::queue::{ActionKindTag, SubmissionState};
    use crate::testing::{BackendCall, FakeBackend, FakeLocationSensor};

    fn context(
        db: Arc<DbState>,
        backend: Arc<FakeBackend>,
        devices: SessionDevices,
    ) -> Arc<AgentSyncContext> {
        Arc::new(AgentSyncContext::new(
            SyncConfig::default(),
            db,
            backend,
            devices,
        ))
    }

    fn seed(
        ctx: &AgentSyncContext,
        order_id: &str,
        status: OrderStatus,
        method: PaymentMethod,
        cents: i64,
    ) {
        ctx.controller
            .cache()
            .upsert(&OrderAssignment::new(
                order_id,
                status,
                method,
                Money::from_cents(cents),
            ))
            .unwrap();
    }

    fn count_calls(backend: &FakeBackend, pred: impl Fn(&BackendCall) -> bool) -> usize {
        backend.calls().iter().filter(|c| pred(c)).count()
    }

    #[tokio::test]
    async fn test_offline_payment_drains_in_order_and_delivers() {
        let backend = Arc::new(FakeBackend::new());
        let ctx = context(db::test_db(), backend.clone(), SessionDevices::default());
        seed(&ctx, "ord-1", OrderStatus::OutForDelivery, PaymentMethod::CashOnDelivery, 1000);

        let receipt = ctx
            .collect_payment("ord-1", Money::from_cents(1250), None)
            .await
            .unwrap();
        assert_eq!(receipt.collection.change_given, Money::from_cents(250));
        assert!(matches!(receipt.payment, SubmissionState::Queued { .. }));
        assert!(matches!(receipt.delivery, TransitionOutcome::Queued { .. }));
        assert!(backend.calls().is_empty());

        let queued: Vec<ActionKindTag> = ctx
            .queue()
            .pending()
            .unwrap()
            .iter()
            .map(|a| a.kind.tag())
            .collect();
        assert_eq!(
            queued,
            vec![ActionKindTag::PaymentCollection, ActionKindTag::OrderStatusUpdate]
        );
        assert_eq!(ctx.active_orders().unwrap().len(), 1);

        // First attempt fails for the payment; the status update must wait.
        backend.fail_next_payment(BackendError::Transient("HTTP 503".into()));
        ctx.report_connectivity(ConnectivityState::Online);
        let report = ctx.drain_now().await.unwrap();
        assert_eq!(report.retained, 1);
        assert_eq!(report.held, 1);
        assert_eq!(ctx.active_orders().unwrap().len(), 1);

        let report = ctx.drain_now().await.unwrap();
        assert_eq!(report.delivered, 2);
        assert!(ctx.queue().is_empty().unwrap());
        assert!(ctx.active_orders().unwrap().is_empty());
        assert!(ctx.payments().is_confirmed("ord-1").unwrap());

        assert_eq!(
            backend.calls(),
            vec![
                BackendCall::Payment {
                    order_id: "ord-1".into()
                },
                BackendCall::Payment {
                    order_id: "ord-1".into()
                },
                BackendCall::Transition {
                    order_id: "ord-1".into(),
                    target: OrderStatus::Delivered
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_queued_conflict_rolls_back_and_purges() {
        let backend = Arc::new(FakeBackend::new());
        let ctx = context(db::test_db(), backend.clone(), SessionDevices::default());
        let mut notices = ctx.subscribe_notices();
        seed(&ctx, "ord-1", OrderStatus::Assigned, PaymentMethod::Prepaid, 900);

        ctx.request_transition("ord-1", OrderStatus::Accepted).await.unwrap();
        ctx.request_transition("ord-1", OrderStatus::PickedUp).await.unwrap();
        assert_eq!(ctx.queue().len().unwrap(), 2);

        backend.fail_next_transition(BackendError::Conflict {
            server_status: Some(OrderStatus::Cancelled),
            message: "order cancelled by dispatcher".into(),
        });
        ctx.report_connectivity(ConnectivityState::Online);
        let report = ctx.drain_now().await.unwrap();

        assert_eq!(report.rejected, 1);
        assert_eq!(report.delivered, 0);
        assert!(ctx.queue().is_empty().unwrap());
        assert!(ctx.active_orders().unwrap().is_empty());
        assert_eq!(
            count_calls(&backend, |c| matches!(c, BackendCall::Transition { .. })),
            1
        );

        let mut saw_removed = false;
        let mut saw_conflict = false;
        while let Ok(notice) = notices.try_recv() {
            match notice {
                Notice::OrderRemoved { reason, .. } => {
                    saw_removed = reason == RemovalReason::Cancelled
                }
                Notice::OrderConflict { server_status, .. } => {
                    saw_conflict = server_status == Some(OrderStatus::Cancelled)
                }
                _ => {}
            }
        }
        assert!(saw_removed);
        assert!(saw_conflict);
    }

    #[tokio::test]
    async fn test_queued_payment_rejection_discards_collection() {
        let backend = Arc::new(FakeBackend::new());
        let ctx = context(db::test_db(), backend.clone(), SessionDevices::default());
        seed(&ctx, "ord-1", OrderStatus::OutForDelivery, PaymentMethod::CashOnDelivery, 1000);

        ctx.collect_payment("ord-1", Money::from_cents(1000), Some("exact".into()))
            .await
            .unwrap();
        backend.fail_next_payment(BackendError::Rejected("order not payable".into()));
        ctx.report_connectivity(ConnectivityState::Online);
        let report = ctx.drain_now().await.unwrap();

        assert_eq!(report.rejected, 1);
        assert!(ctx.queue().is_empty().unwrap());
        assert!(ctx.payments().collection_for("ord-1").unwrap().is_none());

        let order = ctx.controller.get("ord-1").unwrap().unwrap();
        assert_eq!(order.status(), OrderStatus::OutForDelivery);
        assert!(!order.payment_collected);
        assert_eq!(
            count_calls(&backend, |c| matches!(c, BackendCall::Transition { .. })),
            0
        );
    }

    #[tokio::test]
    async fn test_payment_out_of_retries_never_lets_delivery_through() {
        let backend = Arc::new(FakeBackend::new());
        let ctx = context(db::test_db(), backend.clone(), SessionDevices::default());
        seed(&ctx, "ord-1", OrderStatus::OutForDelivery, PaymentMethod::CashOnDelivery, 1000);
        ctx.collect_payment("ord-1", Money::from_cents(1250), None)
            .await
            .unwrap();

        for _ in 0..5 {
            backend.fail_next_payment(BackendError::Transient("HTTP 503".into()));
        }
        ctx.report_connectivity(ConnectivityState::Online);
        let mut dropped = 0;
        for _ in 0..6 {
            let report = ctx.drain_now().await.unwrap();
            assert_eq!(report.delivered, 0);
            dropped += report.dropped;
        }

        assert_eq!(dropped, 1);
        assert!(ctx.queue().is_empty().unwrap());
        assert_eq!(
            count_calls(&backend, |c| matches!(c, BackendCall::Payment { .. })),
            5
        );
        assert_eq!(
            count_calls(&backend, |c| matches!(c, BackendCall::Transition { .. })),
            0
        );

        let order = ctx.controller.get("ord-1").unwrap().unwrap();
        assert_eq!(order.status(), OrderStatus::OutForDelivery);
        assert!(!order.payment_collected);
        assert!(ctx.payments().needs_review("ord-1").unwrap());
        assert!(!ctx.payments().is_confirmed("ord-1").unwrap());

        // Re-entering the cash closes the order normally.
        let receipt = ctx
            .collect_payment("ord-1", Money::from_cents(1250), None)
            .await
            .unwrap();
        assert_eq!(receipt.payment, SubmissionState::Confirmed);
        assert_eq!(receipt.delivery, TransitionOutcome::Confirmed);
        assert!(ctx.active_orders().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_status_update_out_of_retries_drops_later_steps() {
        let backend = Arc::new(FakeBackend::new());
        let ctx = context(db::test_db(), backend.clone(), SessionDevices::default());
        seed(&ctx, "ord-1", OrderStatus::Assigned, PaymentMethod::Prepaid, 900);
        ctx.request_transition("ord-1", OrderStatus::Accepted).await.unwrap();
        ctx.request_transition("ord-1", OrderStatus::PickedUp).await.unwrap();

        for _ in 0..5 {
            backend.fail_next_transition(BackendError::Transient("HTTP 502".into()));
        }
        ctx.report_connectivity(ConnectivityState::Online);
        for _ in 0..5 {
            ctx.drain_now().await.unwrap();
        }

        assert!(ctx.queue().is_empty().unwrap());
        let order = ctx.controller.get("ord-1").unwrap().unwrap();
        assert_eq!(order.status(), OrderStatus::Assigned);
        assert_eq!(
            backend.calls(),
            vec![
                BackendCall::Transition {
                    order_id: "ord-1".into(),
                    target: OrderStatus::Accepted,
                };
                5
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_triggers_one_drain_and_one_poll() {
        let backend = Arc::new(FakeBackend::new());
        backend.set_snapshot(AssignmentSnapshot {
            orders: vec![RemoteAssignment {
                order_id: "ord-1".into(),
                status: OrderStatus::Assigned,
                payment_method: PaymentMethod::Prepaid,
                total_amount: Money::from_cents(900),
            }],
            notifications: vec![],
        });
        let ctx = context(db::test_db(), backend.clone(), SessionDevices::default());
        seed(&ctx, "ord-1", OrderStatus::Assigned, PaymentMethod::Prepaid, 900);
        ctx.request_transition("ord-1", OrderStatus::Accepted).await.unwrap();

        ctx.start().await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        let fetches_before = count_calls(&backend, |c| *c == BackendCall::Fetch);
        assert_eq!(fetches_before, 1);

        assert!(ctx.report_connectivity(ConnectivityState::Online));
        assert!(!ctx.report_connectivity(ConnectivityState::Online));
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(
            count_calls(&backend, |c| matches!(c, BackendCall::Transition { .. })),
            1
        );
        assert_eq!(count_calls(&backend, |c| *c == BackendCall::Fetch), 2);
        assert!(ctx.queue().is_empty().unwrap());
        assert!(ctx.controller.get("ord-1").unwrap().is_some());

        ctx.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_safety_drain_runs_only_while_online() {
        let backend = Arc::new(FakeBackend::new());
        backend.set_snapshot(AssignmentSnapshot {
            orders: vec![RemoteAssignment {
                order_id: "ord-1".into(),
                status: OrderStatus::Assigned,
                payment_method: PaymentMethod::Prepaid,
                total_amount: Money::from_cents(900),
            }],
            notifications: vec![],
        });
        let ctx = context(db::test_db(), backend.clone(), SessionDevices::default());
        seed(&ctx, "ord-1", OrderStatus::Assigned, PaymentMethod::Prepaid, 900);
        ctx.request_transition("ord-1", OrderStatus::Accepted).await.unwrap();

        ctx.start().await.unwrap();
        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(ctx.queue().len().unwrap(), 1);

        // The reconnect drain fails; the safety timer retries.
        ctx.report_connectivity(ConnectivityState::Online);
        backend.fail_next_transition(BackendError::Transient("timeout".into()));
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(ctx.queue().len().unwrap(), 1);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(ctx.queue().is_empty().unwrap());
        assert!(ctx.status().unwrap().last_drain_at.is_some());

        ctx.shutdown().await;
    }

    #[tokio::test]
    async fn test_tracking_requires_a_sensor() {
        let ctx = context(
            db::test_db(),
            Arc::new(FakeBackend::new()),
            SessionDevices::default(),
        );
        let err = ctx.set_tracking(true).await.unwrap_err();
        assert!(matches!(err, SyncError::Sensor(SensorError::Unsupported)));
        assert!(ctx.set_tracking(false).await.is_ok());
        assert!(!ctx.is_tracking());
    }

    #[tokio::test(start_paused = true)]
    async fn test_tracking_choice_survives_restart() {
        let db = db::test_db();
        let backend = Arc::new(FakeBackend::new());
        let sensor = Arc::new(FakeLocationSensor::new());
        let devices = SessionDevices {
            location: Some(sensor.clone()),
            battery: None,
        };

        let first = context(db.clone(), backend.clone(), devices.clone());
        first.set_tracking(true).await.unwrap();
        assert!(first.is_tracking());
        first.shutdown().await;
        assert!(!first.is_tracking());
        assert_eq!(sensor.release_count(), 1);

        let second = context(db, backend, devices);
        second.start().await.unwrap();
        assert!(second.is_tracking());
        assert_eq!(sensor.acquire_count(), 2);
        let status = second.status().unwrap();
        assert!(status.tracking);
        assert_eq!(status.location_interval_ms, Some(45_000));

        second.set_tracking(false).await.unwrap();
        second.shutdown().await;

        let conn = second.db.lock().unwrap();
        assert_eq!(
            db::get_setting(&conn, TRACKING_SETTING_CATEGORY, TRACKING_SETTING_KEY).as_deref(),
            Some("false")
        );
    }

    #[tokio::test]
    async fn test_status_reports_backlog() {
        let ctx = context(
            db::test_db(),
            Arc::new(FakeBackend::new()),
            SessionDevices::default(),
        );
        seed(&ctx, "ord-1", OrderStatus::Assigned, PaymentMethod::Prepaid, 500);
        ctx.request_transition("ord-1", OrderStatus::Accepted).await.unwrap();

        let status = ctx.status().unwrap();
        assert_eq!(status.connectivity, ConnectivityState::Offline);
        assert_eq!(status.queue.status_updates, 1);
        assert_eq!(status.active_orders, 1);
        assert_eq!(status.poll_interval_ms, 15_000);
        assert!(!status.tracking);
        assert!(status.last_drain_at.is_none());
    }
}

//! Order-list polling with failure backoff.
//!
//! The poller reads the agent's assignments on a fixed baseline cadence.
//! After `failure_threshold` consecutive failures it doubles the interval on
//! every further failure, up to the cap, and reports degraded connectivity.
//! The first success returns to the baseline.

use chrono::{DateTime, Utc};
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::{with_timeout, OrderBackend};
use crate::notices::{Notice, NoticeBus};
use crate::orders::OrderLifecycleController;
use crate::queue::InFlightGuard;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub baseline: Duration,
    pub cap: Duration,
    pub failure_threshold: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            baseline: Duration::from_secs(15),
            cap: Duration::from_secs(300),
            failure_threshold: 3,
        }
    }
}

impl BackoffPolicy {
    /// Interval after a failure, given the failure count including it.
    pub fn after_failure(&self, current: Duration, consecutive_failures: u32) -> Duration {
        if consecutive_failures >= self.failure_threshold {
            current.saturating_mul(2).min(self.cap)
        } else {
            current
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollingState {
    pub interval: Duration,
    pub consecutive_failures: u32,
    pub last_success_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    Refreshed { orders: usize },
    Failed { degraded: bool },
    /// A poll was already in flight.
    Skipped,
}

pub struct ResilientPoller {
    backend: Arc<dyn OrderBackend>,
    controller: Arc<OrderLifecycleController>,
    notices: NoticeBus,
    policy: BackoffPolicy,
    request_timeout: Duration,
    state: Mutex<PollingState>,
    in_flight: AtomicBool,
    wake: Notify,
}

impl ResilientPoller {
    pub fn new(
        backend: Arc<dyn OrderBackend>,
        controller: Arc<OrderLifecycleController>,
        notices: NoticeBus,
        policy: BackoffPolicy,
        request_timeout: Duration,
    ) -> Self {
        Self {
            backend,
            controller,
            notices,
            policy,
            request_timeout,
            state: Mutex::new(PollingState {
                interval: policy.baseline,
                consecutive_failures: 0,
                last_success_at: None,
            }),
            in_flight: AtomicBool::new(false),
            wake: Notify::new(),
        }
    }

    pub fn state(&self) -> PollingState {
        match self.state.lock() {
            Ok(state) => state.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn current_interval(&self) -> Duration {
        self.state().interval
    }

    /// Ask the run loop to poll now instead of waiting out the interval.
    pub fn poll_now(&self) {
        self.wake.notify_one();
    }

    /// One poll. Skipped entirely when another is still in flight.
    pub async fn poll_once(&self) -> PollOutcome {
        let Some(_guard) = InFlightGuard::acquire(&self.in_flight) else {
            debug!("Poll already in flight; skipping tick");
            return PollOutcome::Skipped;
        };

        match with_timeout(self.request_timeout, self.backend.fetch_assignments()).await {
            Ok(snapshot) => {
                self.record_success();
                if let Err(e) = self.controller.reconcile(&snapshot) {
                    warn!(error = %e, "Failed to apply order list");
                }
                for message in &snapshot.notifications {
                    self.notices.publish(Notice::ServerMessage {
                        message: message.clone(),
                    });
                }
                PollOutcome::Refreshed {
                    orders: snapshot.orders.len(),
                }
            }
            Err(e) => {
                let degraded = self.record_failure(&e.to_string());
                PollOutcome::Failed { degraded }
            }
        }
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut PollingState) -> R) -> R {
        match self.state.lock() {
            Ok(mut state) => f(&mut state),
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
    }

    fn record_success(&self) {
        let recovered = self.with_state(|state| {
            let was_degraded = state.consecutive_failures >= self.policy.failure_threshold;
            state.consecutive_failures = 0;
            state.interval = self.policy.baseline;
            state.last_success_at = Some(Utc::now());
            was_degraded
        });
        if recovered {
            info!("Order polling recovered");
            self.notices.publish(Notice::PollRecovered);
        }
    }

    /// Returns whether polling is now degraded.
    fn record_failure(&self, error: &str) -> bool {
        let (failures, previous, next) = self.with_state(|state| {
            state.consecutive_failures = state.consecutive_failures.saturating_add(1);
            let previous = state.interval;
            state.interval = self
                .policy
                .after_failure(state.interval, state.consecutive_failures);
            (state.consecutive_failures, previous, state.interval)
        });

        let degraded = failures >= self.policy.failure_threshold;
        if !degraded {
            debug!(failures, error, "Order poll failed");
            return false;
        }
        warn!(
            failures,
            next_poll_s = next.as_secs(),
            error,
            "Order polling degraded"
        );
        if failures == self.policy.failure_threshold || next != previous {
            self.notices.publish(Notice::DegradedConnectivity {
                consecutive_failures: failures,
                next_poll_ms: next.as_millis() as u64,
            });
        }
        true
    }

    /// Poll, then wait the current interval (or a `poll_now` wake-up), until
    /// cancelled.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        info!(
            baseline_s = self.policy.baseline.as_secs(),
            "Order polling started"
        );
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.poll_once() => {}
            }
            let interval = self.current_interval();
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
                _ = self.wake.notified() => debug!("Immediate poll requested"),
            }
        }
        info!("Order polling stopped");
    }
}

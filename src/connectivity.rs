//! Network reachability observer.
//!
//! The monitor never fails: it only records what the OS (or the reachability
//! probe) reports. A false "online" reading is absorbed by downstream retry
//! logic.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::backend::OrderBackend;
use crate::notices::{Notice, NoticeBus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectivityState {
    Online,
    Offline,
}

pub struct ConnectivityMonitor {
    tx: watch::Sender<ConnectivityState>,
    notices: NoticeBus,
}

impl ConnectivityMonitor {
    /// Starts Offline until the first signal arrives.
    pub fn new(notices: NoticeBus) -> Self {
        Self::with_state(ConnectivityState::Offline, notices)
    }

    pub fn with_state(initial: ConnectivityState, notices: NoticeBus) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx, notices }
    }

    pub fn current(&self) -> ConnectivityState {
        *self.tx.borrow()
    }

    pub fn is_online(&self) -> bool {
        self.current() == ConnectivityState::Online
    }

    /// Record a reachability reading. Returns `true` when it was a transition;
    /// repeated readings of the same state are ignored.
    pub fn report(&self, state: ConnectivityState) -> bool {
        let changed = self.tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
        if changed {
            match state {
                ConnectivityState::Online => info!("Network restored; queued actions will sync"),
                ConnectivityState::Offline => {
                    info!("Network offline; mutating actions will be queued")
                }
            }
            self.notices.publish(Notice::ConnectivityChanged { state });
        }
        changed
    }

    /// Stream of state changes. The receiver starts at the current value.
    pub fn subscribe(&self) -> watch::Receiver<ConnectivityState> {
        self.tx.subscribe()
    }
}

/// Poll the backend health endpoint on a fixed cadence and feed the result
/// into the monitor. Used where no OS network signal is available.
pub fn spawn_reachability_probe(
    monitor: Arc<ConnectivityMonitor>,
    backend: Arc<dyn OrderBackend>,
    every: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!("Reachability probe started (interval: {}s)", every.as_secs());
        loop {
            let reachable = tokio::select! {
                _ = cancel.cancelled() => break,
                ok = backend.health_check() => ok,
            };
            let state = if reachable {
                ConnectivityState::Online
            } else {
                ConnectivityState::Offline
            };
            debug!(?state, "reachability probe");
            monitor.report(state);

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(every) => {}
            }
        }
        info!("Reachability probe stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeBackend;

    #[test]
    fn test_starts_offline() {
        let monitor = ConnectivityMonitor::new(NoticeBus::default());
        assert_eq!(monitor.current(), ConnectivityState::Offline);
        assert!(!monitor.is_online());
    }

    #[test]
    fn test_repeated_reports_are_not_transitions() {
        let bus = NoticeBus::new(8);
        let mut rx = bus.subscribe();
        let monitor = ConnectivityMonitor::new(bus);

        assert!(!monitor.report(ConnectivityState::Offline));
        assert!(monitor.report(ConnectivityState::Online));
        assert!(!monitor.report(ConnectivityState::Online));
        assert!(monitor.report(ConnectivityState::Offline));

        assert_eq!(
            rx.try_recv().unwrap(),
            Notice::ConnectivityChanged {
                state: ConnectivityState::Online
            }
        );
        assert_eq!(
            rx.try_recv().unwrap(),
            Notice::ConnectivityChanged {
                state: ConnectivityState::Offline
            }
        );
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_subscribers_observe_transitions() {
        let monitor = ConnectivityMonitor::new(NoticeBus::default());
        let mut rx = monitor.subscribe();
        assert_eq!(*rx.borrow_and_update(), ConnectivityState::Offline);

        monitor.report(ConnectivityState::Online);
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow_and_update(), ConnectivityState::Online);
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_feeds_monitor() {
        let backend = Arc::new(FakeBackend::new());
        let monitor = Arc::new(ConnectivityMonitor::new(NoticeBus::default()));
        let cancel = CancellationToken::new();
        let mut rx = monitor.subscribe();

        let handle = spawn_reachability_probe(
            monitor.clone(),
            backend.clone(),
            Duration::from_secs(15),
            cancel.clone(),
        );

        rx.changed().await.unwrap();
        assert!(monitor.is_online());

        backend.set_reachable(false);
        rx.changed().await.unwrap();
        assert!(!monitor.is_online());

        cancel.cancel();
        handle.await.unwrap();
    }
}

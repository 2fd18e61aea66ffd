//! Battery-aware location tracking.
//!
//! One background task per tracking session samples the device position on
//! a cadence chosen from the battery level. There is always exactly one
//! pending deadline, `last_sample + interval(battery)`; a battery change
//! moves it instead of arming a second timer. Samples go straight to the
//! backend when online and to the offline queue otherwise.

use async_trait::async_trait;
use chrono::Utc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::{with_timeout, OrderBackend};
use crate::connectivity::ConnectivityMonitor;
use crate::error::{BackendError, SensorError, SyncError};
use crate::model::LocationSample;
use crate::notices::{Notice, NoticeBus};
use crate::queue::{ActionKind, OfflineActionQueue};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Accuracy {
    /// Low-power network/cell positioning.
    Coarse,
    Precise,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Position {
    pub latitude: f64,
    pub longitude: f64,
    pub accuracy_meters: f64,
}

/// Device location provider.
#[async_trait]
pub trait LocationSensor: Send + Sync {
    /// Open the OS location subscription.
    async fn acquire(&self, accuracy: Accuracy) -> Result<(), SensorError>;

    async fn current_position(&self) -> Result<Position, SensorError>;

    /// Close the subscription. Must be safe to call more than once.
    fn release(&self);
}

/// Device battery level (0-100) with change notifications.
pub trait BatterySensor: Send + Sync {
    fn subscribe(&self) -> watch::Receiver<u8>;
}

/// Sampling interval by battery level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CadencePolicy {
    /// Levels at or above this use `high_interval`.
    pub high_threshold: u8,
    /// Levels below this use `low_interval`.
    pub low_threshold: u8,
    pub high_interval: Duration,
    pub mid_interval: Duration,
    pub low_interval: Duration,
    /// Used when no battery reading is available.
    pub baseline_interval: Duration,
}

impl Default for CadencePolicy {
    fn default() -> Self {
        Self {
            high_threshold: 50,
            low_threshold: 20,
            high_interval: Duration::from_secs(45),
            mid_interval: Duration::from_secs(60),
            low_interval: Duration::from_secs(120),
            baseline_interval: Duration::from_secs(45),
        }
    }
}

impl CadencePolicy {
    pub fn interval_for(&self, battery: Option<u8>) -> Duration {
        match battery {
            None => self.baseline_interval,
            Some(level) if level >= self.high_threshold => self.high_interval,
            Some(level) if level >= self.low_threshold => self.mid_interval,
            Some(_) => self.low_interval,
        }
    }
}

/// Open sensor subscription; released on drop.
struct SensorSubscription {
    sensor: Arc<dyn LocationSensor>,
}

impl Drop for SensorSubscription {
    fn drop(&mut self) {
        self.sensor.release();
        debug!("Location subscription released");
    }
}

struct TrackingHandle {
    generation: u64,
    cancel: CancellationToken,
    _subscription: SensorSubscription,
    _task: JoinHandle<()>,
}

#[derive(Debug)]
enum LoopEvent {
    Stop,
    Sample,
    Battery(Option<u8>),
}

pub struct LocationTracker {
    sensor: Arc<dyn LocationSensor>,
    battery: Option<Arc<dyn BatterySensor>>,
    backend: Arc<dyn OrderBackend>,
    queue: Arc<OfflineActionQueue>,
    connectivity: Arc<ConnectivityMonitor>,
    notices: NoticeBus,
    cadence: CadencePolicy,
    sensor_timeout: Duration,
    request_timeout: Duration,
    active: Mutex<Option<TrackingHandle>>,
    generation: AtomicU64,
    interval_ms: AtomicU64,
}

impl LocationTracker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        sensor: Arc<dyn LocationSensor>,
        battery: Option<Arc<dyn BatterySensor>>,
        backend: Arc<dyn OrderBackend>,
        queue: Arc<OfflineActionQueue>,
        connectivity: Arc<ConnectivityMonitor>,
        notices: NoticeBus,
        cadence: CadencePolicy,
        sensor_timeout: Duration,
        request_timeout: Duration,
    ) -> Self {
        let initial = cadence.interval_for(None);
        Self {
            sensor,
            battery,
            backend,
            queue,
            connectivity,
            notices,
            cadence,
            sensor_timeout,
            request_timeout,
            active: Mutex::new(None),
            generation: AtomicU64::new(0),
            interval_ms: AtomicU64::new(initial.as_millis() as u64),
        }
    }

    pub fn is_tracking(&self) -> bool {
        self.active
            .lock()
            .map(|active| active.is_some())
            .unwrap_or(false)
    }

    /// Interval the tracker is currently waiting on.
    pub fn current_interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.load(Ordering::SeqCst))
    }

    /// Acquire the sensor and start sampling. A no-op when already tracking.
    ///
    /// A sensor failure is reported as a `TrackingHalted` notice and
    /// returned; tracking stays off.
    pub async fn start(self: &Arc<Self>) -> Result<(), SyncError> {
        if self.is_tracking() {
            debug!("Location tracking already active");
            return Ok(());
        }

        let acquired =
            match tokio::time::timeout(self.sensor_timeout, self.sensor.acquire(Accuracy::Coarse))
                .await
            {
                Ok(result) => result,
                Err(_) => Err(SensorError::Timeout),
            };
        if let Err(reason) = acquired {
            self.sensor.release();
            warn!(error = %reason, "Location tracking could not start");
            self.notices.publish(Notice::TrackingHalted { reason });
            return Err(reason.into());
        }
        let subscription = SensorSubscription {
            sensor: self.sensor.clone(),
        };

        let mut active = self
            .active
            .lock()
            .map_err(|e| SyncError::Storage(format!("tracker state poisoned: {e}")))?;
        if active.is_some() {
            // Raced with another start; the loser's subscription drops here.
            return Ok(());
        }
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let cancel = CancellationToken::new();
        let task = tokio::spawn(self.clone().run(generation, cancel.clone()));
        *active = Some(TrackingHandle {
            generation,
            cancel,
            _subscription: subscription,
            _task: task,
        });
        info!("Location tracking started");
        Ok(())
    }

    /// Stop sampling and release the sensor now. A sample already being
    /// submitted is allowed to finish.
    pub fn stop(&self) {
        let handle = match self.active.lock() {
            Ok(mut active) => active.take(),
            Err(_) => None,
        };
        if let Some(handle) = handle {
            handle.cancel.cancel();
            drop(handle);
            info!("Location tracking stopped");
        }
    }

    /// Stop after a sensor failure, unless tracking was already restarted.
    fn halt(&self, generation: u64, reason: SensorError) {
        let handle = match self.active.lock() {
            Ok(mut active) => match active.as_ref() {
                Some(h) if h.generation == generation => active.take(),
                _ => None,
            },
            Err(_) => None,
        };
        if let Some(handle) = handle {
            handle.cancel.cancel();
            drop(handle);
            warn!(error = %reason, "Location tracking halted");
            self.notices.publish(Notice::TrackingHalted { reason });
        }
    }

    async fn run(self: Arc<Self>, generation: u64, cancel: CancellationToken) {
        let mut battery_rx = self.battery.as_ref().map(|b| b.subscribe());
        let mut level = battery_rx.as_mut().map(|rx| *rx.borrow_and_update());
        let mut last_sample: Option<Instant> = None;

        loop {
            let interval = self.cadence.interval_for(level);
            self.interval_ms
                .store(interval.as_millis() as u64, Ordering::SeqCst);
            let deadline = match last_sample {
                Some(at) => at + interval,
                None => Instant::now(),
            };

            let event = tokio::select! {
                _ = cancel.cancelled() => LoopEvent::Stop,
                _ = tokio::time::sleep_until(deadline) => LoopEvent::Sample,
                changed = next_battery_level(&mut battery_rx) => LoopEvent::Battery(changed),
            };

            match event {
                LoopEvent::Stop => break,
                LoopEvent::Battery(Some(new_level)) => {
                    if level != Some(new_level) {
                        debug!(
                            battery = new_level,
                            interval_s = self.cadence.interval_for(Some(new_level)).as_secs(),
                            "Battery level changed; rescheduling next sample"
                        );
                    }
                    level = Some(new_level);
                }
                LoopEvent::Battery(None) => {
                    debug!("Battery sensor gone; using baseline interval");
                    battery_rx = None;
                    level = None;
                }
                LoopEvent::Sample => {
                    last_sample = Some(Instant::now());
                    if let Err(reason) = self.sample(level).await {
                        if !cancel.is_cancelled() {
                            self.halt(generation, reason);
                        }
                        break;
                    }
                }
            }
        }
        debug!(generation, "Tracking loop exited");
    }

    async fn sample(&self, battery: Option<u8>) -> Result<(), SensorError> {
        let position =
            match tokio::time::timeout(self.sensor_timeout, self.sensor.current_position()).await {
                Ok(result) => result?,
                Err(_) => return Err(SensorError::Timeout),
            };
        let sample = LocationSample {
            latitude: position.latitude,
            longitude: position.longitude,
            accuracy_meters: position.accuracy_meters,
            captured_at: Utc::now(),
            battery_percent: battery,
        };
        self.submit(sample).await;
        Ok(())
    }

    /// Push when online; queue when offline or when the push fails
    /// transiently.
    async fn submit(&self, sample: LocationSample) {
        if self.connectivity.is_online() {
            match with_timeout(self.request_timeout, self.backend.push_location(&sample)).await {
                Ok(()) => {
                    debug!(accuracy_m = sample.accuracy_meters, "Location pushed");
                    return;
                }
                Err(BackendError::Transient(reason)) => {
                    debug!(error = %reason, "Location push failed; queueing");
                }
                Err(e) => {
                    warn!(error = %e, "Location sample rejected by server; dropping");
                    return;
                }
            }
        }
        if let Err(e) = self.queue.enqueue(ActionKind::LocationUpdate { sample }) {
            warn!(error = %e, "Failed to queue location sample");
        }
    }
}

/// Next battery reading; `None` once the sensor is gone. Pends forever
/// without a sensor.
async fn next_battery_level(rx: &mut Option<watch::Receiver<u8>>) -> Option<u8> {
    match rx {
        Some(rx) => match rx.changed().await {
            Ok(()) => Some(*rx.borrow_and_update()),
            Err(_) => None,
        },
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connectivity::ConnectivityState;
    use crate::db::test_db;
    use crate::queue::ActionKindTag;
    use crate::testing::{BackendCall, FakeBattery, FakeBackend, FakeLocationSensor};

    struct Harness {
        tracker: Arc<LocationTracker>,
        sensor: Arc<FakeLocationSensor>,
        battery: Arc<FakeBattery>,
        backend: Arc<FakeBackend>,
        queue: Arc<OfflineActionQueue>,
        notices: NoticeBus,
    }

    fn harness(state: ConnectivityState, battery_level: u8) -> Harness {
        let notices = NoticeBus::new(64);
        let sensor = Arc::new(FakeLocationSensor::new());
        let battery = Arc::new(FakeBattery::new(battery_level));
        let backend = Arc::new(FakeBackend::new());
        let queue = Arc::new(OfflineActionQueue::new(test_db(), 5, notices.clone()));
        let connectivity = Arc::new(ConnectivityMonitor::with_state(state, notices.clone()));
        let tracker = Arc::new(LocationTracker::new(
            sensor.clone(),
            Some(battery.clone()),
            backend.clone(),
            queue.clone(),
            connectivity,
            notices.clone(),
            CadencePolicy::default(),
            Duration::from_secs(20),
            Duration::from_secs(15),
        ));
        Harness {
            tracker,
            sensor,
            battery,
            backend,
            queue,
            notices,
        }
    }

    #[test]
    fn test_cadence_tiers() {
        let policy = CadencePolicy::default();
        assert_eq!(policy.interval_for(Some(100)), Duration::from_secs(45));
        assert_eq!(policy.interval_for(Some(50)), Duration::from_secs(45));
        assert_eq!(policy.interval_for(Some(49)), Duration::from_secs(60));
        assert_eq!(policy.interval_for(Some(20)), Duration::from_secs(60));
        assert_eq!(policy.interval_for(Some(19)), Duration::from_secs(120));
        assert_eq!(policy.interval_for(Some(0)), Duration::from_secs(120));
        assert_eq!(policy.interval_for(None), Duration::from_secs(45));
    }

    #[tokio::test(start_paused = true)]
    async fn test_battery_drop_moves_the_single_deadline() {
        let h = harness(ConnectivityState::Offline, 55);
        let t0 = Instant::now();
        h.tracker.start().await.unwrap();

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(h.tracker.current_interval(), Duration::from_secs(45));
        h.battery.set(15);

        tokio::time::sleep(Duration::from_secs(100)).await;
        assert_eq!(h.tracker.current_interval(), Duration::from_secs(120));
        h.tracker.stop();

        let offsets: Vec<u64> = h
            .sensor
            .sampled_at()
            .into_iter()
            .map(|at| (at - t0).as_secs())
            .collect();
        assert_eq!(offsets, vec![0, 120]);
        assert_eq!(h.queue.len().unwrap(), 2);
        assert!(h.backend.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_online_samples_are_pushed_directly() {
        let h = harness(ConnectivityState::Online, 80);
        h.tracker.start().await.unwrap();
        tokio::time::sleep(Duration::from_secs(50)).await;
        h.tracker.stop();

        assert_eq!(
            h.backend.calls(),
            vec![BackendCall::Location, BackendCall::Location]
        );
        assert!(h.queue.is_empty().unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_push_falls_back_to_queue() {
        let h = harness(ConnectivityState::Online, 80);
        h.backend
            .fail_next_location(BackendError::Transient("HTTP 503".into()));
        h.tracker.start().await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        h.tracker.stop();

        let pending = h.queue.pending().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].kind.tag(), ActionKindTag::LocationUpdate);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_releases_sensor_immediately() {
        let h = harness(ConnectivityState::Offline, 80);
        h.tracker.start().await.unwrap();
        h.tracker.start().await.unwrap();
        assert_eq!(h.sensor.acquire_count(), 1);
        assert!(h.tracker.is_tracking());

        h.tracker.stop();
        assert!(!h.tracker.is_tracking());
        assert_eq!(h.sensor.release_count(), 1);

        let samples = h.sensor.sampled_at().len();
        tokio::time::sleep(Duration::from_secs(300)).await;
        assert!(h.sensor.sampled_at().len() <= samples);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permission_denied_on_start_halts() {
        let h = harness(ConnectivityState::Offline, 80);
        let mut rx = h.notices.subscribe();
        h.sensor.deny_acquire(SensorError::PermissionDenied);

        let err = h.tracker.start().await.unwrap_err();
        assert!(matches!(err, SyncError::Sensor(SensorError::PermissionDenied)));
        assert!(!h.tracker.is_tracking());
        assert_eq!(
            rx.try_recv().unwrap(),
            Notice::TrackingHalted {
                reason: SensorError::PermissionDenied
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_sensor_error_mid_session_halts_without_retry() {
        let h = harness(ConnectivityState::Offline, 80);
        let mut rx = h.notices.subscribe();
        h.tracker.start().await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;

        h.sensor.fail_positions(SensorError::PositionUnavailable);
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(!h.tracker.is_tracking());
        assert_eq!(h.sensor.release_count(), 1);

        let mut halted = Vec::new();
        while let Ok(notice) = rx.try_recv() {
            if let Notice::TrackingHalted { reason } = notice {
                halted.push(reason);
            }
        }
        assert_eq!(halted, vec![SensorError::PositionUnavailable]);

        // No silent retry.
        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(h.sensor.sampled_at().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_battery_sensor_uses_baseline() {
        let notices = NoticeBus::default();
        let sensor = Arc::new(FakeLocationSensor::new());
        let tracker = Arc::new(LocationTracker::new(
            sensor.clone(),
            None,
            Arc::new(FakeBackend::new()),
            Arc::new(OfflineActionQueue::new(test_db(), 5, notices.clone())),
            Arc::new(ConnectivityMonitor::new(notices.clone())),
            notices,
            CadencePolicy::default(),
            Duration::from_secs(20),
            Duration::from_secs(15),
        ));
        let t0 = Instant::now();
        tracker.start().await.unwrap();
        tokio::time::sleep(Duration::from_secs(100)).await;
        tracker.stop();

        let offsets: Vec<u64> = sensor
            .sampled_at()
            .into_iter()
            .map(|at| (at - t0).as_secs())
            .collect();
        assert_eq!(offsets, vec![0, 45, 90]);
    }
}

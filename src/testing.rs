//! In-memory fakes for the backend and device sensors (test-only).

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{watch, Semaphore};
use tokio::time::Instant;

use crate::backend::{AssignmentSnapshot, OrderBackend};
use crate::error::{BackendError, SensorError};
use crate::location::{Accuracy, BatterySensor, LocationSensor, Position};
use crate::model::{LocationSample, OrderStatus, PaymentCollection};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendCall {
    Location,
    Transition { order_id: String, target: OrderStatus },
    Payment { order_id: String },
    Fetch,
}

/// Holds calls while closed. Opening releases every waiter at once.
#[derive(Default)]
pub struct Gate {
    closed: Mutex<Option<Arc<Semaphore>>>,
}

impl Gate {
    pub fn close(&self) {
        *self.closed.lock().unwrap() = Some(Arc::new(Semaphore::new(0)));
    }

    pub fn open(&self) {
        if let Some(sem) = self.closed.lock().unwrap().take() {
            sem.close();
        }
    }

    async fn pass(&self) {
        let sem = self.closed.lock().unwrap().clone();
        if let Some(sem) = sem {
            // Fails once the semaphore is closed, which is the signal to go.
            let _ = sem.acquire().await;
        }
    }
}

/// Backend that succeeds unless told otherwise and records every call.
pub struct FakeBackend {
    calls: Mutex<Vec<BackendCall>>,
    reachable: AtomicBool,
    location_failures: Mutex<VecDeque<BackendError>>,
    transition_failures: Mutex<VecDeque<BackendError>>,
    payment_failures: Mutex<VecDeque<BackendError>>,
    fetch_results: Mutex<VecDeque<Result<AssignmentSnapshot, BackendError>>>,
    snapshot: Mutex<AssignmentSnapshot>,
    fetch_delay: Mutex<Option<std::time::Duration>>,
    fetches_in_flight: AtomicUsize,
    max_fetches_in_flight: AtomicUsize,
    /// Status updates wait here after being recorded.
    pub transitions: Gate,
    /// Payments wait here after being recorded.
    pub payments: Gate,
    /// Fetches wait here after their answer is chosen.
    pub fetches: Gate,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            reachable: AtomicBool::new(true),
            location_failures: Mutex::new(VecDeque::new()),
            transition_failures: Mutex::new(VecDeque::new()),
            payment_failures: Mutex::new(VecDeque::new()),
            fetch_results: Mutex::new(VecDeque::new()),
            snapshot: Mutex::new(AssignmentSnapshot::default()),
            fetch_delay: Mutex::new(None),
            fetches_in_flight: AtomicUsize::new(0),
            max_fetches_in_flight: AtomicUsize::new(0),
            transitions: Gate::default(),
            payments: Gate::default(),
            fetches: Gate::default(),
        }
    }

    pub fn calls(&self) -> Vec<BackendCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    pub fn fail_next_location(&self, err: BackendError) {
        self.location_failures.lock().unwrap().push_back(err);
    }

    pub fn fail_next_transition(&self, err: BackendError) {
        self.transition_failures.lock().unwrap().push_back(err);
    }

    pub fn fail_next_payment(&self, err: BackendError) {
        self.payment_failures.lock().unwrap().push_back(err);
    }

    /// Queue one scripted answer for `fetch_assignments`.
    pub fn script_fetch(&self, result: Result<AssignmentSnapshot, BackendError>) {
        self.fetch_results.lock().unwrap().push_back(result);
    }

    /// Answer used when no scripted fetch result is queued.
    pub fn set_snapshot(&self, snapshot: AssignmentSnapshot) {
        *self.snapshot.lock().unwrap() = snapshot;
    }

    pub fn set_fetch_delay(&self, delay: std::time::Duration) {
        *self.fetch_delay.lock().unwrap() = Some(delay);
    }

    pub fn max_concurrent_fetches(&self) -> usize {
        self.max_fetches_in_flight.load(Ordering::SeqCst)
    }

    fn record(&self, call: BackendCall) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl OrderBackend for FakeBackend {
    async fn push_location(&self, _sample: &LocationSample) -> Result<(), BackendError> {
        self.record(BackendCall::Location);
        match self.location_failures.lock().unwrap().pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn transition_status(
        &self,
        order_id: &str,
        target: OrderStatus,
        _idempotency_key: &str,
    ) -> Result<(), BackendError> {
        self.record(BackendCall::Transition {
            order_id: order_id.to_string(),
            target,
        });
        self.transitions.pass().await;
        match self.transition_failures.lock().unwrap().pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn submit_payment(&self, collection: &PaymentCollection) -> Result<(), BackendError> {
        self.record(BackendCall::Payment {
            order_id: collection.order_id.clone(),
        });
        self.payments.pass().await;
        match self.payment_failures.lock().unwrap().pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn fetch_assignments(&self) -> Result<AssignmentSnapshot, BackendError> {
        self.record(BackendCall::Fetch);
        let now = self.fetches_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_fetches_in_flight.fetch_max(now, Ordering::SeqCst);

        let delay = *self.fetch_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.fetches_in_flight.fetch_sub(1, Ordering::SeqCst);

        let scripted = self.fetch_results.lock().unwrap().pop_front();
        let result = match scripted {
            Some(result) => result,
            None => Ok(self.snapshot.lock().unwrap().clone()),
        };
        self.fetches.pass().await;
        result
    }

    async fn health_check(&self) -> bool {
        self.reachable.load(Ordering::SeqCst)
    }
}

/// Location sensor returning a fixed position.
pub struct FakeLocationSensor {
    acquire_error: Mutex<Option<SensorError>>,
    position_error: Mutex<Option<SensorError>>,
    sampled_at: Mutex<Vec<Instant>>,
    acquired: AtomicUsize,
    released: AtomicUsize,
}

impl FakeLocationSensor {
    pub fn new() -> Self {
        Self {
            acquire_error: Mutex::new(None),
            position_error: Mutex::new(None),
            sampled_at: Mutex::new(Vec::new()),
            acquired: AtomicUsize::new(0),
            released: AtomicUsize::new(0),
        }
    }

    pub fn deny_acquire(&self, err: SensorError) {
        *self.acquire_error.lock().unwrap() = Some(err);
    }

    /// Every position read fails from now on.
    pub fn fail_positions(&self, err: SensorError) {
        *self.position_error.lock().unwrap() = Some(err);
    }

    /// Times of successful position reads.
    pub fn sampled_at(&self) -> Vec<Instant> {
        self.sampled_at.lock().unwrap().clone()
    }

    pub fn acquire_count(&self) -> usize {
        self.acquired.load(Ordering::SeqCst)
    }

    pub fn release_count(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LocationSensor for FakeLocationSensor {
    async fn acquire(&self, _accuracy: Accuracy) -> Result<(), SensorError> {
        if let Some(err) = *self.acquire_error.lock().unwrap() {
            return Err(err);
        }
        self.acquired.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn current_position(&self) -> Result<Position, SensorError> {
        if let Some(err) = *self.position_error.lock().unwrap() {
            return Err(err);
        }
        self.sampled_at.lock().unwrap().push(Instant::now());
        Ok(Position {
            latitude: 37.9838,
            longitude: 23.7275,
            accuracy_meters: 120.0,
        })
    }

    fn release(&self) {
        self.released.fetch_add(1, Ordering::SeqCst);
    }
}

/// Battery whose level is set by the test.
pub struct FakeBattery {
    tx: watch::Sender<u8>,
}

impl FakeBattery {
    pub fn new(level: u8) -> Self {
        let (tx, _rx) = watch::channel(level);
        Self { tx }
    }

    pub fn set(&self, level: u8) {
        self.tx.send_replace(level);
    }
}

impl BatterySensor for FakeBattery {
    fn subscribe(&self) -> watch::Receiver<u8> {
        self.tx.subscribe()
    }
}

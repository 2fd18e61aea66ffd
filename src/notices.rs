//! User-facing notices emitted by the sync core.
//!
//! Components publish onto a broadcast channel; the embedding app (or the
//! headless binary's logger) subscribes and renders them.

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::debug;

use crate::connectivity::ConnectivityState;
use crate::error::SensorError;
use crate::model::OrderStatus;
use crate::queue::ActionKindTag;

/// Why an order left the active list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RemovalReason {
    Delivered,
    Cancelled,
    Reassigned,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notice {
    ConnectivityChanged {
        state: ConnectivityState,
    },
    /// A mutating action could not be sent now and will sync later.
    QueuedForSync {
        action_id: i64,
        kind: ActionKindTag,
        order_id: Option<String>,
    },
    /// The action hit the retry cap and was dropped. Data may need manual
    /// reconciliation.
    ActionDropped {
        action_id: i64,
        kind: ActionKindTag,
        order_id: Option<String>,
        attempts: u32,
        last_error: String,
    },
    /// The server refused the action for a non-transient reason.
    ActionRejected {
        action_id: i64,
        kind: ActionKindTag,
        order_id: Option<String>,
        reason: String,
    },
    OrderConflict {
        order_id: String,
        server_status: Option<OrderStatus>,
        message: String,
    },
    OrderRemoved {
        order_id: String,
        reason: RemovalReason,
    },
    DegradedConnectivity {
        consecutive_failures: u32,
        next_poll_ms: u64,
    },
    PollRecovered,
    TrackingHalted {
        reason: SensorError,
    },
    ServerMessage {
        message: String,
    },
}

/// Cloneable publisher handle over a broadcast channel.
#[derive(Debug, Clone)]
pub struct NoticeBus {
    tx: broadcast::Sender<Notice>,
}

impl NoticeBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notice> {
        self.tx.subscribe()
    }

    /// Publish a notice. Having no subscribers is not an error.
    pub fn publish(&self, notice: Notice) {
        if self.tx.send(notice).is_err() {
            debug!("notice dropped: no subscribers");
        }
    }
}

impl Default for NoticeBus {
    fn default() -> Self {
        Self::new(256)
    }
}

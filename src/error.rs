//! Error taxonomy for the sync core.
//!
//! Every failure ends at the component boundary that produced it as one of:
//! a retry (transient), a synchronous rejection (validation), a rollback to
//! server truth (conflict), a dropped action (exhausted) or a halted sensor.

use serde::Serialize;
use thiserror::Error;

use crate::model::{Money, OrderStatus};

/// Failure reported by the backend order service.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    /// Timeout, connection loss or a temporary server error. Safe to retry.
    #[error("transient backend failure: {0}")]
    Transient(String),

    /// The server state diverged (e.g. the order was reassigned).
    #[error("order state conflict: {message}")]
    Conflict {
        server_status: Option<OrderStatus>,
        message: String,
    },

    /// Semantic rejection (wrong agent, invalid order, bad credentials).
    #[error("rejected by backend: {0}")]
    Rejected(String),
}

impl BackendError {
    pub fn is_transient(&self) -> bool {
        matches!(self, BackendError::Transient(_))
    }
}

/// Device location sensor failures. Each one halts tracking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorError {
    #[error("location permission denied")]
    PermissionDenied,
    #[error("position unavailable")]
    PositionUnavailable,
    #[error("location request timed out")]
    Timeout,
    #[error("location tracking is not supported on this device")]
    Unsupported,
}

/// Local validation failures. Raised before any network call and never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("order {0} is not assigned to this agent")]
    UnknownOrder(String),

    #[error("order {order_id} cannot move from {from} to {to}")]
    InvalidTransition {
        order_id: String,
        from: OrderStatus,
        to: OrderStatus,
    },

    #[error("order {0} needs a cash collection before it can be delivered")]
    PaymentRequired(String),

    #[error("order {0} is prepaid; there is no cash to collect")]
    NotCashOnDelivery(String),

    #[error("order {order_id} is {status}; cash is collected only when out for delivery")]
    NotOutForDelivery {
        order_id: String,
        status: OrderStatus,
    },

    #[error("collected {collected} is less than the order total {total} for order {order_id}")]
    InsufficientPayment {
        order_id: String,
        total: Money,
        collected: Money,
    },

    #[error("cash has already been collected for order {0}")]
    AlreadyCollected(String),
}

/// Error returned by the public sync operations.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("order {order_id} changed on the server: {message}")]
    Conflict {
        order_id: String,
        server_status: Option<OrderStatus>,
        message: String,
    },

    #[error("order {order_id} was rejected by the server: {reason}")]
    Rejected { order_id: String, reason: String },

    #[error(transparent)]
    Sensor(#[from] SensorError),

    #[error("local storage error: {0}")]
    Storage(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl From<rusqlite::Error> for SyncError {
    fn from(e: rusqlite::Error) -> Self {
        SyncError::Storage(e.to_string())
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        SyncError::Storage(format!("payload encoding: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_messages_are_user_facing() {
        let err = SyncError::from(ValidationError::InsufficientPayment {
            order_id: "ord-9".into(),
            total: Money::from_cents(1000),
            collected: Money::from_cents(950),
        });
        assert_eq!(
            err.to_string(),
            "collected 9.50 is less than the order total 10.00 for order ord-9"
        );

        let err = ValidationError::InvalidTransition {
            order_id: "ord-1".into(),
            from: OrderStatus::Assigned,
            to: OrderStatus::Delivered,
        };
        assert_eq!(err.to_string(), "order ord-1 cannot move from assigned to delivered");
    }

    #[test]
    fn test_only_transient_backend_errors_are_retryable() {
        assert!(BackendError::Transient("timeout".into()).is_transient());
        assert!(!BackendError::Rejected("wrong agent".into()).is_transient());
        assert!(!BackendError::Conflict {
            server_status: Some(OrderStatus::Cancelled),
            message: "reassigned".into(),
        }
        .is_transient());
    }
}

//! Core data model shared by the sync components.
//!
//! Monetary values are integer minor units (`Money`) so change calculation
//! is exact. Order status is a forward-only graph; `Cancelled` is only ever
//! reported by the server.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Money
// ---------------------------------------------------------------------------

/// Amount in minor currency units (cents).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Money(i64);

impl Money {
    pub const ZERO: Money = Money(0);

    pub const fn from_cents(cents: i64) -> Self {
        Money(cents)
    }

    pub const fn cents(self) -> i64 {
        self.0
    }

    /// Convert a major-unit float (e.g. `12.5`) to cents, rounding half away
    /// from zero. Returns `None` for NaN/infinite input.
    pub fn from_major(amount: f64) -> Option<Self> {
        if !amount.is_finite() {
            return None;
        }
        let cents = (amount * 100.0).round();
        if cents.abs() > i64::MAX as f64 {
            return None;
        }
        Some(Money(cents as i64))
    }

    pub fn checked_sub(self, other: Money) -> Option<Money> {
        self.0.checked_sub(other.0).map(Money)
    }

    pub fn is_negative(self) -> bool {
        self.0 < 0
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        write!(f, "{sign}{}.{:02}", abs / 100, abs % 100)
    }
}

impl FromStr for Money {
    type Err = String;

    /// Parse a decimal amount such as `12`, `12.5` or `12.50`.
    /// At most two fractional digits are accepted.
    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let trimmed = raw.trim();
        let (negative, digits) = match trimmed.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, trimmed),
        };
        let (whole, frac) = match digits.split_once('.') {
            Some((w, f)) => (w, f),
            None => (digits, ""),
        };
        if whole.is_empty() && frac.is_empty() {
            return Err(format!("Invalid amount: {raw:?}"));
        }
        if frac.len() > 2 {
            return Err(format!("Too many decimal places in amount: {raw:?}"));
        }
        if !whole.chars().all(|c| c.is_ascii_digit()) || !frac.chars().all(|c| c.is_ascii_digit())
        {
            return Err(format!("Invalid amount: {raw:?}"));
        }

        let whole_cents: i64 = if whole.is_empty() {
            0
        } else {
            whole
                .parse::<i64>()
                .ok()
                .and_then(|w| w.checked_mul(100))
                .ok_or_else(|| format!("Amount out of range: {raw:?}"))?
        };
        let frac_cents: i64 = match frac.len() {
            0 => 0,
            1 => frac.parse::<i64>().unwrap_or(0) * 10,
            _ => frac.parse::<i64>().unwrap_or(0),
        };
        let cents = whole_cents
            .checked_add(frac_cents)
            .ok_or_else(|| format!("Amount out of range: {raw:?}"))?;
        Ok(Money(if negative { -cents } else { cents }))
    }
}

// ---------------------------------------------------------------------------
// Order status
// ---------------------------------------------------------------------------

/// Lifecycle status of an assigned order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Assigned,
    Accepted,
    PickedUp,
    OutForDelivery,
    Delivered,
    /// Server-side only; an agent can never request it.
    Cancelled,
}

impl OrderStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            OrderStatus::Assigned => "assigned",
            OrderStatus::Accepted => "accepted",
            OrderStatus::PickedUp => "picked_up",
            OrderStatus::OutForDelivery => "out_for_delivery",
            OrderStatus::Delivered => "delivered",
            OrderStatus::Cancelled => "cancelled",
        }
    }

    /// Lenient parse: accepts snake_case, kebab-case and any casing.
    pub fn parse(raw: &str) -> Option<Self> {
        let normalized = raw.trim().to_ascii_lowercase().replace(['-', ' '], "_");
        match normalized.as_str() {
            "assigned" => Some(OrderStatus::Assigned),
            "accepted" => Some(OrderStatus::Accepted),
            "picked_up" | "pickedup" => Some(OrderStatus::PickedUp),
            "out_for_delivery" | "outfordelivery" => Some(OrderStatus::OutForDelivery),
            "delivered" => Some(OrderStatus::Delivered),
            "cancelled" | "canceled" => Some(OrderStatus::Cancelled),
            _ => None,
        }
    }

    fn rank(self) -> Option<u8> {
        match self {
            OrderStatus::Assigned => Some(0),
            OrderStatus::Accepted => Some(1),
            OrderStatus::PickedUp => Some(2),
            OrderStatus::OutForDelivery => Some(3),
            OrderStatus::Delivered => Some(4),
            OrderStatus::Cancelled => None,
        }
    }

    /// The only status an agent may move to from `self`.
    pub fn next(self) -> Option<Self> {
        match self {
            OrderStatus::Assigned => Some(OrderStatus::Accepted),
            OrderStatus::Accepted => Some(OrderStatus::PickedUp),
            OrderStatus::PickedUp => Some(OrderStatus::OutForDelivery),
            OrderStatus::OutForDelivery => Some(OrderStatus::Delivered),
            OrderStatus::Delivered | OrderStatus::Cancelled => None,
        }
    }

    /// `true` when `self` comes strictly before `other` on the forward path.
    pub fn precedes(self, other: OrderStatus) -> bool {
        match (self.rank(), other.rank()) {
            (Some(a), Some(b)) => a < b,
            _ => false,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, OrderStatus::Delivered | OrderStatus::Cancelled)
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrderStatus {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        OrderStatus::parse(raw).ok_or_else(|| format!("Unknown order status: {raw}"))
    }
}

// ---------------------------------------------------------------------------
// Payment method
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    Prepaid,
    #[serde(alias = "cod")]
    CashOnDelivery,
}

impl PaymentMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            PaymentMethod::Prepaid => "prepaid",
            PaymentMethod::CashOnDelivery => "cash_on_delivery",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "prepaid" | "online" | "card" => Some(PaymentMethod::Prepaid),
            "cash_on_delivery" | "cod" | "cash" => Some(PaymentMethod::CashOnDelivery),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Assignments
// ---------------------------------------------------------------------------

/// Cached view of an order assigned to this agent.
///
/// Status is two-phase: `confirmed_status` is the last value the server
/// acknowledged, `optimistic_status` a local write still awaiting
/// confirmation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderAssignment {
    pub order_id: String,
    pub confirmed_status: OrderStatus,
    pub optimistic_status: Option<OrderStatus>,
    pub payment_method: PaymentMethod,
    pub total_amount: Money,
    pub payment_collected: bool,
    pub updated_at: DateTime<Utc>,
}

impl OrderAssignment {
    pub fn new(
        order_id: impl Into<String>,
        status: OrderStatus,
        payment_method: PaymentMethod,
        total_amount: Money,
    ) -> Self {
        Self {
            order_id: order_id.into(),
            confirmed_status: status,
            optimistic_status: None,
            payment_method,
            total_amount,
            payment_collected: false,
            updated_at: Utc::now(),
        }
    }

    /// Status the UI should show.
    pub fn status(&self) -> OrderStatus {
        self.optimistic_status.unwrap_or(self.confirmed_status)
    }

    pub fn is_pending_confirmation(&self) -> bool {
        self.optimistic_status.is_some()
    }

    pub fn requires_cash_collection(&self) -> bool {
        self.payment_method == PaymentMethod::CashOnDelivery
    }
}

/// Server-side view of an assignment as returned by the order list read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteAssignment {
    pub order_id: String,
    pub status: OrderStatus,
    pub payment_method: PaymentMethod,
    #[serde(alias = "totalCents")]
    pub total_amount: Money,
}

// ---------------------------------------------------------------------------
// Location
// ---------------------------------------------------------------------------

/// One captured device position. Immutable once captured.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationSample {
    pub latitude: f64,
    pub longitude: f64,
    pub accuracy_meters: f64,
    pub captured_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub battery_percent: Option<u8>,
}

// ---------------------------------------------------------------------------
// Payment collection
// ---------------------------------------------------------------------------

/// Cash collected for a cash-on-delivery order. Terminal once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentCollection {
    pub id: Uuid,
    pub order_id: String,
    pub order_total: Money,
    pub collected_amount: Money,
    pub change_given: Money,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    pub collected_at: DateTime<Utc>,
}

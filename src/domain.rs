// ===============================
// src/domain.rs
// ===============================
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};

/// Weight of gold in grams.
pub type Grams = Decimal;
/// Currency amount (price per gram, totals).
pub type Money = Decimal;

pub type OwnerId = String;
pub type ActorId = String;
pub type CartId = u64;
pub type TxId = u64;
pub type PriceId = u64;
pub type RedemptionId = u64;

pub const GRAMS_DP: u32 = 4;
pub const MONEY_DP: u32 = 2;

/// Round a weight to 4 places, half-up.
pub fn round_grams(v: Grams) -> Grams {
    v.round_dp_with_strategy(GRAMS_DP, RoundingStrategy::MidpointAwayFromZero)
}

/// Round a currency amount to 2 places, half-up.
pub fn round_money(v: Money) -> Money {
    v.round_dp_with_strategy(MONEY_DP, RoundingStrategy::MidpointAwayFromZero)
}

/// `grams * price` rounded to money, `None` when it does not fit a Decimal.
pub fn checked_amount(grams: Grams, price: Money) -> Option<Money> {
    grams.checked_mul(price).map(round_money)
}

/// Caller identity as handed over by the auth layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub owner_id: OwnerId,
    pub kyc_verified: bool,
}

impl Identity {
    pub fn new(owner_id: impl Into<OwnerId>, kyc_verified: bool) -> Self {
        Self { owner_id: owner_id.into(), kyc_verified }
    }
}

// ---- Price ----

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriceSource { Manual, Api }

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction { Increase, Decrease, None }

impl Direction {
    /// Strict comparison: equal prices are `None`.
    pub fn between(previous: Money, next: Money) -> Self {
        if next > previous {
            Direction::Increase
        } else if next < previous {
            Direction::Decrease
        } else {
            Direction::None
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PricePoint {
    pub id: PriceId,
    pub price_per_gram: Money,
    pub set_at: DateTime<Utc>,
    /// UTC calendar day of `set_at`; at most one point per day.
    pub day: NaiveDate,
    pub set_by: ActorId,
    pub source: PriceSource,
    pub delta_amount: Money,
    pub direction: Direction,
}

// ---- Inventory ----

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryRecord {
    pub available_grams: Grams,
    pub updated_at: DateTime<Utc>,
}

// ---- Holding ----

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Holding {
    pub owner_id: OwnerId,
    pub total_grams: Grams,
    pub average_cost_per_gram: Money,
    pub total_invested: Money,
    pub last_activity_at: Option<DateTime<Utc>>,
}

impl Holding {
    /// Zero-value holding for an owner that never bought.
    pub fn empty(owner_id: impl Into<OwnerId>) -> Self {
        Self {
            owner_id: owner_id.into(),
            total_grams: Decimal::ZERO,
            average_cost_per_gram: Decimal::ZERO,
            total_invested: Decimal::ZERO,
            last_activity_at: None,
        }
    }
}

// ---- Cart ----

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelReason { ByOwner, Superseded }

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum CartStatus {
    Pending,
    Completed { at: DateTime<Utc>, transaction_id: TxId },
    Cancelled { at: DateTime<Utc>, reason: CancelReason },
    Expired { at: DateTime<Utc> },
}

impl CartStatus {
    pub fn is_terminal(&self) -> bool { !matches!(self, CartStatus::Pending) }

    pub fn label(&self) -> &'static str {
        match self {
            CartStatus::Pending => "pending",
            CartStatus::Completed { .. } => "completed",
            CartStatus::Cancelled { .. } => "cancelled",
            CartStatus::Expired { .. } => "expired",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cart {
    pub id: CartId,
    pub owner_id: OwnerId,
    pub grams: Grams,
    pub price_per_gram_snapshot: Money,
    pub total_amount_snapshot: Money,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub status: CartStatus,
}

impl Cart {
    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        matches!(self.status, CartStatus::Pending) && now > self.expires_at
    }
}

// ---- Transaction ----

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradeKind { Buy, Sell }

impl TradeKind {
    pub fn as_str(&self) -> &'static str {
        match self { TradeKind::Buy => "buy", TradeKind::Sell => "sell" }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradeStatus { Success }

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: TxId,
    pub owner_id: OwnerId,
    pub kind: TradeKind,
    pub grams: Grams,
    pub price_per_gram: Money,
    pub total_amount: Money,
    pub executed_at: DateTime<Utc>,
    pub status: TradeStatus,
}

// ---- Redemption ----

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RedemptionMode { Pickup, Delivery }

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RedemptionStatus {
    Pending,
    Approved { at: DateTime<Utc>, by: ActorId },
    Rejected { at: DateTime<Utc>, by: ActorId },
    Completed { approved_at: DateTime<Utc>, fulfilled_at: DateTime<Utc> },
}

impl RedemptionStatus {
    pub fn label(&self) -> &'static str {
        match self {
            RedemptionStatus::Pending => "pending",
            RedemptionStatus::Approved { .. } => "approved",
            RedemptionStatus::Rejected { .. } => "rejected",
            RedemptionStatus::Completed { .. } => "completed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedemptionRequest {
    pub id: RedemptionId,
    pub owner_id: OwnerId,
    pub grams: Grams,
    pub mode: RedemptionMode,
    pub requested_at: DateTime<Utc>,
    pub status: RedemptionStatus,
}

// ---- Side-effect payloads ----

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub owner_id: OwnerId,
    pub message: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub action: String,
    pub actor_id: String,
    pub target_type: String,
    pub target_id: String,
    pub changes: serde_json::Value,
    pub at: DateTime<Utc>,
}

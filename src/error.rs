// ===============================
// src/error.rs
// ===============================
use chrono::NaiveDate;
use thiserror::Error;

use crate::domain::{CartId, Grams, Money, OwnerId};

/// Storage-layer failures. Never shown to callers as-is.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("write conflict on {key}")]
    Conflict { key: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LedgerError {
    #[error("KYC not verified for {0}")]
    KycNotVerified(OwnerId),
    #[error("invalid quantity {0}: must be greater than zero")]
    InvalidQuantity(Grams),
    #[error("invalid price {0}: must be greater than zero")]
    InvalidPrice(Money),
    #[error("insufficient inventory: requested {requested} g, available {available} g")]
    InsufficientInventory { requested: Grams, available: Grams },
    #[error("insufficient holding: requested {requested} g, held {held} g")]
    InsufficientHolding { requested: Grams, held: Grams },
    #[error("gold price not set")]
    NoPriceSet,
    #[error("no inventory record")]
    NoInventory,
    #[error("price already set for {day} at {existing_price}")]
    AlreadySetToday { day: NaiveDate, existing_price: Money },
    #[error("no active cart")]
    NoActiveCart,
    #[error("cart {cart_id} has expired")]
    CartExpired { cart_id: CartId },
    #[error("redemption request not found")]
    RedemptionNotFound,
    #[error("invalid transition from {from} to {to}")]
    InvalidTransition { from: &'static str, to: &'static str },
    #[error("commit aborted after {attempts} attempt(s), safe to retry")]
    CommitAborted { attempts: u32 },
    #[error("internal error: {0}")]
    Internal(String),
}

impl LedgerError {
    /// Stable code for callers; the Display text is the human message.
    pub fn kind(&self) -> &'static str {
        match self {
            LedgerError::KycNotVerified(_) => "kyc_not_verified",
            LedgerError::InvalidQuantity(_) => "invalid_quantity",
            LedgerError::InvalidPrice(_) => "invalid_price",
            LedgerError::InsufficientInventory { .. } => "insufficient_inventory",
            LedgerError::InsufficientHolding { .. } => "insufficient_holding",
            LedgerError::NoPriceSet => "no_price_set",
            LedgerError::NoInventory => "no_inventory",
            LedgerError::AlreadySetToday { .. } => "already_set_today",
            LedgerError::NoActiveCart => "no_active_cart",
            LedgerError::CartExpired { .. } => "cart_expired",
            LedgerError::RedemptionNotFound => "redemption_not_found",
            LedgerError::InvalidTransition { .. } => "invalid_transition",
            LedgerError::CommitAborted { .. } => "commit_aborted",
            LedgerError::Internal(_) => "internal",
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, LedgerError::CommitAborted { .. })
    }
}

impl From<StoreError> for LedgerError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Conflict { .. } => LedgerError::CommitAborted { attempts: 1 },
        }
    }
}

/// File persistence failures (snapshots, audit journal).
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

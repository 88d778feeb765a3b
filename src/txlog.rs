// ===============================
// src/txlog.rs (append-only trade journal)
// ===============================
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::domain::{checked_amount, Grams, Money, TradeKind, TradeStatus, Transaction};
use crate::error::LedgerError;
use crate::store::{Store, Tx};

/// Stage exactly one journal row for a committed trade.
pub fn append_in(
    tx: &mut Tx<'_>,
    owner: &str,
    kind: TradeKind,
    grams: Grams,
    price: Money,
    now: DateTime<Utc>,
) -> Result<Transaction, LedgerError> {
    let total_amount = checked_amount(grams, price).ok_or(LedgerError::InvalidQuantity(grams))?;
    let t = Transaction {
        id: tx.next_id(),
        owner_id: owner.to_string(),
        kind,
        grams,
        price_per_gram: price,
        total_amount,
        executed_at: now,
        status: TradeStatus::Success,
    };
    tx.append_transaction(t.clone());
    Ok(t)
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TxFilter {
    pub kind: Option<TradeKind>,
    pub limit: Option<usize>,
}

#[derive(Clone)]
pub struct TransactionLog {
    store: Arc<Store>,
}

impl TransactionLog {
    pub fn new(store: Arc<Store>) -> Self { Self { store } }

    /// Owner history, newest first.
    pub fn for_owner(&self, owner: &str, filter: &TxFilter) -> Vec<Transaction> {
        self.store.read(|t| {
            t.transactions
                .iter()
                .rev()
                .filter(|x| x.owner_id == owner)
                .filter(|x| filter.kind.map_or(true, |k| x.kind == k))
                .take(filter.limit.unwrap_or(usize::MAX))
                .cloned()
                .collect()
        })
    }

    /// Whole journal in commit order.
    pub fn all(&self) -> Vec<Transaction> { self.store.read(|t| t.transactions.clone()) }
}

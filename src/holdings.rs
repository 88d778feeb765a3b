// ===============================
// src/holdings.rs (per-owner position & cost basis)
// ===============================
//
// Cost basis ikut weighted average:
//   avg_baru = (unit_lama*avg_lama + unit*harga) / (unit_lama + unit)
// total_invested selalu dihitung ulang = unit * avg (bukan dijumlah),
// supaya tidak ada drift pembulatan setelah banyak transaksi kecil.
//
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;

use crate::clock::Clock;
use crate::domain::{checked_amount, round_grams, round_money, Grams, Holding, Money, OwnerId};
use crate::error::LedgerError;
use crate::inventory::positive_grams;
use crate::store::{Store, Tx};

pub fn apply_buy_in(
    tx: &mut Tx<'_>,
    owner: &str,
    grams: Grams,
    price: Money,
    now: DateTime<Utc>,
) -> Result<Holding, LedgerError> {
    let overflow = move || LedgerError::InvalidQuantity(grams);
    let mut h = tx.holding(owner).unwrap_or_else(|| Holding::empty(owner));
    let units = h.total_grams.checked_add(grams).map(round_grams).ok_or_else(overflow)?;
    h.average_cost_per_gram = if h.total_grams.is_zero() {
        round_money(price)
    } else {
        let cost = h
            .total_grams
            .checked_mul(h.average_cost_per_gram)
            .zip(grams.checked_mul(price))
            .and_then(|(held, bought)| held.checked_add(bought))
            .and_then(|c| c.checked_div(units))
            .ok_or_else(overflow)?;
        round_money(cost)
    };
    h.total_grams = units;
    h.total_invested = checked_amount(units, h.average_cost_per_gram).ok_or_else(overflow)?;
    h.last_activity_at = Some(now);
    tx.put_holding(h.clone());
    Ok(h)
}

/// Reduce the position; average cost is kept as is.
pub fn apply_sell_in(
    tx: &mut Tx<'_>,
    owner: &str,
    grams: Grams,
    now: DateTime<Utc>,
) -> Result<Holding, LedgerError> {
    let Some(mut h) = tx.holding(owner) else {
        return Err(LedgerError::InsufficientHolding { requested: grams, held: Decimal::ZERO });
    };
    if h.total_grams < grams {
        return Err(LedgerError::InsufficientHolding { requested: grams, held: h.total_grams });
    }
    h.total_grams = round_grams(h.total_grams - grams);
    // never larger than the product stored before the sell
    h.total_invested = checked_amount(h.total_grams, h.average_cost_per_gram).unwrap_or(h.total_invested);
    h.last_activity_at = Some(now);
    tx.put_holding(h.clone());
    Ok(h)
}

/// Owner position marked against the current price.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Valuation {
    pub owner_id: OwnerId,
    pub total_grams: Grams,
    pub average_cost_per_gram: Money,
    pub total_invested: Money,
    /// `None` before any price was ever set.
    pub current_price: Option<Money>,
    pub current_value: Money,
    pub unrealized_gain: Money,
}

#[derive(Clone)]
pub struct HoldingsLedger {
    store: Arc<Store>,
    clock: Arc<dyn Clock>,
    attempts: u32,
}

impl HoldingsLedger {
    pub fn new(store: Arc<Store>, clock: Arc<dyn Clock>, attempts: u32) -> Self {
        Self { store, clock, attempts }
    }

    /// Never fails: an owner that never traded gets a zero-value holding.
    pub fn get_holding(&self, owner: &str) -> Holding {
        self.store
            .read(|t| t.holdings.get(owner).cloned())
            .unwrap_or_else(|| Holding::empty(owner))
    }

    pub fn apply_buy(&self, owner: &str, grams: Grams, price: Money) -> Result<Holding, LedgerError> {
        let grams = positive_grams(grams)?;
        if price <= Decimal::ZERO {
            return Err(LedgerError::InvalidPrice(price));
        }
        let now = self.clock.now();
        self.store.transact(self.attempts, |tx| apply_buy_in(tx, owner, grams, price, now))
    }

    pub fn apply_sell(&self, owner: &str, grams: Grams) -> Result<Holding, LedgerError> {
        let grams = positive_grams(grams)?;
        let now = self.clock.now();
        self.store.transact(self.attempts, |tx| apply_sell_in(tx, owner, grams, now))
    }

    pub fn valuation(&self, owner: &str) -> Valuation {
        let (h, price) = self.store.read(|t| {
            (
                t.holdings.get(owner).cloned().unwrap_or_else(|| Holding::empty(owner)),
                t.current_price.as_ref().map(|p| p.price_per_gram),
            )
        });
        let mark = price.unwrap_or(h.average_cost_per_gram);
        let current_value = checked_amount(h.total_grams, mark).unwrap_or(Decimal::MAX);
        Valuation {
            owner_id: h.owner_id,
            total_grams: h.total_grams,
            average_cost_per_gram: h.average_cost_per_gram,
            total_invested: h.total_invested,
            current_price: price,
            current_value,
            unrealized_gain: current_value - h.total_invested,
        }
    }
}

// ===============================
// src/inventory.rs (shared vault stock)
// ===============================
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde_json::json;
use tracing::{info, warn};

use crate::clock::Clock;
use crate::domain::{round_grams, Grams, InventoryRecord};
use crate::effects::{Audit, SideEffects};
use crate::error::LedgerError;
use crate::metrics;
use crate::store::{Store, Tx};

pub(crate) fn positive_grams(grams: Grams) -> Result<Grams, LedgerError> {
    let g = round_grams(grams);
    if g <= Decimal::ZERO {
        return Err(LedgerError::InvalidQuantity(grams));
    }
    Ok(g)
}

/// Conditional decrement inside `tx`. A missing record counts as zero stock.
pub fn debit_in(tx: &mut Tx<'_>, grams: Grams, now: DateTime<Utc>) -> Result<Grams, LedgerError> {
    let available = tx.inventory().map(|r| r.available_grams).unwrap_or(Decimal::ZERO);
    if available < grams {
        return Err(LedgerError::InsufficientInventory { requested: grams, available });
    }
    let left = round_grams(available - grams);
    tx.put_inventory(InventoryRecord { available_grams: left, updated_at: now });
    Ok(left)
}

/// Increment inside `tx`, creating the singleton on first use.
pub fn credit_in(tx: &mut Tx<'_>, grams: Grams, now: DateTime<Utc>) -> Result<Grams, LedgerError> {
    let available = tx.inventory().map(|r| r.available_grams).unwrap_or(Decimal::ZERO);
    let total = available
        .checked_add(grams)
        .map(round_grams)
        .ok_or(LedgerError::InvalidQuantity(grams))?;
    tx.put_inventory(InventoryRecord { available_grams: total, updated_at: now });
    Ok(total)
}

/// Read-only sufficiency check, used by cart creation.
pub fn ensure_available_in(tx: &mut Tx<'_>, grams: Grams) -> Result<Grams, LedgerError> {
    let available = tx.inventory().map(|r| r.available_grams).unwrap_or(Decimal::ZERO);
    if available < grams {
        return Err(LedgerError::InsufficientInventory { requested: grams, available });
    }
    Ok(available)
}

#[derive(Clone)]
pub struct InventoryStore {
    store: Arc<Store>,
    clock: Arc<dyn Clock>,
    effects: SideEffects,
    attempts: u32,
}

impl InventoryStore {
    pub fn new(store: Arc<Store>, clock: Arc<dyn Clock>, effects: SideEffects, attempts: u32) -> Self {
        Self { store, clock, effects, attempts }
    }

    pub fn get_available(&self) -> Result<Grams, LedgerError> {
        self.store
            .read(|t| t.inventory.as_ref().map(|r| r.available_grams))
            .ok_or(LedgerError::NoInventory)
    }

    /// Debit `grams` or fail without touching the record. Returns the new total.
    pub fn reserve_and_debit(&self, grams: Grams) -> Result<Grams, LedgerError> {
        let grams = positive_grams(grams)?;
        let now = self.clock.now();
        let left = self.store.transact(self.attempts, |tx| debit_in(tx, grams, now))?;
        metrics::set_inventory(left);
        Ok(left)
    }

    pub fn credit(&self, grams: Grams) -> Result<Grams, LedgerError> {
        let grams = positive_grams(grams)?;
        let now = self.clock.now();
        let total = self.store.transact(self.attempts, |tx| credit_in(tx, grams, now))?;
        metrics::set_inventory(total);
        Ok(total)
    }

    /// Admin stock-in.
    pub async fn add_stock(&self, actor: &str, grams: Grams) -> Result<Grams, LedgerError> {
        let total = self.credit(grams).map_err(|e| {
            warn!(%actor, %grams, kind = e.kind(), "inventory addition rejected");
            e
        })?;
        info!(%actor, %grams, %total, "inventory added");
        self.audit_adjustment("add_inventory", actor, grams, total).await;
        Ok(total)
    }

    /// Admin stock-out; never below zero.
    pub async fn remove_stock(&self, actor: &str, grams: Grams) -> Result<Grams, LedgerError> {
        let left = self.reserve_and_debit(grams).map_err(|e| {
            warn!(%actor, %grams, kind = e.kind(), "inventory removal rejected");
            e
        })?;
        info!(%actor, %grams, %left, "inventory removed");
        self.audit_adjustment("remove_inventory", actor, grams, left).await;
        Ok(left)
    }

    async fn audit_adjustment(&self, action: &str, actor: &str, grams: Grams, total: Grams) {
        self.effects
            .audit(
                Audit {
                    action,
                    actor_id: actor,
                    target_type: "Inventory",
                    target_id: "vault".into(),
                    changes: json!({ "grams": round_grams(grams), "available_grams": total }),
                },
                self.clock.now(),
            )
            .await;
    }
}

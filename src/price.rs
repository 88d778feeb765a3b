// ===============================
// src/price.rs (daily price ratchet + history)
// ===============================
use std::sync::Arc;

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use crate::clock::Clock;
use crate::domain::{round_money, Direction, Money, PricePoint, PriceSource};
use crate::effects::{Audit, SideEffects};
use crate::error::LedgerError;
use crate::metrics::{self, PRICE_SETS};
use crate::store::Store;

/// Outcome of a successful `set_price`.
#[derive(Debug, Clone, Serialize)]
pub struct PriceChange {
    pub point: PricePoint,
    pub previous_price: Option<Money>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Quote {
    pub point: PricePoint,
    /// Today's (UTC) price has already been fixed.
    pub set_for_today: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryOrder {
    /// Admin tables.
    #[default]
    NewestFirst,
    /// Charts.
    OldestFirst,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryQuery {
    /// Inclusive UTC day bounds.
    pub from: Option<NaiveDate>,
    pub to: Option<NaiveDate>,
    /// Keeps the most recent `limit` entries regardless of `order`.
    pub limit: usize,
    pub order: HistoryOrder,
}

impl Default for HistoryQuery {
    fn default() -> Self { Self { from: None, to: None, limit: 30, order: HistoryOrder::NewestFirst } }
}

/// Chart-facing history row; no actor details.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PublicPricePoint {
    pub day: NaiveDate,
    pub price_per_gram: Money,
    pub delta_amount: Money,
    pub direction: Direction,
}

impl From<&PricePoint> for PublicPricePoint {
    fn from(p: &PricePoint) -> Self {
        Self {
            day: p.day,
            price_per_gram: p.price_per_gram,
            delta_amount: p.delta_amount,
            direction: p.direction,
        }
    }
}

#[derive(Clone)]
pub struct PriceLedger {
    store: Arc<Store>,
    clock: Arc<dyn Clock>,
    effects: SideEffects,
    attempts: u32,
}

impl PriceLedger {
    pub fn new(store: Arc<Store>, clock: Arc<dyn Clock>, effects: SideEffects, attempts: u32) -> Self {
        Self { store, clock, effects, attempts }
    }

    /// Fix today's price. A second call on the same UTC day is refused.
    pub async fn set_price(
        &self,
        actor: &str,
        price: Money,
        source: PriceSource,
    ) -> Result<PriceChange, LedgerError> {
        let price = round_money(price);
        if price <= Decimal::ZERO {
            PRICE_SETS.with_label_values(&["invalid"]).inc();
            return Err(LedgerError::InvalidPrice(price));
        }
        let now = self.clock.now();
        let day = now.date_naive();

        let res = self.store.transact(self.attempts, |tx| {
            if let Some(existing) = tx.price_for_day(day) {
                return Err(LedgerError::AlreadySetToday { day, existing_price: existing.price_per_gram });
            }
            let previous = tx.current_price().map(|p| p.price_per_gram);
            let (delta_amount, direction) = match previous {
                Some(prev) => ((price - prev).abs(), Direction::between(prev, price)),
                None => (Decimal::ZERO, Direction::None),
            };
            let point = PricePoint {
                id: tx.next_id(),
                price_per_gram: price,
                set_at: now,
                day,
                set_by: actor.to_string(),
                source,
                delta_amount,
                direction,
            };
            tx.push_price(point.clone());
            Ok(PriceChange { point, previous_price: previous })
        });

        match res {
            Ok(change) => {
                PRICE_SETS.with_label_values(&["ok"]).inc();
                metrics::set_price(price);
                info!(%actor, %price, %day, direction = ?change.point.direction, "price set");
                self.effects
                    .audit(
                        Audit {
                            action: "update_gold_price",
                            actor_id: actor,
                            target_type: "PricePoint",
                            target_id: change.point.id.to_string(),
                            changes: json!({
                                "previous_price": change.previous_price,
                                "new_price": price,
                                "delta_amount": change.point.delta_amount,
                                "direction": change.point.direction,
                                "day": day,
                                "source": source,
                            }),
                        },
                        now,
                    )
                    .await;
                Ok(change)
            }
            Err(LedgerError::AlreadySetToday { day, existing_price }) => {
                PRICE_SETS.with_label_values(&["blocked"]).inc();
                warn!(%actor, attempted = %price, existing = %existing_price, %day, "price already set today");
                self.effects
                    .audit(
                        Audit {
                            action: "attempt_update_gold_price_blocked",
                            actor_id: actor,
                            target_type: "PricePoint",
                            target_id: day.to_string(),
                            changes: json!({
                                "attempted_price": price,
                                "existing_price": existing_price,
                                "reason": "price already set for today",
                            }),
                        },
                        now,
                    )
                    .await;
                Err(LedgerError::AlreadySetToday { day, existing_price })
            }
            Err(e) => Err(e),
        }
    }

    pub fn current_price(&self) -> Result<PricePoint, LedgerError> {
        self.store.read(|t| t.current_price.clone()).ok_or(LedgerError::NoPriceSet)
    }

    pub fn quote(&self) -> Result<Quote, LedgerError> {
        let today = self.clock.now().date_naive();
        self.store.read(|t| {
            let point = t.current_price.clone().ok_or(LedgerError::NoPriceSet)?;
            Ok(Quote { point, set_for_today: t.price_for_day(today).is_some() })
        })
    }

    pub fn history(&self, q: &HistoryQuery) -> Vec<PricePoint> {
        let mut rows: Vec<PricePoint> = self.store.read(|t| {
            t.price_history
                .iter()
                .rev()
                .filter(|p| q.from.map_or(true, |from| p.day >= from))
                .filter(|p| q.to.map_or(true, |to| p.day <= to))
                .take(q.limit)
                .cloned()
                .collect()
        });
        if q.order == HistoryOrder::OldestFirst {
            rows.reverse();
        }
        rows
    }

    pub fn public_history(&self, q: &HistoryQuery) -> Vec<PublicPricePoint> {
        let q = HistoryQuery { order: HistoryOrder::OldestFirst, ..q.clone() };
        self.history(&q).iter().map(PublicPricePoint::from).collect()
    }
}

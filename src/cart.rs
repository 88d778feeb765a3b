// ===============================
// src/cart.rs (time-boxed buy reservations)
// ===============================
//
// pending -> completed | cancelled | expired (semua terminal).
// Satu cart pending per owner; cart baru menggantikan yang lama.
// Expiry dicek saat cart dibaca (lazy), sweep periodik hanya pelengkap.
//
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use tracing::{debug, info};

use crate::clock::Clock;
use crate::domain::{
    checked_amount, CancelReason, Cart, CartId, CartStatus, Grams, Identity, Money, TxId,
};
use crate::effects::{Audit, SideEffects};
use crate::error::LedgerError;
use crate::inventory::{ensure_available_in, positive_grams};
use crate::metrics::CART_TRANSITIONS;
use crate::store::{Store, Tx};

pub const DEFAULT_TTL_MINUTES: i64 = 30;

pub(crate) fn require_kyc(who: &Identity) -> Result<(), LedgerError> {
    if !who.kyc_verified {
        return Err(LedgerError::KycNotVerified(who.owner_id.clone()));
    }
    Ok(())
}

/// Mark the cart completed by trade `transaction_id`, inside the trade's tx.
pub fn complete_in(tx: &mut Tx<'_>, mut cart: Cart, transaction_id: TxId, now: DateTime<Utc>) -> Cart {
    cart.status = CartStatus::Completed { at: now, transaction_id };
    tx.put_cart(cart.clone());
    cart
}

fn expire_in(tx: &mut Tx<'_>, mut cart: Cart, now: DateTime<Utc>) -> Cart {
    cart.status = CartStatus::Expired { at: now };
    tx.put_cart(cart.clone());
    cart
}

enum Settled {
    Open(Cart),
    Expired(Cart),
    Missing,
}

/// Pending cart for `owner`, expiring it on the way if its TTL has run out.
fn settle_in(tx: &mut Tx<'_>, owner: &str, now: DateTime<Utc>) -> Settled {
    match tx.pending_cart(owner) {
        None => Settled::Missing,
        Some(c) if c.is_overdue(now) => Settled::Expired(expire_in(tx, c, now)),
        Some(c) => Settled::Open(c),
    }
}

#[derive(Debug, Clone)]
pub struct CreatedCart {
    pub cart: Cart,
    pub superseded: Option<CartId>,
}

#[derive(Clone)]
pub struct CartBook {
    store: Arc<Store>,
    clock: Arc<dyn Clock>,
    effects: SideEffects,
    ttl: Duration,
    attempts: u32,
}

impl CartBook {
    pub fn new(
        store: Arc<Store>,
        clock: Arc<dyn Clock>,
        effects: SideEffects,
        ttl: Duration,
        attempts: u32,
    ) -> Self {
        Self { store, clock, effects, ttl, attempts }
    }

    /// Reserve a buy intent at the current price. Any pending cart of the
    /// same owner is cancelled as superseded.
    pub async fn create(&self, who: &Identity, grams: Grams) -> Result<CreatedCart, LedgerError> {
        require_kyc(who)?;
        let grams = positive_grams(grams)?;
        let owner = who.owner_id.as_str();
        let now = self.clock.now();
        let expires_at = now + self.ttl;

        let created = self.store.transact(self.attempts, |tx| {
            let price: Money = tx.current_price().ok_or(LedgerError::NoPriceSet)?.price_per_gram;
            let total = checked_amount(grams, price).ok_or(LedgerError::InvalidQuantity(grams))?;
            ensure_available_in(tx, grams)?;

            let superseded = tx.pending_cart(owner).map(|mut old| {
                old.status = CartStatus::Cancelled { at: now, reason: CancelReason::Superseded };
                tx.put_cart(old.clone());
                old.id
            });
            let cart = Cart {
                id: tx.next_id(),
                owner_id: owner.to_string(),
                grams,
                price_per_gram_snapshot: price,
                total_amount_snapshot: total,
                created_at: now,
                expires_at,
                status: CartStatus::Pending,
            };
            tx.put_cart(cart.clone());
            Ok(CreatedCart { cart, superseded })
        })?;

        if let Some(old) = created.superseded {
            CART_TRANSITIONS.with_label_values(&["cancelled"]).inc();
            debug!(%owner, cart_id = old, "pending cart superseded");
            self.effects
                .audit(
                    Audit {
                        action: "cart_cancelled",
                        actor_id: owner,
                        target_type: "Cart",
                        target_id: old.to_string(),
                        changes: json!({
                            "from": "pending",
                            "to": "cancelled",
                            "reason": CancelReason::Superseded,
                            "superseded_by": created.cart.id,
                        }),
                    },
                    now,
                )
                .await;
        }
        CART_TRANSITIONS.with_label_values(&["pending"]).inc();
        info!(%owner, cart_id = created.cart.id, %grams, total = %created.cart.total_amount_snapshot, "cart created");
        self.effects
            .audit(
                Audit {
                    action: "cart_created",
                    actor_id: owner,
                    target_type: "Cart",
                    target_id: created.cart.id.to_string(),
                    changes: json!({
                        "grams": grams,
                        "price_per_gram": created.cart.price_per_gram_snapshot,
                        "total_amount": created.cart.total_amount_snapshot,
                        "expires_at": expires_at,
                        "superseded": created.superseded,
                    }),
                },
                now,
            )
            .await;
        Ok(created)
    }

    /// The owner's open cart. An overdue cart is expired here and reported
    /// as `NoActiveCart`.
    pub async fn active(&self, owner: &str) -> Result<Cart, LedgerError> {
        let now = self.clock.now();
        let settled = self.store.transact(self.attempts, |tx| Ok(settle_in(tx, owner, now)))?;
        match settled {
            Settled::Open(c) => Ok(c),
            Settled::Expired(c) => {
                self.on_expired(&c, now).await;
                Err(LedgerError::NoActiveCart)
            }
            Settled::Missing => Err(LedgerError::NoActiveCart),
        }
    }

    pub async fn cancel(&self, owner: &str) -> Result<Cart, LedgerError> {
        let now = self.clock.now();
        let settled = self.store.transact(self.attempts, |tx| {
            Ok(match settle_in(tx, owner, now) {
                Settled::Open(mut c) => {
                    c.status = CartStatus::Cancelled { at: now, reason: CancelReason::ByOwner };
                    tx.put_cart(c.clone());
                    Settled::Open(c)
                }
                other => other,
            })
        })?;
        match settled {
            Settled::Open(c) => {
                CART_TRANSITIONS.with_label_values(&["cancelled"]).inc();
                info!(%owner, cart_id = c.id, "cart cancelled");
                self.effects
                    .audit(
                        Audit {
                            action: "cart_cancelled",
                            actor_id: owner,
                            target_type: "Cart",
                            target_id: c.id.to_string(),
                            changes: json!({
                                "from": "pending",
                                "to": "cancelled",
                                "reason": CancelReason::ByOwner,
                            }),
                        },
                        now,
                    )
                    .await;
                Ok(c)
            }
            Settled::Expired(c) => {
                self.on_expired(&c, now).await;
                Err(LedgerError::NoActiveCart)
            }
            Settled::Missing => Err(LedgerError::NoActiveCart),
        }
    }

    /// Expire every overdue pending cart. Returns the ids touched.
    pub async fn sweep_expired(&self) -> Result<Vec<CartId>, LedgerError> {
        let now = self.clock.now();
        let expired = self.store.transact(self.attempts, |tx| {
            let overdue = tx.overdue_carts(now);
            Ok(overdue.into_iter().map(|c| expire_in(tx, c, now)).collect::<Vec<_>>())
        })?;
        for c in &expired {
            self.on_expired(c, now).await;
        }
        if !expired.is_empty() {
            info!(count = expired.len(), "cart sweep expired carts");
        }
        Ok(expired.into_iter().map(|c| c.id).collect())
    }

    async fn on_expired(&self, cart: &Cart, now: DateTime<Utc>) {
        CART_TRANSITIONS.with_label_values(&["expired"]).inc();
        debug!(owner = %cart.owner_id, cart_id = cart.id, "cart expired");
        self.effects
            .audit(
                Audit {
                    action: "cart_expired",
                    actor_id: "system",
                    target_type: "Cart",
                    target_id: cart.id.to_string(),
                    changes: json!({ "owner_id": cart.owner_id, "expires_at": cart.expires_at }),
                },
                now,
            )
            .await;
    }

    /// Any cart by id, terminal ones included.
    pub fn get(&self, id: CartId) -> Option<Cart> { self.store.read(|t| t.carts.get(&id).cloned()) }
}

// ===============================
// src/engine.rs (atomic buy / sell / checkout)
// ===============================
//
// Alur satu trade:
//   1) cek precondition (KYC, qty, holding/inventory) di dalam Tx
//   2) ambil harga terkini (masuk read set -> harga berubah = conflict)
//   3) debit/credit inventory + update holding + append transaksi
//   4) commit sekali; conflict -> retry dengan backoff, lalu CommitAborted
//   5) notifikasi & audit SETELAH commit (gagal = log saja)
//
use std::sync::Arc;
use std::time::{Duration as StdDuration, Instant};

use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use serde::Serialize;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::cart::{self, require_kyc, CartBook, DEFAULT_TTL_MINUTES};
use crate::clock::Clock;
use crate::domain::{Cart, Grams, Holding, Identity, TradeKind, Transaction};
use crate::effects::{Audit, SideEffects};
use crate::error::{LedgerError, StoreError};
use crate::holdings::{apply_buy_in, apply_sell_in, HoldingsLedger};
use crate::inventory::{credit_in, debit_in, positive_grams, InventoryStore};
use crate::metrics::{self, COMMIT_ABORTED, COMMIT_CONFLICTS, COMMIT_LATENCY, TRADES};
use crate::price::PriceLedger;
use crate::redemption::RedemptionDesk;
use crate::store::{Snapshot, Store, Tx};
use crate::txlog::{append_in, TransactionLog};

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub cart_ttl: Duration,
    pub commit_attempts: u32,
    /// Base delay; attempt `n` sleeps `n * retry_backoff` plus jitter.
    pub retry_backoff: StdDuration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cart_ttl: Duration::minutes(DEFAULT_TTL_MINUTES),
            commit_attempts: 8,
            retry_backoff: StdDuration::from_millis(5),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TradeReceipt {
    pub transaction: Transaction,
    pub holding: Holding,
    pub inventory_grams: Grams,
    /// Set when the trade came from a cart checkout.
    pub cart: Option<Cart>,
}

pub struct TradeEngine {
    store: Arc<Store>,
    clock: Arc<dyn Clock>,
    effects: SideEffects,
    cfg: EngineConfig,
    prices: PriceLedger,
    inventory: InventoryStore,
    holdings: HoldingsLedger,
    carts: CartBook,
    txlog: TransactionLog,
    redemptions: RedemptionDesk,
}

impl TradeEngine {
    pub fn new(store: Arc<Store>, clock: Arc<dyn Clock>, effects: SideEffects, cfg: EngineConfig) -> Self {
        let n = cfg.commit_attempts.max(1);
        Self {
            prices: PriceLedger::new(store.clone(), clock.clone(), effects.clone(), n),
            inventory: InventoryStore::new(store.clone(), clock.clone(), effects.clone(), n),
            holdings: HoldingsLedger::new(store.clone(), clock.clone(), n),
            carts: CartBook::new(store.clone(), clock.clone(), effects.clone(), cfg.cart_ttl, n),
            txlog: TransactionLog::new(store.clone()),
            redemptions: RedemptionDesk::new(store.clone(), clock.clone(), effects.clone(), n),
            store,
            clock,
            effects,
            cfg,
        }
    }

    pub fn prices(&self) -> &PriceLedger { &self.prices }
    pub fn inventory(&self) -> &InventoryStore { &self.inventory }
    pub fn holdings(&self) -> &HoldingsLedger { &self.holdings }
    pub fn carts(&self) -> &CartBook { &self.carts }
    pub fn txlog(&self) -> &TransactionLog { &self.txlog }
    pub fn redemptions(&self) -> &RedemptionDesk { &self.redemptions }

    pub fn snapshot(&self) -> Snapshot { self.store.snapshot(self.clock.now()) }

    /// Run `f` in a fresh Tx until it commits, with jittered linear backoff
    /// between conflicts. `f` errors abort at once.
    async fn commit_with_retry<T>(
        &self,
        op: &'static str,
        mut f: impl FnMut(&mut Tx<'_>) -> Result<T, LedgerError>,
    ) -> Result<T, LedgerError> {
        let attempts = self.cfg.commit_attempts.max(1);
        let started = Instant::now();
        for attempt in 1..=attempts {
            let res = {
                let mut tx = self.store.begin();
                let out = f(&mut tx)?;
                self.store.commit(tx).map(|_| out)
            };
            match res {
                Ok(out) => {
                    COMMIT_LATENCY.observe(started.elapsed().as_secs_f64() * 1_000.0);
                    return Ok(out);
                }
                Err(StoreError::Conflict { key }) => {
                    COMMIT_CONFLICTS.with_label_values(&[op]).inc();
                    debug!(%op, %key, attempt, "commit conflict");
                    if attempt < attempts {
                        tokio::time::sleep(self.backoff(attempt)).await;
                    }
                }
            }
        }
        COMMIT_ABORTED.with_label_values(&[op]).inc();
        warn!(%op, attempts, "commit aborted, retry budget exhausted");
        Err(LedgerError::CommitAborted { attempts })
    }

    fn backoff(&self, attempt: u32) -> StdDuration {
        let base = self.cfg.retry_backoff * attempt;
        let cap = self.cfg.retry_backoff.as_micros() as u64;
        let jitter = if cap == 0 { 0 } else { rand::thread_rng().gen_range(0..=cap) };
        base + StdDuration::from_micros(jitter)
    }

    fn rejected(&self, kind: TradeKind, owner: &str, e: LedgerError) -> LedgerError {
        TRADES.with_label_values(&[kind.as_str(), e.kind()]).inc();
        warn!(%owner, kind = kind.as_str(), error = e.kind(), "trade rejected: {e}");
        e
    }

    /// Buy at the current price without a cart.
    pub async fn buy(&self, who: &Identity, grams: Grams) -> Result<TradeReceipt, LedgerError> {
        let now = self.clock.now();
        let receipt = self
            .try_buy(who, grams, now)
            .await
            .map_err(|e| self.rejected(TradeKind::Buy, &who.owner_id, e))?;
        self.committed(&receipt, "buy_gold", now).await;
        Ok(receipt)
    }

    async fn try_buy(&self, who: &Identity, grams: Grams, now: DateTime<Utc>) -> Result<TradeReceipt, LedgerError> {
        require_kyc(who)?;
        let grams = positive_grams(grams)?;
        let owner = who.owner_id.as_str();
        self.commit_with_retry("buy", |tx| buy_in(tx, owner, grams, now)).await
    }

    /// Execute the owner's pending cart at the *current* price.
    pub async fn checkout(&self, who: &Identity) -> Result<TradeReceipt, LedgerError> {
        let owner = who.owner_id.as_str();
        let receipt = match self.try_checkout(who).await {
            Ok(r) => r,
            Err(e @ LedgerError::CartExpired { .. }) => {
                // checkout tx aborted, persist the expiry through the read path
                match self.carts.active(owner).await {
                    Ok(_) | Err(LedgerError::NoActiveCart) => {}
                    Err(left) => warn!(%owner, error = left.kind(), "expired cart left pending: {left}"),
                }
                return Err(self.rejected(TradeKind::Buy, owner, e));
            }
            Err(e) => return Err(self.rejected(TradeKind::Buy, owner, e)),
        };
        metrics::CART_TRANSITIONS.with_label_values(&["completed"]).inc();
        self.committed(&receipt, "checkout_cart", receipt.transaction.executed_at).await;
        Ok(receipt)
    }

    async fn try_checkout(&self, who: &Identity) -> Result<TradeReceipt, LedgerError> {
        require_kyc(who)?;
        let owner = who.owner_id.as_str();
        // TTL re-checked against the clock of each attempt, not the first one
        self.commit_with_retry("checkout", |tx| checkout_in(tx, owner, self.clock.now())).await
    }

    /// Sell back to the vault at the current price.
    pub async fn sell(&self, who: &Identity, grams: Grams) -> Result<TradeReceipt, LedgerError> {
        let now = self.clock.now();
        let receipt = self
            .try_sell(who, grams, now)
            .await
            .map_err(|e| self.rejected(TradeKind::Sell, &who.owner_id, e))?;
        self.committed(&receipt, "sell_gold", now).await;
        Ok(receipt)
    }

    async fn try_sell(&self, who: &Identity, grams: Grams, now: DateTime<Utc>) -> Result<TradeReceipt, LedgerError> {
        require_kyc(who)?;
        let grams = positive_grams(grams)?;
        let owner = who.owner_id.as_str();
        self.commit_with_retry("sell", |tx| {
            let holding = apply_sell_in(tx, owner, grams, now)?;
            let price = tx.current_price().ok_or(LedgerError::NoPriceSet)?.price_per_gram;
            let inventory_grams = credit_in(tx, grams, now)?;
            let transaction = append_in(tx, owner, TradeKind::Sell, grams, price, now)?;
            Ok(TradeReceipt { transaction, holding, inventory_grams, cart: None })
        })
        .await
    }

    async fn committed(&self, r: &TradeReceipt, action: &str, now: DateTime<Utc>) {
        let t = &r.transaction;
        let kind = t.kind.as_str();
        TRADES.with_label_values(&[kind, "ok"]).inc();
        metrics::set_inventory(r.inventory_grams);
        info!(
            owner = %t.owner_id, tx_id = t.id, kind, grams = %t.grams,
            price = %t.price_per_gram, total = %t.total_amount, "trade committed"
        );

        let verb = match t.kind { TradeKind::Buy => "bought", TradeKind::Sell => "sold" };
        let message = format!(
            "You {verb} {} g of gold at {} per gram (total {}).",
            t.grams, t.price_per_gram, t.total_amount
        );
        let audit = Audit {
            action,
            actor_id: &t.owner_id,
            target_type: "Transaction",
            target_id: t.id.to_string(),
            changes: json!({
                "kind": t.kind,
                "grams": t.grams,
                "price_per_gram": t.price_per_gram,
                "total_amount": t.total_amount,
                "cart_id": r.cart.as_ref().map(|c| c.id),
                "holding_grams": r.holding.total_grams,
                "inventory_grams": r.inventory_grams,
            }),
        };
        self.effects.after_commit(&t.owner_id, message, audit, now).await;
    }
}

/// Debit stock, grow the holding, journal the trade. Price is read inside
/// `tx`, so a concurrent price change forces a retry.
fn buy_in(tx: &mut Tx<'_>, owner: &str, grams: Grams, now: DateTime<Utc>) -> Result<TradeReceipt, LedgerError> {
    let price = tx.current_price().ok_or(LedgerError::NoPriceSet)?.price_per_gram;
    let inventory_grams = debit_in(tx, grams, now)?;
    let holding = apply_buy_in(tx, owner, grams, price, now)?;
    let transaction = append_in(tx, owner, TradeKind::Buy, grams, price, now)?;
    Ok(TradeReceipt { transaction, holding, inventory_grams, cart: None })
}

/// Execute the pending cart of `owner` at the current price, or refuse it
/// once its TTL has run out at `now`.
fn checkout_in(tx: &mut Tx<'_>, owner: &str, now: DateTime<Utc>) -> Result<TradeReceipt, LedgerError> {
    let cart = tx.pending_cart(owner).ok_or(LedgerError::NoActiveCart)?;
    if cart.is_overdue(now) {
        return Err(LedgerError::CartExpired { cart_id: cart.id });
    }
    let mut receipt = buy_in(tx, owner, cart.grams, now)?;
    receipt.cart = Some(cart::complete_in(tx, cart, receipt.transaction.id, now));
    Ok(receipt)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::domain::{CartStatus, PricePoint, PriceSource};
    use crate::effects::MemorySink;
    use chrono::TimeZone;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    struct Fixture {
        engine: TradeEngine,
        clock: Arc<ManualClock>,
        sink: Arc<MemorySink>,
    }

    async fn fixture() -> Fixture { fixture_with(EngineConfig::default()).await }

    async fn fixture_with(cfg: EngineConfig) -> Fixture {
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2025, 6, 2, 10, 0, 0).unwrap()));
        let sink = Arc::new(MemorySink::default());
        let engine = TradeEngine::new(
            Arc::new(Store::new()),
            clock.clone(),
            SideEffects::memory(sink.clone()),
            cfg,
        );
        engine.inventory().add_stock("admin", dec!(100)).await.unwrap();
        Fixture { engine, clock, sink }
    }

    fn alice() -> Identity { Identity::new("alice", true) }

    #[tokio::test]
    async fn buy_without_price_changes_nothing() {
        let f = fixture().await;
        assert_eq!(f.engine.buy(&alice(), dec!(1)).await.unwrap_err(), LedgerError::NoPriceSet);
        assert_eq!(f.engine.inventory().get_available().unwrap(), dec!(100));
        assert_eq!(f.engine.holdings().get_holding("alice"), Holding::empty("alice"));
        assert!(f.engine.txlog().all().is_empty());
    }

    #[tokio::test]
    async fn unverified_owner_cannot_trade() {
        let f = fixture().await;
        f.engine.prices().set_price("admin", dec!(6000), PriceSource::Manual).await.unwrap();
        let eve = Identity::new("eve", false);
        assert!(matches!(f.engine.buy(&eve, dec!(1)).await, Err(LedgerError::KycNotVerified(_))));
        assert!(matches!(f.engine.sell(&eve, dec!(1)).await, Err(LedgerError::KycNotVerified(_))));
        assert!(matches!(f.engine.checkout(&eve).await, Err(LedgerError::KycNotVerified(_))));
    }

    #[tokio::test]
    async fn checkout_uses_fresh_price_not_snapshot() {
        let f = fixture().await;
        f.engine.prices().set_price("admin", dec!(6000), PriceSource::Manual).await.unwrap();
        f.clock.set(Utc.with_ymd_and_hms(2025, 6, 2, 23, 50, 0).unwrap());
        let cart = f.engine.carts().create(&alice(), dec!(2)).await.unwrap().cart;
        assert_eq!(cart.total_amount_snapshot, dec!(12000));

        f.clock.advance(Duration::minutes(20)); // next UTC day, cart still inside TTL
        f.engine.prices().set_price("admin", dec!(6100), PriceSource::Api).await.unwrap();

        let r = f.engine.checkout(&alice()).await.unwrap();
        assert_eq!(r.transaction.price_per_gram, dec!(6100));
        assert_eq!(r.transaction.total_amount, dec!(12200));
        let done = r.cart.unwrap();
        assert!(matches!(done.status, CartStatus::Completed { transaction_id, .. } if transaction_id == r.transaction.id));
        assert_eq!(f.engine.carts().active("alice").await, Err(LedgerError::NoActiveCart));
    }

    #[tokio::test]
    async fn checkout_after_ttl_fails_and_expires_the_cart() {
        let f = fixture().await;
        f.engine.prices().set_price("admin", dec!(6000), PriceSource::Manual).await.unwrap();
        let cart = f.engine.carts().create(&alice(), dec!(1)).await.unwrap().cart;
        f.clock.advance(Duration::minutes(31));

        let err = f.engine.checkout(&alice()).await.unwrap_err();
        assert_eq!(err, LedgerError::CartExpired { cart_id: cart.id });
        assert!(matches!(f.engine.carts().get(cart.id).unwrap().status, CartStatus::Expired { .. }));
        assert_eq!(f.engine.inventory().get_available().unwrap(), dec!(100));
        assert_eq!(f.engine.checkout(&alice()).await.unwrap_err(), LedgerError::NoActiveCart);
    }

    #[tokio::test]
    async fn checkout_rechecks_inventory() {
        let f = fixture().await;
        f.engine.prices().set_price("admin", dec!(6000), PriceSource::Manual).await.unwrap();
        f.engine.carts().create(&alice(), dec!(60)).await.unwrap();
        f.engine.buy(&Identity::new("bob", true), dec!(50)).await.unwrap();

        assert!(matches!(
            f.engine.checkout(&alice()).await,
            Err(LedgerError::InsufficientInventory { .. })
        ));
        // cart survives an aborted checkout
        assert!(f.engine.carts().active("alice").await.is_ok());
        assert_eq!(f.engine.inventory().get_available().unwrap(), dec!(50));
    }

    #[tokio::test]
    async fn sell_credits_inventory_and_notifies() {
        let f = fixture().await;
        f.engine.prices().set_price("admin", dec!(6000), PriceSource::Manual).await.unwrap();
        f.engine.buy(&alice(), dec!(3)).await.unwrap();
        let r = f.engine.sell(&alice(), dec!(1.5)).await.unwrap();
        assert_eq!(r.inventory_grams, dec!(98.5));
        assert_eq!(r.holding.total_grams, dec!(1.5));
        assert_eq!(r.transaction.total_amount, dec!(9000));
        assert_eq!(f.sink.messages_for("alice").len(), 2);
        assert!(f.sink.actions().ends_with(&["buy_gold".to_string(), "sell_gold".to_string()]));

        let over = f.engine.sell(&alice(), dec!(2)).await.unwrap_err();
        assert_eq!(over, LedgerError::InsufficientHolding { requested: dec!(2), held: dec!(1.5) });
        assert_eq!(f.engine.inventory().get_available().unwrap(), dec!(98.5));
    }

    #[tokio::test]
    async fn trade_value_past_decimal_range_is_refused_without_side_effects() {
        let f = fixture().await;
        let huge = Decimal::from_i128_with_scale(10_i128.pow(27), 0);
        f.engine.prices().set_price("admin", huge, PriceSource::Manual).await.unwrap();

        assert_eq!(f.engine.buy(&alice(), dec!(100)).await.unwrap_err(), LedgerError::InvalidQuantity(dec!(100)));
        assert_eq!(f.engine.inventory().get_available().unwrap(), dec!(100));
        assert_eq!(f.engine.holdings().get_holding("alice"), Holding::empty("alice"));
        assert!(f.engine.txlog().all().is_empty());
        assert!(!f.sink.actions().contains(&"buy_gold".to_string()));
        assert!(matches!(
            f.engine.carts().create(&alice(), dec!(100)).await,
            Err(LedgerError::InvalidQuantity(_))
        ));
    }

    #[tokio::test]
    async fn price_moving_on_every_attempt_ends_in_commit_aborted() {
        let cfg = EngineConfig { commit_attempts: 3, retry_backoff: StdDuration::ZERO, ..Default::default() };
        let f = fixture_with(cfg).await;
        f.engine.prices().set_price("admin", dec!(6000), PriceSource::Manual).await.unwrap();
        let now = f.clock.now();

        let mut attempts = 0;
        let res = f
            .engine
            .commit_with_retry("buy", |tx| {
                attempts += 1;
                let receipt = buy_in(tx, "alice", dec!(1), now)?;
                // another writer moves the price before this attempt commits
                let mut rival = f.engine.store.begin();
                let prev = rival.current_price().ok_or(LedgerError::NoPriceSet)?;
                rival.push_price(PricePoint {
                    id: rival.next_id(),
                    price_per_gram: prev.price_per_gram + Decimal::ONE,
                    ..prev
                });
                f.engine.store.commit(rival)?;
                Ok(receipt)
            })
            .await;

        assert_eq!(res.unwrap_err(), LedgerError::CommitAborted { attempts: 3 });
        assert_eq!(attempts, 3);
        assert_eq!(f.engine.prices().current_price().unwrap().price_per_gram, dec!(6003));
        assert_eq!(f.engine.inventory().get_available().unwrap(), dec!(100));
        assert_eq!(f.engine.holdings().get_holding("alice"), Holding::empty("alice"));
        assert!(f.engine.txlog().all().is_empty());
    }

    #[tokio::test]
    async fn checkout_retry_rechecks_ttl_at_the_later_attempt() {
        let cfg = EngineConfig { retry_backoff: StdDuration::ZERO, ..Default::default() };
        let f = fixture_with(cfg).await;
        f.engine.prices().set_price("admin", dec!(6000), PriceSource::Manual).await.unwrap();
        let cart = f.engine.carts().create(&alice(), dec!(1)).await.unwrap().cart;
        f.clock.advance(Duration::minutes(29));

        let mut first = true;
        let res = f
            .engine
            .commit_with_retry("checkout", |tx| {
                let out = checkout_in(tx, "alice", f.clock.now());
                if std::mem::take(&mut first) {
                    // stock-in lands mid-attempt while the TTL runs out
                    f.engine.inventory().credit(dec!(1))?;
                    f.clock.advance(Duration::minutes(2));
                }
                out
            })
            .await;

        assert_eq!(res.unwrap_err(), LedgerError::CartExpired { cart_id: cart.id });
        assert_eq!(f.engine.inventory().get_available().unwrap(), dec!(101));
        assert_eq!(f.engine.holdings().get_holding("alice"), Holding::empty("alice"));
    }

    #[test]
    fn backoff_grows_with_attempt() {
        let cfg = EngineConfig { retry_backoff: StdDuration::from_millis(4), ..Default::default() };
        let e = TradeEngine::new(
            Arc::new(Store::new()),
            Arc::new(ManualClock::new(Utc::now())),
            SideEffects::memory(Arc::new(MemorySink::default())),
            cfg,
        );
        let d = e.backoff(3);
        assert!(d >= StdDuration::from_millis(12) && d <= StdDuration::from_millis(16));
    }
}

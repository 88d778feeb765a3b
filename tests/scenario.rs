// ===============================
// tests/scenario.rs
// ===============================
use std::sync::Arc;

use chrono::{Duration, TimeZone, Utc};
use rust_decimal_macros::dec;

use goldvault::domain::{PriceSource, TradeKind};
use goldvault::effects::MemorySink;
use goldvault::txlog::TxFilter;
use goldvault::{EngineConfig, Identity, LedgerError, ManualClock, SideEffects, Store, TradeEngine};

fn engine_at(clock: Arc<ManualClock>, sink: Arc<MemorySink>) -> TradeEngine {
    TradeEngine::new(Arc::new(Store::new()), clock, SideEffects::memory(sink), EngineConfig::default())
}

#[tokio::test]
async fn buy_buy_sell_walkthrough() {
    let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2025, 1, 6, 9, 0, 0).unwrap()));
    let sink = Arc::new(MemorySink::default());
    let engine = engine_at(clock.clone(), sink.clone());
    let alice = Identity::new("alice", true);

    engine.inventory().add_stock("admin", dec!(100)).await.unwrap();
    engine.prices().set_price("admin", dec!(6000), PriceSource::Manual).await.unwrap();

    // buy 10g via cart
    engine.carts().create(&alice, dec!(10)).await.unwrap();
    let r = engine.checkout(&alice).await.unwrap();
    assert_eq!(r.inventory_grams, dec!(90));
    assert_eq!(r.holding.total_grams, dec!(10));
    assert_eq!(r.holding.average_cost_per_gram, dec!(6000));
    assert_eq!(r.holding.total_invested, dec!(60000));

    // next day the price moves; buy 5g more
    clock.advance(Duration::days(1));
    let change = engine.prices().set_price("admin", dec!(6200), PriceSource::Api).await.unwrap();
    assert_eq!(change.previous_price, Some(dec!(6000)));
    let r = engine.buy(&alice, dec!(5)).await.unwrap();
    assert_eq!(r.holding.total_grams, dec!(15));
    assert_eq!(r.holding.average_cost_per_gram, dec!(6066.67));
    assert_eq!(r.holding.total_invested, dec!(91000.05));
    assert_eq!(r.inventory_grams, dec!(85));

    // sell 8g back
    let r = engine.sell(&alice, dec!(8)).await.unwrap();
    assert_eq!(r.holding.total_grams, dec!(7));
    assert_eq!(r.holding.average_cost_per_gram, dec!(6066.67));
    assert_eq!(r.holding.total_invested, dec!(42466.69));
    assert_eq!(r.inventory_grams, dec!(93));
    assert_eq!(r.transaction.total_amount, dec!(49600));

    // reads reflect exactly what the trades computed
    assert_eq!(engine.holdings().get_holding("alice"), r.holding);
    assert_eq!(engine.inventory().get_available().unwrap(), dec!(93));

    let history = engine.txlog().for_owner("alice", &TxFilter::default());
    assert_eq!(
        history.iter().map(|t| t.kind).collect::<Vec<_>>(),
        vec![TradeKind::Sell, TradeKind::Buy, TradeKind::Buy]
    );

    let v = engine.holdings().valuation("alice");
    assert_eq!(v.current_value, dec!(43400));
    assert_eq!(v.unrealized_gain, dec!(933.31));

    assert_eq!(
        sink.actions(),
        vec![
            "add_inventory",
            "update_gold_price",
            "cart_created",
            "checkout_cart",
            "update_gold_price",
            "buy_gold",
            "sell_gold",
        ]
    );
    assert_eq!(sink.messages_for("alice").len(), 3);
}

#[tokio::test]
async fn sell_back_after_single_buy_restores_stock() {
    // 100g stock, buy 10g (90 left), sell 8g back -> 98g
    let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2025, 1, 6, 9, 0, 0).unwrap()));
    let engine = engine_at(clock, Arc::new(MemorySink::default()));
    let alice = Identity::new("alice", true);
    engine.inventory().add_stock("admin", dec!(100)).await.unwrap();
    engine.prices().set_price("admin", dec!(6000), PriceSource::Manual).await.unwrap();

    engine.buy(&alice, dec!(10)).await.unwrap();
    let r = engine.sell(&alice, dec!(8)).await.unwrap();
    assert_eq!(r.inventory_grams, dec!(98));
}

#[tokio::test]
async fn price_ratchet_holds_within_the_utc_day() {
    let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2025, 1, 6, 0, 0, 0).unwrap()));
    let engine = engine_at(clock.clone(), Arc::new(MemorySink::default()));
    let first = engine.prices().set_price("admin", dec!(6000), PriceSource::Manual).await.unwrap();

    clock.set(Utc.with_ymd_and_hms(2025, 1, 6, 23, 59, 59).unwrap());
    assert!(matches!(
        engine.prices().set_price("admin", dec!(1), PriceSource::Api).await,
        Err(LedgerError::AlreadySetToday { .. })
    ));
    assert_eq!(engine.prices().current_price().unwrap(), first.point);

    clock.advance(Duration::seconds(1));
    assert!(engine.prices().set_price("admin", dec!(5999), PriceSource::Api).await.is_ok());
}

#[tokio::test]
async fn expired_cart_is_persisted_on_read_without_explicit_expire() {
    let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2025, 1, 6, 9, 0, 0).unwrap()));
    let engine = engine_at(clock.clone(), Arc::new(MemorySink::default()));
    let bob = Identity::new("bob", true);
    engine.inventory().add_stock("admin", dec!(5)).await.unwrap();
    engine.prices().set_price("admin", dec!(6000), PriceSource::Manual).await.unwrap();

    let cart = engine.carts().create(&bob, dec!(1)).await.unwrap().cart;
    clock.advance(Duration::minutes(45));
    assert_eq!(engine.carts().active("bob").await, Err(LedgerError::NoActiveCart));

    let stored = engine.carts().get(cart.id).unwrap();
    assert_eq!(stored.status.label(), "expired");
    assert_eq!(engine.checkout(&bob).await.unwrap_err(), LedgerError::NoActiveCart);
}

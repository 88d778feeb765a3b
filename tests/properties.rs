// ===============================
// tests/properties.rs
// ===============================
use std::sync::Arc;

use proptest::prelude::*;
use rust_decimal::Decimal;

use goldvault::domain::round_money;
use goldvault::holdings::HoldingsLedger;
use goldvault::{LedgerError, Store, SystemClock};

fn grams() -> impl Strategy<Value = Decimal> {
    (1i64..1_000_000).prop_map(|n| Decimal::new(n, 4)) // 0.0001 .. 100 g
}

fn price() -> impl Strategy<Value = Decimal> {
    (100i64..10_000_000).prop_map(|n| Decimal::new(n, 2)) // 1.00 .. 100000.00
}

fn ledger() -> HoldingsLedger { HoldingsLedger::new(Arc::new(Store::new()), Arc::new(SystemClock), 1) }

proptest! {
    #[test]
    fn buys_keep_invested_equal_to_units_times_average(
        buys in prop::collection::vec((grams(), price()), 1..20)
    ) {
        let l = ledger();
        let mut units = Decimal::ZERO;
        let lo = buys.iter().map(|b| b.1).min().unwrap();
        let hi = buys.iter().map(|b| b.1).max().unwrap();
        for (g, p) in &buys {
            let h = l.apply_buy("p", *g, *p).unwrap();
            units += *g;
            prop_assert_eq!(h.total_grams, units);
            prop_assert_eq!(h.total_invested, round_money(h.total_grams * h.average_cost_per_gram));
        }
        let avg = l.get_holding("p").average_cost_per_gram;
        let cent = Decimal::new(1, 2) * Decimal::from(buys.len() as u64);
        prop_assert!(avg >= lo - cent && avg <= hi + cent, "avg {} outside [{}, {}]", avg, lo, hi);
    }

    #[test]
    fn sells_never_drive_units_negative(
        buy in grams(),
        p in price(),
        sells in prop::collection::vec(grams(), 1..12)
    ) {
        let l = ledger();
        l.apply_buy("p", buy, p).unwrap();
        for s in sells {
            let before = l.get_holding("p");
            match l.apply_sell("p", s) {
                Ok(h) => {
                    prop_assert!(s <= before.total_grams);
                    prop_assert_eq!(h.total_grams, before.total_grams - s);
                    prop_assert_eq!(h.average_cost_per_gram, before.average_cost_per_gram);
                }
                Err(LedgerError::InsufficientHolding { .. }) => {
                    prop_assert!(s > before.total_grams);
                    prop_assert_eq!(l.get_holding("p"), before);
                }
                Err(e) => prop_assert!(false, "unexpected {:?}", e),
            }
            prop_assert!(l.get_holding("p").total_grams >= Decimal::ZERO);
        }
    }
}

// ===============================
// src/metrics.rs
// ===============================
use once_cell::sync::Lazy;
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::Once;
use std::thread;

// Single custom registry (we register everything here)
pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

// -------- Ledger activity --------
pub static TRADES: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("trades_total", "trade attempts (labels: kind, result)"),
        &["kind", "result"],
    )
    .unwrap()
});

pub static COMMIT_CONFLICTS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("commit_conflicts_total", "optimistic write conflicts, retried"),
        &["op"],
    )
    .unwrap()
});

pub static COMMIT_ABORTED: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("commit_aborted_total", "commits given up after the retry budget"),
        &["op"],
    )
    .unwrap()
});

pub static CART_TRANSITIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("cart_transitions_total", "cart state changes (label: to)"),
        &["to"],
    )
    .unwrap()
});

pub static PRICE_SETS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("price_set_total", "price-set attempts (label: result)"),
        &["result"],
    )
    .unwrap()
});

pub static SIDE_EFFECT_FAILURES: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("side_effect_failures_total", "swallowed sink failures (label: sink)"),
        &["sink"],
    )
    .unwrap()
});

// -------- Ledger state --------
pub static INVENTORY_MG: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new("inventory_available_milligrams", "vault stock available (mg)").unwrap()
});

pub static PRICE_MINOR: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new("gold_price_per_gram_minor", "current price per gram (minor units)").unwrap()
});

// Latency from begin -> committed (milliseconds)
pub static COMMIT_LATENCY: Lazy<Histogram> = Lazy::new(|| {
    Histogram::with_opts(HistogramOpts::new(
        "trade_commit_latency_ms",
        "Latency of a trade commit including retries (ms)",
    ))
    .unwrap()
});

static INIT: Once = Once::new();

pub fn init() {
    // Register all metrics to the custom registry (idempotent: tests build many engines)
    INIT.call_once(|| {
        for m in [
            REGISTRY.register(Box::new(TRADES.clone())),
            REGISTRY.register(Box::new(COMMIT_CONFLICTS.clone())),
            REGISTRY.register(Box::new(COMMIT_ABORTED.clone())),
            REGISTRY.register(Box::new(CART_TRANSITIONS.clone())),
            REGISTRY.register(Box::new(PRICE_SETS.clone())),
            REGISTRY.register(Box::new(SIDE_EFFECT_FAILURES.clone())),
            REGISTRY.register(Box::new(INVENTORY_MG.clone())),
            REGISTRY.register(Box::new(PRICE_MINOR.clone())),
            REGISTRY.register(Box::new(COMMIT_LATENCY.clone())),
        ] {
            let _ = m;
        }
    });
}

fn milligrams(grams: Decimal) -> i64 {
    grams.checked_mul(Decimal::ONE_THOUSAND).unwrap_or(Decimal::MAX).trunc().to_i64().unwrap_or(i64::MAX)
}

fn minor_units(price: Decimal) -> i64 {
    price.checked_mul(Decimal::ONE_HUNDRED).unwrap_or(Decimal::MAX).trunc().to_i64().unwrap_or(i64::MAX)
}

pub fn set_inventory(grams: Decimal) { INVENTORY_MG.set(milligrams(grams)); }

pub fn set_price(price: Decimal) { PRICE_MINOR.set(minor_units(price)); }

// Encode all metrics in Prometheus text format
pub fn encode_metrics() -> Vec<u8> {
    let encoder = TextEncoder::new();
    let families = REGISTRY.gather();
    let mut buf = Vec::new();
    if encoder.encode(&families, &mut buf).is_err() || buf.is_empty() {
        buf.extend_from_slice(b"# no metrics\n");
    }
    buf
}

// Serve one HTTP request (GET / or /metrics), tiny HTTP 1.1 responder
fn handle_client(mut stream: TcpStream) {
    // Read a bit to consume headers (no full parse)
    let mut _req_buf = [0u8; 1024];
    let _ = stream.read(&mut _req_buf);

    let body = encode_metrics();
    let header = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/plain; version=0.0.4; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    );

    let _ = stream.write_all(header.as_bytes());
    let _ = stream.write_all(&body);
    let _ = stream.flush();
}

// Run the metrics server in a dedicated OS thread (keeps Tokio runtime clean)
pub fn serve_metrics(port: u16) -> std::io::Result<()> {
    let addr = format!("0.0.0.0:{port}");
    let listener = TcpListener::bind(&addr)?;
    tracing::info!(%addr, "metrics listening on / and /metrics");
    thread::spawn(move || {
        for conn in listener.incoming() {
            match conn {
                Ok(stream) => handle_client(stream),
                Err(e) => tracing::warn!(error = %e, "metrics accept error"),
            }
        }
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn gauges_use_integer_minor_units() {
        assert_eq!(milligrams(dec!(90.1234)), 90123);
        assert_eq!(minor_units(dec!(6066.67)), 606667);
        assert_eq!(milligrams(Decimal::MAX), i64::MAX);
        assert_eq!(minor_units(Decimal::MAX), i64::MAX);
    }

    #[test]
    fn registry_exports_ledger_families() {
        init();
        init();
        TRADES.with_label_values(&["buy", "ok"]).inc();
        let text = String::from_utf8(encode_metrics()).unwrap();
        assert!(text.contains("trades_total"));
    }
}

// ===============================
// src/main.rs
// ===============================
/*
 # contoh sesi
 printf '%s\n' \
   '{"id":1,"op":"set_price","actor":"admin","price":"6000"}' \
   '{"id":2,"op":"add_stock","actor":"admin","grams":"100"}' \
   '{"id":3,"op":"buy","owner":"alice","kyc_verified":true,"grams":"10"}' \
   | cargo run -- serve

 # metrics
 curl -s localhost:9898/metrics | grep '^trades_total'
*/
/*
=============================================================================
Project : goldvault — transactional gold buy/sell ledger in Rust
Module  : main.rs
Version : 0.1.0
Author  : Kukuh Tripamungkas Wicaksono (Kukuh TW)
Email   : kukuhtw@gmail.com
WhatsApp: https://wa.me/628129893706
LinkedIn: https://id.linkedin.com/in/kukuhtw
License : MIT (see LICENSE)

Summary : Daily-ratcheted gold price, shared vault inventory, per-owner
          holdings with weighted-average cost, time-boxed carts and an
          append-only trade journal, committed atomically with optimistic
          retries. Exposes Prometheus metrics and records a JSONL audit trail.

(c) 2025 Kukuh TW. All rights reserved where applicable.
=============================================================================
*/
use std::sync::Arc;

use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    select,
    sync::mpsc,
    task::JoinSet,
    time::{interval_at, Duration, Instant},
};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use goldvault::config::{self, Args, Command};
use goldvault::domain::{AuditEntry, Notification};
use goldvault::effects::{ChannelAuditor, ChannelNotifier};
use goldvault::error::SnapshotError;
use goldvault::store::Snapshot;
use goldvault::{desk, metrics, posttrade, recorder};
use goldvault::{EngineConfig, SideEffects, Store, SystemClock, TradeEngine};

#[tokio::main]
async fn main() -> Result<(), SnapshotError> {
    // ---- Load config ----
    let (args, cfg) = config::load();

    // ---- Logging (stderr; stdout is the response stream) ----
    let filter = EnvFilter::try_new(&args.log_filter).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();

    match args.command.clone().unwrap_or(Command::Serve) {
        Command::Serve => serve(args, cfg).await,
    }
}

fn every(secs: u64) -> tokio::time::Interval {
    let period = Duration::from_secs(secs.max(1));
    interval_at(Instant::now() + period, period)
}

async fn serve(args: Args, cfg: EngineConfig) -> Result<(), SnapshotError> {
    // ---- Metrics ----
    metrics::init();
    if args.metrics_port != 0 {
        if let Err(e) = metrics::serve_metrics(args.metrics_port) {
            warn!(error = %e, port = args.metrics_port, "metrics responder disabled");
        }
    }

    info!(
        state_file = %args.state_file.display(),
        audit_file = %args.audit_file.display(),
        cart_ttl_min = args.cart_ttl_minutes,
        commit_attempts = cfg.commit_attempts,
        retry_backoff_ms = args.retry_backoff_ms,
        "startup config"
    );

    // ---- State ----
    let store = Arc::new(Store::from_snapshot(Snapshot::load_from_file(&args.state_file).await?));

    // ---- Side-effect buses ----
    let (note_tx, note_rx) = mpsc::channel::<Notification>(args.channel_capacity);
    let (audit_tx, audit_rx) = mpsc::channel::<AuditEntry>(args.channel_capacity);
    let post = tokio::spawn(posttrade::run(note_rx));
    let rec = tokio::spawn(recorder::run(audit_rx, args.audit_file.clone()));
    let effects = SideEffects::new(
        Arc::new(ChannelNotifier::new(note_tx)),
        Arc::new(ChannelAuditor::new(audit_tx)),
    );

    let engine = Arc::new(TradeEngine::new(store, Arc::new(SystemClock), effects, cfg));
    if let Ok(g) = engine.inventory().get_available() {
        metrics::set_inventory(g);
    }
    if let Ok(p) = engine.prices().current_price() {
        metrics::set_price(p.price_per_gram);
    }

    // ---- Response writer ----
    let (out_tx, mut out_rx) = mpsc::channel::<String>(args.channel_capacity);
    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(line) = out_rx.recv().await {
            if stdout.write_all(line.as_bytes()).await.is_err() || stdout.write_all(b"\n").await.is_err() {
                error!("stdout closed, dropping responses");
                break;
            }
            let _ = stdout.flush().await;
        }
    });

    // ---- Request loop + periodic tasks ----
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut inflight: JoinSet<()> = JoinSet::new();
    let mut sweep = every(args.sweep_interval_secs);
    let mut flush = every(args.flush_interval_secs);
    let mut heartbeat = every(60);
    let mut served: u64 = 0;

    loop {
        select! {
            line = lines.next_line() => {
                let line = match line {
                    Ok(Some(l)) => l,
                    Ok(None) => break,
                    Err(e) => {
                        error!(error = %e, "stdin read failed, shutting down");
                        break;
                    }
                };
                if line.trim().is_empty() {
                    continue;
                }
                served += 1;
                let engine = engine.clone();
                let out = out_tx.clone();
                // satu task per request
                inflight.spawn(async move {
                    let resp = desk::handle_line(&engine, &line).await;
                    match serde_json::to_string(&resp) {
                        Ok(s) => { let _ = out.send(s).await; }
                        Err(e) => error!(error = %e, "response serialize failed"),
                    }
                });
            }
            Some(done) = inflight.join_next() => {
                if let Err(e) = done {
                    error!(error = %e, "request task failed");
                }
            }
            _ = sweep.tick() => {
                if let Err(e) = engine.carts().sweep_expired().await {
                    warn!(kind = e.kind(), "cart sweep failed: {e}");
                }
            }
            _ = flush.tick() => {
                if let Err(e) = engine.snapshot().save_to_file(&args.state_file).await {
                    error!(error = %e, "periodic snapshot failed");
                }
            }
            _ = heartbeat.tick() => {
                info!(served, inflight = inflight.len(), "heartbeat");
            }
        }
    }

    // ---- Shutdown: finish requests, persist, drain sinks ----
    while let Some(done) = inflight.join_next().await {
        if let Err(e) = done {
            error!(error = %e, "request task failed");
        }
    }
    engine.snapshot().save_to_file(&args.state_file).await?;
    info!(served, path = %args.state_file.display(), "state saved");

    drop(out_tx);
    drop(engine);
    let _ = writer.await;
    if let Ok(delivered) = post.await {
        info!(delivered, "notifications drained");
    }
    match rec.await {
        Ok(Ok(written)) => info!(written, "audit journal closed"),
        Ok(Err(e)) => error!(error = %e, "audit journal failed"),
        Err(e) => error!(error = %e, "recorder task failed"),
    }
    Ok(())
}

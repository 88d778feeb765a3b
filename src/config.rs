// ===============================
// src/config.rs
// ===============================
/*
=============================================================================
Project : goldvault — transactional gold buy/sell ledger in Rust
Module  : config.rs
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
use std::path::PathBuf;
use std::time::Duration as StdDuration;

use chrono::Duration;
use clap::{Parser, Subcommand};
use dotenvy::dotenv;

use crate::engine::EngineConfig;

#[derive(Subcommand, Clone, Debug, PartialEq, Eq)]
pub enum Command {
    /// Read JSON requests from stdin, one per line (default).
    Serve,
}

#[derive(Parser, Clone, Debug)]
#[command(name = "goldvault", version, about = "Gold buy/sell ledger")]
pub struct Args {
    #[command(subcommand)]
    pub command: Option<Command>,

    // files/metrics
    #[arg(long, env = "STATE_FILE", default_value = "data/goldvault.json")]
    pub state_file: PathBuf,
    #[arg(long, env = "AUDIT_FILE", default_value = "data/audit.jsonl")]
    pub audit_file: PathBuf,
    /// 0 disables the metrics responder.
    #[arg(long, env = "METRICS_PORT", default_value_t = 9898)]
    pub metrics_port: u16,

    // ledger
    #[arg(long, env = "CART_TTL_MINUTES", default_value_t = 30)]
    pub cart_ttl_minutes: i64,
    #[arg(long, env = "COMMIT_ATTEMPTS", default_value_t = 8)]
    pub commit_attempts: u32,
    #[arg(long, env = "RETRY_BACKOFF_MS", default_value_t = 5)]
    pub retry_backoff_ms: u64,

    // background tasks
    #[arg(long, env = "SWEEP_INTERVAL_SECS", default_value_t = 60)]
    pub sweep_interval_secs: u64,
    #[arg(long, env = "FLUSH_INTERVAL_SECS", default_value_t = 30)]
    pub flush_interval_secs: u64,
    #[arg(long, env = "CHANNEL_CAPACITY", default_value_t = 4096)]
    pub channel_capacity: usize,

    #[arg(long, env = "RUST_LOG", default_value = "info")]
    pub log_filter: String,
}

impl Args {
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            cart_ttl: Duration::minutes(self.cart_ttl_minutes.max(1)),
            commit_attempts: self.commit_attempts.max(1),
            retry_backoff: StdDuration::from_millis(self.retry_backoff_ms),
        }
    }
}

pub fn load() -> (Args, EngineConfig) {
    // .env dulu, supaya env fallback di bawah ikut ter-load
    let _ = dotenv();
    let args = Args::parse();
    let cfg = args.engine_config();
    (args, cfg)
}

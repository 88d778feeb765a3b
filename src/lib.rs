// ===============================
// src/lib.rs
// ===============================
pub mod cart;
pub mod clock;
pub mod config;
pub mod desk;
pub mod domain;
pub mod effects;
pub mod engine;
pub mod error;
pub mod holdings;
pub mod inventory;
pub mod metrics;
pub mod posttrade;
pub mod price;
pub mod recorder;
pub mod redemption;
pub mod store;
pub mod txlog;

pub use clock::{Clock, ManualClock, SystemClock};
pub use domain::Identity;
pub use effects::SideEffects;
pub use engine::{EngineConfig, TradeEngine, TradeReceipt};
pub use error::LedgerError;
pub use store::Store;

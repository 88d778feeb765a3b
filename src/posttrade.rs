// ===============================
// src/posttrade.rs
// ===============================
//
// Delivery task for owner notifications. Email/push gateways live outside
// this crate; here every message is logged on its own target so an
// external shipper can pick it up.
//
use tokio::sync::mpsc;
use tracing::info;

use crate::domain::Notification;

/// Drain `rx` until every sender is gone. Returns how many were delivered.
pub async fn run(mut rx: mpsc::Receiver<Notification>) -> u64 {
    let mut delivered = 0u64;
    while let Some(n) = rx.recv().await {
        info!(target: "goldvault::notify", owner = %n.owner_id, at = %n.at, "{}", n.message);
        delivered += 1;
    }
    info!(delivered, "posttrade: channel closed, stopped");
    delivered
}

// ===============================
// src/redemption.rs (physical gold redemption requests)
// ===============================
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::{info, warn};

use crate::cart::require_kyc;
use crate::clock::Clock;
use crate::domain::{Grams, Identity, RedemptionId, RedemptionMode, RedemptionRequest, RedemptionStatus};
use crate::effects::{Audit, SideEffects};
use crate::error::LedgerError;
use crate::holdings::apply_sell_in;
use crate::inventory::positive_grams;
use crate::store::Store;

#[derive(Clone)]
pub struct RedemptionDesk {
    store: Arc<Store>,
    clock: Arc<dyn Clock>,
    effects: SideEffects,
    attempts: u32,
}

impl RedemptionDesk {
    pub fn new(store: Arc<Store>, clock: Arc<dyn Clock>, effects: SideEffects, attempts: u32) -> Self {
        Self { store, clock, effects, attempts }
    }

    /// Owner asks to take metal out. Holding is only checked here, it is
    /// reduced on approval.
    pub async fn request(
        &self,
        who: &Identity,
        grams: Grams,
        mode: RedemptionMode,
    ) -> Result<RedemptionRequest, LedgerError> {
        require_kyc(who)?;
        let grams = positive_grams(grams)?;
        let owner = who.owner_id.as_str();
        let now = self.clock.now();

        let req = self.store.transact(self.attempts, |tx| {
            let held = tx.holding(owner).map(|h| h.total_grams).unwrap_or_default();
            if held < grams {
                return Err(LedgerError::InsufficientHolding { requested: grams, held });
            }
            let req = RedemptionRequest {
                id: tx.next_id(),
                owner_id: owner.to_string(),
                grams,
                mode,
                requested_at: now,
                status: RedemptionStatus::Pending,
            };
            tx.put_redemption(req.clone());
            Ok(req)
        })?;

        info!(%owner, id = req.id, %grams, ?mode, "redemption requested");
        self.announce(&req, "request_redemption", owner, "Your redemption request was received.", now)
            .await;
        Ok(req)
    }

    /// pending -> approved; takes the grams off the owner's holding.
    pub async fn approve(&self, actor: &str, id: RedemptionId) -> Result<RedemptionRequest, LedgerError> {
        let now = self.clock.now();
        let req = self.store.transact(self.attempts, |tx| {
            let mut req = tx.redemption(id).ok_or(LedgerError::RedemptionNotFound)?;
            if !matches!(req.status, RedemptionStatus::Pending) {
                return Err(LedgerError::InvalidTransition { from: req.status.label(), to: "approved" });
            }
            apply_sell_in(tx, &req.owner_id, req.grams, now)?;
            req.status = RedemptionStatus::Approved { at: now, by: actor.to_string() };
            tx.put_redemption(req.clone());
            Ok(req)
        });
        let req = self.log_outcome(id, "approved", req)?;
        let msg = format!("Your redemption of {} g was approved.", req.grams);
        self.announce(&req, "approve_redemption", actor, &msg, now).await;
        Ok(req)
    }

    /// pending -> rejected; holding untouched.
    pub async fn reject(&self, actor: &str, id: RedemptionId) -> Result<RedemptionRequest, LedgerError> {
        let now = self.clock.now();
        let req = self.store.transact(self.attempts, |tx| {
            let mut req = tx.redemption(id).ok_or(LedgerError::RedemptionNotFound)?;
            if !matches!(req.status, RedemptionStatus::Pending) {
                return Err(LedgerError::InvalidTransition { from: req.status.label(), to: "rejected" });
            }
            req.status = RedemptionStatus::Rejected { at: now, by: actor.to_string() };
            tx.put_redemption(req.clone());
            Ok(req)
        });
        let req = self.log_outcome(id, "rejected", req)?;
        self.announce(&req, "reject_redemption", actor, "Your redemption request was rejected.", now)
            .await;
        Ok(req)
    }

    /// approved -> completed, once the metal was handed over or shipped.
    pub async fn complete(&self, actor: &str, id: RedemptionId) -> Result<RedemptionRequest, LedgerError> {
        let now = self.clock.now();
        let req = self.store.transact(self.attempts, |tx| {
            let mut req = tx.redemption(id).ok_or(LedgerError::RedemptionNotFound)?;
            let RedemptionStatus::Approved { at, .. } = req.status else {
                return Err(LedgerError::InvalidTransition { from: req.status.label(), to: "completed" });
            };
            req.status = RedemptionStatus::Completed { approved_at: at, fulfilled_at: now };
            tx.put_redemption(req.clone());
            Ok(req)
        });
        let req = self.log_outcome(id, "completed", req)?;
        self.announce(&req, "complete_redemption", actor, "Your gold redemption is complete.", now)
            .await;
        Ok(req)
    }

    pub fn get(&self, id: RedemptionId) -> Result<RedemptionRequest, LedgerError> {
        self.store
            .read(|t| t.redemptions.get(&id).cloned())
            .ok_or(LedgerError::RedemptionNotFound)
    }

    pub fn for_owner(&self, owner: &str) -> Vec<RedemptionRequest> {
        self.store.read(|t| {
            t.redemptions.values().rev().filter(|r| r.owner_id == owner).cloned().collect()
        })
    }

    fn log_outcome(
        &self,
        id: RedemptionId,
        to: &str,
        res: Result<RedemptionRequest, LedgerError>,
    ) -> Result<RedemptionRequest, LedgerError> {
        match res {
            Ok(req) => {
                info!(id, owner = %req.owner_id, %to, "redemption updated");
                Ok(req)
            }
            Err(e) => {
                warn!(id, %to, kind = e.kind(), "redemption transition rejected");
                Err(e)
            }
        }
    }

    async fn announce(
        &self,
        req: &RedemptionRequest,
        action: &str,
        actor: &str,
        message: &str,
        now: DateTime<Utc>,
    ) {
        self.effects
            .after_commit(
                &req.owner_id,
                message.to_string(),
                Audit {
                    action,
                    actor_id: actor,
                    target_type: "RedemptionRequest",
                    target_id: req.id.to_string(),
                    changes: json!({
                        "grams": req.grams,
                        "mode": req.mode,
                        "status": req.status.label(),
                    }),
                },
                now,
            )
            .await;
    }
}

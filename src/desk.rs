// ===============================
// src/desk.rs (JSON request dispatch)
// ===============================
//
// Satu baris JSON = satu request:
//   {"id": 1, "op": "set_price", "actor": "admin", "price": "6000"}
// Jawaban:
//   {"id": 1, "ok": true, "data": {...}}
//   {"id": 1, "ok": false, "kind": "already_set_today", "message": "..."}
//
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::{Grams, Identity, Money, PriceSource, RedemptionId, RedemptionMode, TradeKind};
use crate::engine::TradeEngine;
use crate::error::LedgerError;
use crate::price::{HistoryOrder, HistoryQuery};
use crate::txlog::TxFilter;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryView {
    #[default]
    Admin,
    Public,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    SetPrice { actor: String, price: Money, source: Option<PriceSource> },
    Quote,
    PriceHistory {
        from: Option<NaiveDate>,
        to: Option<NaiveDate>,
        limit: Option<usize>,
        #[serde(default)]
        view: HistoryView,
    },
    AddStock { actor: String, grams: Grams },
    RemoveStock { actor: String, grams: Grams },
    Inventory,
    AddToCart { owner: String, #[serde(default)] kyc_verified: bool, grams: Grams },
    GetCart { owner: String },
    CancelCart { owner: String },
    Checkout { owner: String, #[serde(default)] kyc_verified: bool },
    Buy { owner: String, #[serde(default)] kyc_verified: bool, grams: Grams },
    Sell { owner: String, #[serde(default)] kyc_verified: bool, grams: Grams },
    Holding { owner: String },
    Valuation { owner: String },
    Transactions { owner: String, kind: Option<TradeKind>, limit: Option<usize> },
    RequestRedemption {
        owner: String,
        #[serde(default)]
        kyc_verified: bool,
        grams: Grams,
        mode: RedemptionMode,
    },
    MyRedemptions { owner: String },
    ApproveRedemption { actor: String, id: RedemptionId },
    RejectRedemption { actor: String, id: RedemptionId },
    CompleteRedemption { actor: String, id: RedemptionId },
    SweepCarts,
}

#[derive(Debug, Clone, Serialize)]
pub struct Response {
    pub id: Value,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Response {
    fn ok(id: Value, data: Value) -> Self {
        Self { id, ok: true, data: Some(data), kind: None, message: None }
    }

    fn err(id: Value, kind: &str, message: String) -> Self {
        Self { id, ok: false, data: None, kind: Some(kind.to_string()), message: Some(message) }
    }
}

fn to_data<T: Serialize>(v: T) -> Result<Value, LedgerError> {
    serde_json::to_value(v).map_err(|e| LedgerError::Internal(e.to_string()))
}

pub async fn dispatch(engine: &TradeEngine, req: Request) -> Result<Value, LedgerError> {
    match req {
        Request::SetPrice { actor, price, source } => {
            to_data(engine.prices().set_price(&actor, price, source.unwrap_or(PriceSource::Manual)).await?)
        }
        Request::Quote => to_data(engine.prices().quote()?),
        Request::PriceHistory { from, to, limit, view } => {
            let q = HistoryQuery {
                from,
                to,
                limit: limit.unwrap_or(HistoryQuery::default().limit),
                order: HistoryOrder::NewestFirst,
            };
            match view {
                HistoryView::Admin => to_data(engine.prices().history(&q)),
                HistoryView::Public => to_data(engine.prices().public_history(&q)),
            }
        }
        Request::AddStock { actor, grams } => to_data(engine.inventory().add_stock(&actor, grams).await?),
        Request::RemoveStock { actor, grams } => {
            to_data(engine.inventory().remove_stock(&actor, grams).await?)
        }
        Request::Inventory => to_data(engine.inventory().get_available()?),
        Request::AddToCart { owner, kyc_verified, grams } => {
            to_data(engine.carts().create(&Identity::new(owner, kyc_verified), grams).await?.cart)
        }
        Request::GetCart { owner } => to_data(engine.carts().active(&owner).await?),
        Request::CancelCart { owner } => to_data(engine.carts().cancel(&owner).await?),
        Request::Checkout { owner, kyc_verified } => {
            to_data(engine.checkout(&Identity::new(owner, kyc_verified)).await?)
        }
        Request::Buy { owner, kyc_verified, grams } => {
            to_data(engine.buy(&Identity::new(owner, kyc_verified), grams).await?)
        }
        Request::Sell { owner, kyc_verified, grams } => {
            to_data(engine.sell(&Identity::new(owner, kyc_verified), grams).await?)
        }
        Request::Holding { owner } => to_data(engine.holdings().get_holding(&owner)),
        Request::Valuation { owner } => to_data(engine.holdings().valuation(&owner)),
        Request::Transactions { owner, kind, limit } => {
            to_data(engine.txlog().for_owner(&owner, &TxFilter { kind, limit }))
        }
        Request::RequestRedemption { owner, kyc_verified, grams, mode } => to_data(
            engine.redemptions().request(&Identity::new(owner, kyc_verified), grams, mode).await?,
        ),
        Request::MyRedemptions { owner } => to_data(engine.redemptions().for_owner(&owner)),
        Request::ApproveRedemption { actor, id } => to_data(engine.redemptions().approve(&actor, id).await?),
        Request::RejectRedemption { actor, id } => to_data(engine.redemptions().reject(&actor, id).await?),
        Request::CompleteRedemption { actor, id } => {
            to_data(engine.redemptions().complete(&actor, id).await?)
        }
        Request::SweepCarts => to_data(engine.carts().sweep_expired().await?),
    }
}

/// Parse one input line, run it, and build the reply. Never fails.
pub async fn handle_line(engine: &TradeEngine, line: &str) -> Response {
    let raw: Value = match serde_json::from_str(line) {
        Ok(v) => v,
        Err(e) => return Response::err(Value::Null, "bad_request", e.to_string()),
    };
    let id = raw.get("id").cloned().unwrap_or(Value::Null);
    let req = match Request::deserialize(raw) {
        Ok(r) => r,
        Err(e) => return Response::err(id, "bad_request", e.to_string()),
    };
    match dispatch(engine, req).await {
        Ok(data) => Response::ok(id, data),
        Err(e) => Response::err(id, e.kind(), e.to_string()),
    }
}

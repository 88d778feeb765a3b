// ===============================
// src/effects.rs (notification & audit sinks)
// ===============================
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::error;

use crate::domain::{AuditEntry, Notification};
use crate::metrics::SIDE_EFFECT_FAILURES;

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("sink queue full")]
    Full,
    #[error("sink closed")]
    Closed,
    #[error("sink failed: {0}")]
    Other(String),
}

#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(&self, note: Notification) -> Result<(), SinkError>;
}

#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record_audit(&self, entry: AuditEntry) -> Result<(), SinkError>;
}

/// Hands notifications to the `posttrade` delivery task.
pub struct ChannelNotifier {
    tx: mpsc::Sender<Notification>,
}

impl ChannelNotifier {
    pub fn new(tx: mpsc::Sender<Notification>) -> Self { Self { tx } }
}

#[async_trait]
impl NotificationSink for ChannelNotifier {
    async fn notify(&self, note: Notification) -> Result<(), SinkError> {
        self.tx.try_send(note).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SinkError::Full,
            mpsc::error::TrySendError::Closed(_) => SinkError::Closed,
        })
    }
}

/// Hands audit entries to the `recorder` journal task.
pub struct ChannelAuditor {
    tx: mpsc::Sender<AuditEntry>,
}

impl ChannelAuditor {
    pub fn new(tx: mpsc::Sender<AuditEntry>) -> Self { Self { tx } }
}

#[async_trait]
impl AuditSink for ChannelAuditor {
    async fn record_audit(&self, entry: AuditEntry) -> Result<(), SinkError> {
        self.tx.try_send(entry).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SinkError::Full,
            mpsc::error::TrySendError::Closed(_) => SinkError::Closed,
        })
    }
}

/// Keeps everything in memory. Handy in tests and for dry runs.
#[derive(Default)]
pub struct MemorySink {
    pub notes: Mutex<Vec<Notification>>,
    pub audits: Mutex<Vec<AuditEntry>>,
}

impl MemorySink {
    pub fn actions(&self) -> Vec<String> {
        self.audits.lock().iter().map(|a| a.action.clone()).collect()
    }

    pub fn messages_for(&self, owner: &str) -> Vec<String> {
        self.notes
            .lock()
            .iter()
            .filter(|n| n.owner_id == owner)
            .map(|n| n.message.clone())
            .collect()
    }
}

#[async_trait]
impl NotificationSink for MemorySink {
    async fn notify(&self, note: Notification) -> Result<(), SinkError> {
        self.notes.lock().push(note);
        Ok(())
    }
}

#[async_trait]
impl AuditSink for MemorySink {
    async fn record_audit(&self, entry: AuditEntry) -> Result<(), SinkError> {
        self.audits.lock().push(entry);
        Ok(())
    }
}

/// Audit record before it is timestamped.
pub struct Audit<'a> {
    pub action: &'a str,
    pub actor_id: &'a str,
    pub target_type: &'a str,
    pub target_id: String,
    pub changes: Value,
}

/// Best-effort fan-out to both sinks. Failures are logged and counted,
/// never returned: by the time this runs the ledger has already committed.
#[derive(Clone)]
pub struct SideEffects {
    notifier: Arc<dyn NotificationSink>,
    auditor: Arc<dyn AuditSink>,
}

impl SideEffects {
    pub fn new(notifier: Arc<dyn NotificationSink>, auditor: Arc<dyn AuditSink>) -> Self {
        Self { notifier, auditor }
    }

    pub fn memory(sink: Arc<MemorySink>) -> Self {
        Self { notifier: sink.clone(), auditor: sink }
    }

    pub async fn notify(&self, owner_id: &str, message: String, at: DateTime<Utc>) {
        let note = Notification { owner_id: owner_id.to_string(), message, at };
        if let Err(e) = self.notifier.notify(note).await {
            SIDE_EFFECT_FAILURES.with_label_values(&["notification"]).inc();
            error!(owner = %owner_id, error = %e, "notification failed");
        }
    }

    pub async fn audit(&self, a: Audit<'_>, at: DateTime<Utc>) {
        let entry = AuditEntry {
            action: a.action.to_string(),
            actor_id: a.actor_id.to_string(),
            target_type: a.target_type.to_string(),
            target_id: a.target_id,
            changes: a.changes,
            at,
        };
        if let Err(e) = self.auditor.record_audit(entry).await {
            SIDE_EFFECT_FAILURES.with_label_values(&["audit"]).inc();
            error!(action = %a.action, error = %e, "audit failed");
        }
    }

    /// Notify and audit concurrently.
    pub async fn after_commit(
        &self,
        owner_id: &str,
        message: String,
        audit: Audit<'_>,
        at: DateTime<Utc>,
    ) {
        futures_util::future::join(self.notify(owner_id, message, at), self.audit(audit, at)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Broken;

    #[async_trait]
    impl NotificationSink for Broken {
        async fn notify(&self, _: Notification) -> Result<(), SinkError> {
            Err(SinkError::Other("smtp down".into()))
        }
    }

    #[tokio::test]
    async fn failing_notifier_does_not_stop_the_audit() {
        let mem = Arc::new(MemorySink::default());
        let fx = SideEffects::new(Arc::new(Broken), mem.clone());
        fx.after_commit(
            "alice",
            "hello".into(),
            Audit {
                action: "sell_gold",
                actor_id: "alice",
                target_type: "Transaction",
                target_id: "7".into(),
                changes: json!({ "grams": "1" }),
            },
            Utc::now(),
        )
        .await;
        assert_eq!(mem.actions(), vec!["sell_gold"]);
    }

    #[tokio::test]
    async fn closed_channel_is_reported_not_panicking() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let n = ChannelNotifier::new(tx);
        let err = n
            .notify(Notification { owner_id: "a".into(), message: "m".into(), at: Utc::now() })
            .await
            .unwrap_err();
        assert!(matches!(err, SinkError::Closed));
    }
}

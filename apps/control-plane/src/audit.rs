use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;

/// One authorization decision, recorded whether it granted or denied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    pub account_id: String,
    pub issuer_id: String,
    pub subject: String,
    pub action: String,
    pub resource: String,
    pub authorized: bool,
    pub timestamp: DateTime<Utc>,
}

#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, entry: AuditEntry);
}

pub fn tracing_sink() -> Arc<dyn AuditSink> {
    Arc::new(TracingAuditSink)
}

pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn record(&self, entry: AuditEntry) {
        tracing::info!(
            target: "audit",
            account_id = %entry.account_id,
            issuer_id = %entry.issuer_id,
            subject = %entry.subject,
            action = %entry.action,
            resource = %entry.resource,
            authorized = entry.authorized,
            "authorization decision"
        );
    }
}

#[derive(Default)]
pub struct MemoryAuditSink {
    entries: Mutex<Vec<AuditEntry>>,
}

impl MemoryAuditSink {
    pub async fn entries(&self) -> Vec<AuditEntry> {
        self.entries.lock().await.clone()
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn record(&self, entry: AuditEntry) {
        self.entries.lock().await.push(entry);
    }
}

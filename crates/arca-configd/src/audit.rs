//! Audit sink facade (§4.5): append-only security/operational log with
//! time-based retention. No formatting or enrichment for operator display
//! happens here — that is the CLI's job, out of scope for this crate.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{Duration, Utc};

use crate::error::Result;
use crate::storage::{ConfigStore, CLEANUP_TIMEOUT, DEFAULT_IO_TIMEOUT};
use crate::types::AuditEvent;

/// Default retention window: 90 days.
pub const DEFAULT_RETENTION: StdDuration = StdDuration::from_secs(90 * 24 * 60 * 60);

/// Backend-agnostic entry point for audit log writes and retention sweeps.
#[derive(Clone)]
pub struct AuditSink {
    store: Arc<dyn ConfigStore>,
    retention: StdDuration,
}

impl AuditSink {
    #[must_use]
    pub fn new(store: Arc<dyn ConfigStore>, retention: StdDuration) -> Self {
        Self { store, retention }
    }

    #[must_use]
    pub fn with_default_retention(store: Arc<dyn ConfigStore>) -> Self {
        Self::new(store, DEFAULT_RETENTION)
    }

    /// `LogAuditEvent`. Unset `timestamp` is set to now by the backend.
    pub async fn log(&self, event: AuditEvent) -> Result<()> {
        self.store.log_audit_event(event, DEFAULT_IO_TIMEOUT).await
    }

    /// Sweep events older than the configured retention window.
    /// `CleanupAuditLog(cutoff)` → deleted count.
    pub async fn cleanup(&self) -> Result<u64> {
        let retention =
            Duration::from_std(self.retention).unwrap_or_else(|_| Duration::days(90));
        let cutoff = Utc::now() - retention;
        self.store.cleanup_audit_log(cutoff, CLEANUP_TIMEOUT).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::sqlite::SqliteStore;
    use crate::types::AuditResult;

    #[tokio::test]
    async fn log_then_cleanup_with_future_retention_keeps_event() {
        let store: Arc<dyn ConfigStore> = Arc::new(SqliteStore::open(":memory:").await.unwrap());
        let sink = AuditSink::with_default_retention(store);
        sink.log(AuditEvent {
            timestamp: None,
            user: "alice".into(),
            session_id: "s1".into(),
            source_ip: String::new(),
            correlation_id: String::new(),
            action: "lock_acquire".into(),
            result: AuditResult::Success,
            error_code: None,
            details: "{}".into(),
        })
        .await
        .unwrap();

        let deleted = sink.cleanup().await.unwrap();
        assert_eq!(deleted, 0);
    }

    #[tokio::test]
    async fn cleanup_with_zero_retention_deletes_everything() {
        let store: Arc<dyn ConfigStore> = Arc::new(SqliteStore::open(":memory:").await.unwrap());
        let sink = AuditSink::new(store, StdDuration::from_secs(0));
        sink.log(AuditEvent {
            timestamp: None,
            user: "alice".into(),
            session_id: "s1".into(),
            source_ip: String::new(),
            correlation_id: String::new(),
            action: "lock_acquire".into(),
            result: AuditResult::Success,
            error_code: None,
            details: "{}".into(),
        })
        .await
        .unwrap();

        tokio::time::sleep(StdDuration::from_millis(5)).await;
        let deleted = sink.cleanup().await.unwrap();
        assert_eq!(deleted, 1);
    }
}

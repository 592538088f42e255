//! Storage engine contract (§4.1) and its two implementations.

pub mod etcd;
pub mod sqlite;

use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;
use crate::types::{
    AuditEvent, CandidateConfig, CommitEntry, CommitRequest, DiffResult, HistoryOptions,
    LockInfo, LockTarget, RollbackRequest, RunningConfig,
};

/// Default per-operation I/O timeout on the replicated backend.
pub const DEFAULT_IO_TIMEOUT: Duration = Duration::from_secs(5);
/// Timeout for background cleanup transactions.
pub const CLEANUP_TIMEOUT: Duration = Duration::from_secs(30);
/// Default lock lease duration when a caller does not specify one.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Parameters for `AcquireLock`.
#[derive(Debug, Clone)]
pub struct AcquireLockRequest {
    pub target: LockTarget,
    pub session_id: String,
    pub user: String,
    pub timeout: Duration,
}

/// Parameters for `ExtendLock`.
#[derive(Debug, Clone)]
pub struct ExtendLockRequest {
    pub target: LockTarget,
    pub session_id: String,
    pub duration: Duration,
}

/// Parameters for `StealLock`.
#[derive(Debug, Clone)]
pub struct StealLockRequest {
    pub target: LockTarget,
    pub new_session_id: String,
    pub user: String,
    /// If non-empty, must match the current holder or the steal fails
    /// `Conflict`.
    pub target_session_id: Option<String>,
    pub reason: String,
}

/// The single polymorphic contract both storage backends satisfy.
///
/// Every operation accepts a `deadline`: the caller's cancellation/deadline
/// budget for that call, enforced with `tokio::time::timeout` at the call
/// site. An operation whose deadline fires before completion returns
/// `Timeout` (or `Internal` if the underlying driver reports something more
/// specific) without leaving partial state.
#[async_trait]
pub trait ConfigStore: Send + Sync + std::fmt::Debug {
    async fn get_running(&self, deadline: Duration) -> Result<RunningConfig>;

    async fn get_candidate(&self, session_id: &str, deadline: Duration) -> Result<CandidateConfig>;

    async fn save_candidate(
        &self,
        session_id: &str,
        config_text: &str,
        deadline: Duration,
    ) -> Result<()>;

    async fn delete_candidate(&self, session_id: &str, deadline: Duration) -> Result<()>;

    async fn commit(&self, request: CommitRequest, deadline: Duration) -> Result<String>;

    async fn rollback(&self, request: RollbackRequest, deadline: Duration) -> Result<String>;

    async fn compare_candidate_running(
        &self,
        session_id: &str,
        deadline: Duration,
    ) -> Result<DiffResult>;

    async fn compare_commits(
        &self,
        id1: &str,
        id2: &str,
        deadline: Duration,
    ) -> Result<DiffResult>;

    async fn acquire_lock(&self, request: AcquireLockRequest, deadline: Duration) -> Result<()>;

    async fn release_lock(
        &self,
        target: LockTarget,
        session_id: &str,
        deadline: Duration,
    ) -> Result<()>;

    async fn extend_lock(&self, request: ExtendLockRequest, deadline: Duration) -> Result<()>;

    async fn steal_lock(&self, request: StealLockRequest, deadline: Duration) -> Result<()>;

    async fn get_lock_info(&self, target: LockTarget, deadline: Duration) -> Result<LockInfo>;

    async fn list_commit_history(
        &self,
        options: HistoryOptions,
        deadline: Duration,
    ) -> Result<Vec<CommitEntry>>;

    async fn get_commit(&self, commit_id: &str, deadline: Duration) -> Result<CommitEntry>;

    async fn log_audit_event(&self, event: AuditEvent, deadline: Duration) -> Result<()>;

    async fn cleanup_audit_log(
        &self,
        cutoff: chrono::DateTime<chrono::Utc>,
        deadline: Duration,
    ) -> Result<u64>;

    /// Idempotent shutdown of this store's resources (connection pool,
    /// background reaper).
    async fn close(&self) -> Result<()>;
}

/// Apply `limit`/`offset` post-filtering the way `ListCommitHistory` is
/// specified to: fetch up to `limit * 2` rows (or everything when
/// `limit == 0`), filter, then slice `[offset, offset + limit)`. A single
/// over-fetch, no retry loop — see the design notes on the fetch-multiplier
/// open question.
#[must_use]
pub fn paginate(mut entries: Vec<CommitEntry>, limit: usize, offset: usize) -> Vec<CommitEntry> {
    if offset >= entries.len() {
        return Vec::new();
    }
    let end = if limit == 0 {
        entries.len()
    } else {
        (offset + limit).min(entries.len())
    };
    entries.drain(0..offset);
    let keep = end - offset;
    entries.truncate(keep);
    entries
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn entry(id: &str) -> CommitEntry {
        CommitEntry {
            commit_id: id.to_string(),
            user: "alice".to_string(),
            timestamp: Utc::now(),
            message: String::new(),
            config_text: String::new(),
            is_rollback: false,
            source_ip: String::new(),
        }
    }

    #[test]
    fn paginate_zero_limit_returns_all() {
        let entries = vec![entry("a"), entry("b"), entry("c")];
        let result = paginate(entries, 0, 0);
        assert_eq!(result.len(), 3);
    }

    #[test]
    fn paginate_offset_beyond_size_returns_empty() {
        let entries = vec![entry("a")];
        let result = paginate(entries, 10, 5);
        assert!(result.is_empty());
    }

    #[test]
    fn paginate_applies_offset_and_limit() {
        let entries = vec![entry("a"), entry("b"), entry("c"), entry("d")];
        let result = paginate(entries, 2, 1);
        assert_eq!(
            result.iter().map(|e| e.commit_id.as_str()).collect::<Vec<_>>(),
            vec!["b", "c"]
        );
    }
}

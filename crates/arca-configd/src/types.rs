//! Data records persisted and exchanged by the datastore (§3 of the
//! contract).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// The targets a lock can be keyed on. Closed set — see
/// [`LockTarget::parse`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LockTarget {
    /// The per-session candidate configuration.
    Candidate,
    /// The device-wide running configuration.
    Running,
}

impl LockTarget {
    /// Parse a target string, failing `Validation` for anything outside the
    /// closed set.
    pub fn parse(raw: &str) -> crate::error::Result<Self> {
        match raw {
            "candidate" => Ok(Self::Candidate),
            "running" => Ok(Self::Running),
            other => Err(crate::error::Error::Validation(format!(
                "unknown lock target {other:?}, expected \"candidate\" or \"running\""
            ))),
        }
    }

    /// The wire/storage representation of this target.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Candidate => "candidate",
            Self::Running => "running",
        }
    }
}

impl fmt::Display for LockTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The currently committed configuration. At most one instance exists in
/// storage at any time; it is replaced, never deleted, by commit/rollback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunningConfig {
    pub commit_id: String,
    pub config_text: String,
    pub timestamp: DateTime<Utc>,
}

/// A session's private editable draft.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateConfig {
    pub session_id: String,
    pub config_text: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// An immutable history record produced by commit or rollback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitEntry {
    pub commit_id: String,
    pub user: String,
    pub timestamp: DateTime<Utc>,
    pub message: String,
    pub config_text: String,
    pub is_rollback: bool,
    pub source_ip: String,
}

/// A keyed exclusive lock as persisted by the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    pub target: LockTarget,
    pub session_id: String,
    pub user: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// Backend-internal lease identifier, opaque to callers. `None` on the
    /// single-node backend, which has no server-side lease concept.
    pub backend_lease_id: Option<i64>,
}

impl LockRecord {
    /// A lock is live iff wall-clock `now` is before `expires_at`. Backends
    /// with a server-side lease additionally require the lease TTL to be
    /// positive; that check happens at the storage layer where the lease is
    /// known.
    #[must_use]
    pub fn is_live_at(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }
}

/// Snapshot returned by `GetLockInfo`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockInfo {
    pub is_locked: bool,
    pub session_id: Option<String>,
    pub user: Option<String>,
    pub acquired_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl LockInfo {
    /// The "nothing is locked" value, used when no row exists or the row
    /// has expired.
    #[must_use]
    pub const fn unlocked() -> Self {
        Self {
            is_locked: false,
            session_id: None,
            user: None,
            acquired_at: None,
            expires_at: None,
        }
    }
}

/// Outcome of `Commit` / `Conflict` result, `success` | `failure` | `denied`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditResult {
    Success,
    Failure,
    Denied,
}

impl AuditResult {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Denied => "denied",
        }
    }
}

/// An append-only security/operational event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub timestamp: Option<DateTime<Utc>>,
    pub user: String,
    pub session_id: String,
    pub source_ip: String,
    pub correlation_id: String,
    pub action: String,
    pub result: AuditResult,
    pub error_code: Option<String>,
    /// JSON-encoded string bag.
    pub details: String,
}

/// A single span of a line-level diff.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiffSpanKind {
    Delete,
    Insert,
    Equal,
}

/// One contiguous run of lines sharing a [`DiffSpanKind`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffSpan {
    pub kind: DiffSpanKind,
    pub lines: Vec<String>,
}

/// Output of the diff engine (§4.4).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffResult {
    pub diff_text: String,
    pub has_changes: bool,
}

/// Request to `Commit`.
#[derive(Debug, Clone)]
pub struct CommitRequest {
    pub session_id: String,
    pub user: String,
    pub message: String,
    pub source_ip: String,
}

/// Request to `Rollback`.
#[derive(Debug, Clone)]
pub struct RollbackRequest {
    pub commit_id: String,
    pub user: String,
    pub message: String,
    pub source_ip: String,
}

/// Filters and pagination for `ListCommitHistory`. A zero `limit` means "no
/// cap"; zero time bounds mean "no bound".
#[derive(Debug, Clone, Default)]
pub struct HistoryOptions {
    pub limit: usize,
    pub offset: usize,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub user: Option<String>,
    pub exclude_rollbacks: bool,
}

//! `ConfigStore` implementation backed by a replicated etcd cluster.
//!
//! Every mutation is a compare-and-swap transaction: [`Compare`] conditions
//! are evaluated against a value/revision read moments earlier, and a
//! failed condition maps to [`Error::Conflict`]. Locks additionally carry a
//! server-side lease so a crashed holder is reclaimed within its TTL
//! without relying on wall-clock agreement between participants.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use etcd_client::{Client, Compare, CompareOp, GetOptions, PutOptions, Txn, TxnOp};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::error::{Error, Result};
use crate::storage::{AcquireLockRequest, ConfigStore, ExtendLockRequest, StealLockRequest};
use crate::types::{
    AuditEvent, AuditResult, CandidateConfig, CommitEntry, CommitRequest, DiffResult,
    HistoryOptions, LockInfo, LockTarget, RollbackRequest, RunningConfig,
};

const LEGACY_LOCK_KEY: &str = "lock";

#[derive(Debug, Serialize, Deserialize)]
struct RunningCurrent {
    commit_id: String,
    timestamp: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
struct LockData {
    session_id: String,
    user: String,
    acquired_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    lease_id: i64,
}

/// A storage handle backed by a replicated etcd cluster.
pub struct EtcdStore {
    client: Arc<Mutex<Client>>,
    prefix: String,
    io_timeout: Duration,
    closed: AtomicBool,
}

impl std::fmt::Debug for EtcdStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EtcdStore")
            .field("prefix", &self.prefix)
            .field("io_timeout", &self.io_timeout)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl EtcdStore {
    #[must_use]
    pub fn new(client: Client, prefix: String, io_timeout: Duration) -> Self {
        Self {
            client: Arc::new(Mutex::new(client)),
            prefix,
            io_timeout,
            closed: AtomicBool::new(false),
        }
    }

    fn key(&self, suffix: &str) -> String {
        format!("{}{}", self.prefix, suffix)
    }

    fn lock_key(&self, target: LockTarget) -> String {
        self.key(&format!("lock/{}", target.as_str()))
    }

    async fn get_raw(&self, key: &str) -> Result<Option<(Vec<u8>, i64)>> {
        let mut client = self.client.lock().await;
        let resp = client.get(key, None).await?;
        Ok(resp
            .kvs()
            .first()
            .map(|kv| (kv.value().to_vec(), kv.mod_revision())))
    }

    async fn get_json<T: for<'de> Deserialize<'de>>(&self, key: &str) -> Result<Option<T>> {
        match self.get_raw(key).await? {
            None => Ok(None),
            Some((bytes, _rev)) => Ok(Some(serde_json::from_slice(&bytes)?)),
        }
    }

    async fn put_json<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let bytes = serde_json::to_vec(value)?;
        let mut client = self.client.lock().await;
        client.put(key, bytes, None).await?;
        Ok(())
    }

    async fn delete_key(&self, key: &str) -> Result<()> {
        let mut client = self.client.lock().await;
        client.delete(key, None).await?;
        Ok(())
    }

    async fn reject_legacy_lock(&self) -> Result<()> {
        let legacy = self.key(LEGACY_LOCK_KEY);
        if self.get_raw(&legacy).await?.is_some() {
            return Err(Error::Conflict(
                "legacy lock detected; migrate before use".to_string(),
            ));
        }
        Ok(())
    }

    async fn lease_ttl_positive(&self, lease_id: i64) -> Result<bool> {
        let mut client = self.client.lock().await;
        let resp = client.lease_time_to_live(lease_id, None).await?;
        Ok(resp.ttl() > 0)
    }

    async fn is_live(&self, lock: &LockData, now: DateTime<Utc>) -> Result<bool> {
        if now >= lock.expires_at {
            return Ok(false);
        }
        self.lease_ttl_positive(lock.lease_id).await
    }

    async fn write_audit(&self, mut event: AuditEvent) -> Result<()> {
        if event.timestamp.is_none() {
            event.timestamp = Some(Utc::now());
        }
        let id = ulid::Ulid::new().to_string();
        self.put_json(&self.key(&format!("audit/{id}")), &event).await
    }

    async fn write_audit_best_effort(&self, event: AuditEvent) {
        if let Err(err) = self.write_audit(event).await {
            tracing::warn!(error = %err, "best-effort audit write failed");
        }
    }
}

#[async_trait]
impl ConfigStore for EtcdStore {
    async fn get_running(&self, deadline: Duration) -> Result<RunningConfig> {
        tokio::time::timeout(deadline, async {
            let current: RunningCurrent = self
                .get_json(&self.key("running/current"))
                .await?
                .ok_or_else(|| Error::NotFound("no commit has ever been made".to_string()))?;
            let config_text = match self.get_raw(&self.key("running/config")).await? {
                Some((bytes, _)) => String::from_utf8_lossy(&bytes).into_owned(),
                None => String::new(),
            };
            Ok(RunningConfig {
                commit_id: current.commit_id,
                config_text,
                timestamp: current.timestamp,
            })
        })
        .await?
    }

    async fn get_candidate(&self, session_id: &str, deadline: Duration) -> Result<CandidateConfig> {
        tokio::time::timeout(deadline, async {
            self.get_json(&self.key(&format!("candidates/{session_id}")))
                .await?
                .ok_or_else(|| Error::NotFound(format!("no candidate for session {session_id}")))
        })
        .await?
    }

    async fn save_candidate(&self, session_id: &str, config_text: &str, deadline: Duration) -> Result<()> {
        tokio::time::timeout(deadline, async {
            let key = self.key(&format!("candidates/{session_id}"));
            let now = Utc::now();
            let created_at = match self.get_json::<CandidateConfig>(&key).await? {
                Some(existing) => existing.created_at,
                None => now,
            };
            let record = CandidateConfig {
                session_id: session_id.to_string(),
                config_text: config_text.to_string(),
                created_at,
                updated_at: now,
            };
            self.put_json(&key, &record).await
        })
        .await?
    }

    async fn delete_candidate(&self, session_id: &str, deadline: Duration) -> Result<()> {
        tokio::time::timeout(deadline, async {
            self.delete_key(&self.key(&format!("candidates/{session_id}"))).await
        })
        .await?
    }

    async fn commit(&self, request: CommitRequest, deadline: Duration) -> Result<String> {
        tokio::time::timeout(deadline, async {
            let lock_key = self.lock_key(LockTarget::Candidate);
            let (lock_bytes, lock_rev) = self
                .get_raw(&lock_key)
                .await?
                .ok_or_else(|| Error::Conflict("session does not hold a live lock on candidate".to_string()))?;
            let lock: LockData = serde_json::from_slice(&lock_bytes)?;
            if lock.session_id != request.session_id || !self.is_live(&lock, Utc::now()).await? {
                return Err(Error::Conflict(
                    "session does not hold a live lock on candidate".to_string(),
                ));
            }

            let candidate_key = self.key(&format!("candidates/{}", request.session_id));
            let (candidate_bytes, candidate_rev) = self
                .get_raw(&candidate_key)
                .await?
                .ok_or_else(|| {
                    Error::Conflict(format!(
                        "no candidate configuration exists for session {}",
                        request.session_id
                    ))
                })?;
            let candidate: CandidateConfig = serde_json::from_slice(&candidate_bytes)?;

            let now = Utc::now();
            let commit_id = uuid::Uuid::new_v4().to_string();
            let commit_entry = CommitEntry {
                commit_id: commit_id.clone(),
                user: request.user.clone(),
                timestamp: now,
                message: request.message.clone(),
                config_text: candidate.config_text.clone(),
                is_rollback: false,
                source_ip: request.source_ip.clone(),
            };
            let running_current = RunningCurrent {
                commit_id: commit_id.clone(),
                timestamp: now,
            };
            let audit_id = ulid::Ulid::new().to_string();
            let audit_event = AuditEvent {
                timestamp: Some(now),
                user: request.user.clone(),
                session_id: request.session_id.clone(),
                source_ip: request.source_ip.clone(),
                correlation_id: String::new(),
                action: "commit".to_string(),
                result: AuditResult::Success,
                error_code: None,
                details: format!("{{\"commit_id\":\"{commit_id}\"}}"),
            };

            let txn = Txn::new()
                .when([
                    Compare::mod_revision(lock_key.clone(), CompareOp::Equal, lock_rev),
                    Compare::mod_revision(candidate_key.clone(), CompareOp::Equal, candidate_rev),
                ])
                .and_then([
                    TxnOp::put(self.key("running/current"), serde_json::to_vec(&running_current)?, None),
                    TxnOp::put(self.key("running/config"), candidate.config_text.clone().into_bytes(), None),
                    TxnOp::put(
                        self.key(&format!("commits/{commit_id}")),
                        serde_json::to_vec(&commit_entry)?,
                        None,
                    ),
                    TxnOp::put(self.key(&format!("audit/{audit_id}")), serde_json::to_vec(&audit_event)?, None),
                    TxnOp::delete(candidate_key.clone(), None),
                    TxnOp::delete(lock_key.clone(), None),
                ]);

            let resp = {
                let mut client = self.client.lock().await;
                client.txn(txn).await?
            };
            if !resp.succeeded() {
                return Err(Error::Conflict(
                    "commit lost the race against a concurrent lock or candidate change".to_string(),
                ));
            }

            let mut client = self.client.lock().await;
            if let Err(err) = client.lease_revoke(lock.lease_id).await {
                tracing::warn!(error = %err, "failed to revoke candidate lock lease after commit");
            }
            drop(client);

            tracing::info!(commit_id = %commit_id, user = %request.user, "committed candidate to running");
            Ok(commit_id)
        })
        .await?
    }

    async fn rollback(&self, request: RollbackRequest, deadline: Duration) -> Result<String> {
        tokio::time::timeout(deadline, async {
            let target: CommitEntry = self
                .get_json(&self.key(&format!("commits/{}", request.commit_id)))
                .await?
                .ok_or_else(|| Error::NotFound(format!("commit {} not found", request.commit_id)))?;

            let now = Utc::now();
            let new_commit_id = uuid::Uuid::new_v4().to_string();
            let message = if request.message.is_empty() {
                format!("Rollback to commit {}", request.commit_id)
            } else {
                request.message.clone()
            };
            let commit_entry = CommitEntry {
                commit_id: new_commit_id.clone(),
                user: request.user.clone(),
                timestamp: now,
                message,
                config_text: target.config_text.clone(),
                is_rollback: true,
                source_ip: request.source_ip.clone(),
            };
            let running_current = RunningCurrent {
                commit_id: new_commit_id.clone(),
                timestamp: now,
            };
            let audit_id = ulid::Ulid::new().to_string();
            let audit_event = AuditEvent {
                timestamp: Some(now),
                user: request.user.clone(),
                session_id: String::new(),
                source_ip: request.source_ip.clone(),
                correlation_id: String::new(),
                action: "rollback".to_string(),
                result: AuditResult::Success,
                error_code: None,
                details: format!(
                    "{{\"from_commit\":\"{}\",\"new_commit\":\"{new_commit_id}\"}}",
                    request.commit_id
                ),
            };

            // Rollback does not require the candidate lock (§9 open
            // question, preserved as specified): a concurrent editor can
            // keep working on its candidate while running flips under it.
            let txn = Txn::new().and_then([
                TxnOp::put(self.key("running/current"), serde_json::to_vec(&running_current)?, None),
                TxnOp::put(self.key("running/config"), target.config_text.clone().into_bytes(), None),
                TxnOp::put(
                    self.key(&format!("commits/{new_commit_id}")),
                    serde_json::to_vec(&commit_entry)?,
                    None,
                ),
                TxnOp::put(self.key(&format!("audit/{audit_id}")), serde_json::to_vec(&audit_event)?, None),
            ]);

            let mut client = self.client.lock().await;
            client.txn(txn).await?;
            drop(client);

            tracing::info!(new_commit_id = %new_commit_id, source_commit_id = %request.commit_id, "rolled back running configuration");
            Ok(new_commit_id)
        })
        .await?
    }

    async fn compare_candidate_running(&self, session_id: &str, deadline: Duration) -> Result<DiffResult> {
        tokio::time::timeout(deadline, async {
            let candidate = self.get_candidate(session_id, self.io_timeout).await?;
            let running_text = match self.get_running(self.io_timeout).await {
                Ok(running) => running.config_text,
                Err(Error::NotFound(_)) => String::new(),
                Err(other) => return Err(other),
            };
            Ok(crate::diff::diff_configs(&running_text, &candidate.config_text))
        })
        .await?
    }

    async fn compare_commits(&self, id1: &str, id2: &str, deadline: Duration) -> Result<DiffResult> {
        tokio::time::timeout(deadline, async {
            let a = self.get_commit(id1, self.io_timeout).await?;
            let b = self.get_commit(id2, self.io_timeout).await?;
            Ok(crate::diff::diff_configs(&a.config_text, &b.config_text))
        })
        .await?
    }

    async fn acquire_lock(&self, request: AcquireLockRequest, deadline: Duration) -> Result<()> {
        tokio::time::timeout(deadline, async {
            self.reject_legacy_lock().await?;

            let lock_key = self.lock_key(request.target);
            let now = Utc::now();
            let ttl_secs = request.timeout.max(Duration::from_secs(1)).as_secs() as i64;

            let existing = self.get_raw(&lock_key).await?;

            if let Some((bytes, rev)) = &existing {
                let current: LockData = serde_json::from_slice(bytes)?;
                let live = self.is_live(&current, now).await?;

                if live && current.session_id != request.session_id {
                    return Err(Error::Conflict(format!(
                        "{} is held by another session",
                        request.target
                    )));
                }

                // Same session extends, or the lock is expired and this is
                // a reclaim. Either way CAS on (value, revision) so a
                // concurrent reclaimer cannot silently overwrite a fresh
                // acquirer (§9 compare-and-swap discipline).
                let mut client = self.client.lock().await;
                let lease = client.lease_grant(ttl_secs, None).await?;
                drop(client);

                let new_lock = LockData {
                    session_id: request.session_id.clone(),
                    user: request.user.clone(),
                    acquired_at: now,
                    expires_at: now + chrono::Duration::seconds(ttl_secs),
                    lease_id: lease.id(),
                };
                let put_opts = PutOptions::new().with_lease(lease.id());
                let txn = Txn::new()
                    .when([
                        Compare::value(lock_key.clone(), CompareOp::Equal, bytes.clone()),
                        Compare::mod_revision(lock_key.clone(), CompareOp::Equal, *rev),
                    ])
                    .and_then([TxnOp::put(
                        lock_key.clone(),
                        serde_json::to_vec(&new_lock)?,
                        Some(put_opts),
                    )]);
                let resp = {
                    let mut client = self.client.lock().await;
                    client.txn(txn).await?
                };
                if !resp.succeeded() {
                    let mut client = self.client.lock().await;
                    let _ = client.lease_revoke(lease.id()).await;
                    return Err(Error::Conflict(format!(
                        "lost the race acquiring {}",
                        request.target
                    )));
                }
                if !live {
                    let mut client = self.client.lock().await;
                    let _ = client.lease_revoke(current.lease_id).await;
                }
                return Ok(());
            }

            // No existing key: create it, guarding against a concurrent
            // first-creation with `create_revision == 0`.
            let mut client = self.client.lock().await;
            let lease = client.lease_grant(ttl_secs, None).await?;
            drop(client);
            let new_lock = LockData {
                session_id: request.session_id.clone(),
                user: request.user.clone(),
                acquired_at: now,
                expires_at: now + chrono::Duration::seconds(ttl_secs),
                lease_id: lease.id(),
            };
            let put_opts = PutOptions::new().with_lease(lease.id());
            let txn = Txn::new()
                .when([Compare::create_revision(lock_key.clone(), CompareOp::Equal, 0)])
                .and_then([TxnOp::put(lock_key, serde_json::to_vec(&new_lock)?, Some(put_opts))]);
            let resp = {
                let mut client = self.client.lock().await;
                client.txn(txn).await?
            };
            if !resp.succeeded() {
                let mut client = self.client.lock().await;
                let _ = client.lease_revoke(lease.id()).await;
                return Err(Error::Conflict(format!(
                    "lost the race acquiring {}",
                    request.target
                )));
            }
            Ok(())
        })
        .await?
    }

    async fn release_lock(&self, target: LockTarget, session_id: &str, deadline: Duration) -> Result<()> {
        tokio::time::timeout(deadline, async {
            self.reject_legacy_lock().await?;
            let lock_key = self.lock_key(target);

            let existing = self.get_raw(&lock_key).await?;
            let Some((bytes, _rev)) = existing else {
                return Ok(());
            };
            let current: LockData = serde_json::from_slice(&bytes)?;
            let now = Utc::now();
            if !self.is_live(&current, now).await? {
                self.delete_key(&lock_key).await?;
                return Ok(());
            }
            if current.session_id != session_id {
                return Err(Error::Conflict(format!("{target} is held by another session")));
            }

            self.delete_key(&lock_key).await?;
            let mut client = self.client.lock().await;
            if let Err(err) = client.lease_revoke(current.lease_id).await {
                tracing::warn!(error = %err, "failed to revoke lease on release");
            }
            Ok(())
        })
        .await?
    }

    async fn extend_lock(&self, request: ExtendLockRequest, deadline: Duration) -> Result<()> {
        tokio::time::timeout(deadline, async {
            self.reject_legacy_lock().await?;
            let lock_key = self.lock_key(request.target);

            let existing = self
                .get_raw(&lock_key)
                .await?
                .ok_or_else(|| Error::NotFound(format!("no lock exists for {}", request.target)))?;
            let (bytes, rev) = existing;
            let current: LockData = serde_json::from_slice(&bytes)?;
            let now = Utc::now();
            if !self.is_live(&current, now).await? || current.session_id != request.session_id {
                return Err(Error::Conflict(format!(
                    "{} is not held by this session",
                    request.target
                )));
            }

            let ttl_secs = request.duration.max(Duration::from_secs(1)).as_secs() as i64;
            let mut client = self.client.lock().await;
            let new_lease = client.lease_grant(ttl_secs, None).await?;
            drop(client);

            let new_lock = LockData {
                session_id: current.session_id.clone(),
                user: current.user.clone(),
                acquired_at: current.acquired_at,
                expires_at: now + chrono::Duration::seconds(ttl_secs),
                lease_id: new_lease.id(),
            };
            let put_opts = PutOptions::new().with_lease(new_lease.id());
            let txn = Txn::new()
                .when([Compare::mod_revision(lock_key.clone(), CompareOp::Equal, rev)])
                .and_then([TxnOp::put(lock_key, serde_json::to_vec(&new_lock)?, Some(put_opts))]);

            let resp = {
                let mut client = self.client.lock().await;
                client.txn(txn).await?
            };
            if !resp.succeeded() {
                let mut client = self.client.lock().await;
                let _ = client.lease_revoke(new_lease.id()).await;
                return Err(Error::Conflict(format!("lost the race extending {}", request.target)));
            }

            // The old lease is revoked only after the replacement is
            // durable (§4.2 ExtendLock contract).
            let mut client = self.client.lock().await;
            if let Err(err) = client.lease_revoke(current.lease_id).await {
                tracing::warn!(error = %err, "failed to revoke previous lease after extend");
            }
            Ok(())
        })
        .await?
    }

    async fn steal_lock(&self, request: StealLockRequest, deadline: Duration) -> Result<()> {
        tokio::time::timeout(deadline, async {
            let lock_key = self.lock_key(request.target);
            let existing = self.get_raw(&lock_key).await?;
            let now = Utc::now();

            if let Some(expected) = request.target_session_id.as_ref().filter(|s| !s.is_empty()) {
                let matches = match &existing {
                    Some((bytes, _)) => {
                        serde_json::from_slice::<LockData>(bytes).map(|d| &d.session_id == expected).unwrap_or(false)
                    }
                    None => false,
                };
                if !matches {
                    let err = Error::Conflict(format!(
                        "current holder of {} does not match target_session_id",
                        request.target
                    ));
                    self.write_audit_best_effort(AuditEvent {
                        timestamp: Some(now),
                        user: request.user.clone(),
                        session_id: request.new_session_id.clone(),
                        source_ip: String::new(),
                        correlation_id: String::new(),
                        action: "lock_steal".to_string(),
                        result: AuditResult::Failure,
                        error_code: Some(err.code().to_string()),
                        details: format!("{{\"reason\":{:?}}}", request.reason),
                    })
                    .await;
                    return Err(err);
                }
            }

            let old_lease_id = existing
                .as_ref()
                .and_then(|(bytes, _)| serde_json::from_slice::<LockData>(bytes).ok())
                .map(|d| d.lease_id);

            let ttl_secs = 1800_i64;
            let mut client = self.client.lock().await;
            let lease = client.lease_grant(ttl_secs, None).await?;
            drop(client);

            let new_lock = LockData {
                session_id: request.new_session_id.clone(),
                user: request.user.clone(),
                acquired_at: now,
                expires_at: now + chrono::Duration::seconds(ttl_secs),
                lease_id: lease.id(),
            };
            let put_opts = PutOptions::new().with_lease(lease.id());
            let mut client = self.client.lock().await;
            client
                .put(lock_key, serde_json::to_vec(&new_lock)?, Some(put_opts))
                .await?;
            drop(client);

            if let Some(old_lease) = old_lease_id {
                let mut client = self.client.lock().await;
                let _ = client.lease_revoke(old_lease).await;
            }

            self.write_audit(AuditEvent {
                timestamp: Some(now),
                user: request.user.clone(),
                session_id: request.new_session_id.clone(),
                source_ip: String::new(),
                correlation_id: String::new(),
                action: "lock_steal".to_string(),
                result: AuditResult::Success,
                error_code: None,
                details: format!("{{\"reason\":{:?}}}", request.reason),
            })
            .await?;

            tracing::warn!(target = %request.target, new_session_id = %request.new_session_id, "lock forcibly reassigned by admin");
            Ok(())
        })
        .await?
    }

    async fn get_lock_info(&self, target: LockTarget, deadline: Duration) -> Result<LockInfo> {
        tokio::time::timeout(deadline, async {
            self.reject_legacy_lock().await?;
            match self.get_raw(&self.lock_key(target)).await? {
                None => Ok(LockInfo::unlocked()),
                Some((bytes, _rev)) => {
                    let lock: LockData = serde_json::from_slice(&bytes)?;
                    if !self.is_live(&lock, Utc::now()).await? {
                        return Ok(LockInfo::unlocked());
                    }
                    Ok(LockInfo {
                        is_locked: true,
                        session_id: Some(lock.session_id),
                        user: Some(lock.user),
                        acquired_at: Some(lock.acquired_at),
                        expires_at: Some(lock.expires_at),
                    })
                }
            }
        })
        .await?
    }

    async fn list_commit_history(&self, options: HistoryOptions, deadline: Duration) -> Result<Vec<CommitEntry>> {
        tokio::time::timeout(deadline, async {
            let prefix = self.key("commits/");
            let mut client = self.client.lock().await;
            let resp = client
                .get(prefix.clone(), Some(GetOptions::new().with_prefix()))
                .await?;
            drop(client);

            let mut entries = Vec::new();
            for kv in resp.kvs() {
                let entry: CommitEntry = serde_json::from_slice(kv.value())?;
                if let Some(start) = options.start_time {
                    if entry.timestamp < start {
                        continue;
                    }
                }
                if let Some(end) = options.end_time {
                    if entry.timestamp >= end {
                        continue;
                    }
                }
                if let Some(user) = &options.user {
                    if &entry.user != user {
                        continue;
                    }
                }
                if options.exclude_rollbacks && entry.is_rollback {
                    continue;
                }
                entries.push(entry);
            }
            entries.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));

            Ok(crate::storage::paginate(entries, options.limit, options.offset))
        })
        .await?
    }

    async fn get_commit(&self, commit_id: &str, deadline: Duration) -> Result<CommitEntry> {
        tokio::time::timeout(deadline, async {
            self.get_json(&self.key(&format!("commits/{commit_id}")))
                .await?
                .ok_or_else(|| Error::NotFound(format!("commit {commit_id} not found")))
        })
        .await?
    }

    async fn log_audit_event(&self, event: AuditEvent, deadline: Duration) -> Result<()> {
        tokio::time::timeout(deadline, self.write_audit(event)).await?
    }

    async fn cleanup_audit_log(&self, cutoff: DateTime<Utc>, deadline: Duration) -> Result<u64> {
        tokio::time::timeout(deadline, async {
            let prefix = self.key("audit/");
            let mut client = self.client.lock().await;
            let resp = client
                .get(prefix.clone(), Some(GetOptions::new().with_prefix()))
                .await?;
            drop(client);

            let mut deleted = 0u64;
            for kv in resp.kvs() {
                let event: AuditEvent = match serde_json::from_slice(kv.value()) {
                    Ok(e) => e,
                    Err(_) => continue,
                };
                let Some(ts) = event.timestamp else { continue };
                if ts >= cutoff {
                    continue;
                }
                // Best-effort: a delete failure aborts only that key.
                let key = String::from_utf8_lossy(kv.key()).into_owned();
                if self.delete_key(&key).await.is_ok() {
                    deleted += 1;
                }
            }
            Ok(deleted)
        })
        .await?
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legacy_lock_key_has_no_suffix() {
        assert_eq!(LEGACY_LOCK_KEY, "lock");
    }
}

//! Session core (§4.6): per-user workflow state that drives the lock
//! manager and commit engine. `Session` is an immutable aggregate root —
//! every transition returns a new value rather than mutating in place,
//! mirroring this codebase's other domain aggregates.

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::error::{Error, Result};
use crate::parser;
use crate::storage::{AcquireLockRequest, ConfigStore, DEFAULT_IO_TIMEOUT, DEFAULT_LOCK_TIMEOUT};
use crate::types::LockTarget;

/// The two workflow modes a session can be in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionMode {
    Operational,
    Configuration,
}

/// Per-user workflow state. The storage engine owns the durable records;
/// this struct holds only the transient references the contract allows
/// (§3 Ownership).
#[derive(Debug, Clone)]
pub struct Session {
    pub id: String,
    pub username: String,
    pub mode: SessionMode,
    pub lock_acquired: bool,
    pub timeout: Duration,
    pub created_at: DateTime<Utc>,
    pub config_path: Vec<String>,
}

/// Builds a [`Session`] with the spec's defaults (`Operational` mode, a
/// 30-minute lock timeout, empty hierarchy path).
#[must_use]
pub struct SessionBuilder {
    id: String,
    username: String,
    timeout: Duration,
}

impl SessionBuilder {
    #[must_use]
    pub fn new(id: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            username: username.into(),
            timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }

    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn build(self) -> Session {
        Session {
            id: self.id,
            username: self.username,
            mode: SessionMode::Operational,
            lock_acquired: false,
            timeout: self.timeout,
            created_at: Utc::now(),
            config_path: Vec::new(),
        }
    }
}

impl Session {
    #[must_use]
    pub fn builder(id: impl Into<String>, username: impl Into<String>) -> SessionBuilder {
        SessionBuilder::new(id, username)
    }

    /// Operational → Configuration: acquire the `candidate` lock, then
    /// ensure a candidate exists. `NotFound` from `GetCandidate` is the
    /// only failure that triggers initialisation from running; any other
    /// error propagates.
    pub async fn enter_configuration_mode(&self, store: &dyn ConfigStore) -> Result<Self> {
        store
            .acquire_lock(
                AcquireLockRequest {
                    target: LockTarget::Candidate,
                    session_id: self.id.clone(),
                    user: self.username.clone(),
                    timeout: self.timeout,
                },
                DEFAULT_IO_TIMEOUT,
            )
            .await?;

        match store.get_candidate(&self.id, DEFAULT_IO_TIMEOUT).await {
            Ok(_) => {}
            Err(Error::NotFound(_)) => {
                let running_text = match store.get_running(DEFAULT_IO_TIMEOUT).await {
                    Ok(running) => running.config_text,
                    Err(Error::NotFound(_)) => String::new(),
                    Err(other) => return Err(other),
                };
                store
                    .save_candidate(&self.id, &running_text, DEFAULT_IO_TIMEOUT)
                    .await?;
            }
            Err(other) => return Err(other),
        }

        Ok(Self {
            mode: SessionMode::Configuration,
            lock_acquired: true,
            ..self.clone()
        })
    }

    /// Configuration → Operational: release the candidate lock and clear
    /// the hierarchy path. Idempotent when already `Operational`, since
    /// `ReleaseLock` on an absent lock succeeds.
    pub async fn exit_configuration_mode(&self, store: &dyn ConfigStore) -> Result<Self> {
        store
            .release_lock(LockTarget::Candidate, &self.id, DEFAULT_IO_TIMEOUT)
            .await?;

        Ok(Self {
            mode: SessionMode::Operational,
            lock_acquired: false,
            config_path: Vec::new(),
            ..self.clone()
        })
    }

    /// Close: performs the Configuration→Operational transition if
    /// currently in `Configuration` mode, otherwise a no-op.
    pub async fn close(&self, store: &dyn ConfigStore) -> Result<Self> {
        if self.mode == SessionMode::Configuration {
            self.exit_configuration_mode(store).await
        } else {
            Ok(self.clone())
        }
    }

    /// Re-reads lock state from storage and fails fast if the `candidate`
    /// lock has been lost, stolen, or expired. Called before any
    /// commit/rollback initiated from this session.
    pub async fn verify_lock(&self, store: &dyn ConfigStore) -> Result<()> {
        let info = store
            .get_lock_info(LockTarget::Candidate, DEFAULT_IO_TIMEOUT)
            .await?;

        let holds = info.is_locked && info.session_id.as_deref() == Some(self.id.as_str());
        if !holds {
            return Err(Error::Conflict(
                "candidate lock was lost, stolen, or has expired".to_string(),
            ));
        }
        Ok(())
    }

    /// `EditHierarchy(path)`: mutates `configPath` only, no storage access,
    /// no mode requirement.
    #[must_use]
    pub fn edit_hierarchy(&self, path: Vec<String>) -> Self {
        Self {
            config_path: path,
            ..self.clone()
        }
    }

    /// `UpHierarchy()`: pop the last path component, if any.
    #[must_use]
    pub fn up_hierarchy(&self) -> Self {
        let mut path = self.config_path.clone();
        path.pop();
        Self {
            config_path: path,
            ..self.clone()
        }
    }

    /// `TopHierarchy()`: clear the hierarchy path.
    #[must_use]
    pub fn top_hierarchy(&self) -> Self {
        Self {
            config_path: Vec::new(),
            ..self.clone()
        }
    }

    /// `set <args>`: append a normalised `set <path...> <args...>` line to
    /// the candidate text.
    pub async fn set_command(&self, args: &[String], store: &dyn ConfigStore) -> Result<()> {
        let line = parser::parse_set_command(args, &self.config_path);
        let candidate = store.get_candidate(&self.id, DEFAULT_IO_TIMEOUT).await?;
        let new_text = if candidate.config_text.is_empty() {
            line
        } else {
            format!("{}\n{}", candidate.config_text, line)
        };
        store
            .save_candidate(&self.id, &new_text, DEFAULT_IO_TIMEOUT)
            .await
    }

    /// `delete <args>`: removes every candidate line equal to, or prefixed
    /// (on a whitespace boundary) by, the computed path prefix. Fails
    /// `Validation` with "no matching configuration found" when nothing
    /// matched.
    pub async fn delete_command(&self, args: &[String], store: &dyn ConfigStore) -> Result<usize> {
        let prefix = parser::parse_delete_command(args, &self.config_path);
        let candidate = store.get_candidate(&self.id, DEFAULT_IO_TIMEOUT).await?;

        let lines: Vec<&str> = if candidate.config_text.is_empty() {
            Vec::new()
        } else {
            candidate.config_text.split('\n').collect()
        };
        let kept: Vec<&str> = lines
            .iter()
            .filter(|line| !parser::matches_prefix(line, &prefix))
            .copied()
            .collect();
        let deleted_count = lines.len() - kept.len();

        if deleted_count == 0 {
            return Err(Error::Validation("no matching configuration found".to_string()));
        }

        store
            .save_candidate(&self.id, &kept.join("\n"), DEFAULT_IO_TIMEOUT)
            .await?;
        Ok(deleted_count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::sqlite::SqliteStore;
    use std::sync::Arc;

    async fn store() -> Arc<dyn ConfigStore> {
        Arc::new(SqliteStore::open(":memory:").await.unwrap())
    }

    #[tokio::test]
    async fn entering_configuration_mode_initialises_candidate_from_running() {
        let store = store().await;
        store
            .acquire_lock(
                AcquireLockRequest {
                    target: LockTarget::Candidate,
                    session_id: "seed".into(),
                    user: "seed".into(),
                    timeout: DEFAULT_LOCK_TIMEOUT,
                },
                DEFAULT_IO_TIMEOUT,
            )
            .await
            .unwrap();
        store.save_candidate("seed", "set a", DEFAULT_IO_TIMEOUT).await.unwrap();
        store
            .commit(
                crate::types::CommitRequest {
                    session_id: "seed".into(),
                    user: "seed".into(),
                    message: String::new(),
                    source_ip: String::new(),
                },
                DEFAULT_IO_TIMEOUT,
            )
            .await
            .unwrap();

        let session = Session::builder("s1", "alice").build();
        let session = session.enter_configuration_mode(store.as_ref()).await.unwrap();
        assert_eq!(session.mode, SessionMode::Configuration);
        let candidate = store.get_candidate("s1", DEFAULT_IO_TIMEOUT).await.unwrap();
        assert_eq!(candidate.config_text, "set a");
    }

    #[tokio::test]
    async fn set_then_delete_with_whitespace_boundary() {
        let store = store().await;
        let session = Session::builder("s1", "alice").build();
        let session = session.enter_configuration_mode(store.as_ref()).await.unwrap();

        session
            .set_command(
                &["system".to_string(), "host-name".to_string(), "r1".to_string()],
                store.as_ref(),
            )
            .await
            .unwrap();
        let session = session.edit_hierarchy(vec![]);
        session
            .set_command(
                &[
                    "system".to_string(),
                    "host-name2".to_string(),
                    "r2".to_string(),
                ],
                store.as_ref(),
            )
            .await
            .unwrap();

        let deleted = session
            .delete_command(&["system".to_string(), "host-name".to_string()], store.as_ref())
            .await
            .unwrap();
        assert_eq!(deleted, 1);

        let candidate = store.get_candidate("s1", DEFAULT_IO_TIMEOUT).await.unwrap();
        assert_eq!(candidate.config_text, "set system host-name2 r2");

        let err = session
            .delete_command(&["system".to_string(), "host-name".to_string()], store.as_ref())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "VALIDATION");
    }

    #[tokio::test]
    async fn verify_lock_fails_after_lock_is_stolen() {
        let store = store().await;
        let session = Session::builder("s1", "alice").build();
        let session = session.enter_configuration_mode(store.as_ref()).await.unwrap();

        store
            .steal_lock(
                crate::storage::StealLockRequest {
                    target: LockTarget::Candidate,
                    new_session_id: "s2".into(),
                    user: "admin".into(),
                    target_session_id: None,
                    reason: "incident response".into(),
                },
                DEFAULT_IO_TIMEOUT,
            )
            .await
            .unwrap();

        let err = session.verify_lock(store.as_ref()).await.unwrap_err();
        assert_eq!(err.code(), "CONFLICT");
    }

    #[test]
    fn up_hierarchy_pops_last_component() {
        let session = Session::builder("s1", "alice")
            .build()
            .edit_hierarchy(vec!["system".to_string(), "ntp".to_string()]);
        let session = session.up_hierarchy();
        assert_eq!(session.config_path, vec!["system".to_string()]);
    }

    #[test]
    fn top_hierarchy_clears_path() {
        let session = Session::builder("s1", "alice")
            .build()
            .edit_hierarchy(vec!["system".to_string()]);
        let session = session.top_hierarchy();
        assert!(session.config_path.is_empty());
    }
}

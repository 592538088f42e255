//! Lock manager facade (§4.2): validates `target` before any I/O and
//! applies default timeouts, then delegates the actual keyed
//! compare-and-swap mutation to whichever [`ConfigStore`] backend is
//! configured.

use std::sync::Arc;
use std::time::Duration;

use crate::error::Result;
use crate::storage::{
    AcquireLockRequest, ConfigStore, ExtendLockRequest, StealLockRequest, DEFAULT_IO_TIMEOUT,
    DEFAULT_LOCK_TIMEOUT,
};
use crate::types::LockInfo;

/// Thin, backend-agnostic entry point for lock operations.
#[derive(Clone)]
pub struct LockManager {
    store: Arc<dyn ConfigStore>,
}

impl LockManager {
    #[must_use]
    pub fn new(store: Arc<dyn ConfigStore>) -> Self {
        Self { store }
    }

    /// `AcquireLock{target,sessionID,user,timeout}`. `timeout` of `None`
    /// uses the default 30-minute lease.
    pub async fn acquire(
        &self,
        target: &str,
        session_id: &str,
        user: &str,
        timeout: Option<Duration>,
    ) -> Result<()> {
        let target = crate::types::LockTarget::parse(target)?;
        self.store
            .acquire_lock(
                AcquireLockRequest {
                    target,
                    session_id: session_id.to_string(),
                    user: user.to_string(),
                    timeout: timeout.unwrap_or(DEFAULT_LOCK_TIMEOUT),
                },
                DEFAULT_IO_TIMEOUT,
            )
            .await
    }

    /// `ReleaseLock{target,sessionID}`.
    pub async fn release(&self, target: &str, session_id: &str) -> Result<()> {
        let target = crate::types::LockTarget::parse(target)?;
        self.store.release_lock(target, session_id, DEFAULT_IO_TIMEOUT).await
    }

    /// `ExtendLock{target,sessionID,duration}`.
    pub async fn extend(&self, target: &str, session_id: &str, duration: Duration) -> Result<()> {
        let target = crate::types::LockTarget::parse(target)?;
        self.store
            .extend_lock(
                ExtendLockRequest {
                    target,
                    session_id: session_id.to_string(),
                    duration,
                },
                DEFAULT_IO_TIMEOUT,
            )
            .await
    }

    /// `StealLock{target,newSessionID,user,targetSessionID,reason}`, an
    /// admin operation that unconditionally replaces the current holder.
    pub async fn steal(
        &self,
        target: &str,
        new_session_id: &str,
        user: &str,
        target_session_id: Option<&str>,
        reason: &str,
    ) -> Result<()> {
        let target = crate::types::LockTarget::parse(target)?;
        self.store
            .steal_lock(
                StealLockRequest {
                    target,
                    new_session_id: new_session_id.to_string(),
                    user: user.to_string(),
                    target_session_id: target_session_id.map(str::to_string),
                    reason: reason.to_string(),
                },
                DEFAULT_IO_TIMEOUT,
            )
            .await
    }

    /// `GetLockInfo(target)`.
    pub async fn info(&self, target: &str) -> Result<LockInfo> {
        let target = crate::types::LockTarget::parse(target)?;
        self.store.get_lock_info(target, DEFAULT_IO_TIMEOUT).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::sqlite::SqliteStore;

    async fn manager() -> LockManager {
        let store = SqliteStore::open(":memory:").await.unwrap();
        LockManager::new(Arc::new(store))
    }

    #[tokio::test]
    async fn unknown_target_fails_validation_before_any_io() {
        let mgr = manager().await;
        let err = mgr.acquire("bogus", "s1", "alice", None).await.unwrap_err();
        assert_eq!(err.code(), "VALIDATION");
    }

    #[tokio::test]
    async fn acquire_then_info_reports_locked() {
        let mgr = manager().await;
        mgr.acquire("candidate", "s1", "alice", None).await.unwrap();
        let info = mgr.info("candidate").await.unwrap();
        assert!(info.is_locked);
        assert_eq!(info.session_id.as_deref(), Some("s1"));
    }

    #[tokio::test]
    async fn release_then_second_session_can_acquire() {
        let mgr = manager().await;
        mgr.acquire("candidate", "s1", "alice", None).await.unwrap();
        mgr.release("candidate", "s1").await.unwrap();
        mgr.acquire("candidate", "s2", "bob", None).await.unwrap();
    }
}

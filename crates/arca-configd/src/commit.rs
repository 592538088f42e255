//! Commit engine (§4.3): promotes a session's candidate to running, or
//! rolls running back to a prior commit. The storage-level atomicity
//! lives in each backend's `commit`/`rollback` implementation; this module
//! is the session-facing surface that resolves the CLI's `rollback N`
//! numbering, re-synchronises the candidate after a rollback, and renders
//! the user-visible output strings of §7.

use crate::error::{Error, Result};
use crate::session::Session;
use crate::storage::ConfigStore;
use crate::types::{CommitRequest, HistoryOptions, RollbackRequest};

const COMMIT_ID_PREFIX_LEN: usize = 8;

/// `CommitCheck`: schema-aware validation of configuration content is an
/// explicit non-goal (§1), so this is a fixed acknowledgement rather than
/// a real check — it exists so the session-layer CLI has something to
/// print before `Commit` the way operators expect.
#[must_use]
pub const fn commit_check() -> &'static str {
    "configuration check succeeds"
}

fn short_id(id: &str) -> &str {
    &id[..id.len().min(COMMIT_ID_PREFIX_LEN)]
}

/// Verify the session's lock, commit its candidate, and render the
/// success message: `"commit complete"` plus the 8-character prefix of
/// the new commit id (§7).
pub async fn commit(session: &Session, store: &dyn ConfigStore, message: String, source_ip: String) -> Result<String> {
    session.verify_lock(store).await?;

    let commit_id = store
        .commit(
            CommitRequest {
                session_id: session.id.clone(),
                user: session.username.clone(),
                message,
                source_ip,
            },
            crate::storage::DEFAULT_IO_TIMEOUT,
        )
        .await?;

    Ok(format!("commit complete\n{}", short_id(&commit_id)))
}

/// `rollback 0`: discard the candidate by overwriting it with the current
/// running text, without appending a history entry. Treats a missing
/// running configuration as empty text, matching the datastore's "missing
/// running treated as empty text" rule (§4.1).
pub async fn discard(session: &Session, store: &dyn ConfigStore) -> Result<String> {
    let running_text = match store.get_running(crate::storage::DEFAULT_IO_TIMEOUT).await {
        Ok(running) => running.config_text,
        Err(Error::NotFound(_)) => String::new(),
        Err(other) => return Err(other),
    };
    store
        .save_candidate(&session.id, &running_text, crate::storage::DEFAULT_IO_TIMEOUT)
        .await?;
    Ok("changes discarded".to_string())
}

/// `rollback N`: N=0 is [`discard`]; N>0 selects the Nth-previous commit
/// from the newest-first history (index 0 is the current commit) and
/// rolls running back to it. Fails `Validation` naming the available
/// depth when `N` exceeds the history length. After a successful
/// non-discard rollback, the session's candidate is re-synchronised with
/// the new running text (§4.3).
pub async fn rollback_with_number(
    session: &Session,
    store: &dyn ConfigStore,
    n: usize,
    user: String,
    source_ip: String,
) -> Result<String> {
    if n == 0 {
        return discard(session, store).await;
    }

    let history = store
        .list_commit_history(HistoryOptions::default(), crate::storage::DEFAULT_IO_TIMEOUT)
        .await?;

    let target = history.get(n).ok_or_else(|| {
        Error::Validation(format!(
            "rollback {n} exceeds available history depth of {}",
            history.len()
        ))
    })?;

    let new_commit_id = store
        .rollback(
            RollbackRequest {
                commit_id: target.commit_id.clone(),
                user,
                message: String::new(),
                source_ip,
            },
            crate::storage::DEFAULT_IO_TIMEOUT,
        )
        .await?;

    let running = store.get_running(crate::storage::DEFAULT_IO_TIMEOUT).await?;
    store
        .save_candidate(&session.id, &running.config_text, crate::storage::DEFAULT_IO_TIMEOUT)
        .await?;

    Ok(format!(
        "rollback complete\n{} -> {}",
        short_id(&target.commit_id),
        short_id(&new_commit_id)
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::sqlite::SqliteStore;
    use crate::storage::{AcquireLockRequest, DEFAULT_LOCK_TIMEOUT};
    use crate::types::LockTarget;
    use std::sync::Arc;

    async fn store() -> Arc<dyn ConfigStore> {
        Arc::new(SqliteStore::open(":memory:").await.unwrap())
    }

    async fn seed_commit(store: &dyn ConfigStore, session_id: &str, text: &str) -> String {
        store
            .acquire_lock(
                AcquireLockRequest {
                    target: LockTarget::Candidate,
                    session_id: session_id.to_string(),
                    user: "alice".into(),
                    timeout: DEFAULT_LOCK_TIMEOUT,
                },
                crate::storage::DEFAULT_IO_TIMEOUT,
            )
            .await
            .unwrap();
        store
            .save_candidate(session_id, text, crate::storage::DEFAULT_IO_TIMEOUT)
            .await
            .unwrap();
        store
            .commit(
                CommitRequest {
                    session_id: session_id.to_string(),
                    user: "alice".to_string(),
                    message: String::new(),
                    source_ip: String::new(),
                },
                crate::storage::DEFAULT_IO_TIMEOUT,
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn commit_renders_short_prefix_of_new_id() {
        let store = store().await;
        let session = Session::builder("s1", "alice").build();
        let session = session.enter_configuration_mode(store.as_ref()).await.unwrap();
        session
            .set_command(&["system".to_string(), "host-name".to_string(), "r1".to_string()], store.as_ref())
            .await
            .unwrap();

        let message = commit(&session, store.as_ref(), String::new(), String::new()).await.unwrap();
        assert!(message.starts_with("commit complete\n"));
        let prefix = message.rsplit('\n').next().unwrap();
        assert_eq!(prefix.len(), 8);
    }

    #[tokio::test]
    async fn commit_without_lock_fails_conflict() {
        let store = store().await;
        let session = Session::builder("s1", "alice").build();
        store.save_candidate("s1", "set a", crate::storage::DEFAULT_IO_TIMEOUT).await.unwrap();
        let err = commit(&session, store.as_ref(), String::new(), String::new()).await.unwrap_err();
        assert_eq!(err.code(), "CONFLICT");
    }

    #[tokio::test]
    async fn discard_overwrites_candidate_with_running_text() {
        let store = store().await;
        seed_commit(store.as_ref(), "seed", "set a").await;

        let session = Session::builder("s1", "alice").build();
        store.save_candidate("s1", "set a\nset b", crate::storage::DEFAULT_IO_TIMEOUT).await.unwrap();

        let message = discard(&session, store.as_ref()).await.unwrap();
        assert_eq!(message, "changes discarded");
        let candidate = store.get_candidate("s1", crate::storage::DEFAULT_IO_TIMEOUT).await.unwrap();
        assert_eq!(candidate.config_text, "set a");
    }

    #[tokio::test]
    async fn rollback_with_number_zero_is_discard() {
        let store = store().await;
        seed_commit(store.as_ref(), "seed", "set a").await;
        let session = Session::builder("s1", "alice").build();
        store.save_candidate("s1", "set a\nset b", crate::storage::DEFAULT_IO_TIMEOUT).await.unwrap();

        let message = rollback_with_number(&session, store.as_ref(), 0, "alice".into(), String::new())
            .await
            .unwrap();
        assert_eq!(message, "changes discarded");
    }

    #[tokio::test]
    async fn rollback_with_number_selects_nth_previous_commit() {
        let store = store().await;
        let c1 = seed_commit(store.as_ref(), "seed", "set a").await;
        seed_commit(store.as_ref(), "seed", "set a\nset b").await;

        let session = Session::builder("s1", "alice").build();
        let message = rollback_with_number(&session, store.as_ref(), 1, "alice".into(), String::new())
            .await
            .unwrap();
        assert!(message.starts_with("rollback complete\n"));
        assert!(message.contains(&c1[..8]));

        let running = store.get_running(crate::storage::DEFAULT_IO_TIMEOUT).await.unwrap();
        assert_eq!(running.config_text, "set a");
        let candidate = store.get_candidate("s1", crate::storage::DEFAULT_IO_TIMEOUT).await.unwrap();
        assert_eq!(candidate.config_text, "set a");
    }

    #[tokio::test]
    async fn rollback_with_number_beyond_depth_fails_validation_naming_depth() {
        let store = store().await;
        seed_commit(store.as_ref(), "seed", "set a").await;
        let session = Session::builder("s1", "alice").build();

        let err = rollback_with_number(&session, store.as_ref(), 5, "alice".into(), String::new())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "VALIDATION");
        assert!(err.to_string().contains('1'));
    }
}

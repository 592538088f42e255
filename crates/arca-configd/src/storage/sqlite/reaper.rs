//! Background maintenance task that reaps expired lock rows on the
//! single-node backend (§4.2 "Background reaper").

use std::time::Duration;

use chrono::Utc;
use sqlx::SqlitePool;
use tokio::sync::broadcast;

use crate::shutdown::ShutdownSignal;
use crate::types::{AuditEvent, AuditResult};

const REAP_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Spawn the reaper loop. It never blocks foreground traffic: each tick
/// runs a single bounded `DELETE` and logs failures as audit events rather
/// than propagating them anywhere a caller could observe.
pub fn spawn(pool: SqlitePool, mut shutdown_rx: broadcast::Receiver<ShutdownSignal>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(REAP_INTERVAL);
        interval.tick().await; // first tick fires immediately; skip it.

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(err) = reap_once(&pool).await {
                        tracing::warn!(error = %err, "lock reaper sweep failed");
                    }
                }
                signal = shutdown_rx.recv() => {
                    match signal {
                        Ok(_) | Err(broadcast::error::RecvError::Closed) => break,
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    }
                }
            }
        }
        tracing::info!("lock reaper stopped");
    })
}

async fn reap_once(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    let now = Utc::now();
    let result = sqlx::query("DELETE FROM config_locks WHERE expires_at < ?")
        .bind(now.to_rfc3339())
        .execute(pool)
        .await?;

    let deleted = result.rows_affected();
    if deleted > 0 {
        tracing::info!(deleted, "lock reaper deleted expired lock rows");
        let event = AuditEvent {
            timestamp: Some(now),
            user: "system".to_string(),
            session_id: String::new(),
            source_ip: String::new(),
            correlation_id: String::new(),
            action: "lock_reap".to_string(),
            result: AuditResult::Success,
            error_code: None,
            details: format!("{{\"deleted\":{deleted}}}"),
        };
        if let Err(err) = log_reap_event(pool, &event).await {
            tracing::warn!(error = %err, "failed to log lock reaper audit event");
        }
    }

    Ok(())
}

async fn log_reap_event(pool: &SqlitePool, event: &AuditEvent) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO audit_log (timestamp, user, session_id, source_ip, correlation_id, action, result, error_code, details)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(event.timestamp.unwrap_or_else(Utc::now).to_rfc3339())
    .bind(&event.user)
    .bind(&event.session_id)
    .bind(&event.source_ip)
    .bind(&event.correlation_id)
    .bind(&event.action)
    .bind(event.result.as_str())
    .bind(&event.error_code)
    .bind(&event.details)
    .execute(pool)
    .await?;
    Ok(())
}

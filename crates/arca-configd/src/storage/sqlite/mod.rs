//! Embedded, single-node relational backend (WAL-journaled SQLite via
//! `sqlx`).

mod reaper;
mod store;

pub use store::SqliteStore;

use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;

use crate::error::{Error, Result};

/// Migrations embedded at compile time, applied in ascending order inside
/// a transaction. Each entry is `(NNN_name, sql)`.
const MIGRATIONS: &[(&str, &str)] = &[("001_init", include_str!("../../../migrations/001_init.sql"))];

/// Open (creating if absent) the database at `path` with WAL journaling,
/// then apply any pending migrations.
///
/// `path` may be the literal string `:memory:`, in which case no backup is
/// taken and the database does not persist across process restarts.
pub async fn open_pool(path: &str) -> Result<SqlitePool> {
    let is_memory = path == ":memory:";

    if !is_memory {
        if let Some(parent) = Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| Error::internal("failed to create database directory", e))?;
            }
        }
    }

    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
        .synchronous(sqlx::sqlite::SqliteSynchronous::Normal);

    // `:memory:` gives each connection its own private database with no
    // shared cache configured, so a pool of more than one connection would
    // see a fresh, unmigrated database past the first acquire. Pin the
    // pool to a single connection for that case; the on-disk WAL-journaled
    // case keeps the normal pool size.
    let pool = SqlitePoolOptions::new()
        .max_connections(if is_memory { 1 } else { 8 })
        .connect_with(options)
        .await?;

    if !is_memory {
        backup_before_migrating(path).await?;
    }
    run_migrations(&pool).await?;

    Ok(pool)
}

/// Produce a consistent-copy backup at `<path>.backup.<unix_ts>` with
/// owner-only permissions before any pending migration runs.
async fn backup_before_migrating(path: &str) -> Result<()> {
    if !Path::new(path).exists() {
        return Ok(());
    }
    let ts = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|e| Error::internal_msg(format!("system clock before epoch: {e}")))?
        .as_secs();
    let backup_path = format!("{path}.backup.{ts}");

    tokio::fs::copy(path, &backup_path)
        .await
        .map_err(|e| Error::internal("failed to back up database before migrating", e))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        std::fs::set_permissions(&backup_path, perms)
            .map_err(|e| Error::internal("failed to set backup file permissions", e))?;
    }

    Ok(())
}

async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    sqlx::query("CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL)")
        .execute(pool)
        .await?;

    let applied: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM schema_version")
        .fetch_one(pool)
        .await
        .unwrap_or(0);

    if applied > 0 {
        return Ok(());
    }

    for (name, sql) in MIGRATIONS {
        let mut tx = pool.begin().await?;
        for statement in sql.split(';') {
            let trimmed = statement.trim();
            if trimmed.is_empty() {
                continue;
            }
            sqlx::query(trimmed).execute(&mut *tx).await.map_err(|e| {
                Error::internal(format!("migration {name} failed"), e)
            })?;
        }
        tx.commit().await?;
        tracing::info!(migration = name, "applied sqlite migration");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn opening_in_memory_pool_creates_schema() {
        let pool = open_pool(":memory:").await.unwrap();
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name='config_locks'",
        )
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn opening_twice_is_idempotent() {
        let pool = open_pool(":memory:").await.unwrap();
        run_migrations(&pool).await.unwrap();
    }
}

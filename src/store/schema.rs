use sqlx::SqlitePool;

use crate::error::Result;

/// Create all tables and indexes. Idempotent; runs under the project lock
/// the first time a writer touches the database.
pub async fn ensure(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r"
        CREATE TABLE IF NOT EXISTS metrics (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            timestamp TEXT NOT NULL,
            run_name TEXT NOT NULL,
            step INTEGER NOT NULL,
            metrics TEXT NOT NULL,
            log_id TEXT,
            space_id TEXT
        )
        ",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r"
        CREATE TABLE IF NOT EXISTS system_metrics (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            timestamp TEXT NOT NULL,
            run_name TEXT NOT NULL,
            metrics TEXT NOT NULL,
            log_id TEXT,
            space_id TEXT
        )
        ",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r"
        CREATE TABLE IF NOT EXISTS configs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            run_name TEXT NOT NULL,
            config TEXT NOT NULL,
            created_at TEXT NOT NULL,
            UNIQUE(run_name)
        )
        ",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r"
        CREATE TABLE IF NOT EXISTS alerts (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            run_name TEXT NOT NULL,
            level TEXT NOT NULL,
            title TEXT NOT NULL,
            text TEXT,
            step INTEGER,
            timestamp TEXT NOT NULL,
            alert_id TEXT NOT NULL UNIQUE
        )
        ",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r"
        CREATE TABLE IF NOT EXISTS project_metadata (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        )
        ",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r"
        CREATE TABLE IF NOT EXISTS pending_uploads (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            space_id TEXT NOT NULL,
            run_name TEXT,
            step INTEGER,
            file_path TEXT NOT NULL,
            relative_path TEXT,
            created_at TEXT NOT NULL
        )
        ",
    )
    .execute(pool)
    .await?;

    for statement in [
        "CREATE INDEX IF NOT EXISTS idx_metrics_run_step ON metrics(run_name, step)",
        "CREATE INDEX IF NOT EXISTS idx_metrics_run_timestamp ON metrics(run_name, timestamp)",
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_metrics_log_id
            ON metrics(log_id) WHERE log_id IS NOT NULL",
        "CREATE INDEX IF NOT EXISTS idx_metrics_pending
            ON metrics(space_id) WHERE space_id IS NOT NULL",
        "CREATE INDEX IF NOT EXISTS idx_system_metrics_run_timestamp
            ON system_metrics(run_name, timestamp)",
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_system_metrics_log_id
            ON system_metrics(log_id) WHERE log_id IS NOT NULL",
        "CREATE INDEX IF NOT EXISTS idx_system_metrics_pending
            ON system_metrics(space_id) WHERE space_id IS NOT NULL",
        "CREATE INDEX IF NOT EXISTS idx_configs_run_name ON configs(run_name)",
        "CREATE INDEX IF NOT EXISTS idx_alerts_run_timestamp ON alerts(run_name, timestamp)",
    ] {
        sqlx::query(statement).execute(pool).await?;
    }

    Ok(())
}

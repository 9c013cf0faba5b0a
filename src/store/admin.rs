use serde_json::Value as JsonValue;
use sqlx::{Row, SqlitePool};

use super::ProjectStore;
use crate::error::Result;
use crate::lock::ProcessLockGuard;
use crate::media::rewrite_media_prefixes;
use crate::names::sanitize_project_name;

/// Raw metric/system row, JSON left encoded. Used by run moves and the
/// snapshot import/export path.
#[derive(Debug, Clone)]
pub struct RawRow {
    pub id: i64,
    pub timestamp: String,
    pub run_name: String,
    pub step: Option<i64>,
    pub metrics: String,
    pub log_id: Option<String>,
    pub space_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RawConfigRow {
    pub run_name: String,
    pub config: String,
    pub created_at: String,
}

impl ProjectStore {
    /// Delete a run from every table, in one locked transaction.
    #[tracing::instrument(skip(self), err)]
    pub async fn delete_run(&self, project: &str, run: &str) -> Result<bool> {
        let Some(pool) = self.reader_pool(project).await? else {
            return Ok(false);
        };
        let _guard = self.lock(project).await?;
        let mut tx = pool.begin().await?;
        let mut deleted = 0;
        for table in ["metrics", "system_metrics", "configs", "alerts"] {
            let result = sqlx::query(&format!("DELETE FROM {table} WHERE run_name = ?"))
                .bind(run)
                .execute(&mut *tx)
                .await?;
            deleted += result.rows_affected();
        }
        tx.commit().await?;
        Ok(deleted > 0)
    }

    /// Move a run into another project's database.
    ///
    /// Cross-database moves cannot be one transaction; the commit order is
    /// destination insert, destination commit, source delete. A crash in
    /// between leaves duplicate rows that readers reconcile by preferring the
    /// destination. Locks are taken in name order so two concurrent movers
    /// cannot deadlock.
    #[tracing::instrument(skip(self), err)]
    pub async fn move_run(&self, project: &str, new_project: &str, run: &str) -> Result<bool> {
        if sanitize_project_name(project) == sanitize_project_name(new_project) {
            return Ok(false);
        }
        let Some(source_pool) = self.reader_pool(project).await? else {
            return Ok(false);
        };
        let target_pool = self.writer_pool(new_project).await?;
        let _guards = self.lock_pair(project, new_project).await?;

        let metrics = dump_run_rows(&source_pool, "metrics", run).await?;
        let system = dump_run_rows(&source_pool, "system_metrics", run).await?;
        let config = dump_run_config(&source_pool, run).await?;
        let alerts = sqlx::query(
            "SELECT run_name, level, title, text, step, timestamp, alert_id
             FROM alerts WHERE run_name = ? ORDER BY id",
        )
        .bind(run)
        .fetch_all(&source_pool)
        .await?;
        if metrics.is_empty() && system.is_empty() && config.is_none() {
            return Ok(false);
        }

        let old_prefix = format!("{project}/{run}/");
        let new_prefix = format!("{new_project}/{run}/");

        let mut tx = target_pool.begin().await?;
        for row in &metrics {
            let rewritten = rewrite_row_media(&row.metrics, &old_prefix, &new_prefix)?;
            sqlx::query(
                r"
                INSERT INTO metrics (timestamp, run_name, step, metrics, log_id, space_id)
                VALUES (?, ?, ?, ?, ?, ?)
                ",
            )
            .bind(&row.timestamp)
            .bind(run)
            .bind(row.step)
            .bind(rewritten)
            .bind(&row.log_id)
            .bind(&row.space_id)
            .execute(&mut *tx)
            .await?;
        }
        for row in &system {
            sqlx::query(
                r"
                INSERT INTO system_metrics (timestamp, run_name, metrics, log_id, space_id)
                VALUES (?, ?, ?, ?, ?)
                ",
            )
            .bind(&row.timestamp)
            .bind(run)
            .bind(&row.metrics)
            .bind(&row.log_id)
            .bind(&row.space_id)
            .execute(&mut *tx)
            .await?;
        }
        if let Some(config) = &config {
            sqlx::query(
                r"
                INSERT OR REPLACE INTO configs (run_name, config, created_at)
                VALUES (?, ?, ?)
                ",
            )
            .bind(run)
            .bind(&config.config)
            .bind(&config.created_at)
            .execute(&mut *tx)
            .await?;
        }
        for alert in &alerts {
            sqlx::query(
                r"
                INSERT OR IGNORE INTO alerts
                (run_name, level, title, text, step, timestamp, alert_id)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                ",
            )
            .bind(run)
            .bind(alert.get::<String, _>("level"))
            .bind(alert.get::<String, _>("title"))
            .bind(alert.get::<Option<String>, _>("text"))
            .bind(alert.get::<Option<i64>, _>("step"))
            .bind(alert.get::<String, _>("timestamp"))
            .bind(alert.get::<String, _>("alert_id"))
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        self.media().move_run(project, run, new_project, run)?;

        let mut tx = source_pool.begin().await?;
        for table in ["metrics", "system_metrics", "configs", "alerts"] {
            sqlx::query(&format!("DELETE FROM {table} WHERE run_name = ?"))
                .bind(run)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(true)
    }

    /// Rename a run within its project. Returns `false` when the target name
    /// is already taken.
    #[tracing::instrument(skip(self), err)]
    pub async fn rename_run(&self, project: &str, old: &str, new: &str) -> Result<bool> {
        if old == new {
            return Ok(true);
        }
        let Some(pool) = self.reader_pool(project).await? else {
            return Ok(false);
        };
        let _guard = self.lock(project).await?;

        let taken: Option<i64> =
            sqlx::query_scalar("SELECT 1 FROM metrics WHERE run_name = ? LIMIT 1")
                .bind(new)
                .fetch_optional(&pool)
                .await?;
        if taken.is_some() {
            return Ok(false);
        }

        let old_prefix = format!("{project}/{old}/");
        let new_prefix = format!("{project}/{new}/");
        let rows = dump_run_rows(&pool, "metrics", old).await?;

        let mut tx = pool.begin().await?;
        for row in &rows {
            let rewritten = rewrite_row_media(&row.metrics, &old_prefix, &new_prefix)?;
            sqlx::query("UPDATE metrics SET metrics = ? WHERE id = ?")
                .bind(rewritten)
                .bind(row.id)
                .execute(&mut *tx)
                .await?;
        }
        for table in ["metrics", "system_metrics", "configs", "alerts"] {
            sqlx::query(&format!(
                "UPDATE {table} SET run_name = ? WHERE run_name = ?"
            ))
            .bind(new)
            .bind(old)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        self.media().move_run(project, old, project, new)?;
        Ok(true)
    }

    /// Acquire two project locks in name order.
    async fn lock_pair(
        &self,
        a: &str,
        b: &str,
    ) -> Result<(ProcessLockGuard, Option<ProcessLockGuard>)> {
        let ka = sanitize_project_name(a);
        let kb = sanitize_project_name(b);
        if ka == kb {
            return Ok((self.lock(a).await?, None));
        }
        if ka < kb {
            let first = self.lock(a).await?;
            let second = self.lock(b).await?;
            Ok((first, Some(second)))
        } else {
            let first = self.lock(b).await?;
            let second = self.lock(a).await?;
            Ok((first, Some(second)))
        }
    }
}

// ---------------------------------------------------------------------------
// Raw table access (snapshot import/export, run moves)
// ---------------------------------------------------------------------------

impl ProjectStore {
    /// All metric rows of a project, JSON left encoded.
    pub async fn dump_metrics(&self, project: &str) -> Result<Vec<RawRow>> {
        let Some(pool) = self.reader_pool(project).await? else {
            return Ok(Vec::new());
        };
        dump_all_rows(&pool, "metrics", true).await
    }

    pub async fn dump_system_metrics(&self, project: &str) -> Result<Vec<RawRow>> {
        let Some(pool) = self.reader_pool(project).await? else {
            return Ok(Vec::new());
        };
        dump_all_rows(&pool, "system_metrics", false).await
    }

    pub async fn dump_configs(&self, project: &str) -> Result<Vec<RawConfigRow>> {
        let Some(pool) = self.reader_pool(project).await? else {
            return Ok(Vec::new());
        };
        let rows = sqlx::query("SELECT run_name, config, created_at FROM configs")
            .fetch_all(&pool)
            .await?;
        Ok(rows
            .iter()
            .map(|row| RawConfigRow {
                run_name: row.get("run_name"),
                config: row.get("config"),
                created_at: row.get("created_at"),
            })
            .collect())
    }

    /// Replace a whole table's contents (snapshot import).
    pub async fn restore_metrics(&self, project: &str, rows: &[RawRow]) -> Result<()> {
        self.restore_rows(project, "metrics", rows, true).await
    }

    pub async fn restore_system_metrics(&self, project: &str, rows: &[RawRow]) -> Result<()> {
        self.restore_rows(project, "system_metrics", rows, false).await
    }

    pub async fn restore_configs(&self, project: &str, rows: &[RawConfigRow]) -> Result<()> {
        let pool = self.writer_pool(project).await?;
        let _guard = self.lock(project).await?;
        let mut tx = pool.begin().await?;
        sqlx::query("DELETE FROM configs").execute(&mut *tx).await?;
        for row in rows {
            sqlx::query(
                "INSERT OR REPLACE INTO configs (run_name, config, created_at) VALUES (?, ?, ?)",
            )
            .bind(&row.run_name)
            .bind(&row.config)
            .bind(&row.created_at)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn restore_rows(
        &self,
        project: &str,
        table: &str,
        rows: &[RawRow],
        with_step: bool,
    ) -> Result<()> {
        let pool = self.writer_pool(project).await?;
        let _guard = self.lock(project).await?;
        let mut tx = pool.begin().await?;
        sqlx::query(&format!("DELETE FROM {table}"))
            .execute(&mut *tx)
            .await?;
        for row in rows {
            if with_step {
                sqlx::query(&format!(
                    "INSERT INTO {table} (timestamp, run_name, step, metrics, log_id, space_id)
                     VALUES (?, ?, ?, ?, ?, ?)"
                ))
                .bind(&row.timestamp)
                .bind(&row.run_name)
                .bind(row.step.unwrap_or(0))
                .bind(&row.metrics)
                .bind(&row.log_id)
                .bind(&row.space_id)
                .execute(&mut *tx)
                .await?;
            } else {
                sqlx::query(&format!(
                    "INSERT INTO {table} (timestamp, run_name, metrics, log_id, space_id)
                     VALUES (?, ?, ?, ?, ?)"
                ))
                .bind(&row.timestamp)
                .bind(&row.run_name)
                .bind(&row.metrics)
                .bind(&row.log_id)
                .bind(&row.space_id)
                .execute(&mut *tx)
                .await?;
            }
        }
        tx.commit().await?;
        Ok(())
    }
}

async fn dump_all_rows(pool: &SqlitePool, table: &str, with_step: bool) -> Result<Vec<RawRow>> {
    let step_col = if with_step { "step, " } else { "" };
    let rows = sqlx::query(&format!(
        "SELECT id, timestamp, run_name, {step_col}metrics, log_id, space_id
         FROM {table} ORDER BY id"
    ))
    .fetch_all(pool)
    .await?;
    Ok(rows
        .iter()
        .map(|row| RawRow {
            id: row.get("id"),
            timestamp: row.get("timestamp"),
            run_name: row.get("run_name"),
            step: if with_step { row.get("step") } else { None },
            metrics: row.get("metrics"),
            log_id: row.get("log_id"),
            space_id: row.get("space_id"),
        })
        .collect())
}

async fn dump_run_rows(pool: &SqlitePool, table: &str, run: &str) -> Result<Vec<RawRow>> {
    let step_col = if table == "metrics" { "step, " } else { "" };
    let rows = sqlx::query(&format!(
        "SELECT id, timestamp, run_name, {step_col}metrics, log_id, space_id
         FROM {table} WHERE run_name = ? ORDER BY id"
    ))
    .bind(run)
    .fetch_all(pool)
    .await?;
    Ok(rows
        .iter()
        .map(|row| RawRow {
            id: row.get("id"),
            timestamp: row.get("timestamp"),
            run_name: row.get("run_name"),
            step: if table == "metrics" { row.get("step") } else { None },
            metrics: row.get("metrics"),
            log_id: row.get("log_id"),
            space_id: row.get("space_id"),
        })
        .collect())
}

async fn dump_run_config(pool: &SqlitePool, run: &str) -> Result<Option<RawConfigRow>> {
    let row = sqlx::query("SELECT run_name, config, created_at FROM configs WHERE run_name = ?")
        .bind(run)
        .fetch_optional(pool)
        .await?;
    Ok(row.map(|row| RawConfigRow {
        run_name: row.get("run_name"),
        config: row.get("config"),
        created_at: row.get("created_at"),
    }))
}

fn rewrite_row_media(encoded: &str, old_prefix: &str, new_prefix: &str) -> Result<String> {
    let value: JsonValue = serde_json::from_str(encoded)?;
    Ok(rewrite_media_prefixes(value, old_prefix, new_prefix).to_string())
}

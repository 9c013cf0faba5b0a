use serde_json::Value as JsonValue;
use sqlx::Row;

use super::ProjectStore;
use super::logs::utc_now;
use crate::error::Result;

/// Which durable-buffer table a marker operation targets.
#[derive(Debug, Clone, Copy)]
pub enum PendingTable {
    Metrics,
    SystemMetrics,
}

impl PendingTable {
    fn name(self) -> &'static str {
        match self {
            Self::Metrics => "metrics",
            Self::SystemMetrics => "system_metrics",
        }
    }
}

/// A durable-buffer row awaiting remote delivery.
#[derive(Debug, Clone)]
pub struct PendingLog {
    pub id: i64,
    pub run: String,
    pub step: Option<i64>,
    pub timestamp: String,
    pub metrics: JsonValue,
    pub log_id: Option<String>,
}

/// A media artifact awaiting remote upload.
#[derive(Debug, Clone)]
pub struct PendingUpload {
    pub id: i64,
    pub run: Option<String>,
    pub step: Option<i64>,
    pub file_path: String,
    pub relative_path: Option<String>,
}

impl ProjectStore {
    /// Durable-buffer metric rows, grouped for replay: ascending step within
    /// each run. Returns the rows and the space they are destined for.
    pub async fn get_pending_logs(
        &self,
        project: &str,
    ) -> Result<Option<(Vec<PendingLog>, String)>> {
        self.get_pending(project, PendingTable::Metrics, "run_name, step")
            .await
    }

    /// Durable-buffer system rows, ascending timestamp within each run.
    pub async fn get_pending_system_logs(
        &self,
        project: &str,
    ) -> Result<Option<(Vec<PendingLog>, String)>> {
        self.get_pending(project, PendingTable::SystemMetrics, "run_name, timestamp")
            .await
    }

    async fn get_pending(
        &self,
        project: &str,
        table: PendingTable,
        order_by: &str,
    ) -> Result<Option<(Vec<PendingLog>, String)>> {
        let Some(pool) = self.reader_pool(project).await? else {
            return Ok(None);
        };
        let step_col = match table {
            PendingTable::Metrics => "step, ",
            PendingTable::SystemMetrics => "",
        };
        let rows = sqlx::query(&format!(
            "SELECT id, timestamp, run_name, {step_col}metrics, log_id, space_id
             FROM {} WHERE space_id IS NOT NULL ORDER BY {order_by}",
            table.name()
        ))
        .fetch_all(&pool)
        .await?;
        if rows.is_empty() {
            return Ok(None);
        }
        let space_id: String = rows[0].get("space_id");
        let logs = rows
            .iter()
            .map(|row| {
                let metrics: JsonValue = serde_json::from_str(&row.get::<String, _>("metrics"))?;
                Ok(PendingLog {
                    id: row.get("id"),
                    run: row.get("run_name"),
                    step: match table {
                        PendingTable::Metrics => row.get("step"),
                        PendingTable::SystemMetrics => None,
                    },
                    timestamp: row.get("timestamp"),
                    metrics,
                    log_id: row.get("log_id"),
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Some((logs, space_id)))
    }

    /// Remove delivery markers after a remote ack; the rows stay.
    #[tracing::instrument(skip(self, ids), fields(count = ids.len()), err)]
    pub async fn clear_pending_markers(
        &self,
        project: &str,
        table: PendingTable,
        ids: &[i64],
    ) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let Some(pool) = self.reader_pool(project).await? else {
            return Ok(());
        };
        let _guard = self.lock(project).await?;
        let placeholders = vec!["?"; ids.len()].join(",");
        let sql = format!(
            "UPDATE {} SET log_id = NULL, space_id = NULL WHERE id IN ({placeholders})",
            table.name()
        );
        let mut query = sqlx::query(&sql);
        for id in ids {
            query = query.bind(id);
        }
        query.execute(&pool).await?;
        Ok(())
    }

    /// Remove delivery markers by `log_id` (the sender's ack path, where row
    /// ids are not known).
    #[tracing::instrument(skip(self, log_ids), fields(count = log_ids.len()), err)]
    pub async fn clear_markers_by_log_id(
        &self,
        project: &str,
        table: PendingTable,
        log_ids: &[String],
    ) -> Result<()> {
        if log_ids.is_empty() {
            return Ok(());
        }
        let Some(pool) = self.reader_pool(project).await? else {
            return Ok(());
        };
        let _guard = self.lock(project).await?;
        let placeholders = vec!["?"; log_ids.len()].join(",");
        let sql = format!(
            "UPDATE {} SET log_id = NULL, space_id = NULL WHERE log_id IN ({placeholders})",
            table.name()
        );
        let mut query = sqlx::query(&sql);
        for log_id in log_ids {
            query = query.bind(log_id);
        }
        query.execute(&pool).await?;
        Ok(())
    }

    /// Give every row missing a `log_id` a fresh one (no delivery marker).
    ///
    /// Force-sync resends whole tables; stable ids keep the remote side
    /// idempotent across repeated force runs.
    pub async fn assign_log_ids(&self, project: &str, table: PendingTable) -> Result<()> {
        let Some(pool) = self.reader_pool(project).await? else {
            return Ok(());
        };
        let _guard = self.lock(project).await?;
        let rows = sqlx::query(&format!(
            "SELECT id FROM {} WHERE log_id IS NULL",
            table.name()
        ))
        .fetch_all(&pool)
        .await?;
        let mut tx = pool.begin().await?;
        for row in rows {
            let id: i64 = row.get("id");
            sqlx::query(&format!("UPDATE {} SET log_id = ? WHERE id = ?", table.name()))
                .bind(uuid::Uuid::new_v4().to_string())
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// True when anything still awaits remote delivery.
    pub async fn has_pending_data(&self, project: &str) -> Result<bool> {
        let Some(pool) = self.reader_pool(project).await? else {
            return Ok(false);
        };
        for table in ["metrics", "system_metrics"] {
            let pending: Option<i64> = sqlx::query_scalar(&format!(
                "SELECT 1 FROM {table} WHERE space_id IS NOT NULL LIMIT 1"
            ))
            .fetch_optional(&pool)
            .await?;
            if pending.is_some() {
                return Ok(true);
            }
        }
        let uploads: Option<i64> = sqlx::query_scalar("SELECT 1 FROM pending_uploads LIMIT 1")
            .fetch_optional(&pool)
            .await?;
        Ok(uploads.is_some())
    }

    /// Record a media artifact that still needs uploading to the remote.
    pub async fn add_pending_upload(
        &self,
        project: &str,
        space_id: &str,
        run: Option<&str>,
        step: Option<i64>,
        file_path: &str,
        relative_path: Option<&str>,
    ) -> Result<()> {
        let pool = self.writer_pool(project).await?;
        let _guard = self.lock(project).await?;
        sqlx::query(
            r"
            INSERT INTO pending_uploads
            (space_id, run_name, step, file_path, relative_path, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ",
        )
        .bind(space_id)
        .bind(run)
        .bind(step)
        .bind(file_path)
        .bind(relative_path)
        .bind(utc_now())
        .execute(&pool)
        .await?;
        Ok(())
    }

    pub async fn get_pending_uploads(
        &self,
        project: &str,
    ) -> Result<Option<(Vec<PendingUpload>, String)>> {
        let Some(pool) = self.reader_pool(project).await? else {
            return Ok(None);
        };
        let rows = sqlx::query(
            "SELECT id, space_id, run_name, step, file_path, relative_path
             FROM pending_uploads ORDER BY id",
        )
        .fetch_all(&pool)
        .await?;
        if rows.is_empty() {
            return Ok(None);
        }
        let space_id: String = rows[0].get("space_id");
        let uploads = rows
            .iter()
            .map(|row| PendingUpload {
                id: row.get("id"),
                run: row.get("run_name"),
                step: row.get("step"),
                file_path: row.get("file_path"),
                relative_path: row.get("relative_path"),
            })
            .collect();
        Ok(Some((uploads, space_id)))
    }

    /// Uploads are cleared outright once delivered; nothing else references
    /// their rows.
    pub async fn clear_pending_uploads(&self, project: &str, ids: &[i64]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let Some(pool) = self.reader_pool(project).await? else {
            return Ok(());
        };
        let _guard = self.lock(project).await?;
        let placeholders = vec!["?"; ids.len()].join(",");
        let sql = format!("DELETE FROM pending_uploads WHERE id IN ({placeholders})");
        let mut query = sqlx::query(&sql);
        for id in ids {
            query = query.bind(id);
        }
        query.execute(&pool).await?;
        Ok(())
    }

    pub async fn set_project_metadata(&self, project: &str, key: &str, value: &str) -> Result<()> {
        let pool = self.writer_pool(project).await?;
        let _guard = self.lock(project).await?;
        sqlx::query("INSERT OR REPLACE INTO project_metadata (key, value) VALUES (?, ?)")
            .bind(key)
            .bind(value)
            .execute(&pool)
            .await?;
        Ok(())
    }

    pub async fn get_project_metadata(&self, project: &str, key: &str) -> Result<Option<String>> {
        let Some(pool) = self.reader_pool(project).await? else {
            return Ok(None);
        };
        let row = sqlx::query("SELECT value FROM project_metadata WHERE key = ?")
            .bind(key)
            .fetch_optional(&pool)
            .await?;
        Ok(row.map(|r| r.get("value")))
    }

    /// The remote space this project mirrors to, if configured.
    pub async fn get_space_id(&self, project: &str) -> Result<Option<String>> {
        self.get_project_metadata(project, "space_id").await
    }
}

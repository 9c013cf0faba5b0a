use chrono::{SecondsFormat, Utc};
use serde_json::Value as JsonValue;
use sqlx::Row;

use super::ProjectStore;
use crate::codec::{self, MetricValue, Metrics};
use crate::error::Result;

/// Current UTC time as a fixed-width RFC 3339 string. Lexicographic order on
/// these strings is chronological order, which the timestamp indexes rely on.
pub fn utc_now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

// ---------------------------------------------------------------------------
// Record types ready for batch insertion
// ---------------------------------------------------------------------------

/// Metric row ready for `bulk_log`. `metrics` is the codec-encoded JSON
/// object; a missing `step` is assigned inside the insert transaction.
#[derive(Debug, Clone)]
pub struct MetricRecord {
    pub metrics: JsonValue,
    pub step: Option<i64>,
    pub timestamp: Option<String>,
    pub log_id: Option<String>,
}

/// System metric row: timestamp is the only x-axis.
#[derive(Debug, Clone)]
pub struct SystemMetricRecord {
    pub metrics: JsonValue,
    pub timestamp: Option<String>,
    pub log_id: Option<String>,
}

/// One alert, append-only.
#[derive(Debug, Clone, serde::Serialize)]
pub struct AlertRecord {
    pub run_name: String,
    pub level: String,
    pub title: String,
    pub text: Option<String>,
    pub step: Option<i64>,
    pub timestamp: String,
    pub alert_id: String,
}

/// One point of a single metric's history.
#[derive(Debug, Clone)]
pub struct MetricPoint {
    pub step: i64,
    pub timestamp: String,
    pub value: MetricValue,
}

// ---------------------------------------------------------------------------
// Bulk writes
// ---------------------------------------------------------------------------

impl ProjectStore {
    /// Insert a batch of metric rows in one transaction under the project
    /// lock. Returns the step assigned to each record, in order.
    ///
    /// Rows without a step get `max(step)+1, max(step)+2, …` resolved inside
    /// the same transaction, so concurrent writers cannot duplicate steps.
    /// `INSERT OR IGNORE` on the unique `log_id` index makes retried batches
    /// idempotent.
    #[tracing::instrument(skip(self, records, config), fields(count = records.len()), err)]
    pub async fn bulk_log(
        &self,
        project: &str,
        run: &str,
        records: &[MetricRecord],
        config: Option<&JsonValue>,
        space_id: Option<&str>,
    ) -> Result<Vec<i64>> {
        if records.is_empty() && config.is_none() {
            return Ok(Vec::new());
        }
        let pool = self.writer_pool(project).await?;
        let _guard = self.lock(project).await?;
        let mut tx = pool.begin().await?;

        let mut next_step = if records.iter().any(|r| r.step.is_none()) {
            let max: Option<i64> =
                sqlx::query_scalar("SELECT MAX(step) FROM metrics WHERE run_name = ?")
                    .bind(run)
                    .fetch_one(&mut *tx)
                    .await?;
            max.map_or(0, |m| m + 1)
        } else {
            0
        };

        let mut assigned = Vec::with_capacity(records.len());
        for record in records {
            let step = match record.step {
                Some(s) => s,
                None => {
                    let s = next_step;
                    next_step += 1;
                    s
                }
            };
            assigned.push(step);
            let timestamp = record.timestamp.clone().unwrap_or_else(utc_now);
            sqlx::query(
                r"
                INSERT OR IGNORE INTO metrics
                (timestamp, run_name, step, metrics, log_id, space_id)
                VALUES (?, ?, ?, ?, ?, ?)
                ",
            )
            .bind(&timestamp)
            .bind(run)
            .bind(step)
            .bind(record.metrics.to_string())
            .bind(&record.log_id)
            .bind(space_id)
            .execute(&mut *tx)
            .await?;
        }

        if let Some(config) = config {
            sqlx::query(
                r"
                INSERT OR REPLACE INTO configs (run_name, config, created_at)
                VALUES (?, ?, ?)
                ",
            )
            .bind(run)
            .bind(config.to_string())
            .bind(utc_now())
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(assigned)
    }

    /// Insert a batch of system metric rows (no step column).
    #[tracing::instrument(skip(self, records), fields(count = records.len()), err)]
    pub async fn bulk_log_system(
        &self,
        project: &str,
        run: &str,
        records: &[SystemMetricRecord],
        space_id: Option<&str>,
    ) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        let pool = self.writer_pool(project).await?;
        let _guard = self.lock(project).await?;
        let mut tx = pool.begin().await?;
        for record in records {
            let timestamp = record.timestamp.clone().unwrap_or_else(utc_now);
            sqlx::query(
                r"
                INSERT OR IGNORE INTO system_metrics
                (timestamp, run_name, metrics, log_id, space_id)
                VALUES (?, ?, ?, ?, ?)
                ",
            )
            .bind(&timestamp)
            .bind(run)
            .bind(record.metrics.to_string())
            .bind(&record.log_id)
            .bind(space_id)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Append one alert row.
    #[tracing::instrument(skip(self, alert), err)]
    pub async fn add_alert(&self, project: &str, alert: &AlertRecord) -> Result<()> {
        let pool = self.writer_pool(project).await?;
        let _guard = self.lock(project).await?;
        sqlx::query(
            r"
            INSERT OR IGNORE INTO alerts
            (run_name, level, title, text, step, timestamp, alert_id)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ",
        )
        .bind(&alert.run_name)
        .bind(&alert.level)
        .bind(&alert.title)
        .bind(&alert.text)
        .bind(alert.step)
        .bind(&alert.timestamp)
        .bind(&alert.alert_id)
        .execute(&pool)
        .await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Queries
// ---------------------------------------------------------------------------

impl ProjectStore {
    /// All metric rows for a run, decoded, ordered by timestamp, with `step`
    /// and `timestamp` folded into the returned mapping.
    pub async fn get_logs(&self, project: &str, run: &str) -> Result<Vec<Metrics>> {
        let Some(pool) = self.reader_pool(project).await? else {
            return Ok(Vec::new());
        };
        let rows = sqlx::query(
            r"
            SELECT timestamp, step, metrics
            FROM metrics
            WHERE run_name = ?
            ORDER BY timestamp, id
            ",
        )
        .bind(run)
        .fetch_all(&pool)
        .await?;

        rows.iter()
            .map(|row| {
                let encoded: JsonValue = serde_json::from_str(&row.get::<String, _>("metrics"))?;
                let mut metrics = codec::decode_metrics(&encoded);
                metrics.insert(
                    "timestamp".into(),
                    MetricValue::Str(row.get::<String, _>("timestamp")),
                );
                metrics.insert("step".into(), MetricValue::Int(row.get::<i64, _>("step")));
                Ok(metrics)
            })
            .collect()
    }

    /// System metric rows for a run, decoded, timestamp folded in.
    pub async fn get_system_logs(&self, project: &str, run: &str) -> Result<Vec<Metrics>> {
        let Some(pool) = self.reader_pool(project).await? else {
            return Ok(Vec::new());
        };
        let rows = sqlx::query(
            r"
            SELECT timestamp, metrics
            FROM system_metrics
            WHERE run_name = ?
            ORDER BY timestamp, id
            ",
        )
        .bind(run)
        .fetch_all(&pool)
        .await?;

        rows.iter()
            .map(|row| {
                let encoded: JsonValue = serde_json::from_str(&row.get::<String, _>("metrics"))?;
                let mut metrics = codec::decode_metrics(&encoded);
                metrics.insert(
                    "timestamp".into(),
                    MetricValue::Str(row.get::<String, _>("timestamp")),
                );
                Ok(metrics)
            })
            .collect()
    }

    /// Run names in a project, ordered by earliest logged timestamp.
    pub async fn get_runs(&self, project: &str) -> Result<Vec<String>> {
        let Some(pool) = self.reader_pool(project).await? else {
            return Ok(Vec::new());
        };
        let rows = sqlx::query(
            r"
            SELECT run_name
            FROM metrics
            GROUP BY run_name
            ORDER BY MIN(timestamp) ASC
            ",
        )
        .fetch_all(&pool)
        .await?;
        Ok(rows
            .iter()
            .map(|r| r.get::<String, _>("run_name"))
            .collect())
    }

    pub async fn get_max_step_for_run(&self, project: &str, run: &str) -> Result<Option<i64>> {
        let Some(pool) = self.reader_pool(project).await? else {
            return Ok(None);
        };
        let max: Option<i64> =
            sqlx::query_scalar("SELECT MAX(step) FROM metrics WHERE run_name = ?")
                .bind(run)
                .fetch_one(&pool)
                .await?;
        Ok(max)
    }

    /// Decoded config for a run, or `None`.
    pub async fn get_run_config(&self, project: &str, run: &str) -> Result<Option<Metrics>> {
        let Some(pool) = self.reader_pool(project).await? else {
            return Ok(None);
        };
        let row = sqlx::query("SELECT config FROM configs WHERE run_name = ?")
            .bind(run)
            .fetch_optional(&pool)
            .await?;
        match row {
            Some(row) => {
                let encoded: JsonValue = serde_json::from_str(&row.get::<String, _>("config"))?;
                Ok(Some(codec::decode_metrics(&encoded)))
            }
            None => Ok(None),
        }
    }

    /// Configs for every run in the project.
    pub async fn get_all_run_configs(
        &self,
        project: &str,
    ) -> Result<Vec<(String, Metrics)>> {
        let Some(pool) = self.reader_pool(project).await? else {
            return Ok(Vec::new());
        };
        let rows = sqlx::query("SELECT run_name, config FROM configs ORDER BY run_name")
            .fetch_all(&pool)
            .await?;
        rows.iter()
            .map(|row| {
                let encoded: JsonValue = serde_json::from_str(&row.get::<String, _>("config"))?;
                Ok((
                    row.get::<String, _>("run_name"),
                    codec::decode_metrics(&encoded),
                ))
            })
            .collect()
    }

    /// History of a single metric in a run.
    pub async fn get_metric_values(
        &self,
        project: &str,
        run: &str,
        metric_name: &str,
    ) -> Result<Vec<MetricPoint>> {
        let logs = self.get_logs(project, run).await?;
        Ok(logs
            .into_iter()
            .filter_map(|mut metrics| {
                let value = metrics.remove(metric_name)?;
                let step = match metrics.get("step") {
                    Some(MetricValue::Int(s)) => *s,
                    _ => 0,
                };
                let timestamp = match metrics.get("timestamp") {
                    Some(MetricValue::Str(t)) => t.clone(),
                    _ => String::new(),
                };
                Some(MetricPoint {
                    step,
                    timestamp,
                    value,
                })
            })
            .collect())
    }

    /// Sorted union of metric keys logged for a run.
    pub async fn get_all_metrics_for_run(&self, project: &str, run: &str) -> Result<Vec<String>> {
        let logs = self.get_logs(project, run).await?;
        Ok(collect_keys(logs, &["timestamp", "step"]))
    }

    /// Sorted union of system metric keys logged for a run.
    pub async fn get_all_system_metrics_for_run(
        &self,
        project: &str,
        run: &str,
    ) -> Result<Vec<String>> {
        let logs = self.get_system_logs(project, run).await?;
        Ok(collect_keys(logs, &["timestamp"]))
    }

    /// Alerts for a project, optionally filtered by run, newest last.
    pub async fn get_alerts(
        &self,
        project: &str,
        run: Option<&str>,
    ) -> Result<Vec<AlertRecord>> {
        let Some(pool) = self.reader_pool(project).await? else {
            return Ok(Vec::new());
        };
        let rows = match run {
            Some(run) => {
                sqlx::query(
                    r"
                    SELECT run_name, level, title, text, step, timestamp, alert_id
                    FROM alerts WHERE run_name = ? ORDER BY timestamp
                    ",
                )
                .bind(run)
                .fetch_all(&pool)
                .await?
            }
            None => {
                sqlx::query(
                    r"
                    SELECT run_name, level, title, text, step, timestamp, alert_id
                    FROM alerts ORDER BY timestamp
                    ",
                )
                .fetch_all(&pool)
                .await?
            }
        };
        Ok(rows
            .iter()
            .map(|row| AlertRecord {
                run_name: row.get("run_name"),
                level: row.get("level"),
                title: row.get("title"),
                text: row.get("text"),
                step: row.get("step"),
                timestamp: row.get("timestamp"),
                alert_id: row.get("alert_id"),
            })
            .collect())
    }
}

fn collect_keys(logs: Vec<Metrics>, exclude: &[&str]) -> Vec<String> {
    let mut keys: Vec<String> = logs
        .into_iter()
        .flat_map(|m| m.into_keys())
        .filter(|k| !exclude.contains(&k.as_str()))
        .collect();
    keys.sort();
    keys.dedup();
    keys
}

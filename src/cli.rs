use std::sync::Arc;

use chrono::DateTime;
use serde_json::{Value as JsonValue, json};

use crate::codec::{self, MetricValue, Metrics};
use crate::error::{Result, TrackioError};
use crate::reconcile::Reconciler;
use crate::snapshot::Snapshotter;
use crate::store::ProjectStore;
use crate::store::logs::MetricPoint;

// ---------------------------------------------------------------------------
// status
// ---------------------------------------------------------------------------

/// Print per-project sync state: local-only, synced, or carrying unsynced
/// changes.
pub async fn status(store: &Arc<ProjectStore>) -> Result<()> {
    println!("Reading local projects...\n");
    let projects = store.get_projects();
    if projects.is_empty() {
        println!("No projects found.");
        return Ok(());
    }

    let mut local = Vec::new();
    let mut synced = Vec::new();
    let mut unsynced = Vec::new();
    for project in projects {
        match store.get_space_id(&project).await? {
            None => local.push(project),
            Some(_) => {
                if store.has_pending_data(&project).await? {
                    unsynced.push(project);
                } else {
                    synced.push(project);
                }
            }
        }
    }

    println!("Finished reading projects");
    if !local.is_empty() {
        println!("  * {} local project(s) [OK]", local.len());
    }
    if !synced.is_empty() {
        println!("  * {} project(s) synced to a remote [OK]", synced.len());
    }
    if !unsynced.is_empty() {
        println!(
            "  * {} project(s) with unsynced changes [WARNING]:",
            unsynced.len()
        );
        for project in &unsynced {
            println!("    - {project}");
        }
        println!(
            "\nRun `trackio sync --project {}` to sync, or `trackio sync --all` for everything.",
            unsynced[0]
        );
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// sync
// ---------------------------------------------------------------------------

pub struct SyncArgs {
    pub project: Option<String>,
    pub all: bool,
    pub space_id: Option<String>,
    pub private: bool,
    pub force: bool,
}

pub async fn sync(store: &Arc<ProjectStore>, args: SyncArgs) -> Result<()> {
    if args.all && args.project.is_some() {
        return Err(TrackioError::Other(anyhow::anyhow!(
            "cannot use --all and --project together"
        )));
    }
    if !args.all && args.project.is_none() {
        return Err(TrackioError::Other(anyhow::anyhow!(
            "must provide either --project or --all"
        )));
    }

    let reconciler = Reconciler::new(store.clone());
    if args.all {
        let outcomes = reconciler.sync_all().await?;
        if outcomes.is_empty() {
            println!("No projects with unsynced data found.");
        }
        for (project, outcome) in outcomes {
            println!(
                "{project}: {} logs, {} system rows, {} uploads delivered",
                outcome.logs_sent, outcome.system_sent, outcome.uploads_sent
            );
        }
        return Ok(());
    }

    let project = args.project.expect("checked above");
    if args.private {
        store
            .set_project_metadata(&project, "private", "true")
            .await?;
    }
    let outcome = reconciler
        .sync_project(&project, args.space_id.as_deref(), args.force)
        .await?;
    if outcome.is_empty() {
        println!("{project}: nothing to sync");
    } else {
        println!(
            "{project}: {} logs, {} system rows, {} uploads delivered",
            outcome.logs_sent, outcome.system_sent, outcome.uploads_sent
        );
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// list
// ---------------------------------------------------------------------------

fn print_list(items: &[String], key: &str, as_json: bool) {
    if as_json {
        let mut object = serde_json::Map::new();
        object.insert(key.to_string(), json!(items));
        println!("{}", JsonValue::Object(object));
    } else if items.is_empty() {
        println!("(none)");
    } else {
        for item in items {
            println!("{item}");
        }
    }
}

pub fn list_projects(store: &Arc<ProjectStore>, as_json: bool) {
    print_list(&store.get_projects(), "projects", as_json);
}

pub async fn list_runs(store: &Arc<ProjectStore>, project: &str, as_json: bool) -> Result<()> {
    print_list(&store.get_runs(project).await?, "runs", as_json);
    Ok(())
}

pub async fn list_metrics(
    store: &Arc<ProjectStore>,
    project: &str,
    run: &str,
    as_json: bool,
) -> Result<()> {
    print_list(
        &store.get_all_metrics_for_run(project, run).await?,
        "metrics",
        as_json,
    );
    Ok(())
}

pub async fn list_system_metrics(
    store: &Arc<ProjectStore>,
    project: &str,
    run: &str,
    as_json: bool,
) -> Result<()> {
    print_list(
        &store.get_all_system_metrics_for_run(project, run).await?,
        "system_metrics",
        as_json,
    );
    Ok(())
}

pub async fn list_alerts(
    store: &Arc<ProjectStore>,
    project: &str,
    run: Option<&str>,
    as_json: bool,
) -> Result<()> {
    let alerts = store.get_alerts(project, run).await?;
    if as_json {
        println!("{}", serde_json::to_string(&json!({ "alerts": alerts }))?);
    } else if alerts.is_empty() {
        println!("(none)");
    } else {
        for alert in alerts {
            let step = alert.step.map(|s| format!(" (step {s})")).unwrap_or_default();
            println!(
                "[{}] {} {} {}{step}",
                alert.level.to_uppercase(),
                alert.timestamp,
                alert.run_name,
                alert.title
            );
        }
    }
    Ok(())
}

pub async fn list_reports(
    store: &Arc<ProjectStore>,
    project: &str,
    run: Option<&str>,
    as_json: bool,
) -> Result<()> {
    let mut names = Vec::new();
    for run_name in runs_in_scope(store, project, run).await? {
        for report in extract_reports(store, project, &run_name, None).await? {
            let label = format!("{run_name}/{}", report.name);
            if !names.contains(&label) {
                names.push(label);
            }
        }
    }
    print_list(&names, "reports", as_json);
    Ok(())
}

// ---------------------------------------------------------------------------
// get
// ---------------------------------------------------------------------------

pub async fn get_project(store: &Arc<ProjectStore>, project: &str, as_json: bool) -> Result<()> {
    let runs = store.get_runs(project).await?;
    let space_id = store.get_space_id(project).await?;
    let pending = store.has_pending_data(project).await?;
    if as_json {
        println!(
            "{}",
            json!({
                "project": project,
                "runs": runs,
                "space_id": space_id,
                "has_pending_data": pending,
            })
        );
    } else {
        println!("project: {project}");
        println!("runs: {}", runs.len());
        match space_id {
            Some(space) => println!("remote: {space}{}", if pending { " (unsynced)" } else { "" }),
            None => println!("remote: (local only)"),
        }
    }
    Ok(())
}

pub async fn get_run(
    store: &Arc<ProjectStore>,
    project: &str,
    run: &str,
    as_json: bool,
) -> Result<()> {
    let logs = store.get_logs(project, run).await?;
    if logs.is_empty() {
        return Err(TrackioError::RunNotFound {
            project: project.to_string(),
            run: run.to_string(),
        });
    }
    let max_step = store.get_max_step_for_run(project, run).await?;
    let metrics = store.get_all_metrics_for_run(project, run).await?;
    let config = store.get_run_config(project, run).await?;
    if as_json {
        println!(
            "{}",
            json!({
                "project": project,
                "run": run,
                "rows": logs.len(),
                "max_step": max_step,
                "metrics": metrics,
                "config": config.as_ref().map(codec::encode_metrics).transpose()?,
            })
        );
    } else {
        println!("run: {run}");
        println!("rows: {}", logs.len());
        println!("max step: {}", max_step.map_or("-".into(), |s| s.to_string()));
        println!("metrics: {}", metrics.join(", "));
        if let Some(config) = config {
            println!("config: {}", codec::encode_metrics(&config)?);
        }
    }
    Ok(())
}

#[derive(Debug, Default)]
pub struct PointQuery {
    pub step: Option<i64>,
    pub around: Option<i64>,
    pub at_time: Option<String>,
    pub window: Option<f64>,
}

pub async fn get_metric(
    store: &Arc<ProjectStore>,
    project: &str,
    run: &str,
    name: &str,
    query: PointQuery,
    as_json: bool,
) -> Result<()> {
    let points = store.get_metric_values(project, run, name).await?;
    let selected = select_points(points, &query)?;
    print_points(name, &selected, as_json)
}

pub async fn get_system_metric(
    store: &Arc<ProjectStore>,
    project: &str,
    run: &str,
    name: &str,
    query: PointQuery,
    as_json: bool,
) -> Result<()> {
    let logs = store.get_system_logs(project, run).await?;
    let points: Vec<MetricPoint> = logs
        .into_iter()
        .filter_map(|mut metrics| {
            let value = metrics.remove(name)?;
            let timestamp = match metrics.get("timestamp") {
                Some(MetricValue::Str(t)) => t.clone(),
                _ => String::new(),
            };
            Some(MetricPoint {
                step: 0,
                timestamp,
                value,
            })
        })
        .collect();
    let selected = select_points(points, &query)?;
    print_points(name, &selected, as_json)
}

pub async fn get_alerts(
    store: &Arc<ProjectStore>,
    project: &str,
    run: Option<&str>,
    as_json: bool,
) -> Result<()> {
    list_alerts(store, project, run, as_json).await
}

pub async fn get_snapshot(store: &Arc<ProjectStore>, project: &str, as_json: bool) -> Result<()> {
    let snapshotter = Snapshotter::new(store.clone());
    snapshotter.export_project(project).await?;
    let dir = store.dir();
    let files: Vec<String> = [
        format!("{project}.parquet"),
        format!("{project}_system.parquet"),
        format!("{project}_configs.parquet"),
    ]
    .into_iter()
    .filter(|f| dir.join(f).exists())
    .map(|f| dir.join(f).display().to_string())
    .collect();
    if as_json {
        println!("{}", json!({ "project": project, "files": files }));
    } else if files.is_empty() {
        println!("no snapshot produced (empty project?)");
    } else {
        for file in files {
            println!("{file}");
        }
    }
    Ok(())
}

pub async fn get_report(
    store: &Arc<ProjectStore>,
    project: &str,
    run: &str,
    name: Option<&str>,
    as_json: bool,
) -> Result<()> {
    let reports = extract_reports(store, project, run, name).await?;
    if as_json {
        let out: Vec<JsonValue> = reports
            .iter()
            .map(|r| {
                json!({
                    "run": run,
                    "report": r.name,
                    "step": r.step,
                    "timestamp": r.timestamp,
                    "content": r.content,
                })
            })
            .collect();
        println!("{}", json!({ "reports": out }));
    } else if reports.is_empty() {
        println!("(none)");
    } else {
        for report in reports {
            let step = report.step.map_or("-".to_string(), |s| s.to_string());
            println!("# {} (step {step})\n{}\n", report.name, report.content);
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Point selection
// ---------------------------------------------------------------------------

fn select_points(points: Vec<MetricPoint>, query: &PointQuery) -> Result<Vec<MetricPoint>> {
    if let Some(step) = query.step {
        return Ok(points.into_iter().filter(|p| p.step == step).collect());
    }
    if let Some(around) = query.around {
        return Ok(points
            .into_iter()
            .min_by_key(|p| (p.step - around).unsigned_abs())
            .into_iter()
            .collect());
    }
    if let Some(at_time) = &query.at_time {
        let target = DateTime::parse_from_rfc3339(at_time)
            .map_err(|e| TrackioError::Other(anyhow::anyhow!("invalid --at-time: {e}")))?;
        let distance = |p: &MetricPoint| {
            DateTime::parse_from_rfc3339(&p.timestamp)
                .map(|ts| (ts - target).num_milliseconds().unsigned_abs())
                .unwrap_or(u64::MAX)
        };
        if let Some(window) = query.window {
            let limit = (window * 1000.0 / 2.0) as u64;
            return Ok(points.into_iter().filter(|p| distance(p) <= limit).collect());
        }
        return Ok(points.into_iter().min_by_key(distance).into_iter().collect());
    }
    Ok(points)
}

fn print_points(name: &str, points: &[MetricPoint], as_json: bool) -> Result<()> {
    if as_json {
        let values: Vec<JsonValue> = points
            .iter()
            .map(|p| {
                let mut row = Metrics::new();
                row.insert("value".into(), p.value.clone());
                Ok(json!({
                    "step": p.step,
                    "timestamp": p.timestamp,
                    "value": codec::encode_metrics(&row)?["value"].clone(),
                }))
            })
            .collect::<Result<_>>()?;
        println!("{}", json!({ "metric": name, "points": values }));
    } else if points.is_empty() {
        println!("(none)");
    } else {
        for point in points {
            let mut row = Metrics::new();
            row.insert("value".into(), point.value.clone());
            let encoded = codec::encode_metrics(&row)?;
            println!("step={} {} {}", point.step, point.timestamp, encoded["value"]);
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Report extraction
// ---------------------------------------------------------------------------

/// One markdown report pulled out of a run's metric rows.
pub struct Report {
    pub name: String,
    pub step: Option<i64>,
    pub timestamp: Option<String>,
    pub content: String,
}

async fn runs_in_scope(
    store: &Arc<ProjectStore>,
    project: &str,
    run: Option<&str>,
) -> Result<Vec<String>> {
    match run {
        Some(run) => Ok(vec![run.to_string()]),
        None => store.get_runs(project).await,
    }
}

/// Markdown reports are metrics whose value carries `_type =
/// trackio.markdown` with the content inline under `_value`.
pub async fn extract_reports(
    store: &Arc<ProjectStore>,
    project: &str,
    run: &str,
    name_filter: Option<&str>,
) -> Result<Vec<Report>> {
    let logs = store.get_logs(project, run).await?;
    let mut reports = Vec::new();
    for row in logs {
        let step = match row.get("step") {
            Some(MetricValue::Int(s)) => Some(*s),
            _ => None,
        };
        let timestamp = match row.get("timestamp") {
            Some(MetricValue::Str(t)) => Some(t.clone()),
            _ => None,
        };
        for (key, value) in &row {
            if let Some(filter) = name_filter
                && key != filter
            {
                continue;
            }
            let MetricValue::Map(map) = value else {
                continue;
            };
            let is_markdown = matches!(
                map.get("_type"),
                Some(MetricValue::Str(t)) if t == crate::media::MarkdownReport::TYPE
            );
            if !is_markdown {
                continue;
            }
            if let Some(MetricValue::Str(content)) = map.get("_value") {
                reports.push(Report {
                    name: key.clone(),
                    step,
                    timestamp: timestamp.clone(),
                    content: content.clone(),
                });
            }
        }
    }
    Ok(reports)
}

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use tokio::signal;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::codec;
use crate::error::TrackioError;
use crate::sink::{
    BulkLogRequest, BulkLogResponse, BulkLogResult, UploadMediaRequest, group_entries,
};
use crate::store::ProjectStore;
use crate::store::logs::{MetricRecord, SystemMetricRecord};

/// Presentation hints the dashboard UI reads back from the server.
#[derive(Clone, Default, serde::Serialize)]
pub struct DashboardHints {
    pub theme: Option<String>,
    pub color_palette: Option<String>,
    pub plot_order: Option<String>,
}

/// Hosted-mode state: the wrapped store plus the bearer token callers must
/// present.
#[derive(Clone)]
pub struct ServerState {
    pub store: Arc<ProjectStore>,
    pub token: Option<String>,
    pub hints: DashboardHints,
}

#[derive(Debug, thiserror::Error)]
enum ServerError {
    #[error("unauthorized")]
    Unauthorized,

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error(transparent)]
    Internal(#[from] TrackioError),
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let (status, body) = match &self {
            Self::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                serde_json::json!({ "error": "unauthorized" }),
            ),
            Self::BadRequest(msg) => (
                StatusCode::BAD_REQUEST,
                serde_json::json!({ "error": msg }),
            ),
            Self::Internal(err) => {
                tracing::error!(error = %err, "ingest handler failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    serde_json::json!({ "error": err.to_string() }),
                )
            }
        };
        (status, Json(body)).into_response()
    }
}

fn check_auth(state: &ServerState, headers: &HeaderMap) -> Result<(), ServerError> {
    let Some(expected) = &state.token else {
        return Ok(());
    };
    let presented = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    if presented == Some(expected.as_str()) {
        Ok(())
    } else {
        Err(ServerError::Unauthorized)
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// `POST /api/bulk_log` — commit a batch through the wrapped store and reply
/// with per-entry status.
async fn bulk_log(
    State(state): State<ServerState>,
    headers: HeaderMap,
    Json(request): Json<BulkLogRequest>,
) -> Result<Json<BulkLogResponse>, ServerError> {
    check_auth(&state, &headers)?;

    let mut results = Vec::with_capacity(request.logs.len());
    for entry in &request.logs {
        results.push(BulkLogResult {
            log_id: entry.log_id.clone(),
            status: "ok".into(),
        });
    }

    for ((project, run), group) in group_entries(request.logs) {
        if request.system {
            let records: Vec<SystemMetricRecord> = group
                .into_iter()
                .map(|e| SystemMetricRecord {
                    metrics: e.metrics,
                    timestamp: e.timestamp,
                    log_id: e.log_id,
                })
                .collect();
            state
                .store
                .bulk_log_system(&project, &run, &records, None)
                .await?;
        } else {
            let config = group.iter().find_map(|e| e.config.clone());
            let records: Vec<MetricRecord> = group
                .into_iter()
                .map(|e| MetricRecord {
                    metrics: e.metrics,
                    step: e.step,
                    timestamp: e.timestamp,
                    log_id: e.log_id,
                })
                .collect();
            state
                .store
                .bulk_log(&project, &run, &records, config.as_ref(), None)
                .await?;
        }
    }

    Ok(Json(BulkLogResponse { results }))
}

/// `POST /api/upload_media` — receive one media file from a remote-sink
/// client and place it under the server's media root.
async fn upload_media(
    State(state): State<ServerState>,
    headers: HeaderMap,
    Json(request): Json<UploadMediaRequest>,
) -> Result<Json<serde_json::Value>, ServerError> {
    check_auth(&state, &headers)?;

    if !is_safe_relative_path(&request.relative_path) {
        return Err(ServerError::BadRequest(format!(
            "invalid media path: {}",
            request.relative_path
        )));
    }
    let bytes = request
        .decode_data()
        .map_err(|e| ServerError::BadRequest(e.to_string()))?;

    let target = state.store.media().root().join(&request.relative_path);
    if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent).map_err(TrackioError::from)?;
    }
    std::fs::write(&target, bytes).map_err(TrackioError::from)?;
    tracing::debug!(path = %request.relative_path, "media upload stored");
    Ok(Json(serde_json::json!({ "status": "ok" })))
}

/// Relative, no parent-directory escapes.
fn is_safe_relative_path(path: &str) -> bool {
    let path = std::path::Path::new(path);
    !path.as_os_str().is_empty()
        && !path.is_absolute()
        && path
            .components()
            .all(|c| matches!(c, std::path::Component::Normal(_)))
}

async fn list_projects(State(state): State<ServerState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({ "projects": state.store.get_projects() }))
}

async fn dashboard_config(State(state): State<ServerState>) -> Json<DashboardHints> {
    Json(state.hints.clone())
}

#[derive(Deserialize)]
struct RunsQuery {
    project: String,
}

async fn list_runs(
    State(state): State<ServerState>,
    Query(query): Query<RunsQuery>,
) -> Result<Json<serde_json::Value>, ServerError> {
    let runs = state.store.get_runs(&query.project).await?;
    Ok(Json(serde_json::json!({ "runs": runs })))
}

#[derive(Deserialize)]
struct LogsQuery {
    project: String,
    run: String,
    #[serde(default)]
    system: bool,
}

async fn list_logs(
    State(state): State<ServerState>,
    Query(query): Query<LogsQuery>,
) -> Result<Json<serde_json::Value>, ServerError> {
    let logs = if query.system {
        state
            .store
            .get_system_logs(&query.project, &query.run)
            .await?
    } else {
        state.store.get_logs(&query.project, &query.run).await?
    };
    let encoded: Vec<serde_json::Value> = logs
        .iter()
        .map(codec::encode_metrics)
        .collect::<Result<_, _>>()?;
    Ok(Json(serde_json::json!({ "logs": encoded })))
}

// ---------------------------------------------------------------------------
// Router / serve
// ---------------------------------------------------------------------------

pub fn router(state: ServerState) -> Router {
    Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .route("/api/bulk_log", post(bulk_log))
        .route("/api/upload_media", post(upload_media))
        .route("/api/projects", get(list_projects))
        .route("/api/config", get(dashboard_config))
        .route("/api/runs", get(list_runs))
        .route("/api/logs", get(list_logs))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve the dashboard process until ctrl-c / SIGTERM.
pub async fn serve(addr: SocketAddr, state: ServerState) -> anyhow::Result<()> {
    let app = router(state);
    tracing::info!(%addr, "dashboard server listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    tracing::info!("dashboard server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    tracing::info!("shutdown signal received");
}

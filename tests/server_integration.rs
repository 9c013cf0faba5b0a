mod helpers;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::{Value, json};
use tower::ServiceExt;

use trackio::server::{DashboardHints, ServerState, router};

fn test_router(token: Option<&str>) -> (Router, std::sync::Arc<trackio::store::ProjectStore>) {
    let store = helpers::test_store();
    let app = router(ServerState {
        store: store.clone(),
        token: token.map(Into::into),
        hints: DashboardHints {
            theme: Some("soft".into()),
            color_palette: None,
            plot_order: None,
        },
    });
    (app, store)
}

async fn post_json(app: &Router, path: &str, token: Option<&str>, body: Value) -> (StatusCode, Value) {
    let mut builder = Request::builder()
        .method("POST")
        .uri(path)
        .header("Content-Type", "application/json");
    if let Some(token) = token {
        builder = builder.header("Authorization", format!("Bearer {token}"));
    }
    let req = builder
        .body(Body::from(serde_json::to_string(&body).unwrap()))
        .unwrap();
    let resp = app.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, body)
}

async fn get_json(app: &Router, path: &str) -> (StatusCode, Value) {
    let req = Request::builder()
        .method("GET")
        .uri(path)
        .body(Body::empty())
        .unwrap();
    let resp = app.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, body)
}

fn bulk_body() -> Value {
    json!({
        "logs": [
            {"project": "p", "run": "r", "metrics": {"loss": 1.0}, "step": 0, "log_id": "a"},
            {"project": "p", "run": "r", "metrics": {"loss": "Infinity"}, "step": 1, "log_id": "b"},
        ],
        "system": false,
    })
}

#[tokio::test]
async fn bulk_log_commits_through_the_store() {
    let (app, store) = test_router(None);
    let (status, body) = post_json(&app, "/api/bulk_log", None, bulk_body()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["results"].as_array().unwrap().len(), 2);
    assert_eq!(body["results"][0]["status"], "ok");

    let logs = store.get_logs("p", "r").await.unwrap();
    assert_eq!(logs.len(), 2);
    assert_eq!(helpers::float_of(&logs[1], "loss"), f64::INFINITY);
}

#[tokio::test]
async fn bulk_log_requires_the_configured_token() {
    let (app, store) = test_router(Some("secret"));

    let (status, _) = post_json(&app, "/api/bulk_log", None, bulk_body()).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = post_json(&app, "/api/bulk_log", Some("wrong"), bulk_body()).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = post_json(&app, "/api/bulk_log", Some("secret"), bulk_body()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(store.get_logs("p", "r").await.unwrap().len(), 2);
}

#[tokio::test]
async fn system_batches_land_in_the_system_table() {
    let (app, store) = test_router(None);
    let body = json!({
        "logs": [
            {"project": "p", "run": "r", "metrics": {"gpu_util": 91.0}},
        ],
        "system": true,
    });
    let (status, _) = post_json(&app, "/api/bulk_log", None, body).await;
    assert_eq!(status, StatusCode::OK);
    assert!(store.get_logs("p", "r").await.unwrap().is_empty());
    assert_eq!(store.get_system_logs("p", "r").await.unwrap().len(), 1);
}

#[tokio::test]
async fn query_endpoints_expose_projects_runs_and_logs() {
    let (app, _store) = test_router(None);
    post_json(&app, "/api/bulk_log", None, bulk_body()).await;

    let (status, body) = get_json(&app, "/api/projects").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["projects"], json!(["p"]));

    let (status, body) = get_json(&app, "/api/runs?project=p").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["runs"], json!(["r"]));

    let (status, body) = get_json(&app, "/api/logs?project=p&run=r").await;
    assert_eq!(status, StatusCode::OK);
    let logs = body["logs"].as_array().unwrap();
    assert_eq!(logs.len(), 2);
    // Wire form keeps the quoted non-finite marker
    assert_eq!(logs[1]["loss"], "Infinity");
}

#[tokio::test]
async fn upload_media_lands_under_the_media_root() {
    let (app, store) = test_router(None);
    let request = trackio::sink::UploadMediaRequest::new(
        "p",
        Some("r"),
        Some(0),
        "p/r/0/img.png",
        b"png-bytes",
    );
    let (status, body) = post_json(
        &app,
        "/api/upload_media",
        None,
        serde_json::to_value(&request).unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "upload failed: {body}");
    assert_eq!(
        std::fs::read(store.media().root().join("p/r/0/img.png")).unwrap(),
        b"png-bytes"
    );
}

#[tokio::test]
async fn upload_media_rejects_escaping_paths() {
    let (app, _store) = test_router(None);
    let request =
        trackio::sink::UploadMediaRequest::new("p", Some("r"), Some(0), "../evil.png", b"x");
    let (status, _) = post_json(
        &app,
        "/api/upload_media",
        None,
        serde_json::to_value(&request).unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn upload_media_requires_the_configured_token() {
    let (app, _store) = test_router(Some("secret"));
    let request =
        trackio::sink::UploadMediaRequest::new("p", Some("r"), Some(0), "p/r/0/a.png", b"x");
    let body = serde_json::to_value(&request).unwrap();

    let (status, _) = post_json(&app, "/api/upload_media", None, body.clone()).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = post_json(&app, "/api/upload_media", Some("secret"), body).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn dashboard_hints_are_served() {
    let (app, _store) = test_router(None);
    let (status, body) = get_json(&app, "/api/config").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["theme"], "soft");
}

#[tokio::test]
async fn healthz_answers() {
    let (app, _store) = test_router(None);
    let req = Request::builder()
        .method("GET")
        .uri("/healthz")
        .body(Body::empty())
        .unwrap();
    let resp = app.oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
}

mod helpers;

use trackio::codec::MetricValue;
use trackio::error::TrackioError;
use trackio::run::{InitOptions, ResumeMode, Run};
use trackio::{AlertLevel, Metrics};

fn opts(project: &str, name: Option<&str>) -> InitOptions {
    InitOptions {
        project: project.into(),
        name: name.map(Into::into),
        ..Default::default()
    }
}

#[tokio::test]
async fn steps_auto_increment_in_call_order() {
    let store = helpers::test_store();
    let run = Run::init_with_store(opts("p", Some("r")), store.clone())
        .await
        .unwrap();

    run.log(helpers::metrics(&[("a", 1.0)]), None).unwrap();
    run.log(helpers::metrics(&[("a", 2.0)]), None).unwrap();
    run.log(helpers::metrics(&[("a", 3.0)]), None).unwrap();
    run.finish().await;

    let logs = store.get_logs("p", "r").await.unwrap();
    assert_eq!(logs.len(), 3);
    for (i, row) in logs.iter().enumerate() {
        assert_eq!(helpers::step_of(row), i as i64);
        assert_eq!(helpers::float_of(row, "a"), (i + 1) as f64);
    }
}

#[tokio::test]
async fn non_finite_values_survive_storage() {
    let store = helpers::test_store();
    let run = Run::init_with_store(opts("p", Some("r")), store.clone())
        .await
        .unwrap();

    let mut m = Metrics::new();
    m.insert("loss".into(), MetricValue::Float(f64::INFINITY));
    m.insert("acc".into(), MetricValue::Float(f64::NEG_INFINITY));
    m.insert("f1".into(), MetricValue::Float(f64::NAN));
    m.insert("ok".into(), MetricValue::Float(0.5));
    run.log(m, None).unwrap();
    run.finish().await;

    let logs = store.get_logs("p", "r").await.unwrap();
    assert_eq!(logs.len(), 1);
    let row = &logs[0];
    assert_eq!(helpers::float_of(row, "loss"), f64::INFINITY);
    assert_eq!(helpers::float_of(row, "acc"), f64::NEG_INFINITY);
    assert!(helpers::float_of(row, "f1").is_nan());
    assert_eq!(helpers::float_of(row, "ok"), 0.5);
}

#[tokio::test]
async fn reserved_keys_are_renamed_not_rejected() {
    let store = helpers::test_store();
    let run = Run::init_with_store(opts("p", Some("r")), store.clone())
        .await
        .unwrap();

    let mut m = Metrics::new();
    m.insert("step".into(), MetricValue::Int(100));
    m.insert("time".into(), MetricValue::Int(200));
    m.insert("project".into(), MetricValue::Str("x".into()));
    m.insert("loss".into(), MetricValue::Float(0.5));
    run.log(m, None).unwrap();
    run.finish().await;

    let logs = store.get_logs("p", "r").await.unwrap();
    let row = &logs[0];
    assert_eq!(row.get("__step"), Some(&MetricValue::Int(100)));
    assert_eq!(row.get("__time"), Some(&MetricValue::Int(200)));
    assert_eq!(row.get("__project"), Some(&MetricValue::Str("x".into())));
    assert_eq!(helpers::float_of(row, "loss"), 0.5);
    // The folded-in step column is the real one, not the renamed metric
    assert_eq!(helpers::step_of(row), 0);
}

#[tokio::test]
async fn dunder_keys_fail_the_log_call() {
    let store = helpers::test_store();
    let run = Run::init_with_store(opts("p", Some("r")), store.clone())
        .await
        .unwrap();
    let mut m = Metrics::new();
    m.insert("__hidden".into(), MetricValue::Int(1));
    assert!(matches!(
        run.log(m, None),
        Err(TrackioError::InvalidKey(_))
    ));
    run.finish().await;
}

#[tokio::test]
async fn log_after_finish_is_rejected() {
    let store = helpers::test_store();
    let run = Run::init_with_store(opts("p", Some("r")), store.clone())
        .await
        .unwrap();
    run.log(helpers::metrics(&[("a", 1.0)]), None).unwrap();
    run.finish().await;
    assert!(run.log(helpers::metrics(&[("a", 2.0)]), None).is_err());
}

#[tokio::test]
async fn resume_must_requires_existing_run() {
    let store = helpers::test_store();
    let result = Run::init_with_store(
        InitOptions {
            project: "p".into(),
            name: Some("ghost".into()),
            resume: ResumeMode::Must,
            ..Default::default()
        },
        store,
    )
    .await;
    assert!(matches!(result, Err(TrackioError::RunNotFound { .. })));
}

#[tokio::test]
async fn resume_must_appends_to_existing_run() {
    let store = helpers::test_store();
    let first = Run::init_with_store(opts("p", Some("r")), store.clone())
        .await
        .unwrap();
    first.log(helpers::metrics(&[("a", 1.0)]), None).unwrap();
    first.finish().await;

    let resumed = Run::init_with_store(
        InitOptions {
            project: "p".into(),
            name: Some("r".into()),
            resume: ResumeMode::Must,
            ..Default::default()
        },
        store.clone(),
    )
    .await
    .unwrap();
    resumed.log(helpers::metrics(&[("a", 2.0)]), None).unwrap();
    resumed.finish().await;

    let logs = store.get_logs("p", "r").await.unwrap();
    assert_eq!(logs.len(), 2);
    // Steps continue from where the first run stopped
    assert_eq!(helpers::step_of(&logs[1]), 1);
}

#[tokio::test]
async fn resume_never_generates_fresh_name_on_collision() {
    let store = helpers::test_store();
    let first = Run::init_with_store(opts("p", Some("taken")), store.clone())
        .await
        .unwrap();
    first.log(helpers::metrics(&[("a", 1.0)]), None).unwrap();
    first.finish().await;

    let second = Run::init_with_store(
        InitOptions {
            project: "p".into(),
            name: Some("taken".into()),
            resume: ResumeMode::Never,
            ..Default::default()
        },
        store.clone(),
    )
    .await
    .unwrap();
    assert_ne!(second.name(), "taken");
    second.log(helpers::metrics(&[("b", 9.0)]), None).unwrap();
    second.finish().await;

    // The colliding run's data is untouched
    let original = store.get_logs("p", "taken").await.unwrap();
    assert_eq!(original.len(), 1);
    assert_eq!(helpers::float_of(&original[0], "a"), 1.0);
}

#[tokio::test]
async fn alerts_are_persisted() {
    let store = helpers::test_store();
    let run = Run::init_with_store(opts("p", Some("r")), store.clone())
        .await
        .unwrap();
    run.alert(
        AlertLevel::Warn,
        "loss diverged",
        Some("loss exceeded threshold"),
        Some(40),
    )
    .await;
    run.finish().await;

    let alerts = store.get_alerts("p", Some("r")).await.unwrap();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].level, "warn");
    assert_eq!(alerts[0].title, "loss diverged");
    assert_eq!(alerts[0].step, Some(40));
    assert!(!alerts[0].alert_id.is_empty());
}

#[tokio::test]
async fn system_logs_use_timestamp_axis() {
    let store = helpers::test_store();
    let run = Run::init_with_store(opts("p", Some("r")), store.clone())
        .await
        .unwrap();
    run.log_system(helpers::metrics(&[("gpu_util", 85.0)]))
        .unwrap();
    run.log_system(helpers::metrics(&[("gpu_util", 90.0)]))
        .unwrap();
    run.finish().await;

    let logs = store.get_system_logs("p", "r").await.unwrap();
    assert_eq!(logs.len(), 2);
    assert!(logs[0].contains_key("timestamp"));
    assert!(!logs[0].contains_key("step"));
    assert!(helpers::float_of(&logs[0], "gpu_util") <= helpers::float_of(&logs[1], "gpu_util"));
}

#[tokio::test]
async fn config_is_captured_once() {
    let store = helpers::test_store();
    let run = Run::init_with_store(
        InitOptions {
            project: "p".into(),
            name: Some("r".into()),
            config: Some(serde_json::json!({"lr": 0.1, "epochs": 3})),
            ..Default::default()
        },
        store.clone(),
    )
    .await
    .unwrap();
    run.log(helpers::metrics(&[("a", 1.0)]), None).unwrap();
    run.finish().await;

    let config = store.get_run_config("p", "r").await.unwrap().unwrap();
    assert_eq!(config.get("lr"), Some(&MetricValue::Float(0.1)));
    assert_eq!(config.get("epochs"), Some(&MetricValue::Int(3)));
}

#[tokio::test]
async fn markdown_reports_are_stored_inline_and_extractable() {
    let store = helpers::test_store();
    let run = Run::init_with_store(opts("p", Some("r")), store.clone())
        .await
        .unwrap();
    run.log_report("training_report", "## summary\nloss went down", None)
        .unwrap();
    run.finish().await;

    let logs = store.get_logs("p", "r").await.unwrap();
    let MetricValue::Map(report) = &logs[0]["training_report"] else {
        panic!("report value is not a map");
    };
    assert_eq!(
        report.get("_type"),
        Some(&MetricValue::Str("trackio.markdown".into()))
    );
    assert_eq!(
        report.get("_value"),
        Some(&MetricValue::Str("## summary\nloss went down".into()))
    );
    assert!(!report.contains_key("file_path"));

    let reports = trackio::cli::extract_reports(&store, "p", "r", None)
        .await
        .unwrap();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].name, "training_report");
    assert_eq!(reports[0].content, "## summary\nloss went down");
    assert_eq!(reports[0].step, Some(0));

    let filtered = trackio::cli::extract_reports(&store, "p", "r", Some("other"))
        .await
        .unwrap();
    assert!(filtered.is_empty());
}

#[tokio::test]
async fn timestamps_never_regress_within_a_run() {
    let store = helpers::test_store();
    let run = Run::init_with_store(opts("p", Some("r")), store.clone())
        .await
        .unwrap();
    for i in 0..20 {
        run.log(helpers::metrics(&[("i", f64::from(i))]), None)
            .unwrap();
    }
    run.finish().await;

    let logs = store.get_logs("p", "r").await.unwrap();
    let timestamps: Vec<String> = logs
        .iter()
        .map(|row| match row.get("timestamp") {
            Some(MetricValue::Str(t)) => t.clone(),
            _ => panic!("missing timestamp"),
        })
        .collect();
    let mut sorted = timestamps.clone();
    sorted.sort();
    assert_eq!(timestamps, sorted);
}

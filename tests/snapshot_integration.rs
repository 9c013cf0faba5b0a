mod helpers;

use std::sync::Arc;

use serde_json::json;

use trackio::snapshot::{Mirror, Snapshotter};
use trackio::store::ProjectStore;
use trackio::store::logs::MetricRecord;

fn memory_mirror() -> (opendal::Operator, Mirror) {
    let operator = opendal::Operator::new(opendal::services::Memory::default())
        .expect("memory operator")
        .finish();
    (
        operator.clone(),
        Mirror {
            operator,
            prefix: "dataset".into(),
        },
    )
}

async fn seed(store: &Arc<ProjectStore>) {
    store
        .bulk_log(
            "p",
            "r",
            &[
                MetricRecord {
                    metrics: json!({"loss": "Infinity", "acc": 0.5, "note": "warmup"}),
                    step: Some(0),
                    timestamp: Some("2026-01-01T00:00:00.000000Z".into()),
                    log_id: None,
                },
                MetricRecord {
                    metrics: json!({"loss": 0.25, "acc": "NaN"}),
                    step: Some(1),
                    timestamp: Some("2026-01-01T00:00:01.000000Z".into()),
                    log_id: Some("keep-me".into()),
                },
            ],
            Some(&json!({"lr": 0.1, "optimizer": "adam"})),
            None,
        )
        .await
        .unwrap();
    store
        .bulk_log_system(
            "p",
            "r",
            &[trackio::store::logs::SystemMetricRecord {
                metrics: json!({"gpu_util": 85.5}),
                timestamp: Some("2026-01-01T00:00:00.500000Z".into()),
                log_id: None,
            }],
            None,
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn export_then_import_restores_identical_logs() {
    let dir = helpers::test_dir();
    let store = Arc::new(ProjectStore::new(dir.clone()));
    seed(&store).await;
    let original_logs = store.get_logs("p", "r").await.unwrap();
    let original_system = store.get_system_logs("p", "r").await.unwrap();
    let original_config = store.get_run_config("p", "r").await.unwrap();

    let snapshotter = Snapshotter::with_mirror(store.clone(), None);
    snapshotter.export_project("p").await.unwrap();
    assert!(dir.join("p.parquet").exists());
    assert!(dir.join("p_system.parquet").exists());
    assert!(dir.join("p_configs.parquet").exists());

    // Simulate a fresh host: only the snapshot files travel
    let restored_dir = helpers::test_dir();
    for name in ["p.parquet", "p_system.parquet", "p_configs.parquet"] {
        std::fs::copy(dir.join(name), restored_dir.join(name)).unwrap();
    }

    let restored_store = Arc::new(ProjectStore::new(restored_dir));
    let snapshotter = Snapshotter::with_mirror(restored_store.clone(), None);
    snapshotter.import_all().await.unwrap();

    assert_eq!(
        restored_store.get_logs("p", "r").await.unwrap(),
        original_logs
    );
    assert_eq!(
        restored_store.get_system_logs("p", "r").await.unwrap(),
        original_system
    );
    assert_eq!(
        restored_store.get_run_config("p", "r").await.unwrap(),
        original_config
    );
}

#[tokio::test]
async fn export_skips_untouched_databases() {
    let dir = helpers::test_dir();
    let store = Arc::new(ProjectStore::new(dir.clone()));
    seed(&store).await;

    let snapshotter = Snapshotter::with_mirror(store.clone(), None);
    snapshotter.export_project("p").await.unwrap();
    let first_mtime = dir.join("p.parquet").metadata().unwrap().modified().unwrap();

    // No writes in between: the second export is a no-op
    snapshotter.export_project("p").await.unwrap();
    let second_mtime = dir.join("p.parquet").metadata().unwrap().modified().unwrap();
    assert_eq!(first_mtime, second_mtime);
}

#[tokio::test]
async fn mirror_round_trip_through_object_store() {
    let source_dir = helpers::test_dir();
    let source = Arc::new(ProjectStore::new(source_dir.clone()));
    seed(&source).await;

    // A media asset rides along with the snapshot
    let media_path = source.media().root().join("p/r/0/img.png");
    std::fs::create_dir_all(media_path.parent().unwrap()).unwrap();
    std::fs::write(&media_path, b"png-bytes").unwrap();

    let (operator, mirror) = memory_mirror();
    let snapshotter = Snapshotter::with_mirror(source.clone(), Some(mirror));
    snapshotter.commit().await.unwrap();

    // A different host pulls the same dataset
    let target_dir = helpers::test_dir();
    let target = Arc::new(ProjectStore::new(target_dir.clone()));
    let snapshotter = Snapshotter::with_mirror(
        target.clone(),
        Some(Mirror {
            operator,
            prefix: "dataset".into(),
        }),
    );
    snapshotter.load().await.unwrap();

    assert_eq!(
        target.get_logs("p", "r").await.unwrap(),
        source.get_logs("p", "r").await.unwrap()
    );
    assert_eq!(
        std::fs::read(target_dir.join("media/p/r/0/img.png")).unwrap(),
        b"png-bytes"
    );
}

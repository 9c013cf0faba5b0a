mod helpers;

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;

use trackio::error::{Result, TrackioError};
use trackio::reconcile::Reconciler;
use trackio::sender::{BatchSender, DurableBuffer};
use trackio::server::{DashboardHints, ServerState};
use trackio::sink::{LogEntry, LogSink, RemoteSink};
use trackio::store::ProjectStore;

const SPACE: &str = "test/space";

/// Sink that refuses the first N calls, then accepts.
struct FlakySink {
    failures: AtomicUsize,
    accepted: AtomicUsize,
}

impl FlakySink {
    fn new(failures: usize) -> Self {
        Self {
            failures: AtomicUsize::new(failures),
            accepted: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl LogSink for FlakySink {
    async fn bulk_log(&self, entries: Vec<LogEntry>) -> Result<()> {
        if self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(TrackioError::SinkTransient("connection refused".into()));
        }
        self.accepted.fetch_add(entries.len(), Ordering::SeqCst);
        Ok(())
    }

    async fn bulk_log_system(&self, _entries: Vec<LogEntry>) -> Result<()> {
        Ok(())
    }

    fn space_id(&self) -> Option<&str> {
        Some(SPACE)
    }
}

fn entry(project: &str, run: &str, value: f64) -> LogEntry {
    LogEntry {
        project: project.into(),
        run: run.into(),
        metrics: helpers::encoded(&[("loss", value)]),
        step: None,
        timestamp: None,
        log_id: None,
        config: None,
    }
}

/// Serve the hosted bulk-log endpoint for a store on an ephemeral port.
async fn spawn_remote(store: Arc<ProjectStore>) -> SocketAddr {
    let state = ServerState {
        store,
        token: None,
        hints: DashboardHints::default(),
    };
    let app = trackio::server::router(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

#[tokio::test]
async fn failed_batches_land_in_the_durable_buffer() {
    let store = helpers::test_store();
    let sink = Arc::new(FlakySink::new(usize::MAX));
    let sender = BatchSender::start(
        "p",
        "r",
        sink.clone(),
        Some(DurableBuffer {
            store: store.clone(),
            space_id: SPACE.into(),
        }),
        None,
    );

    sender.enqueue(entry("p", "r", 1.0));
    sender.enqueue(entry("p", "r", 2.0));
    sender.finish().await;
    assert_eq!(sender.queued(), 0);

    // Rows are committed locally with markers still set
    let logs = store.get_logs("p", "r").await.unwrap();
    assert_eq!(logs.len(), 2);
    assert!(store.has_pending_data("p").await.unwrap());
    let (pending, space) = store.get_pending_logs("p").await.unwrap().unwrap();
    assert_eq!(pending.len(), 2);
    assert_eq!(space, SPACE);
    assert_eq!(sink.accepted.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn acked_batches_clear_their_markers() {
    let store = helpers::test_store();
    let sink = Arc::new(FlakySink::new(0));
    let sender = BatchSender::start(
        "p",
        "r",
        sink.clone(),
        Some(DurableBuffer {
            store: store.clone(),
            space_id: SPACE.into(),
        }),
        None,
    );

    sender.enqueue(entry("p", "r", 1.0));
    sender.finish().await;

    assert_eq!(sink.accepted.load(Ordering::SeqCst), 1);
    assert!(!store.has_pending_data("p").await.unwrap());
    // The row itself stays in the local store
    assert_eq!(store.get_logs("p", "r").await.unwrap().len(), 1);
}

#[tokio::test]
async fn reconciler_replays_buffer_to_remote_exactly_once() {
    let local = helpers::test_store();
    let remote = helpers::test_store();
    let addr = spawn_remote(remote.clone()).await;

    // Three entries buffered while the remote was unreachable
    let sink = Arc::new(FlakySink::new(usize::MAX));
    let sender = BatchSender::start(
        "p",
        "r",
        sink,
        Some(DurableBuffer {
            store: local.clone(),
            space_id: SPACE.into(),
        }),
        None,
    );
    for value in [1.0, 2.0, 3.0] {
        sender.enqueue(entry("p", "r", value));
    }
    sender.finish().await;
    assert!(local.has_pending_data("p").await.unwrap());

    let remote_sink = RemoteSink::new(&format!("http://{addr}"), SPACE, None).unwrap();
    let reconciler = Reconciler::new(local.clone());
    let outcome = reconciler.drain_to("p", &remote_sink).await.unwrap();
    assert_eq!(outcome.logs_sent, 3);
    assert!(!local.has_pending_data("p").await.unwrap());

    let delivered = remote.get_logs("p", "r").await.unwrap();
    assert_eq!(delivered.len(), 3);
    let steps: Vec<i64> = delivered.iter().map(helpers::step_of).collect();
    assert_eq!(steps, vec![0, 1, 2]);

    // A second pass has nothing left to do
    let outcome = reconciler.drain_to("p", &remote_sink).await.unwrap();
    assert!(outcome.is_empty());
    assert_eq!(remote.get_logs("p", "r").await.unwrap().len(), 3);
}

#[tokio::test]
async fn retried_batches_do_not_duplicate_remotely() {
    let remote = helpers::test_store();
    let addr = spawn_remote(remote.clone()).await;
    let remote_sink = RemoteSink::new(&format!("http://{addr}"), SPACE, None).unwrap();

    let entries: Vec<LogEntry> = (0..3)
        .map(|i| LogEntry {
            project: "p".into(),
            run: "r".into(),
            metrics: helpers::encoded(&[("loss", f64::from(i))]),
            step: Some(i64::from(i)),
            timestamp: None,
            log_id: Some(format!("log-{i}")),
            config: None,
        })
        .collect();

    remote_sink.bulk_log(entries.clone()).await.unwrap();
    remote_sink.bulk_log(entries).await.unwrap();

    let delivered = remote.get_logs("p", "r").await.unwrap();
    assert_eq!(delivered.len(), 3);
}

#[tokio::test]
async fn pending_media_uploads_drain_to_the_remote_server() {
    let local = helpers::test_store();
    let remote = helpers::test_store();
    let addr = spawn_remote(remote.clone()).await;

    let media_path = local.media().root().join("p/r/0/img.png");
    std::fs::create_dir_all(media_path.parent().unwrap()).unwrap();
    std::fs::write(&media_path, b"png-bytes").unwrap();
    local
        .add_pending_upload(
            "p",
            SPACE,
            Some("r"),
            Some(0),
            "p/r/0/img.png",
            Some("p/r/0/img.png"),
        )
        .await
        .unwrap();
    assert!(local.has_pending_data("p").await.unwrap());

    let sink = RemoteSink::new(&format!("http://{addr}"), SPACE, None).unwrap();
    let outcome = Reconciler::new(local.clone())
        .drain_to("p", &sink)
        .await
        .unwrap();
    assert_eq!(outcome.uploads_sent, 1);
    assert!(!local.has_pending_data("p").await.unwrap());
    assert_eq!(
        std::fs::read(remote.media().root().join("p/r/0/img.png")).unwrap(),
        b"png-bytes"
    );
}

#[tokio::test]
async fn unreachable_remote_classifies_as_transient() {
    // Nothing listens on this port
    let sink = RemoteSink::new("http://127.0.0.1:1", SPACE, None).unwrap();
    let result = sink.bulk_log(vec![entry("p", "r", 1.0)]).await;
    assert!(matches!(result, Err(TrackioError::SinkTransient(_))));
}

//! End-to-end tests for the queue and sync engine
//!
//! The backend and object storage are replaced by in-process fakes behind
//! the `IngestApi` and `AssetUploader` traits.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use proctor_core::config::SyncConfig;
use proctor_core::{
    probe_client, AssetUploader, Config, ConnectivityMonitor, Error, FocusChangeEvent, ImageItem, IngestApi,
    InlineImage, KeystrokeEvent, LogBatch, LogPayload, LogQueue, LogType, MouseButton,
    MouseClickEvent, PayloadCodec, Result, StoredAsset, SyncEngine, SyncEvent, UploadCredential,
    MAX_UPLOAD_ATTEMPTS,
};
use tempfile::TempDir;
use tokio::sync::Notify;

const SUBMISSION: &str = "submission-42";

// ============================================
// Fakes
// ============================================

/// Records accepted batches; can be told to reject everything or to block
/// until released.
#[derive(Default)]
struct FakeIngest {
    batches: Mutex<Vec<LogBatch>>,
    calls: AtomicUsize,
    reject: AtomicBool,
    gate: Option<Gate>,
}

struct Gate {
    entered: Notify,
    release: Notify,
}

impl FakeIngest {
    fn gated() -> Self {
        Self {
            gate: Some(Gate {
                entered: Notify::new(),
                release: Notify::new(),
            }),
            ..Default::default()
        }
    }

    fn sent_logs(&self) -> Vec<serde_json::Value> {
        self.batches
            .lock()
            .unwrap()
            .iter()
            .flat_map(|b| serde_json::to_value(b).unwrap()["logs"].as_array().unwrap().clone())
            .collect()
    }
}

#[async_trait]
impl IngestApi for FakeIngest {
    async fn submit_batch(&self, batch: &LogBatch) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        if let Some(gate) = &self.gate {
            gate.entered.notify_one();
            gate.release.notified().await;
        }

        if self.reject.load(Ordering::SeqCst) {
            return Err(Error::Rejected {
                status: 503,
                body: "maintenance".to_string(),
            });
        }

        self.batches.lock().unwrap().push(batch.clone());
        Ok(())
    }
}

/// Stores images in memory. Images whose data contains `fail_marker` fail.
#[derive(Default)]
struct FakeStorage {
    credential_fetches: AtomicUsize,
    uploads: AtomicUsize,
    fail_marker: Option<&'static str>,
    no_credential: bool,
}

#[async_trait]
impl AssetUploader for FakeStorage {
    async fn fetch_credential(&self) -> Result<UploadCredential> {
        self.credential_fetches.fetch_add(1, Ordering::SeqCst);
        if self.no_credential {
            return Err(Error::Rejected {
                status: 401,
                body: "expired session".to_string(),
            });
        }
        Ok(UploadCredential {
            signature: "sig".to_string(),
            expire: Utc::now().timestamp() + 600,
            token: "token".to_string(),
            public_key: "public_key".to_string(),
            url_endpoint: "https://upload.example.com/api/v1/files/upload".to_string(),
        })
    }

    async fn upload(
        &self,
        _credential: &UploadCredential,
        image: &InlineImage,
    ) -> Result<StoredAsset> {
        if let Some(marker) = self.fail_marker {
            if image.inline_image_data.contains(marker) {
                return Err(Error::Upload("storage returned 500".to_string()));
            }
        }
        let n = self.uploads.fetch_add(1, Ordering::SeqCst);
        Ok(StoredAsset {
            id: format!("file_{}", n),
            url: format!("https://cdn.example.com/file_{}.png", n),
        })
    }
}

// ============================================
// Helpers
// ============================================

fn codec() -> PayloadCodec {
    PayloadCodec::with_iterations("integration-secret", 1_000)
}

fn queue() -> LogQueue {
    proctor_core::logging::init_test();
    LogQueue::open_in_memory(codec()).unwrap()
}

fn engine_with(
    queue: &LogQueue,
    ingest: Arc<FakeIngest>,
    storage: Arc<FakeStorage>,
    connectivity: ConnectivityMonitor,
) -> SyncEngine {
    SyncEngine::new(
        SUBMISSION,
        queue.clone(),
        ingest,
        storage,
        connectivity,
        SyncConfig::default(),
    )
}

fn keystroke(key: &str) -> LogPayload {
    LogPayload::Keystroke(KeystrokeEvent {
        key: key.to_string(),
        logged_at: Utc::now(),
    })
}

fn screenshot(data: &str) -> LogPayload {
    LogPayload::Screenshot(vec![ImageItem::Inline(InlineImage {
        inline_image_data: format!("data:image/png;base64,{}", data),
        taken_at: Utc::now(),
    })])
}

// ============================================
// Scenarios
// ============================================

#[tokio::test]
async fn test_offline_keystrokes_sync_after_reconnect() {
    let queue = queue();
    let ingest = Arc::new(FakeIngest::default());
    let connectivity = ConnectivityMonitor::new(false);
    let engine = engine_with(&queue, ingest.clone(), Arc::default(), connectivity.clone());

    let producer = queue.producer(SUBMISSION);
    for key in ["a", "b", "c"] {
        producer.append(keystroke(key)).await.unwrap();
    }
    assert_eq!(engine.refresh_pending_count().await, 3);
    assert!(engine.trigger_sync().await.is_none());

    connectivity.set_online(true);
    let report = engine.trigger_sync().await.unwrap();

    assert_eq!(report.pending_after, 0);
    assert_eq!(engine.get_pending_count(), 0);
    assert_eq!(engine.status().last_uploaded.keystrokes, 3);

    let logs = ingest.sent_logs();
    assert_eq!(ingest.calls.load(Ordering::SeqCst), 1);
    let keys: Vec<_> = logs.iter().map(|l| l["meta"]["key"].clone()).collect();
    assert_eq!(keys, vec!["a", "b", "c"]);
    assert!(logs.iter().all(|l| l["submissionId"] == SUBMISSION));
}

#[tokio::test]
async fn test_unreachable_backend_is_offline_before_attempts_are_spent() {
    let mut config = Config::default();
    config.backend.base_url = Some("http://127.0.0.1:9".to_string());

    let queue = queue();
    let ingest = Arc::new(FakeIngest::default());
    let connectivity = ConnectivityMonitor::default();
    let engine = engine_with(&queue, ingest.clone(), Arc::default(), connectivity.clone());
    queue.append(SUBMISSION, keystroke("a")).await.unwrap();

    let client = probe_client(Duration::from_secs(2)).unwrap();
    let url = config.probe_url().expect("probing defaults to the backend");
    assert!(!connectivity.probe_once(&client, url).await);

    for _ in 0..=MAX_UPLOAD_ATTEMPTS {
        assert!(engine.trigger_sync().await.is_none());
    }

    assert_eq!(ingest.calls.load(Ordering::SeqCst), 0);
    let pending = queue.list_pending(SUBMISSION).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].upload_attempts, 0);
    assert!(queue.discarded(SUBMISSION).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_screenshot_uploaded_before_submission() {
    let queue = queue();
    let ingest = Arc::new(FakeIngest::default());
    let storage = Arc::new(FakeStorage::default());
    let engine = engine_with(
        &queue,
        ingest.clone(),
        storage.clone(),
        ConnectivityMonitor::new(true),
    );

    queue
        .append(SUBMISSION, screenshot("aGVsbG8="))
        .await
        .unwrap();

    let report = engine.trigger_sync().await.unwrap();
    assert_eq!(report.uploaded.screenshots, 1);
    assert_eq!(storage.uploads.load(Ordering::SeqCst), 1);

    let logs = ingest.sent_logs();
    assert_eq!(logs.len(), 1);
    let log = &logs[0];
    assert_eq!(log["logType"], "SCREENSHOT");
    assert_eq!(log["meta"]["fileId"], "file_0");
    assert_eq!(log["meta"]["image"], "https://cdn.example.com/file_0.png");
    assert!(log["meta"]["takenAt"].is_string());
    assert!(log["meta"].get("inlineImageData").is_none());
    assert!(!log.to_string().contains("aGVsbG8="));
}

#[tokio::test]
async fn test_server_error_increments_every_entry_once() {
    let queue = queue();
    let ingest = Arc::new(FakeIngest::default());
    ingest.reject.store(true, Ordering::SeqCst);
    let engine = engine_with(
        &queue,
        ingest.clone(),
        Arc::default(),
        ConnectivityMonitor::new(true),
    );

    queue.append(SUBMISSION, keystroke("a")).await.unwrap();
    queue
        .append(
            SUBMISSION,
            LogPayload::Mouseclick(MouseClickEvent {
                button: MouseButton::Left,
                position: [100, 200],
                logged_at: Utc::now(),
            }),
        )
        .await
        .unwrap();
    queue
        .append(
            SUBMISSION,
            LogPayload::FocusChange(FocusChangeEvent {
                duration: 1500,
                logged_at: Utc::now(),
            }),
        )
        .await
        .unwrap();

    let report = engine.trigger_sync().await.unwrap();
    assert!(report.batch_rejected);
    assert_eq!(report.submitted, 3);
    assert_eq!(report.uploaded.total(), 0);
    assert_eq!(report.pending_after, 3);

    let pending = queue.list_pending(SUBMISSION).await.unwrap();
    assert!(pending.iter().all(|e| e.upload_attempts == 1));
    assert_eq!(engine.status().last_uploaded.total(), 0);
}

#[tokio::test]
async fn test_partial_upload_failure_sends_the_rest() {
    let queue = queue();
    let ingest = Arc::new(FakeIngest::default());
    let storage = Arc::new(FakeStorage {
        fail_marker: Some("YnJva2Vu"),
        ..Default::default()
    });
    let engine = engine_with(
        &queue,
        ingest.clone(),
        storage,
        ConnectivityMonitor::new(true),
    );

    let broken = queue
        .append(SUBMISSION, screenshot("YnJva2Vu"))
        .await
        .unwrap();
    queue
        .append(SUBMISSION, screenshot("aGVsbG8="))
        .await
        .unwrap();
    queue.append(SUBMISSION, keystroke("k")).await.unwrap();

    let report = engine.trigger_sync().await.unwrap();
    assert_eq!(report.failed, 1);
    assert_eq!(report.submitted, 2);
    assert_eq!(report.uploaded.screenshots, 1);
    assert_eq!(report.uploaded.keystrokes, 1);

    let pending = queue.list_pending(SUBMISSION).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].id, broken);
    assert_eq!(pending[0].upload_attempts, 1);
}

#[tokio::test]
async fn test_credential_failure_holds_back_images_only() {
    let queue = queue();
    let ingest = Arc::new(FakeIngest::default());
    let storage = Arc::new(FakeStorage {
        no_credential: true,
        ..Default::default()
    });
    let engine = engine_with(
        &queue,
        ingest.clone(),
        storage.clone(),
        ConnectivityMonitor::new(true),
    );

    queue.append(SUBMISSION, screenshot("YQ==")).await.unwrap();
    queue.append(SUBMISSION, screenshot("Yg==")).await.unwrap();
    queue.append(SUBMISSION, keystroke("k")).await.unwrap();

    let report = engine.trigger_sync().await.unwrap();
    assert_eq!(report.failed, 2);
    assert_eq!(report.uploaded.keystrokes, 1);
    assert_eq!(storage.credential_fetches.load(Ordering::SeqCst), 1);

    let pending = queue.list_pending(SUBMISSION).await.unwrap();
    assert_eq!(pending.len(), 2);
    assert!(pending.iter().all(|e| e.log_type == LogType::Screenshot));
}

#[tokio::test]
async fn test_entry_discarded_after_max_attempts() {
    let queue = queue();
    let ingest = Arc::new(FakeIngest::default());
    let engine = engine_with(
        &queue,
        ingest.clone(),
        Arc::default(),
        ConnectivityMonitor::new(true),
    );

    let doomed = queue.append(SUBMISSION, keystroke("x")).await.unwrap();
    for _ in 0..MAX_UPLOAD_ATTEMPTS {
        queue.increment_attempts(doomed).await.unwrap();
    }

    let mut events = engine.subscribe();
    let report = engine.trigger_sync().await.unwrap();

    assert_eq!(report.discarded, 1);
    assert_eq!(report.pending_after, 0);
    assert_eq!(ingest.calls.load(Ordering::SeqCst), 0);

    assert_eq!(
        events.recv().await.unwrap(),
        SyncEvent::EntryDiscarded {
            entry_id: doomed,
            log_type: LogType::Keystroke,
            attempts: MAX_UPLOAD_ATTEMPTS,
        }
    );

    let audit = queue.discarded(SUBMISSION).await.unwrap();
    assert_eq!(audit.len(), 1);
    assert_eq!(audit[0].entry_id, doomed);
    assert_eq!(audit[0].upload_attempts, MAX_UPLOAD_ATTEMPTS);
}

#[tokio::test]
async fn test_repeated_failures_end_in_discard() {
    let queue = queue();
    let ingest = Arc::new(FakeIngest::default());
    ingest.reject.store(true, Ordering::SeqCst);
    let engine = engine_with(
        &queue,
        ingest.clone(),
        Arc::default(),
        ConnectivityMonitor::new(true),
    );

    queue.append(SUBMISSION, keystroke("x")).await.unwrap();

    for _ in 0..MAX_UPLOAD_ATTEMPTS {
        let report = engine.trigger_sync().await.unwrap();
        assert!(report.batch_rejected);
    }

    let report = engine.trigger_sync().await.unwrap();
    assert_eq!(report.discarded, 1);
    assert_eq!(report.pending_after, 0);
    assert_eq!(
        ingest.calls.load(Ordering::SeqCst),
        MAX_UPLOAD_ATTEMPTS as usize
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_single_flight_per_session() {
    let queue = queue();
    let ingest = Arc::new(FakeIngest::gated());
    let engine = engine_with(
        &queue,
        ingest.clone(),
        Arc::default(),
        ConnectivityMonitor::new(true),
    );

    queue.append(SUBMISSION, keystroke("a")).await.unwrap();

    let first = tokio::spawn({
        let engine = engine.clone();
        async move { engine.trigger_sync().await }
    });

    let gate = ingest.gate.as_ref().unwrap();
    tokio::time::timeout(Duration::from_secs(5), gate.entered.notified())
        .await
        .unwrap();

    assert!(engine.status().is_syncing);
    assert!(engine.trigger_sync().await.is_none());

    gate.release.notify_one();
    let report = first.await.unwrap().unwrap();

    assert_eq!(report.uploaded.keystrokes, 1);
    assert_eq!(ingest.calls.load(Ordering::SeqCst), 1);
    assert!(!engine.status().is_syncing);
}

#[tokio::test]
async fn test_sessions_sync_independently() {
    let queue = queue();
    let ingest = Arc::new(FakeIngest::default());
    let connectivity = ConnectivityMonitor::new(true);

    let engine_a = engine_with(&queue, ingest.clone(), Arc::default(), connectivity.clone());
    let engine_b = SyncEngine::new(
        "submission-43",
        queue.clone(),
        ingest.clone(),
        Arc::new(FakeStorage::default()),
        connectivity,
        SyncConfig::default(),
    );

    queue.append(SUBMISSION, keystroke("a")).await.unwrap();
    queue.append("submission-43", keystroke("b")).await.unwrap();

    let (a, b) = tokio::join!(engine_a.trigger_sync(), engine_b.trigger_sync());
    assert_eq!(a.unwrap().uploaded.keystrokes, 1);
    assert_eq!(b.unwrap().uploaded.keystrokes, 1);
    assert_eq!(ingest.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_queue_survives_restart() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("queue.db");

    {
        let queue = LogQueue::open(&path, codec()).unwrap();
        queue.append(SUBMISSION, keystroke("before")).await.unwrap();
    }

    let queue = LogQueue::open(&path, codec()).unwrap();
    assert_eq!(queue.count(SUBMISSION).await.unwrap(), 1);

    let ingest = Arc::new(FakeIngest::default());
    let engine = engine_with(
        &queue,
        ingest.clone(),
        Arc::default(),
        ConnectivityMonitor::new(true),
    );
    engine.trigger_sync().await.unwrap();

    assert_eq!(ingest.sent_logs()[0]["meta"]["key"], "before");
    assert_eq!(queue.count(SUBMISSION).await.unwrap(), 0);
}

#[tokio::test]
async fn test_wrong_secret_cannot_read_queue() {
    let queue = queue();
    queue.append(SUBMISSION, keystroke("a")).await.unwrap();
    let entry = queue.list_pending(SUBMISSION).await.unwrap().remove(0);

    let stranger = PayloadCodec::with_iterations("someone-else", 1_000);
    let result: Result<LogPayload> = stranger.decrypt(&entry.encrypted_payload, SUBMISSION);
    assert!(matches!(result, Err(Error::Decryption(_))));

    let other_submission: Result<LogPayload> =
        codec().decrypt(&entry.encrypted_payload, "submission-43");
    assert!(matches!(other_submission, Err(Error::Decryption(_))));
}

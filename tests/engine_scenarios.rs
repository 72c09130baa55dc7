//! End-to-end engine scenarios against a deterministic stub fetcher.

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use corpusgrab::config::{DataSetConfig, EngineSettings};
use corpusgrab::engine::{Controller, EngineEvent, OperationMode};
use corpusgrab::fetch::{FetchOutcome, Fetcher};
use corpusgrab::models::{WorkItem, WorkState};
use corpusgrab::repository::WorkStore;
use corpusgrab::storage;

/// Canned response for one URL.
#[derive(Clone)]
struct StubResponse {
    status: u16,
    body: Vec<u8>,
}

impl StubResponse {
    fn ok(bytes: usize) -> Self {
        Self {
            status: 200,
            body: vec![b'x'; bytes],
        }
    }

    fn status(status: u16) -> Self {
        Self {
            status,
            body: Vec::new(),
        }
    }
}

/// Deterministic fetcher: responses come from a closure over the URL,
/// with an optional artificial transfer delay. Tracks peak concurrency.
struct StubFetcher {
    responder: Box<dyn Fn(&str) -> StubResponse + Send + Sync>,
    delay: Duration,
    active: AtomicI64,
    peak: AtomicI64,
    requests: AtomicUsize,
}

impl StubFetcher {
    fn new(responder: impl Fn(&str) -> StubResponse + Send + Sync + 'static) -> Self {
        Self {
            responder: Box::new(responder),
            delay: Duration::ZERO,
            active: AtomicI64::new(0),
            peak: AtomicI64::new(0),
            requests: AtomicUsize::new(0),
        }
    }

    fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    fn always_ok(bytes: usize) -> Self {
        Self::new(move |_| StubResponse::ok(bytes))
    }

    fn peak_concurrency(&self) -> i64 {
        self.peak.load(Ordering::Acquire)
    }

    async fn respond(&self, url: &str) -> StubResponse {
        self.requests.fetch_add(1, Ordering::Relaxed);
        let now_active = self.active.fetch_add(1, Ordering::AcqRel) + 1;
        self.peak.fetch_max(now_active, Ordering::AcqRel);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.active.fetch_sub(1, Ordering::AcqRel);
        (self.responder)(url)
    }
}

#[async_trait]
impl Fetcher for StubFetcher {
    async fn get_bytes(&self, url: &str, _timeout: Duration) -> FetchOutcome {
        let response = self.respond(url).await;
        FetchOutcome {
            http_code: response.status,
            actual_length: response.body.len() as u64,
            declared_length: Some(response.body.len() as u64),
            body: response.body,
            content_type: Some("text/html".to_string()),
            wire_time_ms: self.delay.as_millis().max(1) as u64,
            ..Default::default()
        }
    }

    async fn get_to_path(&self, url: &str, path: &Path, _timeout: Duration) -> FetchOutcome {
        let response = self.respond(url).await;
        let mut written = 0u64;
        if (200..300).contains(&response.status) {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).unwrap();
            }
            std::fs::write(path, &response.body).unwrap();
            written = response.body.len() as u64;
        }
        FetchOutcome {
            http_code: response.status,
            body: Vec::new(),
            declared_length: Some(response.body.len() as u64),
            actual_length: written,
            content_type: Some("application/pdf".to_string()),
            wire_time_ms: self.delay.as_millis().max(1) as u64,
            ..Default::default()
        }
    }
}

struct Rig {
    dir: tempfile::TempDir,
    store: Arc<WorkStore>,
    settings: EngineSettings,
}

impl Rig {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(WorkStore::new(&dir.path().join("work.db")).unwrap());
        let settings = EngineSettings {
            db_path: dir.path().join("work.db"),
            storage_root: dir.path().join("downloads"),
            max_concurrent_downloads: 4,
            ..Default::default()
        };
        Self {
            dir,
            store,
            settings,
        }
    }

    fn config(&self) -> DataSetConfig {
        DataSetConfig::for_data_set(11).unwrap()
    }

    fn seed(&self, key: &str, state: WorkState) -> WorkItem {
        let config = self.config();
        let item = WorkItem::pending(
            11,
            key.to_string(),
            config.file_url(key),
            storage::local_path(&self.settings.storage_root, 11, key),
        );
        self.store.add_items_batch(std::slice::from_ref(&item)).unwrap();
        if state != WorkState::Pending {
            self.store
                .set_state_by_key(key, 11, state, None, None)
                .unwrap();
        }
        self.store.get_item_by_key(key, 11).unwrap().unwrap()
    }

    fn controller(
        &self,
        fetcher: Arc<StubFetcher>,
    ) -> (Controller, mpsc::Receiver<EngineEvent>) {
        let (event_tx, event_rx) = mpsc::channel(1024);
        let controller = Controller::new(
            self.store.clone(),
            fetcher,
            self.settings.clone(),
            event_tx,
        );
        (controller, event_rx)
    }
}

/// Drain events until RunComplete or timeout. Returns true on complete.
async fn wait_for_complete(rx: &mut mpsc::Receiver<EngineEvent>, timeout: Duration) -> bool {
    tokio::time::timeout(timeout, async {
        while let Some(event) = rx.recv().await {
            if matches!(event, EngineEvent::RunComplete) {
                return true;
            }
        }
        false
    })
    .await
    .unwrap_or(false)
}

/// Drain events in the background, counting completion transitions.
fn spawn_drainer(
    mut rx: mpsc::Receiver<EngineEvent>,
) -> (Arc<AtomicUsize>, Arc<AtomicBool>) {
    let completed = Arc::new(AtomicUsize::new(0));
    let run_complete = Arc::new(AtomicBool::new(false));
    let completed_clone = completed.clone();
    let run_complete_clone = run_complete.clone();
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match event {
                EngineEvent::FileStateChanged {
                    state: WorkState::Completed,
                    ..
                } => {
                    completed_clone.fetch_add(1, Ordering::Relaxed);
                }
                EngineEvent::RunComplete => {
                    run_complete_clone.store(true, Ordering::Release);
                }
                _ => {}
            }
        }
    });
    (completed, run_complete)
}

#[tokio::test]
async fn test_resume_after_crash() {
    let rig = Rig::new();
    for i in 0..5 {
        rig.seed(&format!("EFTA0000000{i}"), WorkState::Completed);
    }
    rig.seed("EFTA00000005", WorkState::InProgress);
    rig.seed("EFTA00000006", WorkState::InProgress);
    for i in 7..10 {
        rig.seed(&format!("EFTA0000000{i}"), WorkState::Pending);
    }

    let fetcher = Arc::new(StubFetcher::always_ok(100));
    let (mut controller, mut rx) = rig.controller(fetcher);
    controller
        .start(rig.config(), OperationMode::DownloadOnly)
        .unwrap();

    assert!(wait_for_complete(&mut rx, Duration::from_secs(10)).await);

    let stats = rig.store.stats(11).unwrap();
    assert_eq!(stats.completed, 10);
    assert_eq!(stats.pending, 0);
    assert_eq!(stats.in_progress, 0);

    // Only the 2 interrupted + 3 pending items hit the network.
    let snapshot = controller.get_stats().unwrap();
    assert_eq!(snapshot.bytes_session, 500);

    controller.stop().await;
}

#[tokio::test]
async fn test_restart_preserves_retry_count_of_interrupted_items() {
    let rig = Rig::new();
    // A previously failed item that was claimed again and then
    // interrupted mid-download.
    let item = rig.seed("EFTA00000001", WorkState::Pending);
    rig.store.increment_retry(item.storage_id).unwrap();
    rig.store.increment_retry(item.storage_id).unwrap();
    rig.store
        .set_state(item.storage_id, WorkState::InProgress, None, None)
        .unwrap();

    let fetcher = Arc::new(StubFetcher::always_ok(100));
    let (mut controller, mut rx) = rig.controller(fetcher);
    controller
        .start(rig.config(), OperationMode::DownloadOnly)
        .unwrap();
    assert!(wait_for_complete(&mut rx, Duration::from_secs(10)).await);
    controller.stop().await;

    // Crash recovery re-queued the item without refreshing its retry
    // budget.
    let stored = rig.store.get_item_by_key("EFTA00000001", 11).unwrap().unwrap();
    assert_eq!(stored.state, WorkState::Completed);
    assert_eq!(stored.retry_count, 2);
}

#[tokio::test]
async fn test_completed_items_have_files_of_recorded_size() {
    let rig = Rig::new();
    let item = rig.seed("EFTA00000042", WorkState::Pending);

    let fetcher = Arc::new(StubFetcher::always_ok(1234));
    let (mut controller, mut rx) = rig.controller(fetcher);
    controller
        .start(rig.config(), OperationMode::DownloadOnly)
        .unwrap();
    assert!(wait_for_complete(&mut rx, Duration::from_secs(10)).await);
    controller.stop().await;

    let stored = rig.store.get_item_by_key("EFTA00000042", 11).unwrap().unwrap();
    assert_eq!(stored.state, WorkState::Completed);
    assert_eq!(stored.size_bytes, 1234);
    let metadata = std::fs::metadata(&item.local_path).unwrap();
    assert_eq!(metadata.len(), 1234);
}

#[tokio::test]
async fn test_404_goes_to_not_found_without_file() {
    let rig = Rig::new();
    let item = rig.seed("EFTA00000001", WorkState::Pending);

    let fetcher = Arc::new(StubFetcher::new(|_| StubResponse::status(404)));
    let (mut controller, mut rx) = rig.controller(fetcher);
    controller
        .start(rig.config(), OperationMode::DownloadOnly)
        .unwrap();
    assert!(wait_for_complete(&mut rx, Duration::from_secs(10)).await);
    controller.stop().await;

    let stored = rig.store.get_item_by_key("EFTA00000001", 11).unwrap().unwrap();
    assert_eq!(stored.state, WorkState::NotFound);
    assert!(!item.local_path.exists());
    assert_eq!(rig.store.stats(11).unwrap().not_found, 1);
}

#[tokio::test]
async fn test_server_error_marks_failed_with_retry_count() {
    let rig = Rig::new();
    rig.seed("EFTA00000001", WorkState::Pending);

    let fetcher = Arc::new(StubFetcher::new(|_| StubResponse::status(500)));
    let (mut controller, mut rx) = rig.controller(fetcher);
    controller
        .start(rig.config(), OperationMode::DownloadOnly)
        .unwrap();
    assert!(wait_for_complete(&mut rx, Duration::from_secs(10)).await);
    controller.stop().await;

    let stored = rig.store.get_item_by_key("EFTA00000001", 11).unwrap().unwrap();
    assert_eq!(stored.state, WorkState::Failed);
    assert_eq!(stored.retry_count, 1);
    assert_eq!(stored.last_error.as_deref(), Some("HTTP error: 500"));
}

#[tokio::test]
async fn test_blocked_statuses_record_blocked_reason() {
    let rig = Rig::new();
    rig.seed("EFTA00000001", WorkState::Pending);

    let fetcher = Arc::new(StubFetcher::new(|_| StubResponse::status(429)));
    let (mut controller, mut rx) = rig.controller(fetcher);
    controller
        .start(rig.config(), OperationMode::DownloadOnly)
        .unwrap();
    assert!(wait_for_complete(&mut rx, Duration::from_secs(10)).await);
    controller.stop().await;

    let stored = rig.store.get_item_by_key("EFTA00000001", 11).unwrap().unwrap();
    assert_eq!(stored.state, WorkState::Failed);
    assert_eq!(stored.last_error.as_deref(), Some("Blocked: HTTP 429"));
}

#[tokio::test]
async fn test_empty_body_counts_as_not_found() {
    let rig = Rig::new();
    rig.seed("EFTA00000001", WorkState::Pending);

    let fetcher = Arc::new(StubFetcher::always_ok(0));
    let (mut controller, mut rx) = rig.controller(fetcher);
    controller
        .start(rig.config(), OperationMode::DownloadOnly)
        .unwrap();
    assert!(wait_for_complete(&mut rx, Duration::from_secs(10)).await);
    controller.stop().await;

    let stored = rig.store.get_item_by_key("EFTA00000001", 11).unwrap().unwrap();
    assert_eq!(stored.state, WorkState::NotFound);
    assert_eq!(stored.last_error.as_deref(), Some("Empty response"));
}

#[tokio::test]
async fn test_existing_file_is_skipped_without_network() {
    let rig = Rig::new();
    let item = rig.seed("EFTA00000001", WorkState::Pending);
    std::fs::create_dir_all(item.local_path.parent().unwrap()).unwrap();
    std::fs::write(&item.local_path, b"already here").unwrap();

    let fetcher = Arc::new(StubFetcher::always_ok(100));
    let (mut controller, mut rx) = rig.controller(fetcher.clone());
    controller
        .start(rig.config(), OperationMode::DownloadOnly)
        .unwrap();
    assert!(wait_for_complete(&mut rx, Duration::from_secs(10)).await);
    controller.stop().await;

    let stored = rig.store.get_item_by_key("EFTA00000001", 11).unwrap().unwrap();
    assert_eq!(stored.state, WorkState::Skipped);
    assert_eq!(fetcher.requests.load(Ordering::Relaxed), 0);
}

#[tokio::test]
async fn test_backed_off_failure_retries_after_window() {
    let rig = Rig::new();
    let item = rig.seed("EFTA00000001", WorkState::Pending);
    rig.store.increment_retry(item.storage_id).unwrap();
    rig.store
        .set_state(item.storage_id, WorkState::Failed, Some("HTTP error: 500"), None)
        .unwrap();

    // Backdate the failure so the 5 s first-retry window has elapsed.
    {
        let conn = rusqlite::Connection::open(&rig.settings.db_path).unwrap();
        conn.execute(
            "UPDATE work_items SET updated_at = ?1 WHERE id = ?2",
            rusqlite::params![
                (chrono::Utc::now() - chrono::Duration::seconds(30)).to_rfc3339(),
                item.storage_id
            ],
        )
        .unwrap();
    }

    let fetcher = Arc::new(StubFetcher::always_ok(64));
    let (mut controller, mut rx) = rig.controller(fetcher);
    controller
        .start(rig.config(), OperationMode::DownloadOnly)
        .unwrap();
    assert!(wait_for_complete(&mut rx, Duration::from_secs(10)).await);
    controller.stop().await;

    let stored = rig.store.get_item_by_key("EFTA00000001", 11).unwrap().unwrap();
    assert_eq!(stored.state, WorkState::Completed);
}

#[tokio::test]
async fn test_fresh_failure_waits_out_its_backoff() {
    let rig = Rig::new();
    let item = rig.seed("EFTA00000001", WorkState::Pending);
    rig.store.increment_retry(item.storage_id).unwrap();
    rig.store
        .set_state(item.storage_id, WorkState::Failed, Some("HTTP error: 500"), None)
        .unwrap();

    // Freshly failed: the backoff window has not elapsed, so the run
    // drains to completion without touching the item.
    let fetcher = Arc::new(StubFetcher::always_ok(64));
    let (mut controller, mut rx) = rig.controller(fetcher.clone());
    controller
        .start(rig.config(), OperationMode::DownloadOnly)
        .unwrap();
    assert!(wait_for_complete(&mut rx, Duration::from_secs(10)).await);
    controller.stop().await;

    let stored = rig.store.get_item_by_key("EFTA00000001", 11).unwrap().unwrap();
    assert_eq!(stored.state, WorkState::Failed);
    assert_eq!(fetcher.requests.load(Ordering::Relaxed), 0);
}

#[tokio::test]
async fn test_concurrency_raise_takes_effect_mid_run() {
    let rig = Rig::new();
    for i in 0..40 {
        rig.seed(&format!("EFTA000000{i:02}"), WorkState::Pending);
    }

    let fetcher = Arc::new(StubFetcher::always_ok(10).with_delay(Duration::from_millis(200)));
    let (mut controller, rx) = rig.controller(fetcher.clone());
    controller.set_max_concurrent_downloads(2);
    controller
        .start(rig.config(), OperationMode::DownloadOnly)
        .unwrap();
    let (_completed, run_complete) = spawn_drainer(rx);

    tokio::time::sleep(Duration::from_millis(500)).await;
    controller.set_max_concurrent_downloads(10);

    let deadline = tokio::time::Instant::now() + Duration::from_secs(20);
    while !run_complete.load(Ordering::Acquire) {
        assert!(tokio::time::Instant::now() < deadline, "run did not finish");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    controller.stop().await;

    let stats = rig.store.stats(11).unwrap();
    assert_eq!(stats.completed, 40);
    assert_eq!(stats.in_progress, 0);
    let peak = fetcher.peak_concurrency();
    assert!(peak > 2, "cap raise never took effect (peak {peak})");
    assert!(peak <= 10, "admission control exceeded the cap (peak {peak})");
}

#[tokio::test]
async fn test_pause_settles_and_resume_finishes() {
    let rig = Rig::new();
    for i in 0..20 {
        rig.seed(&format!("EFTA000000{i:02}"), WorkState::Pending);
    }

    let fetcher = Arc::new(StubFetcher::always_ok(10).with_delay(Duration::from_millis(50)));
    let (mut controller, rx) = rig.controller(fetcher);
    controller.set_max_concurrent_downloads(2);
    controller
        .start(rig.config(), OperationMode::DownloadOnly)
        .unwrap();
    let (_completed, run_complete) = spawn_drainer(rx);

    tokio::time::sleep(Duration::from_millis(200)).await;
    controller.pause();

    // In-flight downloads drain; nothing new starts.
    tokio::time::sleep(Duration::from_millis(500)).await;
    let settled = controller.get_stats().unwrap();
    assert_eq!(settled.active_downloads, 0);
    assert_eq!(settled.store.in_progress, 0);
    let completed_at_pause = settled.store.completed;
    let bytes_at_pause = settled.bytes_session;

    tokio::time::sleep(Duration::from_millis(300)).await;
    let still_paused = controller.get_stats().unwrap();
    assert_eq!(still_paused.store.completed, completed_at_pause);
    assert!(still_paused.bytes_session >= bytes_at_pause);

    controller.resume();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(20);
    while !run_complete.load(Ordering::Acquire) {
        assert!(tokio::time::Instant::now() < deadline, "run did not finish");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    controller.stop().await;

    assert_eq!(rig.store.stats(11).unwrap().completed, 20);
}

#[tokio::test]
async fn test_page_probe_converges_and_scrapes_all_pages() {
    let rig = Rig::new();
    let config = rig.config();
    let base_url = config.base_url.clone();

    // Pages 0..=137 serve one link each; everything past 137 is empty.
    let fetcher = Arc::new(StubFetcher::new(move |url: &str| {
        if url.starts_with(&base_url) {
            let page: u32 = url
                .split_once("?page=")
                .map(|(_, n)| n.parse().unwrap_or(0))
                .unwrap_or(0);
            if page <= 137 {
                let key_id = 2_205_655 + u64::from(page);
                let body = format!(
                    r#"<a href="/epstein/files/DataSet%2011/EFTA{key_id:08}.pdf">doc</a>"#
                );
                StubResponse {
                    status: 200,
                    body: body.into_bytes(),
                }
            } else {
                StubResponse {
                    status: 200,
                    body: b"<html>no results</html>".to_vec(),
                }
            }
        } else {
            // File downloads.
            StubResponse::ok(100)
        }
    }));

    let (mut controller, mut rx) = rig.controller(fetcher);
    controller
        .start(rig.config(), OperationMode::ScraperOnly)
        .unwrap();
    assert!(wait_for_complete(&mut rx, Duration::from_secs(30)).await);
    controller.stop().await;

    let stats = rig.store.stats(11).unwrap();
    assert_eq!(stats.total_pages, 138, "probe should find pages 0..=137");
    assert_eq!(stats.pages_scraped, 138);
    assert_eq!(stats.keys_found, 138);
    assert_eq!(stats.completed, 138);
}

#[tokio::test]
async fn test_enumerator_single_id_range() {
    let rig = Rig::new();
    let mut config = rig.config();
    config.first_id = Some(5);
    config.last_id = Some(5);

    let fetcher = Arc::new(StubFetcher::always_ok(100));
    let (mut controller, mut rx) = rig.controller(fetcher);
    controller
        .start(config, OperationMode::EnumerateOnly)
        .unwrap();
    assert!(wait_for_complete(&mut rx, Duration::from_secs(10)).await);
    controller.stop().await;

    let stats = rig.store.stats(11).unwrap();
    assert_eq!(stats.total_items(), 1);
    assert_eq!(stats.completed, 1);
    assert!(rig.store.exists("EFTA00000005", 11).unwrap());
    assert_eq!(rig.store.get_enumerator(11).unwrap(), 5);
}

#[tokio::test]
async fn test_enumerator_resumes_from_checkpoint() {
    let rig = Rig::new();
    let mut config = rig.config();
    config.first_id = Some(1);
    config.last_id = Some(20);
    rig.store.set_enumerator(11, 15).unwrap();

    let fetcher = Arc::new(StubFetcher::always_ok(50));
    let (mut controller, mut rx) = rig.controller(fetcher);
    controller
        .start(config, OperationMode::EnumerateOnly)
        .unwrap();
    assert!(wait_for_complete(&mut rx, Duration::from_secs(10)).await);
    controller.stop().await;

    // Ids below the checkpoint were never staged.
    assert!(!rig.store.exists("EFTA00000001", 11).unwrap());
    assert!(rig.store.exists("EFTA00000015", 11).unwrap());
    assert!(rig.store.exists("EFTA00000020", 11).unwrap());
    assert_eq!(rig.store.get_enumerator(11).unwrap(), 20);
}

#[tokio::test]
async fn test_external_producer_keeps_run_alive() {
    let rig = Rig::new();
    rig.seed("EFTA00000001", WorkState::Pending);

    let fetcher = Arc::new(StubFetcher::always_ok(10).with_delay(Duration::from_millis(100)));
    let (mut controller, rx) = rig.controller(fetcher);
    controller.set_external_producer_active(true);
    controller
        .start(rig.config(), OperationMode::DownloadOnly)
        .unwrap();
    let (_completed, run_complete) = spawn_drainer(rx);

    // Queue drains but the external flag keeps the dispatcher waiting.
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert!(!run_complete.load(Ordering::Acquire));

    let config = rig.config();
    let added = controller
        .add_items_to_queue(&[(
            "EFTA00000002".to_string(),
            config.file_url("EFTA00000002"),
            storage::local_path(&rig.settings.storage_root, 11, "EFTA00000002"),
        )])
        .unwrap();
    assert_eq!(added, 1);

    controller.set_external_producer_active(false);
    let deadline = tokio::time::Instant::now() + Duration::from_secs(20);
    while !run_complete.load(Ordering::Acquire) {
        assert!(tokio::time::Instant::now() < deadline, "run did not finish");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    controller.stop().await;

    let stats = rig.store.stats(11).unwrap();
    assert_eq!(stats.completed, 2);
}

#[tokio::test]
async fn test_completed_set_survives_restart() {
    let rig = Rig::new();
    for i in 0..5 {
        rig.seed(&format!("EFTA0000000{i}"), WorkState::Pending);
    }

    let fetcher = Arc::new(StubFetcher::always_ok(100));
    let (mut controller, mut rx) = rig.controller(fetcher);
    controller
        .start(rig.config(), OperationMode::DownloadOnly)
        .unwrap();
    assert!(wait_for_complete(&mut rx, Duration::from_secs(10)).await);
    controller.stop().await;
    assert_eq!(rig.store.stats(11).unwrap().completed, 5);

    // Second run on the same store: the completed set only grows.
    for i in 5..8 {
        rig.seed(&format!("EFTA0000000{i}"), WorkState::Pending);
    }
    let fetcher = Arc::new(StubFetcher::always_ok(100));
    let (mut controller, mut rx) = rig.controller(fetcher);
    controller
        .start(rig.config(), OperationMode::DownloadOnly)
        .unwrap();
    assert!(wait_for_complete(&mut rx, Duration::from_secs(10)).await);
    controller.stop().await;

    let stats = rig.store.stats(11).unwrap();
    assert_eq!(stats.completed, 8);
}

#[tokio::test]
async fn test_stats_events_flow_during_run() {
    let rig = Rig::new();
    for i in 0..4 {
        rig.seed(&format!("EFTA0000000{i}"), WorkState::Pending);
    }

    // Two at a time for 600 ms each keeps the run alive past the 1 Hz
    // snapshot tick.
    let fetcher = Arc::new(StubFetcher::always_ok(10).with_delay(Duration::from_millis(600)));
    let (mut controller, mut rx) = rig.controller(fetcher);
    controller.set_max_concurrent_downloads(2);
    controller
        .start(rig.config(), OperationMode::DownloadOnly)
        .unwrap();

    let mut saw_stats = false;
    let mut saw_lifecycle = false;
    let completed = tokio::time::timeout(Duration::from_secs(15), async {
        while let Some(event) = rx.recv().await {
            match event {
                EngineEvent::Stats(_) => saw_stats = true,
                EngineEvent::WorkerLifecycle { .. } => saw_lifecycle = true,
                EngineEvent::RunComplete => return true,
                _ => {}
            }
        }
        false
    })
    .await
    .unwrap_or(false);
    controller.stop().await;

    assert!(completed);
    assert!(saw_stats, "no stats snapshot was published");
    assert!(saw_lifecycle, "no worker lifecycle event was published");
}

#[tokio::test]
async fn test_start_while_running_is_rejected() {
    let rig = Rig::new();
    rig.seed("EFTA00000001", WorkState::Pending);

    let fetcher = Arc::new(StubFetcher::always_ok(10).with_delay(Duration::from_millis(300)));
    let (mut controller, rx) = rig.controller(fetcher);
    controller
        .start(rig.config(), OperationMode::DownloadOnly)
        .unwrap();
    let (_completed, _run_complete) = spawn_drainer(rx);

    let second = controller.start(rig.config(), OperationMode::DownloadOnly);
    assert!(second.is_err());
    controller.stop().await;
}

#[tokio::test]
async fn test_keep_directory_layout_on_disk() {
    let rig = Rig::new();
    rig.seed("EFTA02205655", WorkState::Pending);

    let fetcher = Arc::new(StubFetcher::always_ok(8));
    let (mut controller, mut rx) = rig.controller(fetcher);
    controller
        .start(rig.config(), OperationMode::DownloadOnly)
        .unwrap();
    assert!(wait_for_complete(&mut rx, Duration::from_secs(10)).await);
    controller.stop().await;

    let expected = rig
        .dir
        .path()
        .join("downloads/DataSet11/022/EFTA02205655.pdf");
    assert!(expected.exists());
}

//! Run orchestration: controller, shared worker state, and events.
//!
//! The controller owns the workers; workers hold a non-owning `Arc` view
//! of the shared state (store handle, counters, pause/stop channels).
//! Observers receive events as values over an mpsc channel, so no
//! callback ever runs inside engine locks.

mod backoff;
mod dispatcher;
mod enumerator;
mod scraper;
mod stats;

pub use backoff::sigmoid_backoff;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::info;

use crate::config::{ConfigError, DataSetConfig, EngineSettings};
use crate::fetch::Fetcher;
use crate::models::{StatsSnapshot, WorkItem, WorkState};
use crate::repository::{StoreError, WorkStore};
use crate::storage;

/// Which producers a run starts alongside the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationMode {
    /// Scrape index pages and download what they link.
    ScraperOnly,
    /// Walk the configured integer id range.
    EnumerateOnly,
    /// Both producers at once.
    Hybrid,
    /// No producer; keys arrive through `add_items_to_queue`.
    DownloadOnly,
}

/// Events published to the observer channel.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    Stats(StatsSnapshot),
    FileStateChanged { key: String, state: WorkState },
    PageScraped { page: u32, count: u32 },
    /// The dispatcher drained everything and no producer can add more.
    RunComplete,
    Error(String),
    WorkerLifecycle { name: &'static str, started: bool },
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("extractor pattern error: {0}")]
    Pattern(#[from] regex::Error),
    #[error("engine is already running")]
    AlreadyRunning,
    #[error("no run is active")]
    NotRunning,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Wall-clock bounds of the period during which downloads were active.
/// The span between them is the wire-speed denominator; idle time before
/// the first transfer (scraping, probing) is excluded.
#[derive(Default)]
struct TransferClock {
    first_active: Option<Instant>,
    last_active: Option<Instant>,
}

/// State shared by the controller and every worker of one run.
pub(crate) struct EngineShared {
    pub store: Arc<WorkStore>,
    pub fetcher: Arc<dyn Fetcher>,
    pub config: DataSetConfig,
    pub settings: EngineSettings,
    pub events: mpsc::Sender<EngineEvent>,

    stop_tx: watch::Sender<bool>,
    pause_tx: watch::Sender<bool>,

    pub max_concurrent_downloads: AtomicUsize,
    pub active_downloads: AtomicI64,
    pub bytes_session: AtomicU64,
    pub wire_time_ms: AtomicU64,
    pub active_transfer_wall_ms: AtomicU64,
    transfer_clock: Mutex<TransferClock>,

    pub external_producer_active: Arc<AtomicBool>,
    pub scraper_active: AtomicBool,
    pub enumerator_active: AtomicBool,
    pub enumerator_current: AtomicU64,
    pub running: AtomicBool,
    pub started_at: Instant,
}

impl EngineShared {
    fn new(
        store: Arc<WorkStore>,
        fetcher: Arc<dyn Fetcher>,
        config: DataSetConfig,
        settings: EngineSettings,
        events: mpsc::Sender<EngineEvent>,
        external_producer_active: Arc<AtomicBool>,
    ) -> Self {
        let (stop_tx, _) = watch::channel(false);
        let (pause_tx, _) = watch::channel(false);
        let max_concurrent = settings.max_concurrent_downloads;
        Self {
            store,
            fetcher,
            config,
            settings,
            events,
            stop_tx,
            pause_tx,
            max_concurrent_downloads: AtomicUsize::new(max_concurrent),
            active_downloads: AtomicI64::new(0),
            bytes_session: AtomicU64::new(0),
            wire_time_ms: AtomicU64::new(0),
            active_transfer_wall_ms: AtomicU64::new(0),
            transfer_clock: Mutex::new(TransferClock::default()),
            external_producer_active,
            scraper_active: AtomicBool::new(false),
            enumerator_active: AtomicBool::new(false),
            enumerator_current: AtomicU64::new(0),
            running: AtomicBool::new(true),
            started_at: Instant::now(),
        }
    }

    pub fn stop_requested(&self) -> bool {
        *self.stop_tx.borrow()
    }

    pub fn request_stop(&self) {
        // send_replace updates the value even with no live receivers.
        self.stop_tx.send_replace(true);
    }

    pub fn paused(&self) -> bool {
        *self.pause_tx.borrow()
    }

    pub fn set_paused(&self, paused: bool) {
        self.pause_tx.send_replace(paused);
    }

    pub fn subscribe_stop(&self) -> watch::Receiver<bool> {
        self.stop_tx.subscribe()
    }

    /// Block cooperatively while paused. Returns on resume or stop.
    pub async fn wait_while_paused(&self) {
        loop {
            // Subscribe before checking so a flip between the check and
            // the await still wakes us.
            let mut pause_rx = self.pause_tx.subscribe();
            let mut stop_rx = self.stop_tx.subscribe();
            if self.stop_requested() || !self.paused() {
                return;
            }
            tokio::select! {
                _ = pause_rx.changed() => {}
                _ = stop_rx.changed() => {}
            }
        }
    }

    /// Note that a download is starting. The first transfer of the run
    /// opens the active-transfer window.
    pub fn record_transfer_start(&self) {
        let mut clock = self
            .transfer_clock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if clock.first_active.is_none() {
            clock.first_active = Some(Instant::now());
        }
    }

    /// Note that a download finished and extend the active window.
    pub fn record_transfer_end(&self) {
        let mut clock = self
            .transfer_clock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        clock.last_active = Some(now);
        if let Some(first) = clock.first_active {
            self.active_transfer_wall_ms
                .store(now.duration_since(first).as_millis() as u64, Ordering::Release);
        }
    }

    /// Report a store failure. Persistent I/O failures stop the run;
    /// everything else is logged and retried by the caller's loop.
    pub async fn report_store_error(&self, context: &str, error: &StoreError) {
        match error {
            StoreError::Io(_) => {
                let message = format!("{context}: {error}");
                tracing::error!("{message}");
                let _ = self.events.send(EngineEvent::Error(message)).await;
                self.request_stop();
            }
            _ => tracing::warn!("{context}: {error}"),
        }
    }

    /// Build a progress snapshot from store counts and session counters.
    pub fn snapshot(&self) -> Result<StatsSnapshot, StoreError> {
        let store = self.store.stats(self.config.id)?;
        let bytes = self.bytes_session.load(Ordering::Acquire);
        let elapsed = self.started_at.elapsed().as_secs_f64();
        let wall_speed = if elapsed > 0.0 {
            bytes as f64 / elapsed
        } else {
            0.0
        };
        let active_wall_ms = self.active_transfer_wall_ms.load(Ordering::Acquire);
        let wire_speed = if active_wall_ms > 0 {
            bytes as f64 * 1000.0 / active_wall_ms as f64
        } else {
            0.0
        };
        let enumerator_current = self
            .enumerator_current
            .load(Ordering::Relaxed)
            .max(store.enumerator_current);

        Ok(StatsSnapshot {
            store,
            active_downloads: self.active_downloads.load(Ordering::Acquire),
            bytes_session: bytes,
            wall_speed_bps: wall_speed,
            wire_speed_bps: wire_speed,
            enumerator_current,
            elapsed_secs: elapsed,
        })
    }
}

/// Clears a worker-liveness flag when the worker exits, panics included.
pub(crate) struct ActiveFlag<'a>(pub &'a AtomicBool);

impl Drop for ActiveFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Lifecycle owner for one engine run: starts workers, forwards control
/// operations, joins everything on stop.
pub struct Controller {
    store: Arc<WorkStore>,
    fetcher: Arc<dyn Fetcher>,
    settings: EngineSettings,
    events: mpsc::Sender<EngineEvent>,
    external_producer_active: Arc<AtomicBool>,
    current: Option<Arc<EngineShared>>,
    producer_handles: Vec<JoinHandle<()>>,
    dispatcher_handle: Option<JoinHandle<()>>,
    stats_handle: Option<JoinHandle<()>>,
}

impl Controller {
    pub fn new(
        store: Arc<WorkStore>,
        fetcher: Arc<dyn Fetcher>,
        settings: EngineSettings,
        events: mpsc::Sender<EngineEvent>,
    ) -> Self {
        Self {
            store,
            fetcher,
            settings,
            events,
            external_producer_active: Arc::new(AtomicBool::new(false)),
            current: None,
            producer_handles: Vec::new(),
            dispatcher_handle: None,
            stats_handle: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.current
            .as_ref()
            .map(|shared| shared.running.load(Ordering::Acquire))
            .unwrap_or(false)
    }

    /// Start a run. Fails synchronously on configuration errors; resets
    /// interrupted items before any worker sees the queue.
    pub fn start(&mut self, config: DataSetConfig, mode: OperationMode) -> Result<(), EngineError> {
        if self.is_running() {
            return Err(EngineError::AlreadyRunning);
        }
        // A completed run may still have its stats worker ticking.
        if let Some(previous) = self.current.take() {
            previous.request_stop();
        }
        config.validate()?;
        self.settings.validate()?;
        if matches!(mode, OperationMode::EnumerateOnly | OperationMode::Hybrid)
            && (config.first_id.is_none() || config.last_id.is_none())
        {
            return Err(ConfigError::MissingRange.into());
        }

        std::fs::create_dir_all(&self.settings.storage_root)?;

        // Crash recovery: anything stuck in progress goes back to pending.
        let reset = self.store.reset_in_progress(config.id)?;
        if reset > 0 {
            info!("reset {reset} interrupted downloads to pending");
        }

        self.fetcher.clear_cancel();
        self.producer_handles.clear();

        let shared = Arc::new(EngineShared::new(
            self.store.clone(),
            self.fetcher.clone(),
            config,
            self.settings.clone(),
            self.events.clone(),
            self.external_producer_active.clone(),
        ));

        info!("starting run for {} ({mode:?})", shared.config.name);

        if matches!(mode, OperationMode::ScraperOnly | OperationMode::Hybrid) {
            shared.scraper_active.store(true, Ordering::Release);
            self.producer_handles
                .push(spawn_worker("scraper", shared.clone(), scraper::run));
        }
        if matches!(mode, OperationMode::EnumerateOnly | OperationMode::Hybrid) {
            shared.enumerator_active.store(true, Ordering::Release);
            self.producer_handles
                .push(spawn_worker("enumerator", shared.clone(), enumerator::run));
        }
        self.dispatcher_handle = Some(spawn_worker("dispatcher", shared.clone(), dispatcher::run));
        self.stats_handle = Some(spawn_worker("stats", shared.clone(), stats::run));

        self.current = Some(shared);
        Ok(())
    }

    pub fn pause(&self) {
        if let Some(shared) = &self.current {
            if !shared.paused() {
                shared.set_paused(true);
                info!("run paused");
            }
        }
    }

    pub fn resume(&self) {
        if let Some(shared) = &self.current {
            if shared.paused() {
                shared.set_paused(false);
                info!("run resumed");
            }
        }
    }

    /// Stop the run and join every worker: producers first, then the
    /// dispatcher, then stats. Idempotent.
    pub async fn stop(&mut self) {
        let Some(shared) = self.current.clone() else {
            return;
        };
        shared.request_stop();
        shared.set_paused(false);
        shared.fetcher.cancel();

        for handle in self.producer_handles.drain(..) {
            let _ = handle.await;
        }
        if let Some(handle) = self.dispatcher_handle.take() {
            let _ = handle.await;
        }
        if let Some(handle) = self.stats_handle.take() {
            let _ = handle.await;
        }
        shared.running.store(false, Ordering::Release);
        info!("run stopped");
    }

    pub fn get_stats(&self) -> Result<StatsSnapshot, EngineError> {
        let shared = self.current.as_ref().ok_or(EngineError::NotRunning)?;
        Ok(shared.snapshot()?)
    }

    /// Adjust the admission-control cap. Takes effect at the dispatcher's
    /// next tick; also applies to future runs.
    pub fn set_max_concurrent_downloads(&mut self, max: usize) {
        self.settings.max_concurrent_downloads = max.max(1);
        if let Some(shared) = &self.current {
            shared
                .max_concurrent_downloads
                .store(max.max(1), Ordering::Release);
        }
    }

    /// Queue keys discovered by an external producer (a browser-driven
    /// scraper, for example). Duplicate keys are ignored by the store.
    pub fn add_items_to_queue(
        &self,
        entries: &[(String, String, PathBuf)],
    ) -> Result<usize, EngineError> {
        let shared = self.current.as_ref().ok_or(EngineError::NotRunning)?;
        let items: Vec<WorkItem> = entries
            .iter()
            .map(|(key, url, local_path)| {
                WorkItem::pending(
                    shared.config.id,
                    key.clone(),
                    url.clone(),
                    local_path.clone(),
                )
            })
            .collect();
        Ok(shared.store.add_items_batch(&items)?)
    }

    /// Record a page as scraped on behalf of an external producer,
    /// materializing the row when it does not exist yet.
    pub fn mark_page_scraped(
        &self,
        data_set_id: u32,
        page: u32,
        count: u32,
    ) -> Result<(), EngineError> {
        self.store.add_pages_batch(data_set_id, page, page)?;
        self.store.mark_scraped(data_set_id, page, count)?;
        Ok(())
    }

    /// Tell the dispatcher an external producer is still feeding keys, so
    /// an empty queue means "wait", not "done". The flag persists across
    /// runs and may be set before `start`.
    pub fn set_external_producer_active(&self, active: bool) {
        self.external_producer_active.store(active, Ordering::Release);
    }

    pub fn reset_interrupted(&self, data_set_id: u32) -> Result<usize, EngineError> {
        Ok(self.store.reset_in_progress(data_set_id)?)
    }

    pub fn reset_failed(&self, data_set_id: u32) -> Result<usize, EngineError> {
        Ok(self.store.reset_failed(data_set_id)?)
    }

    pub fn reset_all(&self, data_set_id: u32) -> Result<usize, EngineError> {
        Ok(self.store.reset_all(data_set_id)?)
    }

    pub fn clear_data_set(&self, data_set_id: u32) -> Result<usize, EngineError> {
        Ok(self.store.clear_data_set(data_set_id)?)
    }

    pub fn has_pending_work(&self, data_set_id: u32) -> Result<bool, EngineError> {
        Ok(self.store.has_pending_work(data_set_id)?)
    }
}

/// Stage an item for a freshly discovered key using the run's layout.
pub(crate) fn stage_item(shared: &EngineShared, key: &str) -> WorkItem {
    WorkItem::pending(
        shared.config.id,
        key.to_string(),
        shared.config.file_url(key),
        storage::local_path(&shared.settings.storage_root, shared.config.id, key),
    )
}

fn spawn_worker<F, Fut>(
    name: &'static str,
    shared: Arc<EngineShared>,
    body: F,
) -> JoinHandle<()>
where
    F: FnOnce(Arc<EngineShared>) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let events = shared.events.clone();
        let _ = events
            .send(EngineEvent::WorkerLifecycle {
                name,
                started: true,
            })
            .await;
        body(shared).await;
        let _ = events
            .send(EngineEvent::WorkerLifecycle {
                name,
                started: false,
            })
            .await;
    })
}

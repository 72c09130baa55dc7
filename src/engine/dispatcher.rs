//! Download dispatcher: drains pending and retry-eligible work at a
//! live-adjustable concurrency cap.
//!
//! One long-lived task claims items (take, then mark in progress) and
//! spawns a detached task per download, so no two tasks ever hold the
//! same key in progress. Admission control, not pool size, bounds the
//! effective concurrency.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::FutureExt;
use tracing::{debug, info, warn};

use super::backoff::sigmoid_backoff;
use super::{EngineEvent, EngineShared};
use crate::fetch::{FetchError, FetchOutcome};
use crate::models::{WorkItem, WorkState};
use crate::storage;

/// Hard ceiling on in-flight download tasks, whatever the cap says.
const MAX_POOL: usize = 500;

const CAPACITY_POLL: Duration = Duration::from_millis(100);
const PRODUCER_POLL: Duration = Duration::from_millis(200);
const STORE_ERROR_POLL: Duration = Duration::from_millis(500);

pub(crate) async fn run(shared: Arc<EngineShared>) {
    let data_set = shared.config.id;

    loop {
        shared.wait_while_paused().await;
        if shared.stop_requested() {
            break;
        }

        let cap = shared
            .max_concurrent_downloads
            .load(Ordering::Acquire)
            .min(MAX_POOL) as i64;
        let active = shared.active_downloads.load(Ordering::Acquire);
        if active >= cap {
            tokio::time::sleep(CAPACITY_POLL).await;
            continue;
        }
        let want = (cap - active) as usize;

        let mut items = match shared.store.take_pending(data_set, want) {
            Ok(items) => items,
            Err(e) => {
                shared.report_store_error("taking pending items", &e).await;
                tokio::time::sleep(STORE_ERROR_POLL).await;
                continue;
            }
        };

        if items.is_empty() {
            items = match shared
                .store
                .take_retryable_failed(data_set, shared.settings.max_retries, 100)
            {
                Ok(failed) => retry_eligible(failed, want),
                Err(e) => {
                    shared.report_store_error("taking retryable items", &e).await;
                    Vec::new()
                }
            };
        }

        if items.is_empty() {
            // Nothing claimable right now. Decide between waiting on
            // in-flight work, waiting on producers, or finishing.
            if shared.active_downloads.load(Ordering::Acquire) > 0 {
                tokio::time::sleep(CAPACITY_POLL).await;
                continue;
            }
            if shared.external_producer_active.load(Ordering::Acquire) {
                tokio::time::sleep(PRODUCER_POLL).await;
                continue;
            }
            if shared.scraper_active.load(Ordering::Acquire)
                || shared.enumerator_active.load(Ordering::Acquire)
            {
                tokio::time::sleep(PRODUCER_POLL).await;
                continue;
            }
            // Producers are done; re-read the store to close the race
            // between a producer's final commit and our empty take.
            match shared.store.stats(data_set) {
                Ok(stats) if stats.pending > 0 || stats.in_progress > 0 => {
                    tokio::time::sleep(CAPACITY_POLL).await;
                    continue;
                }
                Ok(_) => {
                    info!("all downloads complete");
                    break;
                }
                Err(e) => {
                    shared.report_store_error("re-checking queue", &e).await;
                    tokio::time::sleep(CAPACITY_POLL).await;
                    continue;
                }
            }
        }

        for item in items {
            if shared.stop_requested() {
                break;
            }
            // A terminal item only re-enters the queue through an
            // explicit reset; never claim one.
            if item.state.is_terminal() {
                warn!("refusing to claim {} in state {}", item.key, item.state.as_str());
                continue;
            }
            if let Err(e) =
                shared
                    .store
                    .set_state(item.storage_id, WorkState::InProgress, None, None)
            {
                shared.report_store_error("claiming item", &e).await;
                continue;
            }
            shared.active_downloads.fetch_add(1, Ordering::AcqRel);

            let shared = shared.clone();
            tokio::spawn(async move {
                let _active = ActiveDownload(&shared);
                let key = item.key.clone();
                let outcome =
                    std::panic::AssertUnwindSafe(process_item(&shared, &item))
                        .catch_unwind()
                        .await;
                if outcome.is_err() {
                    // Best effort; the item resets on next start otherwise.
                    let _ = shared.store.set_state(
                        item.storage_id,
                        WorkState::Failed,
                        Some("download task panicked"),
                        None,
                    );
                    warn!("download task for {key} panicked");
                }
            });
        }
    }

    // Let in-flight tasks finish so a joined dispatcher means a quiet
    // pool. Cancelled fetches abort at their next chunk.
    while shared.active_downloads.load(Ordering::Acquire) > 0 {
        tokio::time::sleep(CAPACITY_POLL).await;
    }

    // Natural completion, as opposed to a requested stop.
    if !shared.stop_requested() {
        shared.running.store(false, Ordering::Release);
        let _ = shared.events.send(EngineEvent::RunComplete).await;
    }
}

/// Filter failed items down to those whose backoff window has elapsed.
fn retry_eligible(failed: Vec<WorkItem>, want: usize) -> Vec<WorkItem> {
    let now = Utc::now();
    let mut eligible = Vec::new();
    for item in failed {
        let backoff = match chrono::Duration::from_std(sigmoid_backoff(item.retry_count)) {
            Ok(duration) => duration,
            Err(_) => continue,
        };
        if now >= item.updated_at + backoff {
            eligible.push(item);
            if eligible.len() >= want {
                break;
            }
        }
    }
    eligible
}

/// Decrements the active-download counter when the task ends, panics
/// included, and stamps the transfer clock.
struct ActiveDownload<'a>(&'a Arc<EngineShared>);

impl Drop for ActiveDownload<'_> {
    fn drop(&mut self) {
        self.0.active_downloads.fetch_sub(1, Ordering::AcqRel);
    }
}

async fn process_item(shared: &Arc<EngineShared>, item: &WorkItem) {
    // Skip without touching the network when the file is already there.
    if !shared.settings.overwrite_existing && storage::file_present(&item.local_path) {
        set_state(shared, item, WorkState::Skipped, None, None).await;
        return;
    }

    shared.record_transfer_start();
    let outcome = shared
        .fetcher
        .get_to_path(
            &item.source_url,
            &item.local_path,
            shared.settings.download_timeout,
        )
        .await;
    shared.record_transfer_end();

    dispose(shared, item, outcome).await;
}

/// Map a fetch outcome onto the item's next state.
async fn dispose(shared: &Arc<EngineShared>, item: &WorkItem, outcome: FetchOutcome) {
    if outcome.error == Some(FetchError::Cancelled) {
        // Not a failure: the item stays in progress and is reset to
        // pending by the next start.
        storage::remove_partial(&item.local_path);
        debug!("download of {} cancelled", item.key);
        return;
    }

    match outcome.http_code {
        404 => {
            storage::remove_partial(&item.local_path);
            set_state(shared, item, WorkState::NotFound, Some("404 Not Found"), None).await;
        }
        403 | 429 => {
            storage::remove_partial(&item.local_path);
            let reason = format!("Blocked: HTTP {}", outcome.http_code);
            fail(shared, item, &reason).await;
        }
        _ if outcome.is_success() && outcome.actual_length > 0 => {
            shared
                .bytes_session
                .fetch_add(outcome.actual_length, Ordering::AcqRel);
            shared
                .wire_time_ms
                .fetch_add(outcome.wire_time_ms, Ordering::AcqRel);
            set_state(
                shared,
                item,
                WorkState::Completed,
                None,
                Some(outcome.actual_length as i64),
            )
            .await;
        }
        _ if outcome.is_success() => {
            storage::remove_partial(&item.local_path);
            set_state(shared, item, WorkState::NotFound, Some("Empty response"), None).await;
        }
        _ => {
            storage::remove_partial(&item.local_path);
            let reason = outcome.failure_reason();
            fail(shared, item, &reason).await;
        }
    }
}

async fn fail(shared: &Arc<EngineShared>, item: &WorkItem, reason: &str) {
    if let Err(e) = shared.store.increment_retry(item.storage_id) {
        shared.report_store_error("incrementing retry count", &e).await;
        return;
    }
    set_state(shared, item, WorkState::Failed, Some(reason), None).await;
}

async fn set_state(
    shared: &Arc<EngineShared>,
    item: &WorkItem,
    state: WorkState,
    error: Option<&str>,
    size: Option<i64>,
) {
    if let Err(e) = shared.store.set_state(item.storage_id, state, error, size) {
        // The item stays in progress; crash recovery picks it up.
        shared.report_store_error("updating item state", &e).await;
        return;
    }
    let _ = shared
        .events
        .send(EngineEvent::FileStateChanged {
            key: item.key.clone(),
            state,
        })
        .await;
}

//! Work items, page records, and derived statistics.
//!
//! A work item tracks a single key's download lifecycle. Items are owned
//! by the work store; workers hold value copies while dispatching.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Download lifecycle state of a work item.
///
/// `Pending -> InProgress -> {Completed | NotFound | Failed | Skipped}`,
/// with `Failed -> Pending` once the retry backoff window has elapsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkState {
    Pending,
    InProgress,
    Completed,
    Failed,
    /// Server answered 404 or sent an empty body.
    NotFound,
    /// File was already present on disk with content.
    Skipped,
}

impl WorkState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::InProgress => "IN_PROGRESS",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::NotFound => "NOT_FOUND",
            Self::Skipped => "SKIPPED",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(Self::Pending),
            "IN_PROGRESS" => Some(Self::InProgress),
            "COMPLETED" => Some(Self::Completed),
            "FAILED" => Some(Self::Failed),
            "NOT_FOUND" => Some(Self::NotFound),
            "SKIPPED" => Some(Self::Skipped),
            _ => None,
        }
    }

    /// Terminal states are not revisited without an explicit reset.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::NotFound | Self::Skipped)
    }
}

/// One unit of work: a single key's download lifecycle within a data set.
///
/// `(data_set_id, key)` is unique in the store.
#[derive(Debug, Clone)]
pub struct WorkItem {
    /// Store row id; the stable handle workers pass around.
    pub storage_id: i64,
    pub data_set_id: u32,
    /// Full key, prefix included (e.g. "EFTA02205655").
    pub key: String,
    pub source_url: String,
    pub local_path: PathBuf,
    pub state: WorkState,
    /// Size recorded on completion; 0 when unknown.
    pub size_bytes: i64,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkItem {
    /// Stage a new pending item; store-assigned fields are placeholders
    /// until the row is inserted.
    pub fn pending(data_set_id: u32, key: String, source_url: String, local_path: PathBuf) -> Self {
        let now = Utc::now();
        Self {
            storage_id: 0,
            data_set_id,
            key,
            source_url,
            local_path,
            state: WorkState::Pending,
            size_bytes: 0,
            retry_count: 0,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// One index page's scrape status.
#[derive(Debug, Clone)]
pub struct PageRecord {
    pub data_set_id: u32,
    pub page_number: u32,
    pub scraped: bool,
    /// Number of file links found when the page was scraped.
    pub pdf_count: u32,
    pub scraped_at: Option<DateTime<Utc>>,
}

/// Counts read from the store in one consistent view. The enumerator
/// checkpoint (the highest integer id processed, durable per data set)
/// surfaces here as `enumerator_current`.
#[derive(Debug, Clone, Copy, Default)]
pub struct StoreStats {
    pub pending: i64,
    pub in_progress: i64,
    pub completed: i64,
    pub failed: i64,
    pub not_found: i64,
    pub skipped: i64,
    pub total_pages: i64,
    pub pages_scraped: i64,
    /// Sum of per-page link counts.
    pub keys_found: i64,
    pub enumerator_current: u64,
}

impl StoreStats {
    pub fn total_items(&self) -> i64 {
        self.pending + self.in_progress + self.completed + self.failed + self.not_found
            + self.skipped
    }
}

/// Point-in-time progress snapshot combining durable counts with
/// session-local counters. Derived, never stored.
#[derive(Debug, Clone, Copy, Default)]
pub struct StatsSnapshot {
    pub store: StoreStats,
    /// Downloads currently in flight.
    pub active_downloads: i64,
    /// Bytes downloaded since the run started.
    pub bytes_session: u64,
    /// Bytes per second over total elapsed wall time.
    pub wall_speed_bps: f64,
    /// Bytes per second over the wall time during which at least one
    /// transfer was active. Excludes idle gaps between bursts.
    pub wire_speed_bps: f64,
    /// Current enumerator position, when an enumerator is running.
    pub enumerator_current: u64,
    pub elapsed_secs: f64,
}

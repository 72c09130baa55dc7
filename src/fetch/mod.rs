//! HTTP fetch capability.
//!
//! The engine never talks to the network directly; it goes through the
//! [`Fetcher`] trait so tests can substitute deterministic stubs. The
//! fetcher reports status codes and transport failures, it does not
//! interpret them; retry and disposition policy live in the dispatcher.

mod cookies;
mod http;

pub use cookies::{Cookie, CookieJar};
pub use http::HttpFetcher;

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

/// Transfer failures. HTTP error statuses are not errors at this layer;
/// they come back in [`FetchOutcome::http_code`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    /// Connection failures, timeouts, and low-throughput aborts.
    #[error("transport error: {0}")]
    Transport(String),
    /// Server declared a Content-Length the body did not match.
    #[error("size mismatch: declared {declared} bytes, received {actual}")]
    SizeMismatch { declared: u64, actual: u64 },
    /// The transfer was cancelled through the fetcher's cancel flag.
    #[error("transfer cancelled")]
    Cancelled,
    /// Could not create the target directory or write the file.
    #[error("local I/O error: {0}")]
    LocalIo(String),
}

/// Result of a single GET, whether it ended in bytes, an HTTP error
/// status, or a transport failure.
#[derive(Debug, Clone, Default)]
pub struct FetchOutcome {
    /// Final HTTP status after redirects; 0 when the request never got a
    /// response.
    pub http_code: u16,
    /// Response body for in-memory fetches; empty for fetches to disk.
    pub body: Vec<u8>,
    /// Content-Length advertised by the server, when present.
    pub declared_length: Option<u64>,
    /// Bytes actually received.
    pub actual_length: u64,
    pub content_type: Option<String>,
    /// Set-Cookie headers the server sent, verbatim.
    pub set_cookies: Vec<String>,
    /// Wall time spent on the wire for this transfer.
    pub wire_time_ms: u64,
    pub error: Option<FetchError>,
}

impl FetchOutcome {
    /// True when the transfer finished without error on a 2xx status.
    pub fn is_success(&self) -> bool {
        self.error.is_none() && (200..300).contains(&self.http_code)
    }

    /// Human-readable failure reason for recording on a work item.
    pub fn failure_reason(&self) -> String {
        match &self.error {
            Some(err) => err.to_string(),
            None => format!("HTTP error: {}", self.http_code),
        }
    }

    pub(crate) fn from_error(error: FetchError, wire_time_ms: u64) -> Self {
        Self {
            error: Some(error),
            wire_time_ms,
            ..Default::default()
        }
    }
}

/// One-shot HTTP GET capability with cookie injection, size verification,
/// wire-time measurement, and cancellation.
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Fetch a URL into memory (index pages, probes).
    async fn get_bytes(&self, url: &str, timeout: Duration) -> FetchOutcome;

    /// Stream a URL to a file. The partial file is removed on any
    /// non-2xx status, transport failure, or declared-length mismatch.
    async fn get_to_path(&self, url: &str, path: &Path, timeout: Duration) -> FetchOutcome;

    /// Ask in-flight and future transfers to abort. Default no-op for
    /// stub fetchers.
    fn cancel(&self) {}

    /// Re-arm the fetcher after a cancelled run.
    fn clear_cancel(&self) {}
}

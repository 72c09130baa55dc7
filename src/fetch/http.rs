//! reqwest-backed fetcher with streaming bodies, cancellation, and a
//! low-throughput abort.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::header::{COOKIE, CONTENT_LENGTH, CONTENT_TYPE};
use tokio::io::AsyncWriteExt;
use tracing::debug;

use super::{CookieJar, FetchError, FetchOutcome, Fetcher};
use crate::config::{REQUIRED_COOKIE, USER_AGENT};

/// Transfers slower than this, sustained for [`LOW_THROUGHPUT_WINDOW`],
/// are aborted as stalled.
const LOW_THROUGHPUT_FLOOR_BPS: f64 = 1024.0;
const LOW_THROUGHPUT_WINDOW: Duration = Duration::from_secs(10);

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const TCP_KEEPALIVE: Duration = Duration::from_secs(120);
const MAX_REDIRECTS: usize = 10;

enum CookieSource {
    /// A literal `Cookie:` header value, sent to every host.
    Literal(String),
    /// A jar loaded from a Netscape cookie file; rendered per URL.
    Jar(CookieJar),
}

/// Production [`Fetcher`] backed by a shared reqwest client.
pub struct HttpFetcher {
    client: reqwest::Client,
    cookies: CookieSource,
    cancelled: Arc<AtomicBool>,
}

impl HttpFetcher {
    /// Build a fetcher with the default age-verification cookie.
    pub fn new() -> Result<Self, FetchError> {
        Self::with_cookies(None, None)
    }

    /// Build a fetcher with an explicit cookie configuration. A literal
    /// cookie string takes precedence over a cookie file.
    pub fn with_cookies(
        cookie: Option<String>,
        cookie_file: Option<&Path>,
    ) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .redirect(reqwest::redirect::Policy::limited(MAX_REDIRECTS))
            .connect_timeout(CONNECT_TIMEOUT)
            .tcp_keepalive(TCP_KEEPALIVE)
            .gzip(true)
            .build()
            .map_err(|e| FetchError::Transport(format!("failed to build HTTP client: {e}")))?;

        let cookies = match (cookie, cookie_file) {
            (Some(literal), _) => CookieSource::Literal(literal),
            (None, Some(path)) => {
                let jar = CookieJar::from_netscape_file(path)
                    .map_err(|e| FetchError::LocalIo(format!("cookie file {path:?}: {e}")))?;
                debug!("loaded {} cookies from {:?}", jar.len(), path);
                CookieSource::Jar(jar)
            }
            (None, None) => CookieSource::Literal(REQUIRED_COOKIE.to_string()),
        };

        Ok(Self {
            client,
            cookies,
            cancelled: Arc::new(AtomicBool::new(false)),
        })
    }

    fn cookie_header(&self, url: &str) -> Option<String> {
        match &self.cookies {
            CookieSource::Literal(value) => Some(value.clone()),
            CookieSource::Jar(jar) => jar.header_for_url(url),
        }
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    async fn send(
        &self,
        url: &str,
        timeout: Duration,
    ) -> Result<reqwest::Response, FetchError> {
        if self.is_cancelled() {
            return Err(FetchError::Cancelled);
        }
        let mut request = self.client.get(url).timeout(timeout);
        if let Some(cookie) = self.cookie_header(url) {
            request = request.header(COOKIE, cookie);
        }
        request.send().await.map_err(|e| {
            if e.is_timeout() {
                FetchError::Transport(format!("timed out fetching {url}"))
            } else {
                FetchError::Transport(e.to_string())
            }
        })
    }
}

/// Tracks sustained throughput over a sliding window.
struct ThroughputGuard {
    window_start: Instant,
    window_bytes: u64,
}

impl ThroughputGuard {
    fn new() -> Self {
        Self {
            window_start: Instant::now(),
            window_bytes: 0,
        }
    }

    /// Record a chunk; returns an error when the rate over a full window
    /// stayed under the floor.
    fn record(&mut self, bytes: usize) -> Result<(), FetchError> {
        self.window_bytes += bytes as u64;
        let elapsed = self.window_start.elapsed();
        if elapsed >= LOW_THROUGHPUT_WINDOW {
            let rate = self.window_bytes as f64 / elapsed.as_secs_f64();
            if rate < LOW_THROUGHPUT_FLOOR_BPS {
                return Err(FetchError::Transport(format!(
                    "throughput {rate:.0} B/s below floor for {}s",
                    LOW_THROUGHPUT_WINDOW.as_secs()
                )));
            }
            self.window_start = Instant::now();
            self.window_bytes = 0;
        }
        Ok(())
    }
}

fn header_u64(response: &reqwest::Response, name: reqwest::header::HeaderName) -> Option<u64> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

fn header_string(response: &reqwest::Response, name: reqwest::header::HeaderName) -> Option<String> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string())
}

fn set_cookie_headers(response: &reqwest::Response) -> Vec<String> {
    response
        .headers()
        .get_all(reqwest::header::SET_COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .map(|v| v.to_string())
        .collect()
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn get_bytes(&self, url: &str, timeout: Duration) -> FetchOutcome {
        let started = Instant::now();
        let response = match self.send(url, timeout).await {
            Ok(response) => response,
            Err(error) => {
                return FetchOutcome::from_error(error, started.elapsed().as_millis() as u64)
            }
        };

        let http_code = response.status().as_u16();
        let declared_length = header_u64(&response, CONTENT_LENGTH);
        let content_type = header_string(&response, CONTENT_TYPE);
        let set_cookies = set_cookie_headers(&response);

        let mut body = Vec::new();
        let mut guard = ThroughputGuard::new();
        let mut stream = response.bytes_stream();
        let mut error = None;

        while let Some(chunk) = stream.next().await {
            if self.is_cancelled() {
                error = Some(FetchError::Cancelled);
                break;
            }
            match chunk {
                Ok(bytes) => {
                    if let Err(stalled) = guard.record(bytes.len()) {
                        error = Some(stalled);
                        break;
                    }
                    body.extend_from_slice(&bytes);
                }
                Err(e) => {
                    error = Some(FetchError::Transport(e.to_string()));
                    break;
                }
            }
        }

        let actual_length = body.len() as u64;
        if error.is_none() {
            if let Some(declared) = declared_length {
                if declared != actual_length {
                    error = Some(FetchError::SizeMismatch {
                        declared,
                        actual: actual_length,
                    });
                }
            }
        }

        FetchOutcome {
            http_code,
            body,
            declared_length,
            actual_length,
            content_type,
            set_cookies,
            wire_time_ms: started.elapsed().as_millis() as u64,
            error,
        }
    }

    async fn get_to_path(&self, url: &str, path: &Path, timeout: Duration) -> FetchOutcome {
        let started = Instant::now();

        if let Some(parent) = path.parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                return FetchOutcome::from_error(
                    FetchError::LocalIo(format!("creating {parent:?}: {e}")),
                    0,
                );
            }
        }

        let response = match self.send(url, timeout).await {
            Ok(response) => response,
            Err(error) => {
                return FetchOutcome::from_error(error, started.elapsed().as_millis() as u64)
            }
        };

        let http_code = response.status().as_u16();
        let declared_length = header_u64(&response, CONTENT_LENGTH);
        let content_type = header_string(&response, CONTENT_TYPE);
        let set_cookies = set_cookie_headers(&response);

        // Error statuses never leave a file behind; the body is not
        // worth writing.
        if !(200..300).contains(&http_code) {
            return FetchOutcome {
                http_code,
                declared_length,
                content_type,
                set_cookies,
                wire_time_ms: started.elapsed().as_millis() as u64,
                ..Default::default()
            };
        }

        let mut file = match tokio::fs::File::create(path).await {
            Ok(file) => file,
            Err(e) => {
                return FetchOutcome::from_error(
                    FetchError::LocalIo(format!("creating {path:?}: {e}")),
                    started.elapsed().as_millis() as u64,
                )
            }
        };

        let mut written: u64 = 0;
        let mut guard = ThroughputGuard::new();
        let mut stream = response.bytes_stream();
        let mut error = None;

        while let Some(chunk) = stream.next().await {
            if self.is_cancelled() {
                error = Some(FetchError::Cancelled);
                break;
            }
            match chunk {
                Ok(bytes) => {
                    if let Err(stalled) = guard.record(bytes.len()) {
                        error = Some(stalled);
                        break;
                    }
                    if let Err(e) = file.write_all(&bytes).await {
                        error = Some(FetchError::LocalIo(format!("writing {path:?}: {e}")));
                        break;
                    }
                    written += bytes.len() as u64;
                }
                Err(e) => {
                    error = Some(FetchError::Transport(e.to_string()));
                    break;
                }
            }
        }

        if error.is_none() {
            if let Err(e) = file.flush().await {
                error = Some(FetchError::LocalIo(format!("flushing {path:?}: {e}")));
            }
        }
        drop(file);

        if error.is_none() {
            if let Some(declared) = declared_length {
                if declared != written {
                    error = Some(FetchError::SizeMismatch {
                        declared,
                        actual: written,
                    });
                }
            }
        }

        if error.is_some() {
            let _ = tokio::fs::remove_file(path).await;
        }

        FetchOutcome {
            http_code,
            body: Vec::new(),
            declared_length,
            actual_length: written,
            content_type,
            set_cookies,
            wire_time_ms: started.elapsed().as_millis() as u64,
            error,
        }
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    fn clear_cancel(&self) {
        self.cancelled.store(false, Ordering::Release);
    }
}

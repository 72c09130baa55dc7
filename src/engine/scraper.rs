//! Scraper worker: probe the page universe, then drain unscraped pages.

use std::sync::Arc;

use tracing::{debug, info, warn};

use super::{stage_item, ActiveFlag, EngineEvent, EngineShared};
use crate::extract::LinkExtractor;

/// Upper bound for the page-count binary search.
const PROBE_UPPER_BOUND: i64 = 100_000;

pub(crate) async fn run(shared: Arc<EngineShared>) {
    let _active = ActiveFlag(&shared.scraper_active);
    let data_set = shared.config.id;

    // A populated page table means a resumed run or an externally
    // provided page universe; the probe is skipped either way.
    let existing_pages = match shared.store.page_count(data_set) {
        Ok(count) => count,
        Err(e) => {
            shared.report_store_error("reading page count", &e).await;
            return;
        }
    };

    if existing_pages == 0 {
        let detected = probe_page_count(&shared).await;
        if shared.stop_requested() {
            return;
        }
        let max_index = match detected.or(shared.config.max_page_index) {
            Some(index) => index,
            None => {
                let message =
                    "page probe failed and no max page index is configured; scraping skipped"
                        .to_string();
                warn!("{message}");
                let _ = shared.events.send(EngineEvent::Error(message)).await;
                return;
            }
        };
        if detected.is_some() {
            info!("detected {} pages", max_index + 1);
        } else {
            info!("probe failed, using configured max page index {max_index}");
        }
        if let Err(e) = shared.store.add_pages_batch(data_set, 0, max_index) {
            shared.report_store_error("materializing pages", &e).await;
            return;
        }
    } else {
        info!("resuming with {existing_pages} known pages");
    }

    let extractor = match LinkExtractor::new(&shared.config) {
        Ok(extractor) => Arc::new(extractor),
        Err(e) => {
            let message = format!("link pattern failed to compile: {e}");
            let _ = shared.events.send(EngineEvent::Error(message)).await;
            return;
        }
    };

    loop {
        shared.wait_while_paused().await;
        if shared.stop_requested() {
            break;
        }

        let pages = match shared
            .store
            .unscraped_pages(data_set, shared.settings.max_concurrent_scrapes)
        {
            Ok(pages) => pages,
            Err(e) => {
                shared.report_store_error("reading unscraped pages", &e).await;
                break;
            }
        };

        if pages.is_empty() {
            info!("all pages scraped");
            break;
        }

        let mut handles = Vec::with_capacity(pages.len());
        for page in pages {
            if shared.stop_requested() {
                break;
            }
            let shared = shared.clone();
            let extractor = extractor.clone();
            handles.push(tokio::spawn(async move {
                scrape_page(&shared, &extractor, page).await;
            }));
        }
        for handle in handles {
            let _ = handle.await;
        }
    }
}

/// Binary search for the highest index page that serves content.
///
/// A page counts as valid when it answers 200 and mentions the key
/// prefix or a .pdf link anywhere in the body. The heuristic can
/// misread an error page that mentions either; the configured
/// `max_page_index` bounds the damage when it does.
async fn probe_page_count(shared: &Arc<EngineShared>) -> Option<u32> {
    let mut low: i64 = 0;
    let mut high: i64 = PROBE_UPPER_BOUND;
    let mut detected: i64 = -1;

    while low <= high && !shared.stop_requested() {
        let mid = low + (high - low) / 2;
        let url = shared.config.page_url(mid as u32);
        let outcome = shared
            .fetcher
            .get_bytes(&url, shared.settings.page_timeout)
            .await;

        let valid = outcome.http_code == 200 && !outcome.body.is_empty() && {
            let body = String::from_utf8_lossy(&outcome.body);
            body.contains(&shared.config.key_prefix) || body.contains(".pdf")
        };

        debug!("probe page {mid}: http {} valid {valid}", outcome.http_code);

        if valid {
            detected = mid;
            low = mid + 1;
        } else {
            high = mid - 1;
        }
    }

    u32::try_from(detected).ok()
}

/// Fetch one index page, extract its links, and commit the keys. An
/// error leaves the page unscraped so the next take retries it.
async fn scrape_page(shared: &Arc<EngineShared>, extractor: &LinkExtractor, page: u32) {
    let url = shared.config.page_url(page);
    let outcome = shared
        .fetcher
        .get_bytes(&url, shared.settings.page_timeout)
        .await;

    if !outcome.is_success() {
        warn!("failed to scrape page {page}: {}", outcome.failure_reason());
        return;
    }

    let html = String::from_utf8_lossy(&outcome.body);
    let links = extractor.extract(&html);

    let items: Vec<_> = links
        .iter()
        .map(|link| {
            let mut item = stage_item(shared, &link.key);
            // Index pages carry the authoritative URL, encoding included.
            item.source_url = link.url.clone();
            item
        })
        .collect();

    if let Err(e) = shared.store.add_items_batch(&items) {
        shared.report_store_error("committing scraped keys", &e).await;
        return;
    }
    if let Err(e) = shared
        .store
        .mark_scraped(shared.config.id, page, links.len() as u32)
    {
        shared.report_store_error("marking page scraped", &e).await;
        return;
    }

    let _ = shared
        .events
        .send(EngineEvent::PageScraped {
            page,
            count: links.len() as u32,
        })
        .await;
}

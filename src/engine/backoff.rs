//! Retry backoff schedule.

use std::time::Duration;

const MIN_DELAY_SECS: f64 = 5.0;
const MAX_DELAY_SECS: f64 = 600.0;
const STEEPNESS: f64 = 1.0;
const MIDPOINT: f64 = 5.0;

/// Logistic backoff: waits grow slowly for the first retries, steeply
/// through the midpoint, and plateau at ten minutes.
///
/// A retry count of zero means the item has never failed and gets no
/// delay.
pub fn sigmoid_backoff(retry_count: u32) -> Duration {
    if retry_count == 0 {
        return Duration::ZERO;
    }
    let delay = MIN_DELAY_SECS
        + (MAX_DELAY_SECS - MIN_DELAY_SECS)
            / (1.0 + (-STEEPNESS * (f64::from(retry_count) - MIDPOINT)).exp());
    Duration::from_secs_f64(delay)
}

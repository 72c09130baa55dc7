//! Stats aggregator: a 1 Hz snapshot loop feeding the observer channel.

use std::sync::Arc;
use std::time::Duration;

use super::{EngineEvent, EngineShared};

const SNAPSHOT_INTERVAL: Duration = Duration::from_secs(1);

pub(crate) async fn run(shared: Arc<EngineShared>) {
    let mut stop_rx = shared.subscribe_stop();

    loop {
        tokio::select! {
            _ = tokio::time::sleep(SNAPSHOT_INTERVAL) => {}
            _ = stop_rx.changed() => {}
        }
        if shared.stop_requested() {
            break;
        }

        match shared.snapshot() {
            Ok(snapshot) => {
                let _ = shared.events.send(EngineEvent::Stats(snapshot)).await;
            }
            Err(e) => {
                shared.report_store_error("building stats snapshot", &e).await;
            }
        }
    }
}

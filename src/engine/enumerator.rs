//! Enumerator worker: walk the configured integer id range and stage
//! every key the store has not seen.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tracing::{info, warn};

use super::{stage_item, ActiveFlag, EngineEvent, EngineShared};

/// Staged items are flushed in one transaction per this many ids.
const FLUSH_BATCH: usize = 1000;

pub(crate) async fn run(shared: Arc<EngineShared>) {
    let _active = ActiveFlag(&shared.enumerator_active);
    let data_set = shared.config.id;

    let (Some(first), Some(last)) = (shared.config.first_id, shared.config.last_id) else {
        let message = format!(
            "no enumeration range configured for {}; enumerator idle",
            shared.config.name
        );
        warn!("{message}");
        let _ = shared.events.send(EngineEvent::Error(message)).await;
        return;
    };

    let checkpoint = match shared.store.get_enumerator(data_set) {
        Ok(checkpoint) => checkpoint,
        Err(e) => {
            shared.report_store_error("reading enumerator checkpoint", &e).await;
            return;
        }
    };
    let start = checkpoint.max(first);
    shared.enumerator_current.store(start, Ordering::Relaxed);
    info!(
        "enumerator walking {}..={} from {}",
        shared.config.format_key(first),
        shared.config.format_key(last),
        shared.config.format_key(start)
    );

    let mut batch = Vec::with_capacity(FLUSH_BATCH);
    let mut current = start;

    for id in start..=last {
        shared.wait_while_paused().await;
        if shared.stop_requested() {
            break;
        }

        let key = shared.config.format_key(id);
        match shared.store.exists(&key, data_set) {
            Ok(true) => {}
            Ok(false) => batch.push(stage_item(&shared, &key)),
            Err(e) => {
                shared.report_store_error("checking key existence", &e).await;
            }
        }

        current = id;
        shared.enumerator_current.store(id, Ordering::Relaxed);

        if batch.len() >= FLUSH_BATCH {
            if flush(&shared, &mut batch, id).await.is_err() {
                return;
            }
        }
    }

    // Final partial batch, then advance the checkpoint to the last id
    // actually processed.
    if !batch.is_empty() && flush(&shared, &mut batch, current).await.is_err() {
        return;
    }
    if let Err(e) = shared.store.set_enumerator(data_set, current) {
        shared.report_store_error("persisting enumerator checkpoint", &e).await;
    }

    info!("enumerator finished at {}", shared.config.format_key(current));
}

async fn flush(
    shared: &Arc<EngineShared>,
    batch: &mut Vec<crate::models::WorkItem>,
    checkpoint_id: u64,
) -> Result<(), ()> {
    if let Err(e) = shared.store.add_items_batch(batch) {
        shared.report_store_error("flushing enumerated keys", &e).await;
        return Err(());
    }
    batch.clear();
    if let Err(e) = shared.store.set_enumerator(shared.config.id, checkpoint_id) {
        shared.report_store_error("persisting enumerator checkpoint", &e).await;
    }
    Ok(())
}

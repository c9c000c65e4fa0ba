use std::sync::Weak;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::engine::Engine;
use crate::observability::WAL_COMPACTIONS_TOTAL;
use crate::store::{MemoryStore, Store, StoreError, WeakMemoryStore};

/// Compact the WAL once more than `threshold` commits were appended since
/// the last rewrite. Returns whether it compacted.
pub async fn compact_if_needed(store: &MemoryStore, threshold: u64) -> Result<bool, StoreError> {
    let appended = store.appends_since_compact().await?;
    if appended <= threshold {
        return Ok(false);
    }
    debug!("{appended} appends since last compaction, compacting");
    match store.compact().await {
        Ok(()) => {
            metrics::counter!(WAL_COMPACTIONS_TOTAL, "status" => "ok").increment(1);
            Ok(true)
        }
        Err(e) => {
            metrics::counter!(WAL_COMPACTIONS_TOTAL, "status" => "error").increment(1);
            Err(e)
        }
    }
}

/// Background task checking the WAL size every `every`. Holds the store
/// only while checking, and stops once every other handle to it is gone, so
/// a dropped store never rewrites a log someone else reopened.
pub async fn run_compactor(store: WeakMemoryStore, threshold: u64, every: Duration) {
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        let Some(store) = store.upgrade() else { break };
        if !store.is_durable() {
            break;
        }
        match compact_if_needed(&store, threshold).await {
            Ok(_) => {}
            Err(StoreError::Closed) => break,
            Err(e) => warn!("WAL compaction failed: {e}"),
        }
    }
    debug!("compactor stopped");
}

/// Background task re-queueing every active template so materialized
/// sessions keep reaching `horizon` weeks ahead. Stops with the engine.
pub async fn run_horizon_keeper<S: Store>(engine: Weak<Engine<S>>, every: Duration) {
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        let Some(engine) = engine.upgrade() else { break };
        match engine.refresh_horizon().await {
            Ok(0) => {}
            Ok(queued) => info!("horizon refresh: {queued} templates queued"),
            Err(e) => warn!("horizon refresh failed: {e}"),
        }
    }
    debug!("horizon keeper stopped");
}

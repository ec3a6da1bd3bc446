use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::engine::Engine;
use crate::model::Ms;
use crate::observability;

/// Release every hold that expired at or before `now`. Returns how many were released.
pub async fn reap_expired_holds(engine: &Engine, now: Ms) -> usize {
    let mut reaped = 0;
    for slot_id in engine.collect_expired_holds(now) {
        match engine.expire_hold(slot_id, now).await {
            Ok(_) => {
                reaped += 1;
                info!(%slot_id, "reaped expired hold");
            }
            // Confirmed, re-held or released since it was collected.
            Err(e) => debug!(%slot_id, "reaper skip: {e}"),
        }
    }
    if reaped > 0 {
        metrics::counter!(observability::HOLDS_REAPED_TOTAL).increment(reaped as u64);
    }
    reaped
}

/// Background task that periodically cleans up expired holds.
pub async fn run_reaper(engine: Arc<Engine>, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        reap_expired_holds(&engine, crate::engine::now_ms()).await;
    }
}

/// Background task that compacts the WAL once `threshold` appends have piled up.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        let appends = engine.wal_appends_since_compact().await;
        if appends < threshold {
            continue;
        }
        if let Err(e) = engine.compact_wal().await {
            warn!(appends, "WAL compaction failed: {e}");
        }
    }
}

use std::net::SocketAddr;
use std::time::Instant;

use crate::engine::EngineError;

// ── RED metrics (operation-driven) ──────────────────────────────

/// Counter: slot operations. Labels: op, status.
pub const SLOT_OPS_TOTAL: &str = "slotq_slot_ops_total";

/// Counter: queue operations. Labels: op, status.
pub const QUEUE_OPS_TOTAL: &str = "slotq_queue_ops_total";

/// Histogram: operation latency in seconds. Labels: op.
pub const OP_DURATION_SECONDS: &str = "slotq_op_duration_seconds";

/// Counter: slots created by generation.
pub const SLOTS_GENERATED_TOTAL: &str = "slotq_slots_generated_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: WAITING plus IN_PROGRESS entries across all queues.
pub const QUEUE_ACTIVE_ENTRIES: &str = "slotq_queue_active_entries";

/// Counter: expired holds released by the reaper.
pub const HOLDS_REAPED_TOTAL: &str = "slotq_holds_reaped_total";

/// Counter: queue changes handed to the outbound sink.
pub const NOTIFICATIONS_DELIVERED_TOTAL: &str = "slotq_notifications_delivered_total";

/// Counter: queue changes the outbound sink rejected.
pub const NOTIFICATIONS_FAILED_TOTAL: &str = "slotq_notifications_failed_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "slotq_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "slotq_wal_flush_batch_size";

/// Counter: completed WAL compactions.
pub const WAL_COMPACTIONS_TOTAL: &str = "slotq_wal_compactions_total";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), metrics_exporter_prometheus::BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Count one finished operation under `counter` and record its latency.
pub fn record_op<T>(
    counter: &'static str,
    op: &'static str,
    started: Instant,
    result: &Result<T, EngineError>,
) {
    let status = match result {
        Ok(_) => "ok",
        Err(e) => e.kind(),
    };
    metrics::counter!(counter, "op" => op, "status" => status).increment(1);
    metrics::histogram!(OP_DURATION_SECONDS, "op" => op).record(started.elapsed().as_secs_f64());
}

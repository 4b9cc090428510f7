use std::net::SocketAddr;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: allocation attempts. Labels: kind, outcome (booked, no_match, race, error).
pub const ALLOCATIONS_TOTAL: &str = "parkalloc_allocations_total";

/// Histogram: allocation latency in seconds, search through index sync.
pub const ALLOCATION_DURATION_SECONDS: &str = "parkalloc_allocation_duration_seconds";

/// Counter: booking cancellations. Labels: status.
pub const CANCELLATIONS_TOTAL: &str = "parkalloc_cancellations_total";

/// Counter: bookings moved to Completed by the sweeper.
pub const BOOKINGS_COMPLETED_TOTAL: &str = "parkalloc_bookings_completed_total";

/// Histogram: candidates scored per private-spot search.
pub const SEARCH_CANDIDATES: &str = "parkalloc_search_candidates";

// ── Batch ───────────────────────────────────────────────────────

/// Counter: batch runs. Labels: status.
pub const BATCH_RUNS_TOTAL: &str = "parkalloc_batch_runs_total";

/// Counter: batch request outcomes. Labels: outcome (confirmed, waitlisted, failed).
pub const BATCH_REQUESTS_TOTAL: &str = "parkalloc_batch_requests_total";

/// Histogram: batch run duration in seconds.
pub const BATCH_DURATION_SECONDS: &str = "parkalloc_batch_duration_seconds";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: windows currently held by the availability index.
pub const INDEX_WINDOWS: &str = "parkalloc_index_windows";

/// Counter: index loads. Labels: status.
pub const INDEX_LOADS_TOTAL: &str = "parkalloc_index_loads_total";

/// Counter: index entries found missing after a persisted removal.
pub const INDEX_INCONSISTENCIES_TOTAL: &str = "parkalloc_index_inconsistencies_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "parkalloc_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (records per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "parkalloc_wal_flush_batch_size";

/// Counter: WAL compactions. Labels: status.
pub const WAL_COMPACTIONS_TOTAL: &str = "parkalloc_wal_compactions_total";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), Box<dyn std::error::Error>> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

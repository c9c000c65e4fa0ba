use std::net::SocketAddr;

use tracing_subscriber::EnvFilter;

use crate::engine::EngineError;

// ── Operations ──────────────────────────────────────────────────

/// Counter: engine operations. Labels: op, outcome.
pub const OPERATIONS_TOTAL: &str = "slotguard_operations_total";

/// Histogram: commit latency in seconds, WAL fsync included. Labels: op.
pub const COMMIT_DURATION_SECONDS: &str = "slotguard_commit_duration_seconds";

/// Counter: commits aborted because a concurrent commit won. Labels: op.
pub const SERIALIZATION_FAILURES_TOTAL: &str = "slotguard_serialization_failures_total";

/// Counter: retries performed by `retry_serializable`.
pub const RETRIES_TOTAL: &str = "slotguard_retries_total";

// ── Ledger ──────────────────────────────────────────────────────

/// Counter: penalty points applied. Labels: kind.
pub const PENALTY_POINTS_APPLIED_TOTAL: &str = "slotguard_penalty_points_applied_total";

/// Counter: penalty points restored by revocation. Labels: kind.
pub const PENALTY_POINTS_REVOKED_TOTAL: &str = "slotguard_penalty_points_revoked_total";

// ── Schedule expansion ──────────────────────────────────────────

/// Counter: session materialization attempts. Labels: outcome (created, existing, failed).
pub const EXPANSION_SESSIONS_TOTAL: &str = "slotguard_expansion_sessions_total";

/// Counter: expansion jobs dropped because the queue was full or closed.
pub const EXPANSION_JOBS_DROPPED_TOTAL: &str = "slotguard_expansion_jobs_dropped_total";

// ── Storage ─────────────────────────────────────────────────────

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "slotguard_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (commits per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "slotguard_wal_flush_batch_size";

/// Counter: WAL compactions. Labels: status.
pub const WAL_COMPACTIONS_TOTAL: &str = "slotguard_wal_compactions_total";

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

/// Install the fmt subscriber, filtered by `RUST_LOG` (default `info`).
/// Returns false when a global subscriber was already set.
pub fn init_tracing() -> bool {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).try_init().is_ok()
}

/// Short label for an operation result.
pub fn outcome_label<T>(result: &Result<T, EngineError>) -> &'static str {
    match result {
        Ok(_) => "ok",
        Err(EngineError::Validation(_)) => "validation",
        Err(EngineError::Conflict(_)) => "conflict",
        Err(EngineError::CapacityExceeded { .. }) => "capacity_exceeded",
        Err(EngineError::QuotaExceeded { .. }) => "quota_exceeded",
        Err(EngineError::SerializationRetry) => "serialization_retry",
        Err(EngineError::NotFound(_)) => "not_found",
        Err(EngineError::AlreadyExists(_)) => "already_exists",
        Err(EngineError::Storage(_)) => "storage",
    }
}

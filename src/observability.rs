use std::net::SocketAddr;

use crate::engine::{EngineError, ErrorKind};

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: engine operations. Labels: operation, outcome.
pub const OPERATIONS_TOTAL: &str = "slotbook_operations_total";

/// Histogram: operation latency in seconds. Labels: operation.
pub const OPERATION_DURATION_SECONDS: &str = "slotbook_operation_duration_seconds";

/// Counter: slots written by publications.
pub const SLOTS_INSERTED_TOTAL: &str = "slotbook_slots_inserted_total";

/// Counter: publication candidates skipped as exact duplicates.
pub const SLOTS_SKIPPED_TOTAL: &str = "slotbook_slots_skipped_total";

/// Counter: notifications handed to the notifier. Labels: status.
pub const NOTIFICATIONS_TOTAL: &str = "slotbook_notifications_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: providers with state loaded in the engine.
pub const PROVIDERS_ACTIVE: &str = "slotbook_providers_active";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "slotbook_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "slotbook_wal_flush_batch_size";

/// Counter: WAL compactions performed.
pub const WAL_COMPACTIONS_TOTAL: &str = "slotbook_wal_compactions_total";

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

/// Map an operation result to a short outcome label.
pub fn outcome_label<T>(result: &Result<T, EngineError>) -> &'static str {
    match result {
        Ok(_) => "ok",
        Err(e) => match e.kind() {
            ErrorKind::Validation => "validation",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Forbidden => "forbidden",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Unavailable => "unavailable",
            ErrorKind::InvalidTransition => "invalid_transition",
            ErrorKind::Internal => "internal",
        },
    }
}

/// Record count and latency for one engine operation.
pub fn record<T>(operation: &'static str, started: std::time::Instant, result: &Result<T, EngineError>) {
    metrics::counter!(OPERATIONS_TOTAL, "operation" => operation, "outcome" => outcome_label(result))
        .increment(1);
    metrics::histogram!(OPERATION_DURATION_SECONDS, "operation" => operation)
        .record(started.elapsed().as_secs_f64());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcome_labels() {
        let ok: Result<(), EngineError> = Ok(());
        assert_eq!(outcome_label(&ok), "ok");
        let conflict: Result<(), EngineError> = Err(EngineError::Conflict("taken".into()));
        assert_eq!(outcome_label(&conflict), "conflict");
        let limit: Result<(), EngineError> = Err(EngineError::LimitExceeded("batch too large"));
        assert_eq!(outcome_label(&limit), "validation");
    }
}

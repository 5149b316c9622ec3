use std::net::SocketAddr;
use std::time::Instant;

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

use crate::engine::EngineError;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: state-machine operations. Labels: op, outcome.
pub const TRANSITIONS_TOTAL: &str = "evrent_transitions_total";

/// Histogram: operation latency in seconds, lock wait and fsync included. Labels: op.
pub const TRANSITION_DURATION_SECONDS: &str = "evrent_transition_duration_seconds";

// ── Background work ─────────────────────────────────────────────

/// Counter: reservations moved by the sweeper. Labels: rule.
pub const SWEEPER_ACTIONS_TOTAL: &str = "evrent_sweeper_actions_total";

/// Counter: station slots that could not be handed back after a cancel or reject.
pub const STATION_RELEASE_FAILURES_TOTAL: &str = "evrent_station_release_failures_total";

/// Counter: WAL compactions. Labels: status.
pub const WAL_COMPACTIONS_TOTAL: &str = "evrent_wal_compactions_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "evrent_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "evrent_wal_flush_batch_size";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// `"ok"` or the error's kind.
pub fn outcome_label<T>(result: &Result<T, EngineError>) -> &'static str {
    match result {
        Ok(_) => "ok",
        Err(e) => e.kind(),
    }
}

/// Count and time one state-machine operation.
pub fn record_transition<T>(op: &'static str, result: &Result<T, EngineError>, started: Instant) {
    if let Err(e) = result {
        tracing::debug!("{op} refused: {e}");
    }
    metrics::counter!(TRANSITIONS_TOTAL, "op" => op, "outcome" => outcome_label(result)).increment(1);
    metrics::histogram!(TRANSITION_DURATION_SECONDS, "op" => op).record(started.elapsed().as_secs_f64());
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    #[test]
    fn outcome_labels() {
        assert_eq!(outcome_label(&Ok::<(), EngineError>(())), "ok");
        let err: Result<(), EngineError> = Err(EngineError::NotFound(Ulid::new()));
        assert_eq!(outcome_label(&err), EngineError::NotFound(Ulid::nil()).kind());
    }

    #[test]
    fn recording_without_exporter_is_harmless() {
        record_transition("confirm", &Ok::<(), EngineError>(()), Instant::now());
    }
}

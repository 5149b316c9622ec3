use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::engine::Engine;
use crate::model::CancellationReason;

const PAYMENT_TIMEOUT_REASON: &str = "payment timeout";

/// What one sweep changed.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub rejected: usize,
    pub no_shows: usize,
    pub archived: usize,
    /// Candidates that moved on before the sweeper got to them.
    pub skipped: usize,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.rejected + self.no_shows + self.archived + self.skipped == 0
    }
}

fn record(rule: &'static str, count: usize) {
    if count > 0 {
        metrics::counter!(crate::observability::SWEEPER_ACTIONS_TOTAL, "rule" => rule).increment(count as u64);
    }
}

/// One pass over all vehicles. Each candidate goes through the regular
/// transition, which re-checks its status under the vehicle lock, so a
/// reservation paid or picked up since it was collected is left alone.
pub async fn sweep_once(engine: &Engine) -> SweepReport {
    let now = engine.now();
    let mut report = SweepReport::default();

    for id in engine.collect_expired_pending(now) {
        match engine.reject(id, PAYMENT_TIMEOUT_REASON.to_string()).await {
            Ok(_) => {
                info!("rejected unpaid reservation {id}");
                report.rejected += 1;
            }
            Err(e) => {
                warn!("sweeper skip {id}: {e}");
                report.skipped += 1;
            }
        }
    }

    for id in engine.collect_no_shows(now) {
        match engine.cancel(id, CancellationReason::NoShow).await {
            Ok(_) => {
                info!("cancelled no-show reservation {id}");
                report.no_shows += 1;
            }
            Err(e) => {
                warn!("sweeper skip {id}: {e}");
                report.skipped += 1;
            }
        }
    }

    for id in engine.collect_archivable(now) {
        match engine.archive(id).await {
            Ok(_) => report.archived += 1,
            Err(e) => {
                warn!("sweeper skip {id}: {e}");
                report.skipped += 1;
            }
        }
    }

    record("payment_timeout", report.rejected);
    record("no_show", report.no_shows);
    record("archive", report.archived);
    report
}

/// Background task that periodically expires stale reservations.
pub async fn run_sweeper(engine: Arc<Engine>, period: Duration) {
    let mut interval = tokio::time::interval(period);
    loop {
        interval.tick().await;
        let report = sweep_once(&engine).await;
        if !report.is_empty() {
            info!(
                "sweep: {} rejected, {} no-shows, {} archived, {} skipped",
                report.rejected, report.no_shows, report.archived, report.skipped
            );
        }
        let pruned = engine.notify.prune();
        if pruned > 0 {
            debug!("dropped {pruned} idle change feeds");
        }
    }
}

/// Background task that compacts the WAL once enough appends piled up.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64, period: Duration) {
    let mut interval = tokio::time::interval(period);
    loop {
        interval.tick().await;
        if engine.wal_appends_since_compact().await < threshold {
            continue;
        }
        match engine.compact_wal().await {
            Ok(()) => {
                metrics::counter!(crate::observability::WAL_COMPACTIONS_TOTAL, "status" => "ok").increment(1);
            }
            Err(e) => {
                metrics::counter!(crate::observability::WAL_COMPACTIONS_TOTAL, "status" => "error").increment(1);
                error!("WAL compaction failed: {e}");
            }
        }
    }
}

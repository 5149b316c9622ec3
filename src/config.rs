use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tracing::warn;

use crate::fees::{LateFeePolicy, PenaltySchedule, PenaltyStep, StepSchedule};
use crate::model::{DAY, HOUR, MINUTE, Ms};

/// Business thresholds consulted by transitions and the sweeper.
#[derive(Debug, Clone)]
pub struct Policy {
    /// Share of the rental total collected up front.
    pub deposit_fraction: Decimal,
    pub late_fee: LateFeePolicy,
    pub cancellation: Arc<dyn PenaltySchedule>,
    /// Share of the deposit forfeited on a no-show.
    pub no_show_penalty_fraction: Decimal,
    /// Pending reservations without a deposit are rejected after this long.
    pub pending_payment_timeout: Ms,
    pub no_show_grace: Ms,
    /// Earliest check-in, relative to pickup.
    pub checkin_early: Ms,
    /// Latest check-in, relative to pickup.
    pub checkin_late: Ms,
    /// Terminal reservations are archived once untouched for this long.
    pub retention: Ms,
    pub collaborator_timeout: Duration,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            deposit_fraction: dec!(0.30),
            late_fee: LateFeePolicy {
                per_hour: dec!(50),
                cap: None,
            },
            cancellation: Arc::new(StepSchedule::default()),
            no_show_penalty_fraction: Decimal::ONE,
            pending_payment_timeout: 30 * MINUTE,
            no_show_grace: HOUR,
            checkin_early: HOUR,
            checkin_late: HOUR,
            retention: 30 * DAY,
            collaborator_timeout: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub data_dir: PathBuf,
    pub sweep_interval: Duration,
    pub compact_interval: Duration,
    /// Compact the WAL once this many appends accumulated.
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    pub policy: Policy,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            sweep_interval: Duration::from_secs(60),
            compact_interval: Duration::from_secs(60),
            compact_threshold: 1000,
            metrics_port: None,
            policy: Policy::default(),
        }
    }
}

impl Config {
    /// Read `EVRENT_*` environment variables over the defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let d = Config::default();
        let p = d.policy;

        let late_fee_cap = non_negative(&lookup, "EVRENT_LATE_FEE_CAP");
        let cancellation: Arc<dyn PenaltySchedule> = match lookup("EVRENT_CANCEL_PENALTY_STEPS") {
            Some(raw) => {
                let otherwise = non_negative(&lookup, "EVRENT_CANCEL_PENALTY_OTHERWISE").unwrap_or(Decimal::ONE);
                match parse_penalty_steps(&raw).and_then(|steps| StepSchedule::new(steps, otherwise).ok()) {
                    Some(schedule) => Arc::new(schedule),
                    None => {
                        warn!("ignoring invalid EVRENT_CANCEL_PENALTY_STEPS={raw:?}, using default schedule");
                        p.cancellation
                    }
                }
            }
            None => p.cancellation,
        };
        let no_show_grace = duration(&lookup, "EVRENT_NO_SHOW_GRACE_MINUTES", MINUTE, p.no_show_grace);

        Self {
            data_dir: lookup("EVRENT_DATA_DIR").map(PathBuf::from).unwrap_or(d.data_dir),
            sweep_interval: period(&lookup, "EVRENT_SWEEP_INTERVAL_SECS", d.sweep_interval),
            compact_interval: period(&lookup, "EVRENT_COMPACT_INTERVAL_SECS", d.compact_interval),
            compact_threshold: var(&lookup, "EVRENT_COMPACT_THRESHOLD", d.compact_threshold),
            metrics_port: lookup("EVRENT_METRICS_PORT").and_then(|raw| parse_or_warn("EVRENT_METRICS_PORT", &raw)),
            policy: Policy {
                deposit_fraction: non_negative(&lookup, "EVRENT_DEPOSIT_FRACTION").unwrap_or(p.deposit_fraction),
                late_fee: LateFeePolicy {
                    per_hour: non_negative(&lookup, "EVRENT_LATE_FEE_PER_HOUR").unwrap_or(p.late_fee.per_hour),
                    cap: late_fee_cap,
                },
                cancellation,
                no_show_penalty_fraction: non_negative(&lookup, "EVRENT_NO_SHOW_PENALTY_FRACTION")
                    .unwrap_or(p.no_show_penalty_fraction),
                pending_payment_timeout: duration(
                    &lookup,
                    "EVRENT_PENDING_TIMEOUT_MINUTES",
                    MINUTE,
                    p.pending_payment_timeout,
                ),
                no_show_grace,
                checkin_early: duration(&lookup, "EVRENT_CHECKIN_EARLY_MINUTES", MINUTE, p.checkin_early),
                checkin_late: duration(&lookup, "EVRENT_CHECKIN_LATE_MINUTES", MINUTE, no_show_grace),
                retention: duration(&lookup, "EVRENT_RETENTION_DAYS", DAY, p.retention),
                collaborator_timeout: Duration::from_millis(var(
                    &lookup,
                    "EVRENT_COLLABORATOR_TIMEOUT_MS",
                    p.collaborator_timeout.as_millis() as u64,
                )),
            },
        }
    }
}

fn parse_or_warn<T: FromStr>(key: &str, raw: &str) -> Option<T> {
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!("ignoring unparsable {key}={raw:?}");
            None
        }
    }
}

fn var<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    lookup(key)
        .and_then(|raw| parse_or_warn(key, &raw))
        .unwrap_or(default)
}

/// Amounts and fractions. Negative values are ignored.
fn non_negative(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<Decimal> {
    let raw = lookup(key)?;
    let value: Decimal = parse_or_warn(key, &raw)?;
    if value.is_sign_negative() {
        warn!("ignoring negative {key}={raw:?}");
        return None;
    }
    Some(value)
}

/// Whole `unit`s (minutes, days) as milliseconds.
fn duration(lookup: &impl Fn(&str) -> Option<String>, key: &str, unit: Ms, default: Ms) -> Ms {
    let Some(raw) = lookup(key) else {
        return default;
    };
    let Some(count) = parse_or_warn::<Ms>(key, &raw) else {
        return default;
    };
    match count.checked_mul(unit) {
        Some(ms) if count >= 0 => ms,
        _ => {
            warn!("ignoring out-of-range {key}={raw:?}");
            default
        }
    }
}

/// Loop periods in seconds; zero is ignored.
fn period(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: Duration) -> Duration {
    match lookup(key).and_then(|raw| parse_or_warn::<u64>(key, &raw)) {
        Some(0) => {
            warn!("ignoring zero {key}");
            default
        }
        Some(secs) => Duration::from_secs(secs),
        None => default,
    }
}

/// `"48:0,24:0.25,2:0.5"`: hours before pickup and penalty fraction per step.
fn parse_penalty_steps(raw: &str) -> Option<Vec<PenaltyStep>> {
    raw.split(',')
        .filter(|s| !s.trim().is_empty())
        .map(|step| {
            let (hours, fraction) = step.split_once(':')?;
            Some(PenaltyStep {
                min_lead: hours.trim().parse::<Ms>().ok()? * HOUR,
                fraction: fraction.trim().parse().ok()?,
            })
        })
        .collect()
}

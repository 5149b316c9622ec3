//! Pricing, fee and refund arithmetic. Everything here is a pure function of
//! its inputs; amounts are rounded to cents before they are returned.

use std::fmt::Debug;

use rust_decimal::{Decimal, RoundingStrategy};

use crate::engine::EngineError;
use crate::model::{DAY, HOUR, Ms, Span};

pub fn round_cents(amount: Decimal) -> Decimal {
    amount.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

fn ceil_div(n: Ms, d: Ms) -> Ms {
    (n + d - 1) / d
}

/// Rental charge for a window: whole days at the daily rate once the rental
/// reaches 24h, otherwise whole hours at the hourly rate.
pub fn estimate_rental(span: &Span, hourly_rate: Decimal, daily_rate: Decimal) -> Result<Decimal, EngineError> {
    if hourly_rate.is_sign_negative() || daily_rate.is_sign_negative() {
        return Err(EngineError::Validation("rates must not be negative"));
    }
    if hourly_rate.is_zero() && daily_rate.is_zero() {
        return Err(EngineError::Validation("at least one rate must be positive"));
    }
    let duration = span.duration_ms();
    if duration <= 0 {
        return Err(EngineError::Validation("return must be after pickup"));
    }
    let amount = if duration >= DAY {
        Decimal::from(ceil_div(duration, DAY)) * daily_rate
    } else {
        Decimal::from(ceil_div(duration, HOUR)) * hourly_rate
    };
    Ok(round_cents(amount))
}

/// A fraction above 1 models a security deposit larger than the rental itself.
pub fn deposit_for(total: Decimal, fraction: Decimal) -> Decimal {
    round_cents(total * fraction.max(Decimal::ZERO))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LateFeePolicy {
    pub per_hour: Decimal,
    pub cap: Option<Decimal>,
}

/// `max(0, actual - expected)` in fractional hours times the hourly late rate.
pub fn late_fee(expected_return: Ms, actual_return: Ms, policy: &LateFeePolicy) -> Decimal {
    let late_ms = (actual_return - expected_return).max(0);
    if late_ms == 0 {
        return Decimal::ZERO;
    }
    let per_hour = policy.per_hour.max(Decimal::ZERO);
    let fee = round_cents(Decimal::from(late_ms) * per_hour / Decimal::from(HOUR));
    match policy.cap {
        Some(cap) => fee.min(cap.max(Decimal::ZERO)),
        None => fee,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckoutCharges {
    pub late_fee: Decimal,
    pub damage_fee: Decimal,
    /// `total + late + damage`
    pub actual_amount: Decimal,
    /// Still to collect after the deposit is applied.
    pub amount_due: Decimal,
    /// Deposit left over after charges, owed back to the customer.
    pub refund_due: Decimal,
}

pub fn checkout_charges(
    total_amount: Decimal,
    deposit_amount: Decimal,
    expected_return: Ms,
    actual_return: Ms,
    damage_fee: Decimal,
    policy: &LateFeePolicy,
) -> Result<CheckoutCharges, EngineError> {
    if damage_fee < Decimal::ZERO {
        return Err(EngineError::Validation("damage fee must not be negative"));
    }
    let damage_fee = round_cents(damage_fee);
    let late_fee = late_fee(expected_return, actual_return, policy);
    let actual_amount = total_amount + late_fee + damage_fee;
    let balance = actual_amount - deposit_amount;
    Ok(CheckoutCharges {
        late_fee,
        damage_fee,
        actual_amount,
        amount_due: balance.max(Decimal::ZERO),
        refund_due: (-balance).max(Decimal::ZERO),
    })
}

/// Share of the deposit forfeited when cancelling `lead` ms before pickup
/// (negative once pickup has passed).
pub trait PenaltySchedule: Debug + Send + Sync {
    fn penalty_fraction(&self, lead: Ms) -> Decimal;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PenaltyStep {
    /// Applies when the cancellation happens at least this long before pickup.
    pub min_lead: Ms,
    pub fraction: Decimal,
}

/// Monotone step function: the closer to pickup, the larger the penalty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepSchedule {
    steps: Vec<PenaltyStep>,
    otherwise: Decimal,
}

impl StepSchedule {
    pub fn new(mut steps: Vec<PenaltyStep>, otherwise: Decimal) -> Result<Self, EngineError> {
        let in_range = |f: &Decimal| *f >= Decimal::ZERO && *f <= Decimal::ONE;
        if !steps.iter().all(|s| in_range(&s.fraction)) || !in_range(&otherwise) {
            return Err(EngineError::Validation("penalty fraction must be within [0, 1]"));
        }
        steps.sort_by(|a, b| b.min_lead.cmp(&a.min_lead));
        let fractions: Vec<Decimal> = steps
            .iter()
            .map(|s| s.fraction)
            .chain(std::iter::once(otherwise))
            .collect();
        if fractions.windows(2).any(|w| w[1] < w[0]) {
            return Err(EngineError::Validation(
                "penalty must not decrease closer to pickup",
            ));
        }
        Ok(Self { steps, otherwise })
    }

    pub fn steps(&self) -> &[PenaltyStep] {
        &self.steps
    }
}

impl Default for StepSchedule {
    /// Full refund when cancelled at least 24h ahead, deposit forfeited otherwise.
    fn default() -> Self {
        Self {
            steps: vec![PenaltyStep {
                min_lead: 24 * HOUR,
                fraction: Decimal::ZERO,
            }],
            otherwise: Decimal::ONE,
        }
    }
}

impl PenaltySchedule for StepSchedule {
    fn penalty_fraction(&self, lead: Ms) -> Decimal {
        self.steps
            .iter()
            .find(|s| lead >= s.min_lead)
            .map(|s| s.fraction)
            .unwrap_or(self.otherwise)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CancellationSettlement {
    pub penalty: Decimal,
    pub refund: Decimal,
}

/// Penalty is capped at the deposit, so the refund is never negative.
pub fn cancellation_settlement(deposit: Decimal, penalty_fraction: Decimal) -> CancellationSettlement {
    let deposit = deposit.max(Decimal::ZERO);
    let fraction = penalty_fraction.clamp(Decimal::ZERO, Decimal::ONE);
    let penalty = round_cents(deposit * fraction).min(deposit);
    CancellationSettlement {
        penalty,
        refund: deposit - penalty,
    }
}

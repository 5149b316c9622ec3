use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds, the only time type.
pub type Ms = i64;

pub const MINUTE: Ms = 60_000;
pub const HOUR: Ms = 60 * MINUTE;
pub const DAY: Ms = 24 * HOUR;

pub type ReservationId = Ulid;
pub type CustomerId = Ulid;
/// A rentable vehicle.
pub type ResourceId = Ulid;
pub type StationId = Ulid;

pub fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or(0)
}

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }
}

/// Stored lifecycle status.
///
/// ```text
/// Pending ─► Confirmed ─► ContractApproved ─► CheckedIn ─► CheckedOutPendingPayment ─► Completed
///    │           │               │
///    │           └───────────────┴─► CancelledPendingRefund ─► Cancelled
///    ├─► Cancelled
///    └─► Rejected
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReservationStatus {
    Pending,
    Confirmed,
    ContractApproved,
    CheckedIn,
    CheckedOutPendingPayment,
    Completed,
    CancelledPendingRefund,
    Cancelled,
    Rejected,
}

impl ReservationStatus {
    /// Whether a reservation in this status holds the vehicle for its window.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            ReservationStatus::Pending
                | ReservationStatus::Confirmed
                | ReservationStatus::ContractApproved
                | ReservationStatus::CheckedIn
                | ReservationStatus::CheckedOutPendingPayment
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ReservationStatus::Completed | ReservationStatus::Cancelled | ReservationStatus::Rejected
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ReservationStatus::Pending => "pending",
            ReservationStatus::Confirmed => "confirmed",
            ReservationStatus::ContractApproved => "contract_approved",
            ReservationStatus::CheckedIn => "checked_in",
            ReservationStatus::CheckedOutPendingPayment => "checked_out_pending_payment",
            ReservationStatus::Completed => "completed",
            ReservationStatus::CancelledPendingRefund => "cancelled_pending_refund",
            ReservationStatus::Cancelled => "cancelled",
            ReservationStatus::Rejected => "rejected",
        }
    }
}

impl std::fmt::Display for ReservationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status as observers see it. `InProgress` is never stored: it is a
/// `CheckedIn` reservation whose pickup time has passed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EffectiveStatus {
    InProgress,
    Stored(ReservationStatus),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PaymentMethod {
    Cash,
    Card,
    BankTransfer,
    EWallet,
}

impl PaymentMethod {
    /// Electronic payments are only accepted with a gateway transaction id.
    pub fn requires_transaction_id(&self) -> bool {
        !matches!(self, PaymentMethod::Cash)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentMethod::Cash => "cash",
            PaymentMethod::Card => "card",
            PaymentMethod::BankTransfer => "bank_transfer",
            PaymentMethod::EWallet => "e_wallet",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentRef {
    pub method: PaymentMethod,
    pub transaction_id: Option<String>,
    pub paid_at: Ms,
}

impl PaymentRef {
    /// Same payment reported again (webhook redelivery).
    pub fn is_same(&self, method: PaymentMethod, transaction_id: Option<&str>) -> bool {
        self.method == method && self.transaction_id.as_deref() == transaction_id
    }
}

/// Staff notes captured at vehicle hand-over or return.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Inspection {
    pub at: Ms,
    pub notes: Option<String>,
    pub photo_ref: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancellationReason {
    /// Customer or staff request; the penalty schedule applies.
    Requested(String),
    /// Pickup missed by more than the grace period.
    NoShow,
    /// Vehicle or station incident; penalty waived.
    Incident(String),
}

impl std::fmt::Display for CancellationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CancellationReason::Requested(r) => f.write_str(r),
            CancellationReason::NoShow => f.write_str("no-show"),
            CancellationReason::Incident(r) => write!(f, "incident: {r}"),
        }
    }
}

/// The reservation aggregate. Only mutated by applying an [`Event`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: ReservationId,
    pub customer_id: CustomerId,
    pub resource_id: ResourceId,
    pub origin_station: StationId,
    pub destination_station: StationId,
    /// `[pickup, expected_return)`
    pub span: Span,
    pub actual_return: Option<Ms>,

    pub hourly_rate: Decimal,
    pub daily_rate: Decimal,
    pub deposit_amount: Decimal,
    pub total_amount: Decimal,
    pub actual_amount: Option<Decimal>,
    pub late_fee: Decimal,
    pub damage_fee: Decimal,
    /// Owed back to the customer once known (cancellation or checkout).
    pub refund_due: Decimal,
    pub refund_issued: bool,

    pub deposit_payment: Option<PaymentRef>,
    pub settlement_payment: Option<PaymentRef>,

    pub contract_approved: bool,
    pub contract_approved_at: Option<Ms>,

    pub check_in: Option<Inspection>,
    pub check_out: Option<Inspection>,

    pub status: ReservationStatus,
    pub created_at: Ms,
    pub updated_at: Ms,
    pub cancellation_reason: Option<String>,
    pub cancelled_at: Option<Ms>,
    pub deleted: bool,
}

impl Reservation {
    pub fn pickup(&self) -> Ms {
        self.span.start
    }

    pub fn expected_return(&self) -> Ms {
        self.span.end
    }

    pub fn deposit_paid(&self) -> bool {
        self.deposit_payment.is_some()
    }

    /// Amount still to collect at settlement; zero when the deposit covers it.
    pub fn amount_due(&self) -> Decimal {
        match self.actual_amount {
            Some(actual) => (actual - self.deposit_amount).max(Decimal::ZERO),
            None => Decimal::ZERO,
        }
    }

    pub fn effective_status(&self, now: Ms) -> EffectiveStatus {
        if self.status == ReservationStatus::CheckedIn && now >= self.pickup() {
            EffectiveStatus::InProgress
        } else {
            EffectiveStatus::Stored(self.status)
        }
    }
}

/// All reservations ever made for one vehicle, sorted by pickup time.
#[derive(Debug, Clone)]
pub struct ResourceBook {
    pub id: ResourceId,
    pub reservations: Vec<Reservation>,
}

impl ResourceBook {
    pub fn new(id: ResourceId) -> Self {
        Self {
            id,
            reservations: Vec::new(),
        }
    }

    /// Insert maintaining sort order by pickup. Replaces a record with the same id.
    pub fn insert(&mut self, reservation: Reservation) {
        if let Some(pos) = self.position(&reservation.id) {
            self.reservations.remove(pos);
        }
        let pos = self
            .reservations
            .partition_point(|r| r.span.start <= reservation.span.start);
        self.reservations.insert(pos, reservation);
    }

    fn position(&self, id: &ReservationId) -> Option<usize> {
        self.reservations.iter().position(|r| r.id == *id)
    }

    pub fn get(&self, id: &ReservationId) -> Option<&Reservation> {
        self.reservations.iter().find(|r| r.id == *id)
    }

    pub fn get_mut(&mut self, id: &ReservationId) -> Option<&mut Reservation> {
        self.reservations.iter_mut().find(|r| r.id == *id)
    }

    /// Reservations (any status) whose window overlaps the query.
    /// Binary search skips everything picking up at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Reservation> {
        let right_bound = self
            .reservations
            .partition_point(|r| r.span.start < query.end);
        self.reservations[..right_bound]
            .iter()
            .filter(move |r| r.span.end > query.start)
    }

    pub fn active_overlapping(&self, query: &Span) -> impl Iterator<Item = &Reservation> {
        self.overlapping(query).filter(|r| r.status.is_active())
    }
}

/// WAL record format. One variant per committed transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    ReservationCreated {
        reservation: Box<Reservation>,
    },
    DepositPaid {
        id: ReservationId,
        resource_id: ResourceId,
        payment: PaymentRef,
    },
    ContractApproved {
        id: ReservationId,
        resource_id: ResourceId,
        at: Ms,
    },
    CheckedIn {
        id: ReservationId,
        resource_id: ResourceId,
        inspection: Inspection,
    },
    CheckedOut {
        id: ReservationId,
        resource_id: ResourceId,
        actual_return: Ms,
        late_fee: Decimal,
        damage_fee: Decimal,
        actual_amount: Decimal,
        refund_due: Decimal,
        inspection: Inspection,
    },
    SettlementPaid {
        id: ReservationId,
        resource_id: ResourceId,
        payment: PaymentRef,
    },
    Cancelled {
        id: ReservationId,
        resource_id: ResourceId,
        reason: String,
        refund_due: Decimal,
        at: Ms,
    },
    RefundConfirmed {
        id: ReservationId,
        resource_id: ResourceId,
        at: Ms,
    },
    Rejected {
        id: ReservationId,
        resource_id: ResourceId,
        reason: String,
        at: Ms,
    },
    Archived {
        id: ReservationId,
        resource_id: ResourceId,
        at: Ms,
    },
    /// Compaction snapshot of a reservation in whatever status it had.
    ReservationRestored {
        reservation: Box<Reservation>,
    },
    ReturnChanged {
        id: ReservationId,
        resource_id: ResourceId,
        expected_return: Ms,
        total_amount: Decimal,
        deposit_amount: Decimal,
        at: Ms,
    },
}

impl Event {
    pub fn reservation_id(&self) -> ReservationId {
        match self {
            Event::ReservationCreated { reservation } | Event::ReservationRestored { reservation } => {
                reservation.id
            }
            Event::DepositPaid { id, .. }
            | Event::ContractApproved { id, .. }
            | Event::CheckedIn { id, .. }
            | Event::CheckedOut { id, .. }
            | Event::SettlementPaid { id, .. }
            | Event::Cancelled { id, .. }
            | Event::RefundConfirmed { id, .. }
            | Event::Rejected { id, .. }
            | Event::Archived { id, .. }
            | Event::ReturnChanged { id, .. } => *id,
        }
    }

    pub fn resource_id(&self) -> ResourceId {
        match self {
            Event::ReservationCreated { reservation } | Event::ReservationRestored { reservation } => {
                reservation.resource_id
            }
            Event::DepositPaid { resource_id, .. }
            | Event::ContractApproved { resource_id, .. }
            | Event::CheckedIn { resource_id, .. }
            | Event::CheckedOut { resource_id, .. }
            | Event::SettlementPaid { resource_id, .. }
            | Event::Cancelled { resource_id, .. }
            | Event::RefundConfirmed { resource_id, .. }
            | Event::Rejected { resource_id, .. }
            | Event::Archived { resource_id, .. }
            | Event::ReturnChanged { resource_id, .. } => *resource_id,
        }
    }
}

use std::time::Instant;

use rust_decimal::Decimal;
use tokio::sync::oneshot;
use tracing::{info, warn};
use ulid::Ulid;

use crate::fees;
use crate::limits::*;
use crate::model::*;
use crate::observability::record_transition;

use super::overlap::{check_available, first_conflict, validate_window};
use super::{Engine, EngineError, WalCommand, WriteScope};

/// A booking request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewReservation {
    pub customer_id: CustomerId,
    pub resource_id: ResourceId,
    pub origin_station: StationId,
    pub destination_station: StationId,
    pub pickup: Ms,
    pub expected_return: Ms,
    pub hourly_rate: Decimal,
    pub daily_rate: Decimal,
}

/// What staff record when the vehicle comes back.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CheckOutRequest {
    pub actual_return: Ms,
    /// Assessed by staff, passed through unchanged.
    pub damage_fee: Decimal,
    pub notes: Option<String>,
    pub photo_ref: Option<String>,
}

fn invalid(from: ReservationStatus, op: &'static str) -> EngineError {
    EngineError::InvalidTransition { from, op }
}

fn check_len(value: Option<&str>, max: usize, what: &'static str) -> Result<(), EngineError> {
    match value {
        Some(v) if v.len() > max => Err(EngineError::LimitExceeded(what)),
        _ => Ok(()),
    }
}

/// Blank references count as absent.
fn payment_reference(transaction_id: Option<String>) -> Result<Option<String>, EngineError> {
    let transaction_id = transaction_id
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty());
    check_len(transaction_id.as_deref(), MAX_TRANSACTION_ID_LEN, "transaction id too long")?;
    Ok(transaction_id)
}

impl Engine {
    /// Persist the event under the held scope and return the updated record.
    async fn commit(&self, scope: &mut WriteScope, event: &Event) -> Result<Reservation, EngineError> {
        self.persist_and_apply(&mut scope.book, event).await?;
        let id = event.reservation_id();
        scope.book.get(&id).cloned().ok_or(EngineError::NotFound(id))
    }

    /// Book a vehicle for `[pickup, expected_return)`. The overlap check, the
    /// station slot reservation and the write all happen under the vehicle's
    /// lock, so two overlapping requests can never both succeed.
    pub async fn create(&self, request: NewReservation) -> Result<Reservation, EngineError> {
        let started = Instant::now();
        let result = self.create_inner(request).await;
        record_transition("create", &result, started);
        result
    }

    async fn create_inner(&self, request: NewReservation) -> Result<Reservation, EngineError> {
        let span = validate_window(request.pickup, request.expected_return)?;
        if span.start <= self.now() {
            return Err(EngineError::Validation("pickup must be in the future"));
        }
        let total_amount = fees::estimate_rental(&span, request.hourly_rate, request.daily_rate)?;
        let deposit_amount = fees::deposit_for(total_amount, self.policy.deposit_fraction);

        let mut scope = self.lock_resource(request.resource_id).await;
        check_available(&scope.book, &span)?;

        let station = request.destination_station;
        if !self
            .station_call("check station slot", self.stations.has_available_slot(station))
            .await?
        {
            return Err(EngineError::StationUnavailable(station));
        }
        self.station_call("reserve station slot", self.stations.reserve(station))
            .await?;

        let now = self.now();
        let reservation = Reservation {
            id: Ulid::new(),
            customer_id: request.customer_id,
            resource_id: request.resource_id,
            origin_station: request.origin_station,
            destination_station: station,
            span,
            actual_return: None,
            hourly_rate: request.hourly_rate,
            daily_rate: request.daily_rate,
            deposit_amount,
            total_amount,
            actual_amount: None,
            late_fee: Decimal::ZERO,
            damage_fee: Decimal::ZERO,
            refund_due: Decimal::ZERO,
            refund_issued: false,
            deposit_payment: None,
            settlement_payment: None,
            contract_approved: false,
            contract_approved_at: None,
            check_in: None,
            check_out: None,
            status: ReservationStatus::Pending,
            created_at: now,
            updated_at: now,
            cancellation_reason: None,
            cancelled_at: None,
            deleted: false,
        };
        let event = Event::ReservationCreated {
            reservation: Box::new(reservation.clone()),
        };
        if let Err(e) = self.persist_and_apply(&mut scope.book, &event).await {
            drop(scope);
            self.release_slot(reservation.id, station).await;
            return Err(e);
        }
        info!(
            "reservation {} created for vehicle {} [{}, {}), total {} deposit {}",
            reservation.id, reservation.resource_id, span.start, span.end, total_amount, deposit_amount
        );
        Ok(reservation)
    }

    /// Record the deposit payment. Cash needs no gateway reference.
    pub async fn confirm(
        &self,
        id: ReservationId,
        method: PaymentMethod,
        transaction_id: Option<String>,
    ) -> Result<Reservation, EngineError> {
        let started = Instant::now();
        let result = self.confirm_inner(id, method, transaction_id).await;
        record_transition("confirm", &result, started);
        result
    }

    async fn confirm_inner(
        &self,
        id: ReservationId,
        method: PaymentMethod,
        transaction_id: Option<String>,
    ) -> Result<Reservation, EngineError> {
        let transaction_id = payment_reference(transaction_id)?;
        let mut scope = self.lock_reservation(&id).await?;
        let r = scope.book.get(&id).ok_or(EngineError::NotFound(id))?;
        // A redelivered deposit callback stays a no-op however far the
        // reservation has moved on since.
        if r
            .deposit_payment
            .as_ref()
            .is_some_and(|p| p.is_same(method, transaction_id.as_deref()))
        {
            return Ok(r.clone());
        }
        if r.status != ReservationStatus::Pending {
            return Err(invalid(r.status, "confirm"));
        }
        if method.requires_transaction_id() && transaction_id.is_none() {
            return Err(EngineError::PaymentRequired(method.as_str()));
        }

        let event = Event::DepositPaid {
            id,
            resource_id: scope.resource_id,
            payment: PaymentRef {
                method,
                transaction_id,
                paid_at: self.now(),
            },
        };
        let reservation = self.commit(&mut scope, &event).await?;
        info!("reservation {id} confirmed, deposit {} paid by {}", reservation.deposit_amount, method.as_str());
        Ok(reservation)
    }

    /// Move the expected return of a booking the customer has not been
    /// handed yet. The new window is re-checked against the vehicle's other
    /// bookings and the rental repriced; a deposit already paid stays as paid.
    pub async fn change_return(&self, id: ReservationId, expected_return: Ms) -> Result<Reservation, EngineError> {
        let started = Instant::now();
        let result = self.change_return_inner(id, expected_return).await;
        record_transition("change_return", &result, started);
        result
    }

    async fn change_return_inner(&self, id: ReservationId, expected_return: Ms) -> Result<Reservation, EngineError> {
        let mut scope = self.lock_reservation(&id).await?;
        let r = scope.book.get(&id).ok_or(EngineError::NotFound(id))?;
        match r.status {
            ReservationStatus::Pending | ReservationStatus::Confirmed => {}
            other => return Err(invalid(other, "change the return of")),
        }
        if expected_return == r.expected_return() {
            return Ok(r.clone());
        }
        let span = validate_window(r.pickup(), expected_return)?;
        if let Some(other) = first_conflict(&scope.book, &span, Some(id)) {
            return Err(EngineError::ResourceUnavailable(other.id));
        }
        let total_amount = fees::estimate_rental(&span, r.hourly_rate, r.daily_rate)?;
        let deposit_amount = if r.deposit_paid() {
            r.deposit_amount
        } else {
            fees::deposit_for(total_amount, self.policy.deposit_fraction)
        };

        let event = Event::ReturnChanged {
            id,
            resource_id: scope.resource_id,
            expected_return,
            total_amount,
            deposit_amount,
            at: self.now(),
        };
        let reservation = self.commit(&mut scope, &event).await?;
        info!("reservation {id} now returns at {expected_return}, total {total_amount} deposit {deposit_amount}");
        Ok(reservation)
    }

    /// Contract service callback. Redelivery after approval is a no-op.
    pub async fn approve_contract(&self, id: ReservationId) -> Result<Reservation, EngineError> {
        let started = Instant::now();
        let result = self.approve_contract_inner(id).await;
        record_transition("approve_contract", &result, started);
        result
    }

    async fn approve_contract_inner(&self, id: ReservationId) -> Result<Reservation, EngineError> {
        let mut scope = self.lock_reservation(&id).await?;
        let r = scope.book.get(&id).ok_or(EngineError::NotFound(id))?;
        match r.status {
            ReservationStatus::Confirmed => {}
            _ if r.contract_approved => return Ok(r.clone()),
            other => return Err(invalid(other, "approve contract for")),
        }

        let event = Event::ContractApproved {
            id,
            resource_id: scope.resource_id,
            at: self.now(),
        };
        let reservation = self.commit(&mut scope, &event).await?;
        info!("reservation {id} contract approved");
        Ok(reservation)
    }

    /// Hand the vehicle over. Only allowed inside the check-in window around pickup.
    pub async fn check_in(
        &self,
        id: ReservationId,
        notes: Option<String>,
        photo_ref: Option<String>,
    ) -> Result<Reservation, EngineError> {
        let started = Instant::now();
        let result = self.check_in_inner(id, notes, photo_ref).await;
        record_transition("check_in", &result, started);
        result
    }

    async fn check_in_inner(
        &self,
        id: ReservationId,
        notes: Option<String>,
        photo_ref: Option<String>,
    ) -> Result<Reservation, EngineError> {
        check_len(notes.as_deref(), MAX_NOTE_LEN, "notes too long")?;
        check_len(photo_ref.as_deref(), MAX_PHOTO_REF_LEN, "photo reference too long")?;
        let mut scope = self.lock_reservation(&id).await?;
        let r = scope.book.get(&id).ok_or(EngineError::NotFound(id))?;
        match r.status {
            ReservationStatus::ContractApproved if r.contract_approved => {}
            ReservationStatus::Pending | ReservationStatus::Confirmed | ReservationStatus::ContractApproved => {
                return Err(EngineError::ContractNotApproved(id));
            }
            other => return Err(invalid(other, "check in")),
        }
        let now = self.now();
        if now < r.pickup() - self.policy.checkin_early {
            return Err(EngineError::Validation("too early to check in"));
        }
        if now > r.pickup() + self.policy.checkin_late {
            return Err(EngineError::Validation("check-in window has passed"));
        }
        // The previous renter still has the car.
        if let Some(out) = scope
            .book
            .reservations
            .iter()
            .find(|o| o.id != id && o.status == ReservationStatus::CheckedIn)
        {
            return Err(EngineError::ResourceUnavailable(out.id));
        }

        let event = Event::CheckedIn {
            id,
            resource_id: scope.resource_id,
            inspection: Inspection {
                at: now,
                notes,
                photo_ref,
            },
        };
        let reservation = self.commit(&mut scope, &event).await?;
        info!("reservation {id} checked in, vehicle {} handed over", reservation.resource_id);
        Ok(reservation)
    }

    /// Take the vehicle back and fix the charges.
    pub async fn check_out(&self, id: ReservationId, request: CheckOutRequest) -> Result<Reservation, EngineError> {
        let started = Instant::now();
        let result = self.check_out_inner(id, request).await;
        record_transition("check_out", &result, started);
        result
    }

    async fn check_out_inner(&self, id: ReservationId, request: CheckOutRequest) -> Result<Reservation, EngineError> {
        check_len(request.notes.as_deref(), MAX_NOTE_LEN, "notes too long")?;
        check_len(request.photo_ref.as_deref(), MAX_PHOTO_REF_LEN, "photo reference too long")?;
        let mut scope = self.lock_reservation(&id).await?;
        let r = scope.book.get(&id).ok_or(EngineError::NotFound(id))?;
        if r.status != ReservationStatus::CheckedIn {
            return Err(invalid(r.status, "check out"));
        }
        let now = self.now();
        let checked_in_at = r.check_in.as_ref().map_or(r.pickup(), |i| i.at);
        if request.actual_return < checked_in_at {
            return Err(EngineError::Validation("return time is before check-in"));
        }
        if request.actual_return > now {
            return Err(EngineError::Validation("return time is in the future"));
        }
        let charges = fees::checkout_charges(
            r.total_amount,
            r.deposit_amount,
            r.expected_return(),
            request.actual_return,
            request.damage_fee,
            &self.policy.late_fee,
        )?;

        let event = Event::CheckedOut {
            id,
            resource_id: scope.resource_id,
            actual_return: request.actual_return,
            late_fee: charges.late_fee,
            damage_fee: charges.damage_fee,
            actual_amount: charges.actual_amount,
            refund_due: charges.refund_due,
            inspection: Inspection {
                at: now,
                notes: request.notes,
                photo_ref: request.photo_ref,
            },
        };
        let reservation = self.commit(&mut scope, &event).await?;
        info!(
            "reservation {id} checked out: late fee {}, damage fee {}, actual {}, due {}, refund {}",
            charges.late_fee, charges.damage_fee, charges.actual_amount, charges.amount_due, charges.refund_due
        );
        Ok(reservation)
    }

    /// Record the final settlement and close the reservation.
    pub async fn complete_with_payment(
        &self,
        id: ReservationId,
        method: PaymentMethod,
        transaction_id: Option<String>,
    ) -> Result<Reservation, EngineError> {
        let started = Instant::now();
        let result = self.complete_inner(id, method, transaction_id).await;
        record_transition("complete", &result, started);
        result
    }

    async fn complete_inner(
        &self,
        id: ReservationId,
        method: PaymentMethod,
        transaction_id: Option<String>,
    ) -> Result<Reservation, EngineError> {
        let transaction_id = payment_reference(transaction_id)?;
        let mut scope = self.lock_reservation(&id).await?;
        let r = scope.book.get(&id).ok_or(EngineError::NotFound(id))?;
        match r.status {
            ReservationStatus::CheckedOutPendingPayment => {}
            ReservationStatus::Completed
                if r
                    .settlement_payment
                    .as_ref()
                    .is_some_and(|p| p.is_same(method, transaction_id.as_deref())) =>
            {
                return Ok(r.clone());
            }
            other => return Err(invalid(other, "complete")),
        }
        if r.refund_due > Decimal::ZERO {
            return Err(EngineError::Validation(
                "deposit exceeds charges; confirm the refund instead",
            ));
        }
        if r.amount_due() > Decimal::ZERO && method.requires_transaction_id() && transaction_id.is_none() {
            return Err(EngineError::PaymentRequired(method.as_str()));
        }

        let amount_due = r.amount_due();
        let event = Event::SettlementPaid {
            id,
            resource_id: scope.resource_id,
            payment: PaymentRef {
                method,
                transaction_id,
                paid_at: self.now(),
            },
        };
        let reservation = self.commit(&mut scope, &event).await?;
        info!("reservation {id} completed, settlement {amount_due} by {}", method.as_str());
        Ok(reservation)
    }

    /// Report a failed deposit or settlement payment. Nothing moves: the
    /// reservation stays where it was until a payment succeeds or it expires.
    pub async fn payment_failed(&self, id: ReservationId, detail: String) -> Result<Reservation, EngineError> {
        let started = Instant::now();
        let result = self.payment_failed_inner(id, detail).await;
        record_transition("payment_failed", &result, started);
        result
    }

    async fn payment_failed_inner(&self, id: ReservationId, detail: String) -> Result<Reservation, EngineError> {
        let scope = self.lock_reservation(&id).await?;
        let r = scope.book.get(&id).ok_or(EngineError::NotFound(id))?;
        match r.status {
            ReservationStatus::Pending | ReservationStatus::CheckedOutPendingPayment => {}
            other => return Err(invalid(other, "record a payment failure for")),
        }
        warn!("reservation {id}: payment failed in status {}: {detail}", r.status);
        Err(EngineError::PaymentFailed { id, detail })
    }

    /// Cancel before the vehicle is collected. With a deposit on file the
    /// reservation waits in `CancelledPendingRefund` for staff to pay out.
    pub async fn cancel(&self, id: ReservationId, reason: CancellationReason) -> Result<Reservation, EngineError> {
        let started = Instant::now();
        let result = self.cancel_inner(id, reason).await;
        record_transition("cancel", &result, started);
        result
    }

    /// Staff cancellation after a vehicle or station incident; no penalty.
    pub async fn cancel_for_incident(&self, id: ReservationId, reason: String) -> Result<Reservation, EngineError> {
        self.cancel(id, CancellationReason::Incident(reason)).await
    }

    async fn cancel_inner(&self, id: ReservationId, reason: CancellationReason) -> Result<Reservation, EngineError> {
        if let CancellationReason::Requested(text) | CancellationReason::Incident(text) = &reason {
            check_len(Some(text.as_str()), MAX_REASON_LEN, "reason too long")?;
        }
        let mut scope = self.lock_reservation(&id).await?;
        let r = scope.book.get(&id).ok_or(EngineError::NotFound(id))?;
        match r.status {
            ReservationStatus::Pending | ReservationStatus::Confirmed | ReservationStatus::ContractApproved => {}
            other => return Err(invalid(other, "cancel")),
        }
        let now = self.now();
        let settlement = if r.deposit_paid() {
            let fraction = match &reason {
                CancellationReason::Requested(_) => self.policy.cancellation.penalty_fraction(r.pickup() - now),
                CancellationReason::NoShow => self.policy.no_show_penalty_fraction,
                CancellationReason::Incident(_) => Decimal::ZERO,
            };
            fees::cancellation_settlement(r.deposit_amount, fraction)
        } else {
            fees::CancellationSettlement {
                penalty: Decimal::ZERO,
                refund: Decimal::ZERO,
            }
        };
        let station = r.destination_station;

        let event = Event::Cancelled {
            id,
            resource_id: scope.resource_id,
            reason: reason.to_string(),
            refund_due: settlement.refund,
            at: now,
        };
        let reservation = self.commit(&mut scope, &event).await?;
        drop(scope);
        self.release_slot(id, station).await;
        info!(
            "reservation {id} cancelled ({reason}): penalty {}, refund {} -> {}",
            settlement.penalty, settlement.refund, reservation.status
        );
        Ok(reservation)
    }

    /// Staff acknowledgment that a refund actually left the account.
    pub async fn confirm_refund(&self, id: ReservationId) -> Result<Reservation, EngineError> {
        let started = Instant::now();
        let result = self.confirm_refund_inner(id).await;
        record_transition("confirm_refund", &result, started);
        result
    }

    async fn confirm_refund_inner(&self, id: ReservationId) -> Result<Reservation, EngineError> {
        let mut scope = self.lock_reservation(&id).await?;
        let r = scope.book.get(&id).ok_or(EngineError::NotFound(id))?;
        match r.status {
            ReservationStatus::CancelledPendingRefund => {}
            ReservationStatus::CheckedOutPendingPayment if r.refund_due > Decimal::ZERO => {}
            ReservationStatus::CheckedOutPendingPayment => {
                return Err(EngineError::Validation("no refund is due; complete with payment instead"));
            }
            ReservationStatus::Completed | ReservationStatus::Cancelled if r.refund_issued => {
                return Ok(r.clone());
            }
            other => return Err(invalid(other, "confirm refund for")),
        }
        let refund = r.refund_due;

        let event = Event::RefundConfirmed {
            id,
            resource_id: scope.resource_id,
            at: self.now(),
        };
        let reservation = self.commit(&mut scope, &event).await?;
        info!("reservation {id} refund of {refund} confirmed -> {}", reservation.status);
        Ok(reservation)
    }

    /// Administrative denial before any payment.
    pub async fn reject(&self, id: ReservationId, reason: String) -> Result<Reservation, EngineError> {
        let started = Instant::now();
        let result = self.reject_inner(id, reason).await;
        record_transition("reject", &result, started);
        result
    }

    async fn reject_inner(&self, id: ReservationId, reason: String) -> Result<Reservation, EngineError> {
        check_len(Some(reason.as_str()), MAX_REASON_LEN, "reason too long")?;
        let mut scope = self.lock_reservation(&id).await?;
        let r = scope.book.get(&id).ok_or(EngineError::NotFound(id))?;
        if r.status != ReservationStatus::Pending {
            return Err(invalid(r.status, "reject"));
        }
        let station = r.destination_station;

        let event = Event::Rejected {
            id,
            resource_id: scope.resource_id,
            reason: reason.clone(),
            at: self.now(),
        };
        let reservation = self.commit(&mut scope, &event).await?;
        drop(scope);
        self.release_slot(id, station).await;
        info!("reservation {id} rejected: {reason}");
        Ok(reservation)
    }

    /// Soft-delete a closed reservation once the retention window has passed.
    pub async fn archive(&self, id: ReservationId) -> Result<Reservation, EngineError> {
        let started = Instant::now();
        let result = self.archive_inner(id).await;
        record_transition("archive", &result, started);
        result
    }

    async fn archive_inner(&self, id: ReservationId) -> Result<Reservation, EngineError> {
        let mut scope = self.lock_reservation(&id).await?;
        let r = scope.book.get(&id).ok_or(EngineError::NotFound(id))?;
        if !r.status.is_terminal() {
            return Err(invalid(r.status, "archive"));
        }
        if r.deleted {
            return Ok(r.clone());
        }
        let now = self.now();
        if now - r.updated_at < self.policy.retention {
            return Err(EngineError::Validation("retention window has not elapsed"));
        }

        let event = Event::Archived {
            id,
            resource_id: scope.resource_id,
            at: now,
        };
        let reservation = self.commit(&mut scope, &event).await?;
        info!("reservation {id} archived");
        Ok(reservation)
    }

    /// Rewrite the WAL as one snapshot event per reservation.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        // Exclusive gate: no transition is between its check and its commit.
        let _gate = self.commit_gate.write().await;

        let books: Vec<_> = self.books.iter().map(|e| e.value().clone()).collect();
        let mut events = Vec::new();
        for book in books {
            let guard = book.read().await;
            events.extend(guard.reservations.iter().map(|r| Event::ReservationRestored {
                reservation: Box::new(r.clone()),
            }));
        }
        let count = events.len();

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::Storage("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Storage("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::Storage(e.to_string()))?;
        info!("WAL compacted to {count} reservations");
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

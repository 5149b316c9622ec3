use std::collections::HashMap;

use rust_decimal::Decimal;

use crate::fees;
use crate::limits::*;
use crate::model::*;

use super::overlap::{is_available, validate_window};
use super::{Engine, EngineError};

/// Price of a prospective rental, before anything is booked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Quote {
    pub total_amount: Decimal,
    pub deposit_amount: Decimal,
}

impl Engine {
    pub async fn get(&self, id: ReservationId) -> Option<Reservation> {
        let resource_id = self.resource_of(&id)?;
        let book = self.get_book(&resource_id)?;
        let guard = book.read().await;
        guard.get(&id).cloned()
    }

    /// `InProgress` for a checked-in rental whose pickup has passed.
    pub async fn effective_status(&self, id: ReservationId) -> Option<EffectiveStatus> {
        let now = self.now();
        self.get(id).await.map(|r| r.effective_status(now))
    }

    /// Whether the vehicle could be booked for `[pickup, expected_return)` right now.
    pub async fn check_availability(
        &self,
        resource_id: ResourceId,
        pickup: Ms,
        expected_return: Ms,
    ) -> Result<bool, EngineError> {
        let span = validate_window(pickup, expected_return)?;
        let Some(book) = self.get_book(&resource_id) else {
            return Ok(true);
        };
        let guard = book.read().await;
        Ok(is_available(&guard, &span))
    }

    /// Active reservations of one vehicle intersecting `[start, end)`, by pickup.
    pub async fn list_active_in_window(
        &self,
        resource_id: ResourceId,
        start: Ms,
        end: Ms,
    ) -> Result<Vec<Reservation>, EngineError> {
        if start >= end {
            return Err(EngineError::Validation("window end must be after start"));
        }
        if end - start > MAX_QUERY_WINDOW_MS {
            return Err(EngineError::LimitExceeded("query window too wide"));
        }
        let Some(book) = self.get_book(&resource_id) else {
            return Ok(vec![]);
        };
        let guard = book.read().await;
        Ok(guard
            .active_overlapping(&Span::new(start, end))
            .cloned()
            .collect())
    }

    /// Every non-archived reservation of a customer, most recent pickup first.
    pub async fn customer_history(&self, customer_id: CustomerId) -> Vec<Reservation> {
        let ids = self
            .by_customer
            .get(&customer_id)
            .map(|e| e.value().clone())
            .unwrap_or_default();
        let mut out = self.fetch(&ids, |r| !r.deleted).await;
        out.sort_by(|a, b| b.pickup().cmp(&a.pickup()));
        out
    }

    /// Reservations of a customer that are not closed yet, soonest pickup first.
    pub async fn customer_active(&self, customer_id: CustomerId) -> Vec<Reservation> {
        let mut out: Vec<_> = self
            .customer_history(customer_id)
            .await
            .into_iter()
            .filter(|r| !r.status.is_terminal())
            .collect();
        out.reverse();
        out
    }

    /// Reservations departing from or returning to a station, by pickup.
    pub async fn list_by_station(&self, station_id: StationId) -> Vec<Reservation> {
        let ids = self
            .by_station
            .get(&station_id)
            .map(|e| e.value().clone())
            .unwrap_or_default();
        let mut out = self.fetch(&ids, |r| !r.deleted).await;
        out.sort_by_key(|r| r.pickup());
        out
    }

    /// Paid reservations whose pickup is still ahead, soonest first.
    pub async fn upcoming(&self, limit: usize) -> Vec<Reservation> {
        let now = self.now();
        let books: Vec<_> = self.books.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::new();
        for book in books {
            let guard = book.read().await;
            out.extend(
                guard
                    .reservations
                    .iter()
                    .filter(|r| {
                        matches!(
                            r.status,
                            ReservationStatus::Confirmed | ReservationStatus::ContractApproved
                        ) && r.pickup() >= now
                    })
                    .cloned(),
            );
        }
        out.sort_by_key(|r| r.pickup());
        out.truncate(limit.min(MAX_UPCOMING_LIMIT));
        out
    }

    pub fn estimate_cost(
        &self,
        pickup: Ms,
        expected_return: Ms,
        hourly_rate: Decimal,
        daily_rate: Decimal,
    ) -> Result<Quote, EngineError> {
        let span = validate_window(pickup, expected_return)?;
        let total_amount = fees::estimate_rental(&span, hourly_rate, daily_rate)?;
        Ok(Quote {
            total_amount,
            deposit_amount: fees::deposit_for(total_amount, self.policy.deposit_fraction),
        })
    }

    /// Pending reservations whose deposit never arrived in time.
    pub fn collect_expired_pending(&self, now: Ms) -> Vec<ReservationId> {
        let timeout = self.policy.pending_payment_timeout;
        self.collect_where(|r| {
            r.status == ReservationStatus::Pending && r.created_at + timeout <= now
        })
    }

    /// Paid reservations nobody picked up within the grace period.
    pub fn collect_no_shows(&self, now: Ms) -> Vec<ReservationId> {
        let grace = self.policy.no_show_grace;
        self.collect_where(|r| {
            matches!(
                r.status,
                ReservationStatus::Confirmed | ReservationStatus::ContractApproved
            ) && r.pickup() + grace <= now
        })
    }

    /// Closed reservations past retention that are still visible.
    pub fn collect_archivable(&self, now: Ms) -> Vec<ReservationId> {
        let retention = self.policy.retention;
        self.collect_where(|r| {
            r.status.is_terminal() && !r.deleted && r.updated_at + retention <= now
        })
    }

    /// Books under write are skipped; the next sweep picks them up.
    fn collect_where(&self, pred: impl Fn(&Reservation) -> bool) -> Vec<ReservationId> {
        let mut found = Vec::new();
        for entry in self.books.iter() {
            let book = entry.value().clone();
            if let Ok(guard) = book.try_read() {
                found.extend(guard.reservations.iter().filter(|r| pred(r)).map(|r| r.id));
            }
        }
        found
    }

    /// Resolve ids book by book, one read lock per vehicle.
    async fn fetch(&self, ids: &[ReservationId], keep: impl Fn(&Reservation) -> bool) -> Vec<Reservation> {
        let mut per_book: HashMap<ResourceId, Vec<ReservationId>> = HashMap::new();
        for id in ids {
            if let Some(resource_id) = self.resource_of(id) {
                per_book.entry(resource_id).or_default().push(*id);
            }
        }
        let mut out = Vec::with_capacity(ids.len());
        for (resource_id, ids) in per_book {
            let Some(book) = self.get_book(&resource_id) else {
                continue;
            };
            let guard = book.read().await;
            out.extend(
                ids.iter()
                    .filter_map(|id| guard.get(id))
                    .filter(|r| keep(r))
                    .cloned(),
            );
        }
        out
    }
}

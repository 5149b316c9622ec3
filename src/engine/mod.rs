mod error;
mod mutations;
mod overlap;
mod queries;

pub use error::EngineError;
pub use mutations::{CheckOutRequest, NewReservation};
pub use overlap::{first_conflict, is_available};
pub use queries::Quote;

use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock, mpsc, oneshot};
use tracing::warn;

use crate::config::Policy;
use crate::model::*;
use crate::notify::NotifyHub;
use crate::station::{StationDirectory, StationError};
use crate::wal::Wal;

pub type SharedBook = Arc<RwLock<ResourceBook>>;

/// Source of "now" for every transition. Tests swap in a manual clock.
pub type Clock = Arc<dyn Fn() -> Ms + Send + Sync>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];
                let mut deferred = None;

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                        Ok(other) => {
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break, // channel empty, flush batch
                    }
                }

                commit_batch(&mut wal, &mut batch);
                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    respond_batch(batch, &result);
}

fn flush_batch(wal: &mut Wal, batch: &[(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    wal.append_batch(batch.iter().map(|(event, _)| event))
}

fn respond_batch(batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>, result: &io::Result<()>) {
    for (_, tx) in batch.drain(..) {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events).and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { event, response } => {
            let mut batch = vec![(event, response)];
            commit_batch(wal, &mut batch);
        }
    }
}

/// The reservation state machine. One [`ResourceBook`] per vehicle, each
/// behind its own lock: every transition holds the write lock of the vehicle
/// it touches from the precondition check until the event is durable.
pub struct Engine {
    books: DashMap<ResourceId, SharedBook>,
    wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    reservation_to_resource: DashMap<ReservationId, ResourceId>,
    by_customer: DashMap<CustomerId, Vec<ReservationId>>,
    by_station: DashMap<StationId, Vec<ReservationId>>,
    /// Shared by every transition, taken exclusively by compaction so the
    /// snapshot and the log swap see no concurrent commits.
    commit_gate: Arc<RwLock<()>>,
    stations: Arc<dyn StationDirectory>,
    policy: Policy,
    clock: Clock,
}

/// Exclusive access to one vehicle's book for the duration of a transition.
pub(super) struct WriteScope {
    _commit: OwnedRwLockReadGuard<()>,
    pub resource_id: ResourceId,
    pub book: OwnedRwLockWriteGuard<ResourceBook>,
}

/// Apply an event directly to a book. Caller holds the lock.
fn apply_to_book(book: &mut ResourceBook, event: &Event) {
    match event {
        Event::ReservationCreated { reservation } | Event::ReservationRestored { reservation } => {
            book.insert(reservation.as_ref().clone());
            return;
        }
        _ => {}
    }
    let Some(r) = book.get_mut(&event.reservation_id()) else {
        return;
    };
    match event {
        Event::DepositPaid { payment, .. } => {
            r.updated_at = payment.paid_at;
            r.deposit_payment = Some(payment.clone());
            r.status = ReservationStatus::Confirmed;
        }
        Event::ContractApproved { at, .. } => {
            r.contract_approved = true;
            r.contract_approved_at = Some(*at);
            r.status = ReservationStatus::ContractApproved;
            r.updated_at = *at;
        }
        Event::CheckedIn { inspection, .. } => {
            r.updated_at = inspection.at;
            r.check_in = Some(inspection.clone());
            r.status = ReservationStatus::CheckedIn;
        }
        Event::CheckedOut {
            actual_return,
            late_fee,
            damage_fee,
            actual_amount,
            refund_due,
            inspection,
            ..
        } => {
            r.actual_return = Some(*actual_return);
            r.late_fee = *late_fee;
            r.damage_fee = *damage_fee;
            r.actual_amount = Some(*actual_amount);
            r.refund_due = *refund_due;
            r.updated_at = inspection.at;
            r.check_out = Some(inspection.clone());
            r.status = ReservationStatus::CheckedOutPendingPayment;
        }
        Event::SettlementPaid { payment, .. } => {
            r.updated_at = payment.paid_at;
            r.settlement_payment = Some(payment.clone());
            r.status = ReservationStatus::Completed;
        }
        Event::Cancelled {
            reason, refund_due, at, ..
        } => {
            r.status = if r.deposit_paid() {
                ReservationStatus::CancelledPendingRefund
            } else {
                ReservationStatus::Cancelled
            };
            r.refund_due = *refund_due;
            r.cancellation_reason = Some(reason.clone());
            r.cancelled_at = Some(*at);
            r.updated_at = *at;
        }
        Event::RefundConfirmed { at, .. } => {
            r.refund_issued = !r.refund_due.is_zero();
            r.status = match r.status {
                ReservationStatus::CheckedOutPendingPayment => ReservationStatus::Completed,
                ReservationStatus::CancelledPendingRefund => ReservationStatus::Cancelled,
                other => other,
            };
            r.updated_at = *at;
        }
        Event::Rejected { reason, at, .. } => {
            r.status = ReservationStatus::Rejected;
            r.cancellation_reason = Some(reason.clone());
            r.cancelled_at = Some(*at);
            r.updated_at = *at;
        }
        Event::Archived { at, .. } => {
            r.deleted = true;
            r.updated_at = *at;
        }
        Event::ReturnChanged {
            expected_return,
            total_amount,
            deposit_amount,
            at,
            ..
        } => {
            r.span = Span::new(r.span.start, *expected_return);
            r.total_amount = *total_amount;
            r.deposit_amount = *deposit_amount;
            r.updated_at = *at;
        }
        Event::ReservationCreated { .. } | Event::ReservationRestored { .. } => {}
    }
}

impl Engine {
    pub fn new(wal_path: PathBuf, stations: Arc<dyn StationDirectory>, policy: Policy) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            books: DashMap::new(),
            wal_tx,
            notify: Arc::new(NotifyHub::new()),
            reservation_to_resource: DashMap::new(),
            by_customer: DashMap::new(),
            by_station: DashMap::new(),
            commit_gate: Arc::new(RwLock::new(())),
            stations,
            policy,
            clock: Arc::new(now_ms),
        };

        // Rebuild books before sharing them, so replay never touches a lock.
        let mut books: HashMap<ResourceId, ResourceBook> = HashMap::new();
        for event in &events {
            let resource_id = event.resource_id();
            let book = books
                .entry(resource_id)
                .or_insert_with(|| ResourceBook::new(resource_id));
            apply_to_book(book, event);
            engine.index(event);
        }
        for (id, book) in books {
            engine.books.insert(id, Arc::new(RwLock::new(book)));
        }

        Ok(engine)
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn now(&self) -> Ms {
        (self.clock)()
    }

    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    /// Secondary indexes only change when a reservation first appears.
    fn index(&self, event: &Event) {
        let (Event::ReservationCreated { reservation } | Event::ReservationRestored { reservation }) = event
        else {
            return;
        };
        if self
            .reservation_to_resource
            .insert(reservation.id, reservation.resource_id)
            .is_some()
        {
            return;
        }
        self.by_customer
            .entry(reservation.customer_id)
            .or_default()
            .push(reservation.id);
        self.by_station
            .entry(reservation.origin_station)
            .or_default()
            .push(reservation.id);
        if reservation.destination_station != reservation.origin_station {
            self.by_station
                .entry(reservation.destination_station)
                .or_default()
                .push(reservation.id);
        }
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::Storage("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Storage("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::Storage(e.to_string()))
    }

    pub fn get_book(&self, resource_id: &ResourceId) -> Option<SharedBook> {
        self.books.get(resource_id).map(|e| e.value().clone())
    }

    pub fn resource_of(&self, reservation_id: &ReservationId) -> Option<ResourceId> {
        self.reservation_to_resource.get(reservation_id).map(|e| *e.value())
    }

    /// WAL-append + apply + notify. Nothing changes in memory unless the
    /// event is durable.
    pub(super) async fn persist_and_apply(&self, book: &mut ResourceBook, event: &Event) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_book(book, event);
        self.index(event);
        self.notify.send(book.id, event);
        Ok(())
    }

    /// Take the commit gate and the vehicle's write lock, creating an empty
    /// book for a vehicle seen for the first time.
    pub(super) async fn lock_resource(&self, resource_id: ResourceId) -> WriteScope {
        let commit = self.commit_gate.clone().read_owned().await;
        let book = self
            .books
            .entry(resource_id)
            .or_insert_with(|| Arc::new(RwLock::new(ResourceBook::new(resource_id))))
            .value()
            .clone();
        WriteScope {
            _commit: commit,
            resource_id,
            book: book.write_owned().await,
        }
    }

    /// Lookup reservation → vehicle, then lock that vehicle's book.
    pub(super) async fn lock_reservation(&self, id: &ReservationId) -> Result<WriteScope, EngineError> {
        let resource_id = self.resource_of(id).ok_or(EngineError::NotFound(*id))?;
        let scope = self.lock_resource(resource_id).await;
        if scope.book.get(id).is_none() {
            return Err(EngineError::NotFound(*id));
        }
        Ok(scope)
    }

    /// Run a station-service call under the collaborator timeout. An
    /// unreachable service is reported as retryable, never as an answer.
    pub(super) async fn station_call<T>(
        &self,
        what: &'static str,
        call: impl Future<Output = Result<T, StationError>>,
    ) -> Result<T, EngineError> {
        let timeout = self.policy.collaborator_timeout;
        match tokio::time::timeout(timeout, call).await {
            Ok(Ok(v)) => Ok(v),
            Ok(Err(StationError::NoFreeSlot(id) | StationError::UnknownStation(id))) => {
                Err(EngineError::StationUnavailable(id))
            }
            Ok(Err(StationError::Unavailable(msg))) => {
                Err(EngineError::PreconditionCheckTimedOut(format!("{what}: {msg}")))
            }
            Err(_) => Err(EngineError::PreconditionCheckTimedOut(format!(
                "{what}: no answer within {timeout:?}"
            ))),
        }
    }

    /// Give a station slot back after a reservation left the active set.
    /// The transition is already committed; a failure here is reconciled by
    /// the station service, not by rolling the reservation back.
    pub(super) async fn release_slot(&self, reservation_id: ReservationId, station: StationId) {
        if let Err(e) = self
            .station_call("release station slot", self.stations.release(station))
            .await
        {
            metrics::counter!(crate::observability::STATION_RELEASE_FAILURES_TOTAL).increment(1);
            warn!("reservation {reservation_id}: failed to release slot at station {station}: {e}");
        }
    }
}

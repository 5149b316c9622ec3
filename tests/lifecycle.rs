use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use rust_decimal_macros::dec;
use tokio_test::{assert_err, assert_ok};
use ulid::Ulid;

use evrent::config::Policy;
use evrent::engine::{CheckOutRequest, Engine, EngineError, NewReservation};
use evrent::model::*;
use evrent::station::InMemoryStations;
use evrent::sweeper::sweep_once;

const T0: Ms = 1_760_000_000_000;

// ── Test infrastructure ──────────────────────────────────────

struct Fleet {
    engine: Engine,
    now: Arc<AtomicI64>,
    stations: Arc<InMemoryStations>,
    downtown: StationId,
    airport: StationId,
    wal: PathBuf,
}

fn fleet(name: &str) -> Fleet {
    let dir = std::env::temp_dir().join(format!("evrent_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let wal = dir.join(format!("{name}.wal"));

    let stations = Arc::new(InMemoryStations::new());
    let downtown = Ulid::new();
    let airport = Ulid::new();
    stations.add_station(downtown, 3);
    stations.add_station(airport, 1);

    let now = Arc::new(AtomicI64::new(T0));
    let engine = reopen(&wal, &stations, &now);
    Fleet {
        engine,
        now,
        stations,
        downtown,
        airport,
        wal,
    }
}

fn reopen(wal: &PathBuf, stations: &Arc<InMemoryStations>, now: &Arc<AtomicI64>) -> Engine {
    let clock = now.clone();
    Engine::new(wal.clone(), stations.clone(), Policy::default())
        .unwrap()
        .with_clock(Arc::new(move || clock.load(Ordering::SeqCst)))
}

impl Fleet {
    fn at(&self, t: Ms) {
        self.now.store(t, Ordering::SeqCst);
    }

    fn booking(&self, customer: CustomerId, vehicle: ResourceId, pickup: Ms, hours: Ms) -> NewReservation {
        NewReservation {
            customer_id: customer,
            resource_id: vehicle,
            origin_station: self.downtown,
            destination_station: self.airport,
            pickup,
            expected_return: pickup + hours * HOUR,
            hourly_rate: dec!(12.50),
            daily_rate: dec!(90),
        }
    }
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn one_way_rental_end_to_end() {
    let f = fleet("one_way");
    let customer = Ulid::new();
    let vehicle = Ulid::new();
    let pickup = T0 + 2 * DAY;

    let r = assert_ok!(f.engine.create(f.booking(customer, vehicle, pickup, 30)).await);
    // 30h crosses the day threshold: two days at the daily rate.
    assert_eq!(r.total_amount, dec!(180));
    assert_eq!(r.deposit_amount, dec!(54.00));
    assert_eq!(f.stations.available(&f.airport), Some(0));

    assert_ok!(
        f.engine
            .confirm(r.id, PaymentMethod::EWallet, Some("ew-5521".into()))
            .await
    );
    assert_ok!(f.engine.approve_contract(r.id).await);
    assert_ok!(f.engine.approve_contract(r.id).await);

    f.at(pickup - 30 * MINUTE);
    assert_ok!(f.engine.check_in(r.id, Some("82% battery".into()), None).await);

    let back = r.expected_return() + 90 * MINUTE;
    f.at(back);
    let r = assert_ok!(
        f.engine
            .check_out(
                r.id,
                CheckOutRequest {
                    actual_return: back,
                    damage_fee: dec!(35),
                    notes: Some("cracked mirror".into()),
                    photo_ref: Some("inspections/mirror.jpg".into()),
                },
            )
            .await
    );
    assert_eq!(r.late_fee, dec!(75.00));
    assert_eq!(r.damage_fee, dec!(35));
    assert_eq!(r.actual_amount, Some(dec!(290.00)));
    assert_eq!(r.amount_due(), dec!(236.00));

    let r = assert_ok!(
        f.engine
            .complete_with_payment(r.id, PaymentMethod::Card, Some("ch-991".into()))
            .await
    );
    assert_eq!(r.status, ReservationStatus::Completed);
    // The car stays parked at the airport.
    assert_eq!(f.stations.available(&f.airport), Some(0));

    let history = f.engine.customer_history(customer).await;
    assert_eq!(history.len(), 1);
    assert_eq!(history[0], r);
}

#[tokio::test]
async fn second_booking_for_full_station_is_refused() {
    let f = fleet("station_full");
    let first = assert_ok!(
        f.engine
            .create(f.booking(Ulid::new(), Ulid::new(), T0 + DAY, 4))
            .await
    );
    let err = assert_err!(
        f.engine
            .create(f.booking(Ulid::new(), Ulid::new(), T0 + DAY, 4))
            .await
    );
    assert_eq!(err, EngineError::StationUnavailable(f.airport));

    // Cancelling gives the slot back.
    assert_ok!(
        f.engine
            .cancel(first.id, CancellationReason::Requested("changed plans".into()))
            .await
    );
    assert_ok!(
        f.engine
            .create(f.booking(Ulid::new(), Ulid::new(), T0 + DAY, 4))
            .await
    );
}

#[tokio::test]
async fn sweeper_expires_and_cancels() {
    let f = fleet("sweeper");
    let mut downtown_only = f.booking(Ulid::new(), Ulid::new(), T0 + 3 * HOUR, 2);
    downtown_only.destination_station = f.downtown;
    let unpaid = assert_ok!(f.engine.create(downtown_only.clone()).await);

    downtown_only.resource_id = Ulid::new();
    let paid = assert_ok!(f.engine.create(downtown_only).await);
    assert_ok!(f.engine.confirm(paid.id, PaymentMethod::Cash, None).await);

    f.at(T0 + 45 * MINUTE);
    let report = sweep_once(&f.engine).await;
    assert_eq!((report.rejected, report.no_shows), (1, 0));

    f.at(T0 + 4 * HOUR + MINUTE);
    let report = sweep_once(&f.engine).await;
    assert_eq!((report.rejected, report.no_shows), (0, 1));

    let unpaid = f.engine.get(unpaid.id).await.unwrap();
    assert_eq!(unpaid.status, ReservationStatus::Rejected);
    let paid = f.engine.get(paid.id).await.unwrap();
    assert_eq!(paid.status, ReservationStatus::CancelledPendingRefund);
    assert_eq!(paid.cancellation_reason.as_deref(), Some("no-show"));
    assert_eq!(f.stations.available(&f.downtown), Some(3));
}

#[tokio::test]
async fn restart_resumes_where_it_left_off() {
    let f = fleet("restart");
    let vehicle = Ulid::new();
    let r = assert_ok!(f.engine.create(f.booking(Ulid::new(), vehicle, T0 + DAY, 6)).await);
    assert_ok!(f.engine.confirm(r.id, PaymentMethod::Cash, None).await);
    assert_ok!(f.engine.compact_wal().await);
    assert_ok!(f.engine.approve_contract(r.id).await);

    let restarted = reopen(&f.wal, &f.stations, &f.now);
    let after = restarted.get(r.id).await.unwrap();
    assert_eq!(after.status, ReservationStatus::ContractApproved);
    assert_eq!(after.deposit_amount, r.deposit_amount);

    f.at(T0 + DAY);
    assert_ok!(restarted.check_in(r.id, None, None).await);
    assert_eq!(
        restarted.effective_status(r.id).await,
        Some(EffectiveStatus::InProgress)
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn simultaneous_requests_for_one_car() {
    let f = fleet("race");
    let engine = Arc::new(f.engine);
    let vehicle = Ulid::new();

    let mut handles = Vec::new();
    for i in 0..2 {
        let engine = engine.clone();
        let mut req = NewReservation {
            customer_id: Ulid::new(),
            resource_id: vehicle,
            origin_station: f.downtown,
            destination_station: f.downtown,
            pickup: T0 + DAY,
            expected_return: T0 + DAY + 5 * HOUR,
            hourly_rate: dec!(12.50),
            daily_rate: dec!(90),
        };
        req.pickup += i * HOUR;
        handles.push(tokio::spawn(async move { engine.create(req).await }));
    }

    let results: Vec<_> = futures::future::join_all(handles)
        .await
        .into_iter()
        .map(|r| r.unwrap())
        .collect();
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    let winner = results.iter().find_map(|r| r.as_ref().ok()).unwrap();
    let loser = results.iter().find_map(|r| r.as_ref().err()).unwrap();
    assert_eq!(loser, &EngineError::ResourceUnavailable(winner.id));
}

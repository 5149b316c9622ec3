use std::sync::Arc;

use proptest::prelude::*;
use rust_decimal::Decimal;
use ulid::Ulid;

use evrent::config::Policy;
use evrent::engine::{Engine, EngineError, NewReservation};
use evrent::fees::{
    LateFeePolicy, PenaltySchedule, StepSchedule, cancellation_settlement, checkout_charges, late_fee,
};
use evrent::model::*;
use evrent::station::InMemoryStations;

const T0: Ms = 1_760_000_000_000;

fn money() -> impl Strategy<Value = Decimal> {
    (0i64..10_000_000).prop_map(|cents| Decimal::new(cents, 2))
}

fn fraction() -> impl Strategy<Value = Decimal> {
    (0i64..=100).prop_map(|pct| Decimal::new(pct, 2))
}

#[derive(Debug, Clone)]
enum Op {
    Create { start_h: i64, hours: i64 },
    CancelNth(usize),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (0i64..240, 1i64..48).prop_map(|(start_h, hours)| Op::Create { start_h, hours }),
        1 => (0usize..64).prop_map(Op::CancelNth),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    /// Whatever order requests arrive in, no two active reservations of a
    /// vehicle intersect, and a request is refused only when it would.
    #[test]
    fn no_double_booking(ops in prop::collection::vec(op(), 1..40)) {
        let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let stations = Arc::new(InMemoryStations::new());
            let station = Ulid::new();
            stations.add_station(station, u32::MAX);
            let dir = std::env::temp_dir().join("evrent_prop_test");
            std::fs::create_dir_all(&dir).unwrap();
            let path = dir.join(format!("{}.wal", Ulid::new()));
            let engine = Engine::new(path.clone(), stations, Policy::default())
                .unwrap()
                .with_clock(Arc::new(|| T0));
            let vehicle = Ulid::new();
            let mut created: Vec<Reservation> = Vec::new();

            for op in ops {
                match op {
                    Op::Create { start_h, hours } => {
                        let span = Span::new(T0 + HOUR + start_h * HOUR, T0 + HOUR + (start_h + hours) * HOUR);
                        let mut active = Vec::new();
                        for r in &created {
                            let current = engine.get(r.id).await.unwrap();
                            if current.status.is_active() {
                                active.push(current);
                            }
                        }
                        let clash = active.iter().find(|r| r.span.overlaps(&span)).map(|r| r.id);

                        let result = engine
                            .create(NewReservation {
                                customer_id: Ulid::new(),
                                resource_id: vehicle,
                                origin_station: station,
                                destination_station: station,
                                pickup: span.start,
                                expected_return: span.end,
                                hourly_rate: Decimal::TEN,
                                daily_rate: Decimal::ONE_HUNDRED,
                            })
                            .await;
                        match (clash, result) {
                            (None, Ok(r)) => created.push(r),
                            (Some(_), Err(EngineError::ResourceUnavailable(_))) => {}
                            (clash, result) => panic!("clash {clash:?} but got {result:?}"),
                        }
                    }
                    Op::CancelNth(n) => {
                        if let Some(r) = created.get(n % created.len().max(1)) {
                            let _ = engine.cancel(r.id, CancellationReason::Requested("prop".into())).await;
                        }
                    }
                }
            }

            let active = engine
                .list_active_in_window(vehicle, T0, T0 + 300 * HOUR)
                .await
                .unwrap();
            for (i, a) in active.iter().enumerate() {
                for b in &active[i + 1..] {
                    assert!(!a.span.overlaps(&b.span), "{:?} overlaps {:?}", a.span, b.span);
                }
            }
            let _ = std::fs::remove_file(&path);
        });
    }

    #[test]
    fn cancellation_refund_is_never_negative(deposit in money(), penalty in fraction()) {
        let s = cancellation_settlement(deposit, penalty);
        prop_assert!(s.refund >= Decimal::ZERO);
        prop_assert!(s.penalty <= deposit);
        prop_assert_eq!(s.penalty + s.refund, deposit);
    }

    #[test]
    fn checkout_balance_is_consistent(
        total in money(),
        deposit in money(),
        damage in money(),
        late_min in -600i64..6_000,
    ) {
        let policy = LateFeePolicy { per_hour: Decimal::new(50, 0), cap: None };
        let expected = T0 + 10 * HOUR;
        let actual = expected + late_min * MINUTE;
        let c = checkout_charges(total, deposit, expected, actual, damage, &policy).unwrap();

        prop_assert!(c.late_fee >= Decimal::ZERO);
        prop_assert!(c.refund_due >= Decimal::ZERO);
        prop_assert!(c.amount_due >= Decimal::ZERO);
        prop_assert!(c.refund_due.is_zero() || c.amount_due.is_zero());
        prop_assert_eq!(c.actual_amount, total + c.late_fee + c.damage_fee);
        prop_assert_eq!(c.amount_due - c.refund_due, c.actual_amount - deposit);

        // Same inputs, same charges.
        let again = checkout_charges(total, deposit, expected, actual, damage, &policy).unwrap();
        prop_assert_eq!(c, again);
    }

    #[test]
    fn late_fee_grows_with_lateness(a in 0i64..10_000, b in 0i64..10_000, cap in prop::option::of(money())) {
        let policy = LateFeePolicy { per_hour: Decimal::new(50, 0), cap };
        let (early, late) = (a.min(b), a.max(b));
        let fee_early = late_fee(T0, T0 + early * MINUTE, &policy);
        let fee_late = late_fee(T0, T0 + late * MINUTE, &policy);
        prop_assert!(fee_early <= fee_late);
        if let Some(cap) = cap {
            prop_assert!(fee_late <= cap);
        }
    }

    #[test]
    fn penalty_never_decreases_closer_to_pickup(a in -48i64..240, b in -48i64..240) {
        let schedule = StepSchedule::default();
        let (near, far) = (a.min(b), a.max(b));
        prop_assert!(
            schedule.penalty_fraction(near * HOUR) >= schedule.penalty_fraction(far * HOUR)
        );
    }
}

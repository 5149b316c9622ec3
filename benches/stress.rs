use std::sync::Arc;
use std::time::{Duration, Instant};

use rust_decimal_macros::dec;
use ulid::Ulid;

use evrent::config::Policy;
use evrent::engine::{Engine, EngineError, NewReservation};
use evrent::model::{DAY, HOUR, Ms, StationId, now_ms};
use evrent::station::InMemoryStations;

fn percentile(sorted: &[Duration], p: f64) -> Duration {
    if sorted.is_empty() {
        return Duration::ZERO;
    }
    let idx = ((sorted.len() as f64) * p / 100.0) as usize;
    sorted[idx.min(sorted.len() - 1)]
}

fn print_latency(label: &str, latencies: &mut [Duration]) {
    if latencies.is_empty() {
        println!("  {label}: no samples");
        return;
    }
    latencies.sort();
    let total: Duration = latencies.iter().sum();
    let avg = total / latencies.len() as u32;
    println!("  {label}:");
    println!(
        "    n={}, avg={:.2}ms, p50={:.2}ms, p95={:.2}ms, p99={:.2}ms, max={:.2}ms",
        latencies.len(),
        avg.as_secs_f64() * 1000.0,
        percentile(latencies, 50.0).as_secs_f64() * 1000.0,
        percentile(latencies, 95.0).as_secs_f64() * 1000.0,
        percentile(latencies, 99.0).as_secs_f64() * 1000.0,
        latencies[latencies.len() - 1].as_secs_f64() * 1000.0,
    );
}

fn request(station: StationId, resource_id: Ulid, pickup: Ms, hours: Ms) -> NewReservation {
    NewReservation {
        customer_id: Ulid::new(),
        resource_id,
        origin_station: station,
        destination_station: station,
        pickup,
        expected_return: pickup + hours * HOUR,
        hourly_rate: dec!(50),
        daily_rate: dec!(400),
    }
}

fn open_engine(name: &str) -> (Arc<Engine>, StationId) {
    let dir = std::env::temp_dir().join(format!("evrent_bench_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).expect("create bench dir");
    let stations = Arc::new(InMemoryStations::new());
    let station = Ulid::new();
    stations.add_station(station, u32::MAX);
    let engine = Engine::new(dir.join(name), stations, Policy::default()).expect("open engine");
    (Arc::new(engine), station)
}

async fn phase1_sequential() {
    let (engine, station) = open_engine("sequential.wal");
    let vehicle = Ulid::new();
    let base = now_ms() + DAY;

    let n = 2000;
    let mut latencies = Vec::with_capacity(n);
    let start = Instant::now();

    for i in 0..n {
        let t = Instant::now();
        engine
            .create(request(station, vehicle, base + (i as i64) * HOUR, 1))
            .await
            .expect("sequential create");
        latencies.push(t.elapsed());
    }

    let elapsed = start.elapsed();
    let ops = n as f64 / elapsed.as_secs_f64();
    println!("  {n} reservations in {:.2}s = {ops:.0} ops/sec", elapsed.as_secs_f64());
    print_latency("create latency", &mut latencies);
}

async fn phase2_concurrent_vehicles() {
    let (engine, station) = open_engine("concurrent.wal");
    let n_tasks = 16;
    let n_per_task = 200;
    let base = now_ms() + DAY;

    let start = Instant::now();
    let mut handles = Vec::new();
    for _ in 0..n_tasks {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            let vehicle = Ulid::new();
            for j in 0..n_per_task {
                engine
                    .create(request(station, vehicle, base + (j as i64) * HOUR, 1))
                    .await
                    .expect("concurrent create");
            }
        }));
    }
    for h in handles {
        h.await.expect("task panicked");
    }

    let elapsed = start.elapsed();
    let total = n_tasks * n_per_task;
    let ops = total as f64 / elapsed.as_secs_f64();
    println!(
        "  {n_tasks} vehicles x {n_per_task} reservations = {total} total in {:.2}s = {ops:.0} ops/sec",
        elapsed.as_secs_f64()
    );
}

async fn phase3_contended_vehicle() {
    let (engine, station) = open_engine("contended.wal");
    let vehicle = Ulid::new();
    let base = now_ms() + DAY;
    let n_windows = 200;
    let n_racers = 8;

    let start = Instant::now();
    let mut handles = Vec::new();
    for w in 0..n_windows {
        for _ in 0..n_racers {
            let engine = engine.clone();
            let req = request(station, vehicle, base + (w as i64) * 2 * HOUR, 2);
            handles.push(tokio::spawn(async move { engine.create(req).await }));
        }
    }

    let (mut won, mut lost) = (0, 0);
    for h in handles {
        match h.await.expect("task panicked") {
            Ok(_) => won += 1,
            Err(EngineError::ResourceUnavailable(_)) => lost += 1,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }

    let elapsed = start.elapsed();
    println!(
        "  {} racing creates in {:.2}s: {won} won, {lost} conflicts",
        n_windows * n_racers,
        elapsed.as_secs_f64()
    );
    assert_eq!(won, n_windows, "exactly one winner per window");
}

async fn phase4_read_under_load() {
    let (engine, station) = open_engine("read_under_load.wal");
    let vehicle = Ulid::new();
    let base = now_ms() + DAY;

    for i in 0..500 {
        engine
            .create(request(station, vehicle, base + (i as i64) * HOUR, 1))
            .await
            .expect("seed create");
    }

    let writers: Vec<_> = (0..4)
        .map(|_| {
            let engine = engine.clone();
            tokio::spawn(async move {
                let other = Ulid::new();
                for j in 0..500 {
                    let _ = engine
                        .create(request(station, other, base + (j as i64) * HOUR, 1))
                        .await;
                }
            })
        })
        .collect();

    let mut latencies = Vec::with_capacity(2000);
    for i in 0..2000 {
        let from = base + ((i % 400) as i64) * HOUR;
        let t = Instant::now();
        engine
            .list_active_in_window(vehicle, from, from + DAY)
            .await
            .expect("window query");
        latencies.push(t.elapsed());
    }
    for w in writers {
        w.await.expect("writer panicked");
    }

    print_latency("window query latency", &mut latencies);
}

#[tokio::main(flavor = "multi_thread")]
async fn main() {
    println!("=== evrent stress benchmark ===\n");

    println!("[phase 1] sequential create throughput");
    phase1_sequential().await;

    println!("\n[phase 2] concurrent creates across vehicles");
    phase2_concurrent_vehicles().await;

    println!("\n[phase 3] racing creates on one vehicle");
    phase3_contended_vehicle().await;

    println!("\n[phase 4] read latency under write load");
    phase4_read_under_load().await;

    println!("\n=== benchmark complete ===");
}

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use chrono::{Days, NaiveDate, NaiveTime, TimeDelta};
use ulid::Ulid;

use slotguard::store::MemoryStore;
use slotguard::{Config, Engine, EngineError, FixedClock, Policy, retry_serializable};

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
        latencies.last().map_or(0.0, |d| d.as_secs_f64() * 1000.0),
    );
}

fn start_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2025, 3, 1).unwrap()
}

fn hour(h: u32) -> NaiveTime {
    NaiveTime::from_hms_opt(h, 0, 0).unwrap()
}

/// Engine with a quota high enough to never get in the way.
fn engine(store: MemoryStore) -> Arc<Engine> {
    let clock = Arc::new(FixedClock::new(start_date().and_time(hour(0))));
    let policy = Policy { max_active_reservations: usize::MAX, horizon: 0, ..Policy::default() };
    Engine::new(store, clock, policy)
}

async fn phase1_sequential(engine: &Engine) {
    let member = engine.enroll_member(Ulid::new()).await.unwrap().id;
    let n = 2000u64;
    let mut latencies = Vec::with_capacity(n as usize);
    let start = Instant::now();

    // One booking per day, each on its own facility.
    for i in 0..n {
        let date = start_date() + Days::new(i);
        let t = Instant::now();
        engine
            .create_reservation(member, Ulid::new(), date, hour(9), hour(10), None)
            .await
            .unwrap();
        latencies.push(t.elapsed());
    }

    let elapsed = start.elapsed();
    let ops = n as f64 / elapsed.as_secs_f64();
    println!("  {n} reservations in {:.2}s = {ops:.0} ops/sec", elapsed.as_secs_f64());
    print_latency("write latency", &mut latencies);
}

async fn phase2_concurrent(engine: &Arc<Engine>) {
    let n_tasks = 10;
    let n_per_task = 200u64;

    let start = Instant::now();
    let mut handles = Vec::new();

    for _ in 0..n_tasks {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            let member = engine.enroll_member(Ulid::new()).await.unwrap().id;
            let facility = Ulid::new();
            let mut failed = 0;
            for j in 0..n_per_task {
                let date = start_date() + Days::new(j);
                let result = retry_serializable(20, || {
                    engine.create_reservation(member, facility, date, hour(9), hour(10), None)
                })
                .await;
                if result.is_err() {
                    failed += 1;
                }
            }
            failed
        }));
    }

    let mut failed = 0;
    for h in handles {
        failed += h.await.unwrap();
    }

    let elapsed = start.elapsed();
    let total = n_tasks * n_per_task as usize;
    let ops = total as f64 / elapsed.as_secs_f64();
    println!(
        "  {n_tasks} tasks x {n_per_task} reservations = {total} total in {:.2}s = {ops:.0} ops/sec ({failed} failed)",
        elapsed.as_secs_f64()
    );
}

async fn phase3_read_under_load(engine: &Arc<Engine>) {
    let facility = Ulid::new();
    let day = start_date() + Days::new(30);
    // Pre-fill a day of hourly bookings with gaps.
    for h in (6..22).step_by(2) {
        let member = engine.enroll_member(Ulid::new()).await.unwrap().id;
        engine
            .create_reservation(member, facility, day, hour(h), hour(h + 1), None)
            .await
            .unwrap();
    }

    let stop = Arc::new(AtomicBool::new(false));
    let mut writer_handles = Vec::new();
    for _ in 0..5 {
        let engine = engine.clone();
        let stop = stop.clone();
        writer_handles.push(tokio::spawn(async move {
            // Writers book elsewhere so readers see no churn on their facility.
            let member = engine.enroll_member(Ulid::new()).await.unwrap().id;
            let mut i = 0u64;
            while !stop.load(Ordering::Relaxed) {
                let date = start_date() + Days::new(1000 + i);
                let _ = engine
                    .create_reservation(member, Ulid::new(), date, hour(9), hour(10), None)
                    .await;
                i += 1;
            }
        }));
    }

    let n_readers = 10;
    let reads_per_reader = 500;
    let mut reader_handles = Vec::new();
    for _ in 0..n_readers {
        let engine = engine.clone();
        reader_handles.push(tokio::spawn(async move {
            let mut latencies = Vec::with_capacity(reads_per_reader);
            for _ in 0..reads_per_reader {
                let t = Instant::now();
                let free = engine
                    .free_windows(facility, day, hour(6), hour(22), TimeDelta::minutes(30))
                    .await
                    .unwrap();
                assert_eq!(free.len(), 8);
                latencies.push(t.elapsed());
            }
            latencies
        }));
    }

    let mut all_latencies = Vec::new();
    for h in reader_handles {
        all_latencies.extend(h.await.unwrap());
    }

    stop.store(true, Ordering::Relaxed);
    for h in writer_handles {
        let _ = h.await;
    }

    print_latency("free-window query", &mut all_latencies);
}

async fn phase4_registration_storm(engine: &Arc<Engine>) {
    let n_members = 200;
    let capacity = 50;

    let template = engine
        .create_template(Ulid::new(), Ulid::new(), 6, hour(10), hour(11), capacity)
        .await
        .unwrap();
    engine.materialize(template, 1).await.unwrap();
    let session = engine.template_sessions(template).await.unwrap()[0].session.id;

    let mut members = Vec::with_capacity(n_members);
    for _ in 0..n_members {
        members.push(engine.enroll_member(Ulid::new()).await.unwrap().id);
    }

    let start = Instant::now();
    let registered = Arc::new(AtomicUsize::new(0));
    let full = Arc::new(AtomicUsize::new(0));
    let gave_up = Arc::new(AtomicUsize::new(0));
    let mut handles = Vec::new();
    for member in members {
        let engine = engine.clone();
        let (registered, full, gave_up) = (registered.clone(), full.clone(), gave_up.clone());
        handles.push(tokio::spawn(async move {
            match retry_serializable(100, || engine.create_registration(member, session)).await {
                Ok(_) => registered.fetch_add(1, Ordering::Relaxed),
                Err(EngineError::CapacityExceeded { .. }) => full.fetch_add(1, Ordering::Relaxed),
                Err(e) if e.is_retryable() => gave_up.fetch_add(1, Ordering::Relaxed),
                Err(e) => panic!("registration failed: {e}"),
            };
        }));
    }
    for h in handles {
        h.await.unwrap();
    }

    let registered = registered.load(Ordering::Relaxed);
    println!(
        "  {n_members} members for {capacity} seats: {registered} registered, {} turned away, {} gave up in {:.2}s",
        full.load(Ordering::Relaxed),
        gave_up.load(Ordering::Relaxed),
        start.elapsed().as_secs_f64()
    );
    assert!(registered <= capacity as usize, "session overbooked");
}

#[tokio::main]
async fn main() {
    slotguard::observability::init_tracing();
    let config = Config::from_env();
    if let Err(e) = slotguard::observability::init(config.metrics_port) {
        eprintln!("metrics exporter not installed: {e}");
    }
    let durable = std::env::var("SLOTGUARD_BENCH_DURABLE").is_ok();

    println!("=== slotguard stress benchmark ===");
    let store = if durable {
        let path = config.data_dir.join(format!("bench_{}.wal", Ulid::new()));
        println!("store: WAL at {}\n", path.display());
        MemoryStore::open(&path).expect("failed to open WAL")
    } else {
        println!("store: in-memory\n");
        MemoryStore::ephemeral()
    };
    let engine = engine(store);

    println!("[phase 1] sequential reservation throughput");
    phase1_sequential(&engine).await;

    println!("\n[phase 2] concurrent reservation throughput");
    phase2_concurrent(&engine).await;

    println!("\n[phase 3] read latency under write load");
    phase3_read_under_load(&engine).await;

    println!("\n[phase 4] registration storm");
    phase4_registration_storm(&engine).await;

    println!("\n=== benchmark complete ===");
}

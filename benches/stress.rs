//! In-process stress run: hammer one engine with concurrent booking traffic
//! and print latency percentiles. Run with `cargo bench --bench stress`.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use slotbook::engine::{Engine, EngineConfig};
use slotbook::model::{Ms, now_ms};
use slotbook::notify::ChannelNotifier;

const H: Ms = 3_600_000;
const CLIENTS: usize = 200;
const SLOTS: usize = 2_000;
const OPS_PER_CLIENT: usize = 50;

fn percentile(sorted: &[Duration], p: f64) -> Duration {
    if sorted.is_empty() {
        return Duration::ZERO;
    }
    let idx = ((sorted.len() - 1) as f64 * p).round() as usize;
    sorted[idx]
}

fn print_latency(label: &str, mut samples: Vec<Duration>) {
    samples.sort();
    println!(
        "{label:<10} n={:<7} p50={:?} p95={:?} p99={:?} max={:?}",
        samples.len(),
        percentile(&samples, 0.50),
        percentile(&samples, 0.95),
        percentile(&samples, 0.99),
        percentile(&samples, 1.0),
    );
}

fn wal_path() -> PathBuf {
    let dir = std::env::temp_dir().join("slotbook_bench");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join("stress.wal");
    let _ = std::fs::remove_file(&path);
    path
}

#[tokio::main(flavor = "multi_thread")]
async fn main() {
    // Uncapped quota so cancels never throttle the run.
    let config = EngineConfig {
        monthly_action_limit: u32::MAX,
        ..EngineConfig::default()
    };
    let engine = Arc::new(
        Engine::new(&wal_path(), Arc::new(ChannelNotifier::new()), config).unwrap(),
    );
    let now = now_ms();

    let service = engine.add_service("Stress", "0", None).await.unwrap();
    let times: Vec<Ms> = (0..SLOTS as Ms).map(|i| now + 48 * H + i * H).collect();
    for chunk in times.chunks(500) {
        let outcome = engine.publish_slots(chunk, now).await.unwrap();
        assert_eq!(outcome.created, chunk.len());
    }
    let slot_ids: Vec<_> = engine
        .list_future_slots(now, Ms::MAX)
        .iter()
        .map(|s| s.id)
        .collect();

    let mut clients = Vec::with_capacity(CLIENTS);
    for i in 0..CLIENTS {
        clients.push(engine.register_client(&format!("bench-{i}")).await.unwrap());
    }

    let started = Instant::now();
    let mut tasks = Vec::with_capacity(CLIENTS);
    for (i, client) in clients.into_iter().enumerate() {
        let engine = engine.clone();
        let slot_ids = slot_ids.clone();
        tasks.push(tokio::spawn(async move {
            let mut reserve_lat = Vec::new();
            let mut cancel_lat = Vec::new();
            let mut conflicts = 0usize;
            for op in 0..OPS_PER_CLIENT {
                // Overlapping slot choices across clients force contention.
                let slot = slot_ids[(i * OPS_PER_CLIENT + op * 7) % slot_ids.len()];
                let t = Instant::now();
                match engine.reserve(slot, client, service, now).await {
                    Ok(info) => {
                        reserve_lat.push(t.elapsed());
                        let t = Instant::now();
                        if engine.cancel(info.id, client, now).await.is_ok() {
                            cancel_lat.push(t.elapsed());
                        }
                    }
                    Err(_) => conflicts += 1,
                }
            }
            (reserve_lat, cancel_lat, conflicts)
        }));
    }

    let mut reserve_lat = Vec::new();
    let mut cancel_lat = Vec::new();
    let mut conflicts = 0usize;
    for task in tasks {
        let (r, c, k) = task.await.unwrap();
        reserve_lat.extend(r);
        cancel_lat.extend(c);
        conflicts += k;
    }

    let total = CLIENTS * OPS_PER_CLIENT;
    let elapsed = started.elapsed();
    println!(
        "{total} ops in {elapsed:?} ({:.0} ops/s), {conflicts} conflicts",
        total as f64 / elapsed.as_secs_f64()
    );
    print_latency("reserve", reserve_lat);
    print_latency("cancel", cancel_lat);
}

use std::sync::Arc;
use std::time::{Duration, Instant};

use slotq::engine::Engine;
use slotq::model::*;
use slotq::notify::NotifyHub;
use ulid::Ulid;

/// 2026-06-01T00:00:00Z
const DAY: Ms = 1_780_272_000_000;

fn bench_engine(name: &str) -> Arc<Engine> {
    let dir = std::env::temp_dir().join(format!("slotq_bench_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).expect("create bench dir");
    Arc::new(Engine::new(dir.join(name), Arc::new(NotifyHub::new())).expect("open engine"))
}

fn percentile(sorted: &[Duration], p: f64) -> Duration {
    if sorted.is_empty() {
        return Duration::ZERO;
    }
    let idx = ((sorted.len() as f64) * p / 100.0) as usize;
    sorted[idx.min(sorted.len() - 1)]
}

fn print_latency(label: &str, latencies: &mut [Duration]) {
    if latencies.is_empty() {
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

async fn phase1_sequential_bookings() {
    let engine = bench_engine("phase1.wal");
    let provider = Ulid::new();
    let slots = engine
        .generate_slots(provider, DAY, DAY + 30 * DAY_MS, 15)
        .await
        .expect("generate");

    let n = slots.len().min(2000);
    let mut latencies = Vec::with_capacity(n);
    let start = Instant::now();
    for slot in &slots[..n] {
        let t = Instant::now();
        engine.book_slot(slot.id, Ulid::new()).await.expect("book");
        latencies.push(t.elapsed());
    }

    let elapsed = start.elapsed();
    let ops = n as f64 / elapsed.as_secs_f64();
    println!("  {n} bookings in {:.2}s = {ops:.0} ops/sec", elapsed.as_secs_f64());
    print_latency("book latency", &mut latencies);
}

async fn phase2_contended_bookings() {
    let engine = bench_engine("phase2.wal");
    let provider = Ulid::new();
    let slots = engine
        .generate_slots(provider, DAY, DAY + DAY_MS, 30)
        .await
        .expect("generate");

    // 20 customers race for every slot of the day.
    let n_customers = 20;
    let start = Instant::now();
    let mut handles = Vec::new();
    for _ in 0..n_customers {
        let engine = engine.clone();
        let ids: Vec<Ulid> = slots.iter().map(|s| s.id).collect();
        handles.push(tokio::spawn(async move {
            let customer = Ulid::new();
            let mut won = 0usize;
            for id in ids {
                if engine.book_slot(id, customer).await.is_ok() {
                    won += 1;
                }
            }
            won
        }));
    }

    let mut won = 0;
    for h in handles {
        won += h.await.expect("booking task");
    }
    let elapsed = start.elapsed();
    println!(
        "  {n_customers} customers x {} slots: {won} bookings won in {:.2}s",
        slots.len(),
        elapsed.as_secs_f64()
    );
    assert_eq!(won, slots.len(), "every slot must have exactly one winner");
}

async fn phase3_queue_churn() {
    let engine = bench_engine("phase3.wal");
    let n_providers = 10;
    let per_provider = 100;

    let start = Instant::now();
    let mut handles = Vec::new();
    for _ in 0..n_providers {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            let provider = Ulid::new();
            let mut latencies = Vec::with_capacity(per_provider * 2);
            for _ in 0..per_provider {
                let t = Instant::now();
                engine
                    .join_queue(provider, Ulid::new())
                    .await
                    .expect("join");
                latencies.push(t.elapsed());
            }
            engine.call_next(provider).await.expect("call next");
            for _ in 0..per_provider {
                let t = Instant::now();
                engine
                    .complete_current_customer(provider)
                    .await
                    .expect("complete");
                latencies.push(t.elapsed());
            }
            latencies
        }));
    }

    let mut all_latencies = Vec::new();
    for h in handles {
        all_latencies.extend(h.await.expect("queue task"));
    }
    let elapsed = start.elapsed();
    let ops = all_latencies.len() as f64 / elapsed.as_secs_f64();
    println!(
        "  {n_providers} providers x {per_provider} customers in {:.2}s = {ops:.0} ops/sec",
        elapsed.as_secs_f64()
    );
    print_latency("queue op latency", &mut all_latencies);
}

async fn phase4_reads_under_load() {
    let engine = bench_engine("phase4.wal");
    let provider = Ulid::new();
    let slots = engine
        .generate_slots(provider, DAY, DAY + 7 * DAY_MS, 15)
        .await
        .expect("generate");

    let stop = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let writer = {
        let engine = engine.clone();
        let stop = stop.clone();
        let ids: Vec<Ulid> = slots.iter().map(|s| s.id).collect();
        tokio::spawn(async move {
            for id in ids {
                if stop.load(std::sync::atomic::Ordering::Relaxed) {
                    break;
                }
                let _ = engine.hold_slot(id, Ulid::new(), 60_000).await;
            }
        })
    };

    let mut latencies = Vec::with_capacity(1000);
    for i in 0..1000 {
        let day = DAY + (i % 7) * DAY_MS;
        let t = Instant::now();
        let listed = engine.get_available_slots(provider, day).await;
        latencies.push(t.elapsed());
        assert_eq!(listed.len(), 96);
    }

    stop.store(true, std::sync::atomic::Ordering::Relaxed);
    let _ = writer.await;
    print_latency("day listing", &mut latencies);
}

#[tokio::main]
async fn main() {
    println!("=== slotq stress benchmark ===\n");

    println!("[phase 1] sequential booking throughput");
    phase1_sequential_bookings().await;

    println!("\n[phase 2] contended bookings");
    phase2_contended_bookings().await;

    println!("\n[phase 3] queue churn");
    phase3_queue_churn().await;

    println!("\n[phase 4] day listing under hold load");
    phase4_reads_under_load().await;

    println!("\n=== benchmark complete ===");
}

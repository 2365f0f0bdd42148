use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use admitq_core::{Priority, SystemClock};
use admitq_infra::{InMemoryJobStore, JobQueue, RateLimiter};

const LEASE: Duration = Duration::from_secs(300);

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .build()
        .expect("runtime")
}

fn queue(capacity: usize) -> JobQueue {
    JobQueue::new(InMemoryJobStore::arc(), SystemClock::arc(), capacity, LEASE)
}

/// Enqueue N jobs spread over the three tiers.
fn bench_enqueue(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("enqueue");
    for size in [100usize, 1_000, 10_000] {
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            b.iter(|| {
                rt.block_on(async {
                    let queue = queue(size);
                    for i in 0..size {
                        let priority = Priority::from_level((i % 3) as u8).unwrap_or(Priority::Low);
                        queue.enqueue(priority, serde_json::json!(i)).await.unwrap();
                    }
                    black_box(queue)
                })
            });
        });
    }
    group.finish();
}

/// Claim and ack every job of a pre-filled queue.
fn bench_claim_ack(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("claim_ack");
    for size in [100usize, 1_000, 10_000] {
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            b.iter_batched(
                || {
                    rt.block_on(async {
                        let queue = queue(size);
                        for i in 0..size {
                            let priority = Priority::from_level((i % 3) as u8).unwrap_or(Priority::Low);
                            queue.enqueue(priority, serde_json::json!(i)).await.unwrap();
                        }
                        queue
                    })
                },
                |queue| {
                    rt.block_on(async {
                        while let Some(job) = queue.dequeue_next().await.unwrap() {
                            let lease = job.lease_id().unwrap();
                            queue.ack(job.id, lease).await.unwrap();
                        }
                    })
                },
                criterion::BatchSize::LargeInput,
            );
        });
    }
    group.finish();
}

fn bench_rate_limiter(c: &mut Criterion) {
    let rt = runtime();
    let limiter = RateLimiter::in_memory(
        admitq_core::RateLimitConfig {
            requests_per_minute: u32::MAX,
            tokens_per_minute: u64::MAX,
        },
        SystemClock::arc(),
    );
    c.bench_function("rate_limiter_try_acquire", |b| {
        b.iter(|| black_box(rt.block_on(limiter.try_acquire(black_box(100))).unwrap()))
    });
}

criterion_group!(benches, bench_enqueue, bench_claim_ack, bench_rate_limiter);
criterion_main!(benches);

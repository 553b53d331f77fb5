//! Benchmark: send scheduling and receive reordering
//!
//! Run: cargo bench -p kaos-vsession --bench bench_session

use std::time::Instant;

use criterion::{black_box, criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion, Throughput};
use kaos_test_support::ChaosMonkey;
use kaos_vsession::{DeliveryMode, Packet, Payload, ReorderBuffer, Scheduler, SeqNum};

fn packets(count: u32) -> Vec<Packet> {
    (0..count)
        .map(|i| Packet::data(SeqNum(i), Payload::new("n", vec![serde_json::json!(i)])))
        .collect()
}

/// Reorder buffer fed a shuffled stream
fn bench_reorder(c: &mut Criterion) {
    let mut group = c.benchmark_group("reorder");
    let count = 10_000u32;
    group.throughput(Throughput::Elements(count as u64));

    let in_order = packets(count);
    let mut shuffled = in_order.clone();
    ChaosMonkey::seeded(42).shuffle(&mut shuffled);

    for (name, input) in [("in-order", &in_order), ("shuffled", &shuffled)] {
        group.bench_with_input(BenchmarkId::new("sequential", name), input, |b, input| {
            b.iter_batched(
                || input.clone(),
                |input| {
                    let mut buffer = ReorderBuffer::new(DeliveryMode::Sequential);
                    let mut out = Vec::with_capacity(input.len());
                    for packet in input {
                        buffer.push(packet, &mut out);
                    }
                    black_box(out.len())
                },
                BatchSize::LargeInput,
            );
        });
    }

    group.bench_with_input(BenchmarkId::new("immediate", "shuffled"), &shuffled, |b, input| {
        b.iter_batched(
            || input.clone(),
            |input| {
                let mut buffer = ReorderBuffer::new(DeliveryMode::Immediate);
                let mut out = Vec::with_capacity(input.len());
                for packet in input {
                    buffer.push(packet, &mut out);
                }
                black_box(out.len())
            },
            BatchSize::LargeInput,
        );
    });

    group.finish();
}

/// Enqueue, dispatch and ack across N connections
fn bench_scheduler(c: &mut Criterion) {
    let mut group = c.benchmark_group("scheduler");
    let count = 10_000u64;
    group.throughput(Throughput::Elements(count));

    for conns in [1u64, 4, 20] {
        group.bench_with_input(BenchmarkId::new("dispatch-ack", conns), &conns, |b, &conns| {
            b.iter(|| {
                let mut scheduler = Scheduler::new();
                for conn in 0..conns {
                    scheduler.add_connection(conn);
                }
                for i in 0..count {
                    scheduler.enqueue(Payload::new("n", vec![serde_json::json!(i)]), None);
                }
                let mut acked = 0u64;
                loop {
                    let dispatched = scheduler.dispatch(Instant::now());
                    if dispatched.is_empty() {
                        break;
                    }
                    for d in dispatched {
                        scheduler.acknowledge(d.conn, d.token);
                        acked += 1;
                    }
                }
                black_box(acked)
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_reorder, bench_scheduler);
criterion_main!(benches);

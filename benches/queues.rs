//! Queue benchmarks.

use corelend::Pid;
use corelend::queue::{AggregateQueue, GrowthPolicy, RingBuffer};
use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};

fn bench_ring_push_take(c: &mut Criterion) {
    let mut group = c.benchmark_group("ring_push_take");

    for capacity in [8, 64, 1024] {
        let mut ring: RingBuffer<u64> = RingBuffer::new(capacity, GrowthPolicy::Fixed);

        group.throughput(Throughput::Elements(capacity as u64));
        group.bench_with_input(BenchmarkId::from_parameter(capacity), &capacity, |b, &n| {
            b.iter(|| {
                for v in 0..n as u64 {
                    ring.push_head(v);
                }
                while let Some(v) = ring.take_tail() {
                    std::hint::black_box(v);
                }
            });
        });
    }

    group.finish();
}

fn bench_pop_ncpus(c: &mut Criterion) {
    let mut group = c.benchmark_group("pop_ncpus");

    for requesters in [4, 32, 256] {
        group.throughput(Throughput::Elements(requesters as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(requesters),
            &requesters,
            |b, &n| {
                b.iter(|| {
                    let mut queue: AggregateQueue<256> = AggregateQueue::new();
                    for i in 0..n {
                        queue.push(Pid::from_raw(i as i32 + 1), (i % 7) as u32 + 1).unwrap();
                    }
                    let (grants, left) = queue.pop_ncpus(n as u32 * 2, n);
                    std::hint::black_box((grants.len(), left));
                });
            },
        );
    }

    group.finish();
}

criterion_group!(benches, bench_ring_push_take, bench_pop_ncpus);
criterion_main!(benches);

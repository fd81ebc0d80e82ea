use aggregator::resolver::DeltaResolver;
use aggregator::store::{AggregateStore, InMemoryAggregateStore};
use chrono::{TimeZone, Utc};
use criterion::{criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion, Throughput};
use rust_decimal::Decimal;
use types::aggregate::{AggregateDelta, BucketWidth};
use types::event::{ChangeEvent, Operation, SequenceToken, TransactionStatus};
use types::ids::{MerchantId, TransactionId};

// INSERT, UPDATE and DELETE of each transaction, spread over `merchants`.
fn build_events(n: usize, merchants: usize) -> Vec<ChangeEvent> {
    let base = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
    let mut events = Vec::with_capacity(n);
    let mut offset = 0u64;
    for i in 0..n {
        let op = match i % 3 {
            0 => Operation::INSERT,
            1 => Operation::UPDATE,
            _ => Operation::DELETE,
        };
        offset += 1;
        events.push(ChangeEvent::new(
            TransactionId::new(format!("t{}", i / 3)),
            op,
            SequenceToken::new(1, offset),
            MerchantId::new(format!("m{}", (i / 3) % merchants)),
            Decimal::new(1_000 + (i as i64 % 500), 2),
            TransactionStatus::SUCCESS,
            base + chrono::Duration::minutes((i / 3) as i64 % 1_440),
        ));
    }
    events
}

fn resolve_all(events: &[ChangeEvent]) -> Vec<AggregateDelta> {
    let mut resolver = DeltaResolver::new(BucketWidth::HOUR, 100_000);
    events
        .iter()
        .flat_map(|e| resolver.resolve(e).deltas)
        .collect()
}

fn bench_resolve(c: &mut Criterion) {
    let mut group = c.benchmark_group("resolve");
    for &n in &[1_000usize, 10_000] {
        let events = build_events(n, 50);
        group.throughput(Throughput::Elements(n as u64));
        group.bench_with_input(BenchmarkId::from_parameter(n), &events, |b, events| {
            b.iter(|| criterion::black_box(resolve_all(events)))
        });
    }
    group.finish();
}

fn bench_apply_batch(c: &mut Criterion) {
    let mut group = c.benchmark_group("apply_batch");
    for &n in &[1_000usize, 10_000] {
        let deltas = resolve_all(&build_events(n, 50));
        group.throughput(Throughput::Elements(deltas.len() as u64));
        group.bench_with_input(BenchmarkId::new("fresh", n), &deltas, |b, deltas| {
            b.iter_batched(
                InMemoryAggregateStore::new,
                |store| criterion::black_box(store.apply_batch(deltas)),
                BatchSize::SmallInput,
            )
        });

        // Redelivery: every delta is gated out.
        let warm = InMemoryAggregateStore::new();
        let _ = warm.apply_batch(&deltas);
        group.bench_with_input(BenchmarkId::new("replay", n), &deltas, |b, deltas| {
            b.iter(|| criterion::black_box(warm.apply_batch(deltas)))
        });
    }
    group.finish();
}

criterion_group!(benches, bench_resolve, bench_apply_batch);
criterion_main!(benches);

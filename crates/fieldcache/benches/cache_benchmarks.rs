//! Benchmarks for fieldcache.

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use fieldcache::{
    field_ids, now_micros, EntityRef, FieldCache, FieldKey, FieldSummaryRequest, ReservedGroup,
    Sample, StaticInventory, SummaryMask, WatchPolicy,
};

const GPUS: u32 = 8;

fn watched_cache(max_keep_samples: i64) -> FieldCache {
    let cache = FieldCache::builder()
        .inventory(Arc::new(StaticInventory::with_devices(GPUS, 0)))
        .build()
        .unwrap();
    let fields = cache
        .create_field_group("bench", &[field_ids::GPU_TEMP, field_ids::POWER_USAGE])
        .unwrap();
    let policy = WatchPolicy::new(1_000_000, 0.0, max_keep_samples).unwrap();
    cache
        .watch(ReservedGroup::AllGpus.into(), fields, policy, None)
        .unwrap();
    cache
}

fn temp(gpu: u32) -> FieldKey {
    FieldKey::new(EntityRef::gpu(gpu), field_ids::GPU_TEMP)
}

fn benchmark_record(c: &mut Criterion) {
    let cache = watched_cache(1_000);
    let key = temp(0);
    let mut t = now_micros();

    c.bench_function("record_single_sample", |b| {
        b.iter(|| {
            t += 1;
            cache
                .record_at(key, Sample::int64(t, black_box(65)), t)
                .unwrap();
        });
    });
}

fn benchmark_latest(c: &mut Criterion) {
    let cache = watched_cache(1_000);
    let base = now_micros();
    for gpu in 0..GPUS {
        for i in 0..1_000 {
            cache
                .record_at(temp(gpu), Sample::int64(base + i, i), base + i)
                .unwrap();
        }
    }
    let keys: Vec<_> = (0..GPUS).map(temp).collect();

    c.bench_function("latest_single_key", |b| {
        b.iter(|| black_box(cache.latest(black_box(temp(3)))));
    });

    c.bench_function("latest_many_8_keys", |b| {
        b.iter(|| black_box(cache.latest_many(black_box(&keys))));
    });
}

fn benchmark_since(c: &mut Criterion) {
    let cache = watched_cache(10_000);
    let base = now_micros();
    for i in 0..10_000 {
        cache
            .record_at(temp(0), Sample::int64(base + i, i), base + i)
            .unwrap();
    }

    c.bench_function("since_half_of_10k_samples", |b| {
        b.iter(|| cache.since(temp(0), black_box(base + 5_000)).count());
    });
}

fn benchmark_summarize(c: &mut Criterion) {
    let cache = watched_cache(10_000);
    let key = FieldKey::new(EntityRef::gpu(0), field_ids::POWER_USAGE);
    let base = now_micros();
    for i in 0..10_000 {
        let t = base + i * 1_000;
        cache
            .record_at(key, Sample::float64(t, 250.0 + (i % 50) as f64), t)
            .unwrap();
    }
    let request = FieldSummaryRequest::new(key, SummaryMask::ALL);

    c.bench_function("summarize_all_kinds_10k_samples", |b| {
        b.iter(|| cache.summarize(black_box(&request)).unwrap());
    });
}

criterion_group!(
    benches,
    benchmark_record,
    benchmark_latest,
    benchmark_since,
    benchmark_summarize,
);
criterion_main!(benches);

//! Record store benchmarks.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use resync_bench::{random_payload, record_keys, rng};
use resync_engine::{Clock, EngineConfig, Record, RecordStore, SyncState, TokioClock};
use resync_storage::{FilePersistence, InMemoryPersistence, Persistence};
use std::sync::Arc;
use tempfile::TempDir;

fn store_over(persistence: Arc<dyn Persistence>) -> RecordStore {
    let clock: Arc<dyn Clock> = Arc::new(TokioClock::new());
    RecordStore::new(&EngineConfig::default(), persistence, clock)
}

/// Benchmark record encoding and decoding.
fn bench_record_codec(c: &mut Criterion) {
    let mut group = c.benchmark_group("record_codec");

    for size in [64, 1024, 16 * 1024].iter() {
        let record = Record {
            key: "progress_1".into(),
            payload: random_payload(&mut rng(), *size),
            version: 1_700_000_000_000,
            sync_state: SyncState::Dirty,
            attempt: 2,
            last_error: Some("transient error: timeout".into()),
            last_updated: 1_700_000_000_000,
        };
        let encoded = record.encode().unwrap();
        group.throughput(Throughput::Bytes(*size as u64));

        group.bench_with_input(BenchmarkId::new("encode", size), &record, |b, record| {
            b.iter(|| black_box(record.encode().unwrap()));
        });
        group.bench_with_input(BenchmarkId::new("decode", size), &encoded, |b, encoded| {
            b.iter(|| black_box(Record::decode(black_box(encoded)).unwrap()));
        });
    }

    group.finish();
}

/// Benchmark puts against the in-memory backend.
fn bench_inmemory_put(c: &mut Criterion) {
    let mut group = c.benchmark_group("store_inmemory_put");

    for size in [64, 1024].iter() {
        group.throughput(Throughput::Bytes(*size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            let store = store_over(Arc::new(InMemoryPersistence::new()));
            let keys = record_keys(1_000);
            let payload = random_payload(&mut rng(), size);
            let mut idx = 0;

            b.iter(|| {
                let record = store.put(&keys[idx], payload.clone()).unwrap();
                idx = (idx + 1) % keys.len();
                black_box(record);
            });
        });
    }

    group.finish();
}

/// Benchmark durable puts against the file backend.
fn bench_file_put(c: &mut Criterion) {
    let mut group = c.benchmark_group("store_file_put");

    // every put syncs a file and its directory
    group.sample_size(20);

    for size in [256, 4096].iter() {
        group.throughput(Throughput::Bytes(*size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            let temp_dir = TempDir::new().unwrap();
            let store = store_over(Arc::new(FilePersistence::open(temp_dir.path()).unwrap()));
            let keys = record_keys(100);
            let payload = random_payload(&mut rng(), size);
            let mut idx = 0;

            b.iter(|| {
                let record = store.put(&keys[idx], payload.clone()).unwrap();
                idx = (idx + 1) % keys.len();
                black_box(record);
            });
        });
    }

    group.finish();
}

/// Benchmark listing every record of a user.
fn bench_list(c: &mut Criterion) {
    let mut group = c.benchmark_group("store_list");

    for count in [100, 1_000].iter() {
        group.throughput(Throughput::Elements(*count as u64));
        group.bench_with_input(BenchmarkId::from_parameter(count), count, |b, &count| {
            let store = store_over(Arc::new(InMemoryPersistence::new()));
            let mut rng = rng();
            for key in record_keys(count) {
                store.put(&key, random_payload(&mut rng, 128)).unwrap();
            }

            b.iter(|| black_box(store.list().unwrap()));
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_record_codec,
    bench_inmemory_put,
    bench_file_put,
    bench_list,
);

criterion_main!(benches);

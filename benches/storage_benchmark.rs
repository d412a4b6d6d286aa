use std::sync::Arc;
use std::time::Duration;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use serde::{Deserialize, Serialize};
use Gigastore::cache::type_dictionary::{FieldKind, PayloadBuilder, TypeDictionary, TypeLayout};
use Gigastore::core::types::TYPE_ID_BASE;
use Gigastore::index::indexer::IndexerFn;
use Gigastore::{Config, Entity, GigaMap, ObjectId, StorageManager, TypeId};

const BLOB: TypeId = TypeId(TYPE_ID_BASE + 2000);

fn start(path: &std::path::Path, channels: usize) -> StorageManager {
    let dictionary = TypeDictionary::new();
    dictionary.register(BLOB, TypeLayout::new("blob", vec![FieldKind::Bytes]));
    let config = Config::new(path)
        .with_channel_count(channels)
        .with_housekeeping(Duration::from_secs(3600), 10_000_000);
    StorageManager::builder(config).type_dictionary(Arc::new(dictionary)).start().unwrap()
}

fn blobs(ids: &[ObjectId], size: usize) -> Vec<Entity> {
    let body = vec![0xAB; size];
    ids.iter().map(|id| Entity::new(*id, BLOB, PayloadBuilder::new().bytes(&body).finish())).collect()
}

/// Benchmark storing batches across different channel counts
fn bench_store(c: &mut Criterion) {
    let mut group = c.benchmark_group("store");
    group.sample_size(10);

    for channels in [1, 2, 4] {
        let dir = tempfile::tempdir().unwrap();
        let storage = start(dir.path(), channels);
        let ids = storage.new_object_ids(1_000).unwrap();
        group.throughput(Throughput::Elements(ids.len() as u64));
        group.bench_with_input(BenchmarkId::new("1000x256B", channels), &ids, |b, ids| {
            b.iter(|| storage.store(blobs(ids, 256)).unwrap());
        });
        storage.shutdown().unwrap();
    }
    group.finish();
}

/// Benchmark loading single entities and batches
fn bench_load(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let storage = start(dir.path(), 4);
    let ids = storage.new_object_ids(10_000).unwrap();
    storage.store(blobs(&ids, 128)).unwrap();

    let mut group = c.benchmark_group("load");
    group.bench_function("single", |b| {
        let mut next = 0;
        b.iter(|| {
            next = (next + 7919) % ids.len();
            storage.load(black_box(ids[next])).unwrap()
        });
    });
    group.bench_function("many_100", |b| {
        b.iter(|| storage.load_many(black_box(&ids[..100])).unwrap().len());
    });
    group.finish();
    storage.shutdown().unwrap();
}

#[derive(Clone, Serialize, Deserialize)]
struct Reading {
    sensor: u32,
    value: i64,
}

/// Benchmark persisting and reloading a GigaMap
fn bench_gigamap_persistence(c: &mut Criterion) {
    let mut group = c.benchmark_group("gigamap_persistence");
    group.sample_size(10);

    let dir = tempfile::tempdir().unwrap();
    let storage = start(dir.path(), 2);
    let map = GigaMap::new();
    map.register_index(IndexerFn::single("sensor", |r: &Reading| r.sensor)).unwrap();
    map.add_all((0..50_000).map(|i| Reading { sensor: i % 64, value: i as i64 })).unwrap();
    let root = map.store(&storage).unwrap();

    group.bench_function("incremental_store", |b| {
        let mut position = 0u64;
        b.iter(|| {
            position = (position + 1021) % 50_000;
            map.update(position, |r| r.value += 1).unwrap();
            map.store(&storage).unwrap()
        });
    });

    group.bench_function("load_50k", |b| {
        b.iter(|| GigaMap::<Reading>::load(&storage, black_box(root)).unwrap().size());
    });

    group.finish();
    storage.shutdown().unwrap();
}

criterion_group!(benches, bench_store, bench_load, bench_gigamap_persistence);
criterion_main!(benches);

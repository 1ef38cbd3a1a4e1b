//! Transaction throughput benchmarks
//!
//! Measures the cost of the persistence protocol for:
//! - logged writes of different sizes, committed one per transaction
//! - allocate/free pairs
//! - copy-on-write list updates and queue round trips
//!
//! Each commit drains at least twice, so results mostly reflect the flush
//! mode and the device behind the region directory.
//!
//! Run with: cargo bench --bench txn_throughput

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use ember_core::{CowArrayList, PersistentQueue, Region, RegionManager, RuntimeConfig};
use rand::Rng;
use std::hint::black_box;
use std::sync::Arc;
use std::time::Duration;

fn setup(name: &str) -> (tempfile::TempDir, RegionManager, Arc<Region>) {
    let dir = tempfile::tempdir().unwrap();
    let manager = RegionManager::new(RuntimeConfig::with_dir(dir.path())).unwrap();
    let region = manager.create_region(name, 64 << 20).unwrap();
    (dir, manager, region)
}

fn bench_logged_write(c: &mut Criterion) {
    let mut group = c.benchmark_group("logged_write");
    group.measurement_time(Duration::from_secs(10));
    let (_dir, _manager, region) = setup("write");
    let block = region.allocate_zeroed(4096).unwrap();

    for size in [8usize, 64, 512, 4096] {
        let mut rng = rand::rng();
        let data: Vec<u8> = (0..size).map(|_| rng.random()).collect();
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, _| {
            b.iter(|| {
                let mut txn = region.begin().unwrap();
                txn.write(block, black_box(&data)).unwrap();
                txn.commit().unwrap();
            });
        });
    }
    group.finish();
}

fn bench_allocate_free(c: &mut Criterion) {
    let mut group = c.benchmark_group("allocate_free");
    group.throughput(Throughput::Elements(1));
    let (_dir, _manager, region) = setup("alloc");

    for size in [32u64, 1024, 65536] {
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            b.iter(|| {
                let offset = region.allocate(black_box(size)).unwrap();
                region.deallocate(offset).unwrap();
            });
        });
    }
    group.finish();
}

fn bench_collections(c: &mut Criterion) {
    let mut group = c.benchmark_group("collections");
    group.throughput(Throughput::Elements(1));
    let (_dir, _manager, region) = setup("collections");

    let list = CowArrayList::create(Arc::clone(&region)).unwrap();
    for i in 0..64 {
        list.append(i).unwrap();
    }
    group.bench_function("list_set_64", |b| {
        let mut i = 0u64;
        b.iter(|| {
            i += 1;
            list.set((i % 64) as usize, black_box(i)).unwrap();
        });
    });
    group.bench_function("list_snapshot_64", |b| {
        b.iter(|| black_box(list.snapshot().unwrap()));
    });

    let queue = PersistentQueue::create(Arc::clone(&region)).unwrap();
    group.bench_function("queue_round_trip", |b| {
        b.iter(|| {
            queue.enqueue(black_box(7)).unwrap();
            black_box(queue.dequeue().unwrap());
        });
    });
    group.finish();
}

criterion_group!(
    benches,
    bench_logged_write,
    bench_allocate_free,
    bench_collections
);
criterion_main!(benches);

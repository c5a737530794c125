use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use proxycache::{Limits, LruStorageMt, LruStorageSt};
use proxystore::{CacheKey, GetFlags, InMemoryStorage, Storage};

fn bench_cached_get(c: &mut Criterion) {
    let mut group = c.benchmark_group("cached_get");
    group.sample_size(50);
    group.throughput(Throughput::Elements(1));

    group.bench_function("get_1kb_st", |b| {
        let mut storage = LruStorageSt::create(InMemoryStorage::new("bench"), Limits::new(1000, 0));
        let data = Bytes::from(vec![b'x'; 1024]);

        for i in 0..100 {
            storage.put_value(CacheKey::from_raw(i), data.clone()).unwrap();
        }

        let mut counter = 0u64;
        b.iter(|| {
            let key = CacheKey::from_raw(counter % 100);
            black_box(storage.get_value(&key, GetFlags::NONE).unwrap());
            counter += 1;
        });
    });

    group.bench_function("get_1kb_mt", |b| {
        let storage = LruStorageMt::create(InMemoryStorage::new("bench"), Limits::new(1000, 0));
        let data = Bytes::from(vec![b'x'; 1024]);

        for i in 0..100 {
            storage.put_value(CacheKey::from_raw(i), data.clone()).unwrap();
        }

        let mut counter = 0u64;
        b.iter(|| {
            let key = CacheKey::from_raw(counter % 100);
            black_box(storage.get_value(&key, GetFlags::NONE).unwrap());
            counter += 1;
        });
    });

    group.finish();
}

fn bench_mixed_50_50(c: &mut Criterion) {
    let mut group = c.benchmark_group("mixed");
    group.sample_size(50);
    group.throughput(Throughput::Elements(1));

    group.bench_function("50_read_50_write_mt", |b| {
        let storage = LruStorageMt::create(InMemoryStorage::new("bench"), Limits::new(1000, 0));
        let data = Bytes::from(vec![b'x'; 1024]);

        for i in 0..100 {
            storage.put_value(CacheKey::from_raw(i), data.clone()).unwrap();
        }

        let mut counter = 0u64;
        b.iter(|| {
            let key = CacheKey::from_raw(counter % 100);
            if counter.is_multiple_of(2) {
                black_box(storage.get_value(&key, GetFlags::NONE).ok());
            } else {
                black_box(storage.put_value(key, data.clone()).ok());
            }
            counter += 1;
        });
    });

    group.finish();
}

fn bench_eviction(c: &mut Criterion) {
    let mut group = c.benchmark_group("eviction");
    group.sample_size(50);
    group.throughput(Throughput::Elements(1));

    group.bench_function("put_1kb_full_cache", |b| {
        // Small cache: every put past the first ten evicts.
        let mut storage = LruStorageSt::create(InMemoryStorage::new("bench"), Limits::new(10, 0));
        let data = Bytes::from(vec![b'x'; 1024]);

        let mut counter = 0u64;
        b.iter(|| {
            black_box(storage.put_value(CacheKey::from_raw(counter), data.clone()).ok());
            counter += 1;
        });
    });

    group.finish();
}

criterion_group!(benches, bench_cached_get, bench_mixed_50_50, bench_eviction);
criterion_main!(benches);

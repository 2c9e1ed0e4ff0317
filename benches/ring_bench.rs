//! Benchmarks for the ring client's hot paths.
//!
//! Run with: cargo bench

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use memcache_ring::selector::wire_key;
use memcache_ring::{CacheValue, KeySelector, ServerSpec};
use serde_json::json;

fn servers(n: usize) -> Vec<ServerSpec> {
    (1..=n)
        .map(|i| ServerSpec::new(format!("10.0.{}.{}", i / 256, i % 256), 11211))
        .collect()
}

/// Benchmark ranking servers for a key.
fn bench_candidates(c: &mut Criterion) {
    let mut group = c.benchmark_group("candidates");

    for num_servers in [3, 10, 50].iter() {
        let selector = KeySelector::new(&servers(*num_servers));

        group.throughput(Throughput::Elements(1));
        group.bench_with_input(
            BenchmarkId::new("rank", num_servers),
            num_servers,
            |b, _| {
                let mut i = 0;
                b.iter(|| {
                    let key = format!("key_{}", i);
                    black_box(selector.candidates(&key));
                    i += 1;
                });
            },
        );
    }

    group.bench_function("build_ring_50", |b| {
        let specs = servers(50);
        b.iter(|| black_box(KeySelector::new(&specs)));
    });

    group.finish();
}

/// Benchmark key hashing and value encoding done before every request.
fn bench_encoding(c: &mut Criterion) {
    let mut group = c.benchmark_group("encoding");

    group.bench_function("wire_key", |b| {
        let mut i = 0;
        b.iter(|| {
            black_box(wire_key(&format!("account:{}:container", i)));
            i += 1;
        });
    });

    let raw = CacheValue::from(vec![b'x'; 4096]);
    group.bench_function("encode_raw_4k", |b| {
        b.iter(|| black_box(raw.encode()));
    });

    let doc = CacheValue::from(json!({
        "status": 200,
        "object_count": 1024,
        "bytes": 1_048_576,
        "meta": {"color": "blue", "owner": "alice"},
    }));
    group.bench_function("encode_json", |b| {
        b.iter(|| black_box(doc.encode()));
    });

    group.finish();
}

criterion_group!(benches, bench_candidates, bench_encoding);
criterion_main!(benches);

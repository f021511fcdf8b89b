//! Benchmarks for the adaptive cache hot paths.
//!
//! Covers the operations the orchestrator issues on every request:
//! - context lookups that hit
//! - inserts that force priority-aware eviction
//! - the background compression sweep

use criterion::{Criterion, criterion_group, criterion_main};
use std::hint::black_box;
use switchboard_core::cache::{AdaptiveCache, CacheConfig, CachePriority, PutOptions};
use tokio::runtime::Runtime;

fn filled_cache(rt: &Runtime, entries: usize) -> AdaptiveCache {
    let cache = AdaptiveCache::new(CacheConfig { max_entries: entries, ..CacheConfig::default() })
        .expect("valid config");
    rt.block_on(async {
        for i in 0..entries {
            let priority = if i % 3 == 0 { CachePriority::Low } else { CachePriority::Normal };
            cache
                .put(format!("context:{i}"), &format!("turn {i}"), PutOptions::with_priority(priority))
                .await
                .expect("put");
        }
    });
    cache
}

fn bench_get_hit(c: &mut Criterion) {
    let rt = Runtime::new().expect("runtime");
    let cache = filled_cache(&rt, 1000);

    c.bench_function("cache_get_hit", |b| {
        b.to_async(&rt).iter(|| async { black_box(cache.get("context:500").await) });
    });
}

fn bench_put_with_eviction(c: &mut Criterion) {
    let rt = Runtime::new().expect("runtime");
    let cache = filled_cache(&rt, 1000);
    let mut next = 0usize;

    c.bench_function("cache_put_evicting", |b| {
        b.to_async(&rt).iter(|| {
            next += 1;
            let key = format!("fresh:{next}");
            let cache = &cache;
            async move { cache.put(key, "value", PutOptions::default()).await.expect("put") }
        });
    });
}

fn bench_compression_sweep(c: &mut Criterion) {
    let rt = Runtime::new().expect("runtime");
    let payload = "previous exchange between user and worker\n".repeat(200);

    c.bench_function("cache_compress_entries_100", |b| {
        b.to_async(&rt).iter(|| async {
            let cache = AdaptiveCache::new(CacheConfig::default()).expect("valid config");
            for i in 0..100 {
                cache.put(format!("big:{i}"), &payload, PutOptions::default()).await.expect("put");
            }
            black_box(cache.compress_entries().await)
        });
    });
}

criterion_group!(benches, bench_get_hit, bench_put_with_eviction, bench_compression_sweep);
criterion_main!(benches);

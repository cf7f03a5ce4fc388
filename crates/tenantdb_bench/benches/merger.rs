//! Transaction merger benchmarks.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use futures::future::join_all;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tenantdb_bench::{open_database, random_document, runtime};
use tenantdb_server::PutDocument;
use tenantdb_storage::{Environment, EnvironmentOptions};

/// Benchmark concurrent submissions merged into shared batches.
fn bench_batched_submit(c: &mut Criterion) {
    let mut group = c.benchmark_group("batched_submit");
    let runtime = runtime();

    for writers in [1usize, 8, 64].iter() {
        group.throughput(Throughput::Elements(*writers as u64));
        group.bench_with_input(BenchmarkId::from_parameter(writers), writers, |b, &writers| {
            let (landlord, db) = open_database(&runtime, "bench");
            let next = AtomicUsize::new(0);
            let data = random_document(256);

            b.to_async(&runtime).iter(|| {
                let puts = (0..writers).map(|_| {
                    let id = format!("docs/{}", next.fetch_add(1, Ordering::Relaxed));
                    let db = Arc::clone(&db);
                    let data = data.clone();
                    async move { db.submit(PutDocument::new(id, black_box(data))).await.unwrap() }
                });
                join_all(puts)
            });

            runtime.block_on(landlord.shutdown()).unwrap();
        });
    }
    group.finish();
}

/// Benchmark the same writes awaited one after another.
fn bench_serial_submit(c: &mut Criterion) {
    let mut group = c.benchmark_group("serial_submit");
    let runtime = runtime();

    for writes in [1usize, 8, 64].iter() {
        group.throughput(Throughput::Elements(*writes as u64));
        group.bench_with_input(BenchmarkId::from_parameter(writes), writes, |b, &writes| {
            let (landlord, db) = open_database(&runtime, "bench");
            let next = AtomicUsize::new(0);
            let data = random_document(256);

            b.to_async(&runtime).iter(|| async {
                for _ in 0..writes {
                    let id = format!("docs/{}", next.fetch_add(1, Ordering::Relaxed));
                    db.submit(PutDocument::new(id, black_box(data.clone()))).await.unwrap();
                }
            });

            runtime.block_on(landlord.shutdown()).unwrap();
        });
    }
    group.finish();
}

/// Baseline: one synchronous storage commit per write, no merger.
fn bench_direct_commit(c: &mut Criterion) {
    let mut group = c.benchmark_group("direct_commit");
    group.throughput(Throughput::Elements(1));

    group.bench_function("single", |b| {
        let options = EnvironmentOptions::new("bench").sync_on_commit(false);
        let env = Environment::open_in_memory(options).unwrap();
        let data = serde_json::to_vec(&random_document(256)).unwrap();
        let mut i = 0u64;

        b.iter(|| {
            let mut tx = env.begin_write().unwrap();
            tx.put("docs", &format!("docs/{i}"), black_box(data.clone()));
            tx.commit().unwrap();
            i += 1;
        });

        env.close().unwrap();
    });
    group.finish();
}

/// Benchmark the cache hit path of the landlord.
fn bench_loaded_lookup(c: &mut Criterion) {
    let runtime = runtime();
    let (landlord, _db) = open_database(&runtime, "bench");

    c.bench_function("loaded_lookup", |b| {
        b.to_async(&runtime)
            .iter(|| async { black_box(landlord.get_or_create("bench").await.unwrap()) });
    });

    runtime.block_on(landlord.shutdown()).unwrap();
}

criterion_group!(
    benches,
    bench_batched_submit,
    bench_serial_submit,
    bench_direct_commit,
    bench_loaded_lookup,
);
criterion_main!(benches);

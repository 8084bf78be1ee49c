//! Local-path microbenchmarks: put/get, atomics, allocator

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use pgas::config::NodeConfig;
use pgas::{Affinity, ClusterConfig, Runtime};
use std::net::TcpListener;
use std::time::Duration;

fn bench_runtime() -> Runtime {
    let port = TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port();

    let config = ClusterConfig {
        local_node_id: 0,
        num_nodes: 1,
        nodes: vec![NodeConfig {
            node_id: 0,
            hostname: "127.0.0.1".to_string(),
            port,
            region_base: 0,
            region_size: 64 << 20,
        }],
        connect_retries: 1,
        connect_timeout: Duration::from_millis(200),
    };
    Runtime::new(config).unwrap()
}

fn bench_local_put_get(c: &mut Criterion) {
    let runtime = bench_runtime();
    let ptr = runtime.alloc(4096, Affinity::Local).unwrap();
    let data = vec![0xA5u8; 4096];
    let mut readback = vec![0u8; 4096];

    let mut group = c.benchmark_group("local_transfer");
    group.throughput(Throughput::Bytes(4096));
    group.bench_function("put_4k", |b| {
        b.iter(|| runtime.put(black_box(ptr), black_box(&data)).unwrap())
    });
    group.bench_function("get_4k", |b| {
        b.iter(|| runtime.get(black_box(&mut readback), black_box(ptr)).unwrap())
    });
    group.finish();
}

fn bench_local_atomics(c: &mut Criterion) {
    let runtime = bench_runtime();
    let ptr = runtime.alloc(8, Affinity::Local).unwrap();
    runtime.put(ptr, &0u64.to_le_bytes()).unwrap();

    c.bench_function("local_fetch_add", |b| {
        b.iter(|| runtime.atomic_fetch_add(black_box(ptr), 1).unwrap())
    });
}

fn bench_alloc_free(c: &mut Criterion) {
    let runtime = bench_runtime();

    c.bench_function("alloc_free_64", |b| {
        b.iter(|| {
            let ptr = runtime.alloc(black_box(64), Affinity::Local).unwrap();
            runtime.free(ptr).unwrap();
        })
    });
}

criterion_group!(
    benches,
    bench_local_put_get,
    bench_local_atomics,
    bench_alloc_free
);
criterion_main!(benches);

use std::time::Duration;

use criterion::{criterion_group, criterion_main, Criterion};
use sealpool::{PoolConfig, PoolPaths, SecurePool};
use tempfile::tempdir;

const KEY: &[u8; 16] = b"0123456789012345";

fn bench_config() -> PoolConfig {
    PoolConfig {
        pool_size: 256 * 1024 * 1024,
        manifest_size: 16 * 1024 * 1024,
        counter_flush_interval: Duration::from_millis(5),
        ..PoolConfig::default()
    }
}

fn object_ops(c: &mut Criterion) {
    let dir = tempdir().expect("tempdir");
    let paths = PoolPaths::derive(dir.path().join("bench.pool"));
    let pool = SecurePool::create(&paths, &bench_config(), KEY).expect("pool create");

    let oid = pool.zalloc(1024).expect("alloc");
    let payload = vec![0x5A_u8; 1024];

    c.bench_function("sobj_write_1k", |b| {
        b.iter(|| pool.write(oid, &payload).expect("write"))
    });

    c.bench_function("sobj_read_1k", |b| {
        b.iter(|| pool.read(oid).expect("read").expect("present"))
    });

    c.bench_function("tx_commit_1k", |b| {
        b.iter(|| {
            let mut tx = pool.tx_begin().expect("begin");
            tx.add_range(oid, 0, 1024).expect("add_range");
            tx.write(oid, &payload).expect("tx write");
            tx.commit().expect("commit");
        })
    });

    c.bench_function("alloc_free_64", |b| {
        b.iter(|| {
            let oid = pool.zalloc(64).expect("alloc");
            pool.free(oid).expect("free");
        })
    });
}

criterion_group!(benches, object_ops);
criterion_main!(benches);

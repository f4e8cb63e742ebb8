use std::time::Duration;

use sealpool::{PoolConfig, PoolPaths, SecurePool};
use tempfile::{tempdir, TempDir};

const KEY: &[u8; 16] = b"0123456789012345";

fn config() -> PoolConfig {
    PoolConfig {
        pool_size: 8 * 1024 * 1024,
        manifest_size: 1024 * 1024,
        ml_file_size: 256 * 1024,
        ml_vol_size: 256 * 1024,
        ulog_capacity: 64 * 1024,
        counter_flush_interval: Duration::from_millis(5),
    }
}

fn fresh_pool() -> (TempDir, PoolPaths, SecurePool) {
    let dir = tempdir().expect("tempdir");
    let paths = PoolPaths::derive(dir.path().join("test.pool"));
    let pool = SecurePool::create(&paths, &config(), KEY).expect("pool create");
    (dir, paths, pool)
}

#[test]
fn crash_after_redo_applied_keeps_the_commit() -> sealpool::Result<()> {
    let (_dir, paths, pool) = fresh_pool();
    let oid = pool.zalloc(128)?;
    pool.write(oid, &[0xAB; 128])?;
    let offset = oid.offset;

    // the pool holds the new ciphertexts, but TX_FINISH was never journaled
    let mut tx = pool.tx_begin()?;
    tx.add_range(oid, 0, 128)?;
    tx.write_part(oid, 0, &[0xFF; 16])?;
    tx.commit_halt_before_finish()?;
    drop(tx);
    pool.simulate_crash();

    // redo wins: recovery finds its first entry applied
    let pool = SecurePool::open(&paths, &config(), KEY)?;
    let data = pool.read(pool.oid(offset))?.expect("object must survive");
    assert!(
        data[..16].iter().all(|b| *b == 0xFF),
        "the committed bytes must survive the crash"
    );
    assert!(data[16..].iter().all(|b| *b == 0xAB));
    pool.close()?;
    Ok(())
}

#[test]
fn crash_before_redo_applied_rolls_back() -> sealpool::Result<()> {
    let (_dir, paths, pool) = fresh_pool();
    let oid = pool.zalloc(128)?;
    pool.write(oid, &[0xAB; 128])?;
    let offset = oid.offset;

    // redo log durable, but no pool byte changed yet
    let mut tx = pool.tx_begin()?;
    tx.add_range(oid, 0, 128)?;
    tx.write_part(oid, 0, &[0xFF; 16])?;
    tx.commit_halt_before_apply()?;
    drop(tx);
    pool.simulate_crash();

    // undo replays: the object reads as if the transaction never happened
    let pool = SecurePool::open(&paths, &config(), KEY)?;
    let data = pool.read(pool.oid(offset))?.expect("object must survive");
    assert!(
        data.iter().all(|b| *b == 0xAB),
        "an unapplied commit must roll back on recovery"
    );
    pool.close()?;
    Ok(())
}

#[test]
fn crash_mid_work_leaves_the_pool_untouched() -> sealpool::Result<()> {
    let (_dir, paths, pool) = fresh_pool();
    let oid = pool.zalloc(64)?;
    pool.write(oid, &[0x44; 64])?;
    let offset = oid.offset;

    let mut tx = pool.tx_begin()?;
    tx.add_range(oid, 0, 64)?;
    tx.write(oid, &[0x99; 64])?;
    // the process dies while the transaction is still in WORK
    std::mem::forget(tx);
    pool.simulate_crash();

    let pool = SecurePool::open(&paths, &config(), KEY)?;
    let data = pool.read(pool.oid(offset))?.unwrap();
    assert!(
        data.iter().all(|b| *b == 0x44),
        "a transaction that never committed must leave no trace"
    );
    pool.close()?;
    Ok(())
}

#[test]
fn recovered_pool_accepts_new_transactions() -> sealpool::Result<()> {
    let (_dir, paths, pool) = fresh_pool();
    let oid = pool.zalloc(64)?;
    pool.write(oid, &[1u8; 64])?;
    let offset = oid.offset;

    let mut tx = pool.tx_begin()?;
    tx.add_range(oid, 0, 64)?;
    tx.write(oid, &[2u8; 64])?;
    tx.commit_halt_before_apply()?;
    drop(tx);
    pool.simulate_crash();

    let pool = SecurePool::open(&paths, &config(), KEY)?;
    let oid = pool.oid(offset);
    let mut tx = pool.tx_begin()?;
    tx.add_range(oid, 0, 64)?;
    tx.write(oid, &[3u8; 64])?;
    tx.commit()?;
    assert!(pool.read(oid)?.unwrap().iter().all(|b| *b == 3));
    drop(tx);
    pool.close()?;

    // and the second recovery boots clean
    let pool = SecurePool::open(&paths, &config(), KEY)?;
    assert!(pool.read(pool.oid(offset))?.unwrap().iter().all(|b| *b == 3));
    pool.close()?;
    Ok(())
}

#[test]
fn double_crash_recovery_is_idempotent() -> sealpool::Result<()> {
    let (_dir, paths, pool) = fresh_pool();
    let oid = pool.zalloc(128)?;
    pool.write(oid, &[0xAB; 128])?;
    let offset = oid.offset;

    let mut tx = pool.tx_begin()?;
    tx.add_range(oid, 0, 128)?;
    tx.write_part(oid, 0, &[0xFF; 32])?;
    tx.commit_halt_before_finish()?;
    drop(tx);
    pool.simulate_crash();

    // first recovery completes the transaction, then crashes again without
    // an orderly shutdown
    let pool = SecurePool::open(&paths, &config(), KEY)?;
    assert!(pool.read(pool.oid(offset))?.unwrap()[..32]
        .iter()
        .all(|b| *b == 0xFF));
    pool.simulate_crash();

    let pool = SecurePool::open(&paths, &config(), KEY)?;
    let data = pool.read(pool.oid(offset))?.unwrap();
    assert!(data[..32].iter().all(|b| *b == 0xFF));
    assert!(data[32..].iter().all(|b| *b == 0xAB));
    pool.close()?;
    Ok(())
}

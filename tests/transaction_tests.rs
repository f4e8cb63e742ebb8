use std::time::Duration;

use sealpool::{Error, PoolConfig, PoolPaths, SecurePool};
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
fn committed_writes_are_visible_and_durable() -> sealpool::Result<()> {
    let (_dir, paths, pool) = fresh_pool();
    let oid = pool.zalloc(128)?;
    pool.write(oid, &[0xAA; 128])?;

    let mut tx = pool.tx_begin()?;
    tx.add_range(oid, 0, 128)?;
    tx.write_part(oid, 0, &[0xFF; 16])?;
    tx.commit()?;

    let data = pool.read(oid)?.unwrap();
    assert!(data[..16].iter().all(|b| *b == 0xFF));
    assert!(data[16..].iter().all(|b| *b == 0xAA));

    let offset = oid.offset;
    drop(tx);
    pool.close()?;
    let pool = SecurePool::open(&paths, &config(), KEY)?;
    let data = pool.read(pool.oid(offset))?.unwrap();
    assert!(data[..16].iter().all(|b| *b == 0xFF));
    assert!(data[16..].iter().all(|b| *b == 0xAA));
    pool.close()?;
    Ok(())
}

#[test]
fn abort_restores_the_snapshot() -> sealpool::Result<()> {
    let (_dir, _paths, pool) = fresh_pool();
    let oid = pool.zalloc(128)?;
    pool.write(oid, &[0xAA; 128])?;

    let mut tx = pool.tx_begin()?;
    tx.add_range(oid, 0, 128)?;
    tx.write_part(oid, 0, &[0xFF; 64])?;
    assert_eq!(
        tx.read(oid)?.unwrap()[0],
        0xFF,
        "a transaction must see its own writes"
    );
    tx.abort()?;

    let data = pool.read(oid)?.unwrap();
    assert!(
        data.iter().all(|b| *b == 0xAA),
        "abort must restore the pre-transaction bytes"
    );
    drop(tx);
    pool.close()?;
    Ok(())
}

#[test]
fn dropping_an_open_transaction_aborts_it() -> sealpool::Result<()> {
    let (_dir, _paths, pool) = fresh_pool();
    let oid = pool.zalloc(64)?;
    pool.write(oid, &[7u8; 64])?;

    {
        let mut tx = pool.tx_begin()?;
        tx.add_range(oid, 0, 64)?;
        tx.write(oid, &[9u8; 64])?;
        // dropped without commit
    }

    assert!(pool.read(oid)?.unwrap().iter().all(|b| *b == 7));
    pool.close()?;
    Ok(())
}

#[test]
fn nested_commit_only_finishes_at_the_outermost() -> sealpool::Result<()> {
    let (_dir, _paths, pool) = fresh_pool();
    let oid = pool.zalloc(64)?;
    pool.write(oid, &[1u8; 64])?;

    let mut tx = pool.tx_begin()?;
    tx.add_range(oid, 0, 64)?;
    tx.write_part(oid, 0, &[2u8; 8])?;

    tx.begin()?;
    tx.write_part(oid, 8, &[3u8; 8])?;
    tx.commit()?; // inner: must not flush anything yet

    tx.write_part(oid, 16, &[4u8; 8])?;
    tx.commit()?; // outermost: everything becomes visible

    let data = pool.read(oid)?.unwrap();
    assert!(data[..8].iter().all(|b| *b == 2));
    assert!(data[8..16].iter().all(|b| *b == 3));
    assert!(data[16..24].iter().all(|b| *b == 4));
    assert!(data[24..].iter().all(|b| *b == 1));
    drop(tx);
    pool.close()?;
    Ok(())
}

#[test]
fn tx_alloc_commits_or_vanishes() -> sealpool::Result<()> {
    let (_dir, paths, pool) = fresh_pool();

    let committed = {
        let mut tx = pool.tx_begin()?;
        let oid = tx.zalloc(64)?;
        tx.write(oid, &[5u8; 64])?;
        tx.commit()?;
        oid
    };
    assert_eq!(pool.read(committed)?.unwrap()[0], 5);

    let aborted = {
        let mut tx = pool.tx_begin()?;
        let oid = tx.zalloc(64)?;
        tx.write(oid, &[6u8; 64])?;
        tx.abort()?;
        oid
    };
    assert!(pool.read(aborted)?.is_none());

    let committed_off = committed.offset;
    pool.close()?;
    let pool = SecurePool::open(&paths, &config(), KEY)?;
    assert_eq!(pool.read(pool.oid(committed_off))?.unwrap()[0], 5);
    pool.close()?;
    Ok(())
}

#[test]
fn tx_free_rolls_back_on_abort() -> sealpool::Result<()> {
    let (_dir, _paths, pool) = fresh_pool();
    let oid = pool.zalloc(64)?;
    pool.write(oid, &[8u8; 64])?;

    {
        let mut tx = pool.tx_begin()?;
        tx.free(oid)?;
        assert!(tx.read(oid)?.is_none(), "freed objects disappear at once");
        tx.abort()?;
    }
    assert_eq!(
        pool.read(oid)?.unwrap()[0],
        8,
        "abort must reinstate the freed object"
    );

    {
        let mut tx = pool.tx_begin()?;
        tx.free(oid)?;
        tx.commit()?;
    }
    assert!(pool.read(oid)?.is_none());
    pool.close()?;
    Ok(())
}

#[test]
fn journaled_value_ops_apply_at_commit() -> sealpool::Result<()> {
    let (_dir, paths, pool) = fresh_pool();
    let oid = pool.zalloc(64)?;

    let mut tx = pool.tx_begin()?;
    tx.log_set(oid, 8, 0xDEAD)?;
    tx.log_or(oid, 16, 0b1111_0000)?;
    tx.commit()?;

    let data = pool.read(oid)?.unwrap();
    assert_eq!(
        u64::from_le_bytes(data[8..16].try_into().unwrap()),
        0xDEAD
    );
    assert_eq!(
        u64::from_le_bytes(data[16..24].try_into().unwrap()),
        0b1111_0000
    );

    let offset = oid.offset;
    drop(tx);
    pool.close()?;
    let pool = SecurePool::open(&paths, &config(), KEY)?;
    let data = pool.read(pool.oid(offset))?.unwrap();
    assert_eq!(u64::from_le_bytes(data[8..16].try_into().unwrap()), 0xDEAD);
    pool.close()?;
    Ok(())
}

#[test]
fn oversized_snapshot_cancels_the_transaction() -> sealpool::Result<()> {
    let (_dir, _paths, pool) = fresh_pool();
    let oid = pool.zalloc(64)?;

    let mut tx = pool.tx_begin()?;
    let result = tx.add_range(oid, 0, sealpool::MAX_ALLOC_SIZE + 1);
    assert!(matches!(result, Err(Error::SnapshotTooLarge(_))));
    // the lane was released by the automatic abort; a new transaction works
    drop(tx);
    let mut tx = pool.tx_begin()?;
    tx.add_range(oid, 0, 64)?;
    tx.commit()?;
    drop(tx);
    pool.close()?;
    Ok(())
}

#[test]
fn out_of_range_snapshot_cancels_the_transaction() -> sealpool::Result<()> {
    let (_dir, _paths, pool) = fresh_pool();
    let oid = pool.zalloc(64)?;

    let mut tx = pool.tx_begin()?;
    let result = tx.add_range(oid, 32, 64);
    assert!(matches!(result, Err(Error::SnapshotOutOfRange { .. })));
    drop(tx);
    pool.close()?;
    Ok(())
}

#[test]
fn overlapping_ranges_snapshot_each_byte_once() -> sealpool::Result<()> {
    let (_dir, _paths, pool) = fresh_pool();
    let oid = pool.zalloc(256)?;
    pool.write(oid, &[0x11; 256])?;

    let mut tx = pool.tx_begin()?;
    tx.add_range(oid, 0, 128)?;
    tx.write_part(oid, 0, &[0x22; 128])?;
    // overlaps the already-snapshotted half; the stored pre-image must not
    // be clobbered with the modified bytes
    tx.add_range(oid, 64, 192)?;
    tx.write_part(oid, 128, &[0x33; 128])?;
    tx.abort()?;

    let data = pool.read(oid)?.unwrap();
    assert!(
        data.iter().all(|b| *b == 0x11),
        "abort must restore the original bytes even after overlapping snapshots"
    );
    drop(tx);
    pool.close()?;
    Ok(())
}

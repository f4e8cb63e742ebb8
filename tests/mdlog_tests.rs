use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::time::Duration;

use sealpool::{Error, PoolConfig, PoolPaths, SecurePool};
use tempfile::tempdir;

const KEY: &[u8; 16] = b"0123456789012345";

fn config() -> PoolConfig {
    PoolConfig {
        pool_size: 8 * 1024 * 1024,
        manifest_size: 1024 * 1024,
        ml_file_size: 256 * 1024,
        ml_vol_size: 256 * 1024,
        ulog_capacity: 16 * 1024,
        counter_flush_interval: Duration::from_millis(5),
    }
}

fn patch_byte(path: &Path, offset: u64) {
    let mut file = OpenOptions::new().read(true).write(true).open(path).unwrap();
    file.seek(SeekFrom::Start(offset)).unwrap();
    let mut byte = [0u8; 1];
    file.read_exact(&mut byte).unwrap();
    file.seek(SeekFrom::Start(offset)).unwrap();
    file.write_all(&[byte[0] ^ 0xFF]).unwrap();
}

#[test]
fn journal_replays_after_a_crash() -> sealpool::Result<()> {
    let dir = tempdir()?;
    let paths = PoolPaths::derive(dir.path().join("test.pool"));
    let pool = SecurePool::create(&paths, &config(), KEY)?;

    let mut offsets = Vec::new();
    for i in 0..5u8 {
        let oid = pool.zalloc(64)?;
        pool.write(oid, &[i + 1; 64])?;
        offsets.push(oid.offset);
    }
    // no orderly close: the journal keeps its chunk chain
    pool.simulate_crash();

    let pool = SecurePool::open(&paths, &config(), KEY)?;
    for (i, off) in offsets.iter().enumerate() {
        let data = pool
            .read(pool.oid(*off))?
            .expect("allocation must survive the crash via the metadata log");
        assert_eq!(data[0], i as u8 + 1);
    }
    pool.close()?;
    Ok(())
}

#[test]
fn tampered_journal_chunk_fails_recovery() {
    let dir = tempdir().unwrap();
    let paths = PoolPaths::derive(dir.path().join("test.pool"));
    let pool = SecurePool::create(&paths, &config(), KEY).unwrap();
    for _ in 0..3 {
        pool.zalloc(64).unwrap();
    }
    pool.simulate_crash();

    // inside the first chunk's ciphertext
    patch_byte(&paths.metadata_log, 30);

    let result = SecurePool::open(&paths, &config(), KEY);
    assert!(
        matches!(result, Err(Error::Corrupted(_))),
        "a tampered metadata-log chunk must abort the mount"
    );
}

#[test]
fn orderly_close_truncates_the_journal() -> sealpool::Result<()> {
    let dir = tempdir()?;
    let paths = PoolPaths::derive(dir.path().join("test.pool"));
    let pool = SecurePool::create(&paths, &config(), KEY)?;
    for _ in 0..3 {
        pool.zalloc(64)?;
    }
    pool.close()?;

    // after a clean shutdown the journal window is empty, so tampering with
    // stale bytes cannot affect the next mount
    patch_byte(&paths.metadata_log, 30);
    let pool = SecurePool::open(&paths, &config(), KEY)?;
    pool.close()?;
    Ok(())
}

#[test]
fn many_small_allocations_cycle_the_ring() -> sealpool::Result<()> {
    let dir = tempdir()?;
    let paths = PoolPaths::derive(dir.path().join("test.pool"));
    let small = PoolConfig {
        ml_file_size: 8 * 1024,
        ml_vol_size: 4 * 1024,
        ..config()
    };
    let pool = SecurePool::create(&paths, &small, KEY)?;
    // enough header journal entries to wrap both the ring and the file
    let mut offsets = Vec::new();
    for _ in 0..200 {
        offsets.push(pool.zalloc(64)?.offset);
    }
    pool.close()?;

    let pool = SecurePool::open(&paths, &small, KEY)?;
    for off in offsets {
        assert!(pool.read(pool.oid(off))?.is_some());
    }
    pool.close()?;
    Ok(())
}

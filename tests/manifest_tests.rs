use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::time::Duration;

use sealpool::{Error, PoolConfig, PoolPaths, SecurePool};
use tempfile::tempdir;

const KEY: &[u8; 16] = b"0123456789012345";

fn tiny_manifest_config() -> PoolConfig {
    PoolConfig {
        pool_size: 8 * 1024 * 1024,
        // small enough that a modest workload crosses the 70% threshold
        manifest_size: 16 * 1024,
        ml_file_size: 256 * 1024,
        ml_vol_size: 256 * 1024,
        ulog_capacity: 4 * 1024,
        counter_flush_interval: Duration::from_millis(5),
    }
}

fn config() -> PoolConfig {
    PoolConfig {
        manifest_size: 1024 * 1024,
        ..tiny_manifest_config()
    }
}

fn patch_byte(path: &Path, offset: u64, xor: u8) {
    let mut file = OpenOptions::new().read(true).write(true).open(path).unwrap();
    file.seek(SeekFrom::Start(offset)).unwrap();
    let mut byte = [0u8; 1];
    file.read_exact(&mut byte).unwrap();
    file.seek(SeekFrom::Start(offset)).unwrap();
    file.write_all(&[byte[0] ^ xor]).unwrap();
}

fn zero_range(path: &Path, offset: u64, len: usize) {
    let mut file = OpenOptions::new().write(true).open(path).unwrap();
    file.seek(SeekFrom::Start(offset)).unwrap();
    file.write_all(&vec![0u8; len]).unwrap();
}

#[test]
fn flipped_slot_byte_fails_the_scan() {
    let dir = tempdir().unwrap();
    let paths = PoolPaths::derive(dir.path().join("test.pool"));
    let pool = SecurePool::create(&paths, &config(), KEY).unwrap();
    let oid = pool.zalloc(64).unwrap();
    pool.write(oid, &[1u8; 64]).unwrap();
    pool.close().unwrap();

    patch_byte(&paths.manifest, 8, 0xFF);

    let result = SecurePool::open(&paths, &config(), KEY);
    assert!(
        matches!(result, Err(Error::Corrupted(_))),
        "a tampered manifest slot must abort the mount"
    );
}

#[test]
fn zeroed_live_slot_fails_the_freshness_check() {
    let dir = tempdir().unwrap();
    let paths = PoolPaths::derive(dir.path().join("test.pool"));
    let pool = SecurePool::create(&paths, &config(), KEY).unwrap();
    let oid = pool.zalloc(64).unwrap();
    pool.write(oid, &[1u8; 64]).unwrap();
    pool.close().unwrap();

    // zeroing a slot in the middle of the live window looks like a
    // truncated manifest; the end counter proves entries are missing
    zero_range(&paths.manifest, 128, 64);

    let result = SecurePool::open(&paths, &config(), KEY);
    assert!(
        matches!(result, Err(Error::Corrupted(_))),
        "a hole in the live window must abort the mount"
    );
}

#[test]
fn compaction_rewrites_and_data_survives() -> sealpool::Result<()> {
    let dir = tempdir()?;
    let paths = PoolPaths::derive(dir.path().join("test.pool"));
    let pool = SecurePool::create(&paths, &tiny_manifest_config(), KEY)?;

    let (start_before, _) = manifest_window(&pool);
    assert_eq!(start_before, 0);

    let mut oids = Vec::new();
    for i in 0..8 {
        let oid = pool.zalloc(64)?;
        pool.write(oid, &[i as u8 + 1; 64])?;
        oids.push(oid);
    }

    // keep appending until the compactor has run and the handover happened
    let mut rounds = 0;
    loop {
        pool.write(oids[0], &[0x42u8; 64])?;
        let (start, _) = manifest_window(&pool);
        if start > 0 && !pool.compaction_pending() {
            break;
        }
        rounds += 1;
        assert!(rounds < 10_000, "compaction never completed");
    }

    let (start, end) = manifest_window(&pool);
    assert!(start > 0, "the start counter must move to n+1");
    assert!(end > start);

    // every object must still verify after the rewrite
    for (i, oid) in oids.iter().enumerate().skip(1) {
        let data = pool.read(*oid)?.expect("object lost in compaction");
        assert_eq!(data[0], i as u8 + 1);
    }
    let offsets: Vec<u64> = oids.iter().map(|o| o.offset).collect();
    pool.close()?;

    // a remount replays the compacted manifest end-to-end
    let pool = SecurePool::open(&paths, &tiny_manifest_config(), KEY)?;
    assert_eq!(pool.read(pool.oid(offsets[0]))?.unwrap()[0], 0x42);
    for (i, off) in offsets.iter().enumerate().skip(1) {
        let data = pool
            .read(pool.oid(*off))?
            .expect("object lost after compacted remount");
        assert_eq!(data[0], i as u8 + 1);
    }
    pool.close()?;
    Ok(())
}

fn manifest_window(pool: &SecurePool) -> (u64, u64) {
    pool.manifest_window()
}

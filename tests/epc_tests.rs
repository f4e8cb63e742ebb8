use std::sync::Arc;
use std::time::{Duration, Instant};

use sealpool::epc::Epc;

fn bytes(n: usize, fill: u8) -> Arc<[u8]> {
    Arc::from(vec![fill; n].into_boxed_slice())
}

#[test]
fn set_lookup_remove() {
    let epc = Epc::new();
    epc.set(0x1000, [7u8; 16], 128);
    assert_eq!(epc.len(), 1);

    let entry = epc.lookup(0x1000).expect("entry must be present");
    assert_eq!(entry.tag, [7u8; 16]);
    assert_eq!(entry.logical_size(), 128);
    assert!(entry.cached.is_none());

    assert!(epc.remove(0x1000));
    assert!(epc.lookup(0x1000).is_none());
    assert_eq!(epc.len(), 0);
}

#[test]
fn lookup_advances_the_epoch_clock() {
    let epc = Epc::new();
    epc.set(0x1000, [1u8; 16], 64);
    let before = epc.curr_epoch();
    epc.lookup(0x1000);
    epc.lookup(0x1000);
    assert_eq!(epc.curr_epoch(), before + 2);
    // peek must not advance it
    epc.peek(0x1000);
    assert_eq!(epc.curr_epoch(), before + 2);
}

#[test]
fn install_cached_is_first_writer_wins() {
    let epc = Epc::new();
    epc.set(0x2000, [1u8; 16], 32);

    let first = epc.install_cached(0x2000, bytes(32, 0xAA)).unwrap();
    assert_eq!(first[0], 0xAA);
    // a racing reader keeps the original copy
    let second = epc.install_cached(0x2000, bytes(32, 0xBB)).unwrap();
    assert_eq!(second[0], 0xAA);
    assert_eq!(epc.cached_bytes(), 32);
}

#[test]
fn force_flush_drops_everything() {
    let epc = Epc::new();
    for i in 0..10u64 {
        let off = 0x1000 + i * 64;
        epc.set(off, [i as u8; 16], 64);
        epc.install_cached(off, bytes(64, i as u8));
    }
    assert_eq!(epc.cached_bytes(), 640);
    epc.force_cache_flush();
    assert_eq!(epc.cached_bytes(), 0);
    assert_eq!(epc.len(), 10, "eviction drops plaintexts, not entries");
}

#[test]
fn evictor_respects_the_minimum_active_epoch() {
    let epc = Epc::new();
    let big = 31 * 1024 * 1024;

    // a cold object big enough to cross the eviction threshold on its own
    epc.set(0x1000, [1u8; 16], big);
    epc.install_cached(0x1000, bytes(big as usize, 1));
    epc.lookup(0x1000);

    // a transaction pins the epoch, then touches a second object
    let pinned = epc.curr_epoch();
    epc.update_lane_epoch(0, pinned);
    epc.set_min_epoch();
    epc.set(0x2000, [2u8; 16], 64);
    epc.install_cached(0x2000, bytes(64, 2));
    epc.lookup(0x2000);

    epc.cache_flush();
    let deadline = Instant::now() + Duration::from_secs(5);
    while epc.peek(0x1000).unwrap().cached.is_some() {
        assert!(Instant::now() < deadline, "evictor never ran");
        std::thread::sleep(Duration::from_millis(10));
    }

    // the entry touched after the transaction began must survive
    assert!(
        epc.peek(0x2000).unwrap().cached.is_some(),
        "entries at or above the minimum active epoch must not be evicted"
    );
}

#[test]
fn min_epoch_falls_back_when_lanes_go_idle() {
    let epc = Epc::new();
    epc.update_lane_epoch(3, 100);
    epc.update_lane_epoch(7, 40);
    epc.set_min_epoch();
    assert_eq!(epc.min_epoch(), 40);

    epc.update_lane_epoch(7, u64::MAX);
    epc.set_min_epoch();
    assert_eq!(epc.min_epoch(), 100);

    epc.update_lane_epoch(3, u64::MAX);
    epc.set_min_epoch();
    assert_eq!(epc.min_epoch(), u64::MAX);
}

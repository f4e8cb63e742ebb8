//! EPC: the in-enclave integrity and freshness cache. Maps every live
//! persistent object's offset to its AEAD tag, size word and an optional
//! cached plaintext. The map is striped; a background evictor drops cached
//! plaintexts that no active transaction can still observe, bounding memory
//! across long transactions.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::thread::{self, JoinHandle};

use crate::aead::Tag;
use crate::constants::{CACHE_FLUSH_THRESHOLD, COMPACTION_MASK_OFF, EPC_STRIPES, NLANES};

/// Per-object record held by the EPC.
#[derive(Clone)]
pub struct EpcEntry {
    /// AEAD tag of the ciphertext at rest
    pub tag: Tag,
    /// Object size with the compaction epoch folded into bits 58..61;
    /// the MSB marks an invalid / in-flight entry
    pub size: u64,
    /// Decrypted object data, populated on read and dropped by the evictor
    pub cached: Option<Arc<[u8]>>,
    /// Global read epoch at last touch
    pub access_epoch: u64,
}

impl EpcEntry {
    /// Object size with compaction and validity bits stripped
    pub fn logical_size(&self) -> u64 {
        self.size & COMPACTION_MASK_OFF
    }
}

struct EvictorState {
    run: bool,
    ended: bool,
}

struct EpcShared {
    stripes: Vec<RwLock<HashMap<u64, EpcEntry>>>,
    count: AtomicUsize,
    curr_epoch: AtomicU64,
    min_epoch: AtomicU64,
    lane_epochs: Vec<AtomicU64>,
    /// Accumulated cached plaintext bytes, gating eviction
    acc_bytes: AtomicI64,
    flushing: AtomicBool,
    wake: Mutex<EvictorState>,
    wake_cv: Condvar,
}

impl EpcShared {
    fn stripe(&self, offset: u64) -> &RwLock<HashMap<u64, EpcEntry>> {
        // fibonacci hashing spreads pool offsets (typically aligned) evenly
        let h = offset.wrapping_mul(0x9E3779B97F4A7C15);
        &self.stripes[(h >> 32) as usize % EPC_STRIPES]
    }

    /// Drops every cached plaintext that predates the minimum active epoch.
    fn sweep(&self) {
        let min = self.min_epoch.load(Ordering::SeqCst);
        for stripe in &self.stripes {
            let mut map = stripe.write().expect("epc stripe poisoned");
            for entry in map.values_mut() {
                if entry.cached.is_some() && entry.access_epoch < min {
                    let freed = entry.logical_size() as i64;
                    entry.cached = None;
                    self.acc_bytes.fetch_sub(freed, Ordering::SeqCst);
                }
            }
        }
    }
}

/// The encrypted-page cache handle; owns the evictor thread.
pub struct Epc {
    shared: Arc<EpcShared>,
    evictor: Mutex<Option<JoinHandle<()>>>,
}

impl Epc {
    pub fn new() -> Self {
        let shared = Arc::new(EpcShared {
            stripes: (0..EPC_STRIPES).map(|_| RwLock::new(HashMap::new())).collect(),
            count: AtomicUsize::new(0),
            curr_epoch: AtomicU64::new(0),
            min_epoch: AtomicU64::new(0),
            // idle lanes hold u64::MAX so min_epoch tracks live lanes only
            lane_epochs: (0..NLANES).map(|_| AtomicU64::new(u64::MAX)).collect(),
            acc_bytes: AtomicI64::new(0),
            flushing: AtomicBool::new(false),
            wake: Mutex::new(EvictorState {
                run: false,
                ended: false,
            }),
            wake_cv: Condvar::new(),
        });

        let evictor_shared = Arc::clone(&shared);
        let evictor = thread::spawn(move || loop {
            {
                let mut state = evictor_shared.wake.lock().expect("evictor lock poisoned");
                while !state.run && !state.ended {
                    state = evictor_shared
                        .wake_cv
                        .wait(state)
                        .expect("evictor lock poisoned");
                }
                if state.ended {
                    return;
                }
                state.run = false;
            }
            evictor_shared.sweep();
            evictor_shared.flushing.store(false, Ordering::SeqCst);
        });

        Self {
            shared,
            evictor: Mutex::new(Some(evictor)),
        }
    }

    /// Inserts or replaces the entry at `offset`. Replacing with an identical
    /// logical size preserves the cached plaintext; a size change drops it.
    pub fn set(&self, offset: u64, tag: Tag, size: u64) {
        let mut map = self.shared.stripe(offset).write().expect("epc stripe poisoned");
        match map.get_mut(&offset) {
            Some(entry) => {
                if entry.logical_size() != (size & COMPACTION_MASK_OFF) {
                    if let Some(_cached) = entry.cached.take() {
                        self.shared
                            .acc_bytes
                            .fetch_sub(entry.logical_size() as i64, Ordering::SeqCst);
                    }
                    entry.size = size;
                }
                entry.tag = tag;
            }
            None => {
                map.insert(
                    offset,
                    EpcEntry {
                        tag,
                        size,
                        cached: None,
                        access_epoch: 0,
                    },
                );
                self.shared.count.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    /// Lookup that stamps the entry with a fresh read epoch.
    pub fn lookup(&self, offset: u64) -> Option<EpcEntry> {
        let mut map = self.shared.stripe(offset).write().expect("epc stripe poisoned");
        let entry = map.get_mut(&offset)?;
        entry.access_epoch = self.shared.curr_epoch.fetch_add(1, Ordering::SeqCst);
        Some(entry.clone())
    }

    /// Lookup without advancing the epoch clock.
    pub fn peek(&self, offset: u64) -> Option<EpcEntry> {
        let map = self.shared.stripe(offset).read().expect("epc stripe poisoned");
        map.get(&offset).cloned()
    }

    /// Installs a decrypted plaintext if none is cached yet; returns the
    /// winner so racing readers share one copy.
    pub fn install_cached(&self, offset: u64, data: Arc<[u8]>) -> Option<Arc<[u8]>> {
        let mut map = self.shared.stripe(offset).write().expect("epc stripe poisoned");
        let entry = map.get_mut(&offset)?;
        match &entry.cached {
            Some(existing) => Some(Arc::clone(existing)),
            None => {
                self.shared
                    .acc_bytes
                    .fetch_add(data.len() as i64, Ordering::SeqCst);
                entry.cached = Some(Arc::clone(&data));
                Some(data)
            }
        }
    }

    /// Replaces the cached plaintext unconditionally (transactional writes
    /// mutate the cache first and flush to the pool at commit).
    pub fn store_cached(&self, offset: u64, data: Arc<[u8]>) -> bool {
        let mut map = self.shared.stripe(offset).write().expect("epc stripe poisoned");
        let Some(entry) = map.get_mut(&offset) else {
            return false;
        };
        let old = entry.cached.take().map(|c| c.len() as i64).unwrap_or(0);
        self.shared
            .acc_bytes
            .fetch_add(data.len() as i64 - old, Ordering::SeqCst);
        entry.cached = Some(data);
        true
    }

    /// Drops the entry and its cached plaintext.
    pub fn remove(&self, offset: u64) -> bool {
        let mut map = self.shared.stripe(offset).write().expect("epc stripe poisoned");
        match map.remove(&offset) {
            Some(entry) => {
                if entry.cached.is_some() {
                    self.shared
                        .acc_bytes
                        .fetch_sub(entry.logical_size() as i64, Ordering::SeqCst);
                }
                self.shared.count.fetch_sub(1, Ordering::SeqCst);
                true
            }
            None => false,
        }
    }

    /// Iterates the whole map under per-stripe exclusive locks.
    pub fn for_each<F: FnMut(u64, &EpcEntry)>(&self, mut f: F) {
        for stripe in &self.shared.stripes {
            let map = stripe.write().expect("epc stripe poisoned");
            for (offset, entry) in map.iter() {
                f(*offset, entry);
            }
        }
    }

    /// Number of live objects tracked.
    pub fn len(&self) -> usize {
        self.shared.count.load(Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Accumulated cached plaintext bytes.
    pub fn cached_bytes(&self) -> i64 {
        self.shared.acc_bytes.load(Ordering::SeqCst)
    }

    pub fn curr_epoch(&self) -> u64 {
        self.shared.curr_epoch.load(Ordering::SeqCst)
    }

    pub fn min_epoch(&self) -> u64 {
        self.shared.min_epoch.load(Ordering::SeqCst)
    }

    /// Publishes a lane's snapshot epoch; `u64::MAX` marks the lane idle.
    pub fn update_lane_epoch(&self, lane: usize, epoch: u64) {
        self.shared.lane_epochs[lane].store(epoch, Ordering::SeqCst);
    }

    /// Recomputes the minimum epoch over all lanes. Unsynchronised by
    /// design: a stale minimum only makes eviction less aggressive.
    pub fn set_min_epoch(&self) {
        let mut min = u64::MAX;
        for lane in &self.shared.lane_epochs {
            min = min.min(lane.load(Ordering::SeqCst));
        }
        self.shared.min_epoch.store(min, Ordering::SeqCst);
    }

    /// Signals the evictor once the cache gauge crosses the threshold.
    pub fn cache_flush(&self) {
        if self.shared.acc_bytes.load(Ordering::SeqCst) > CACHE_FLUSH_THRESHOLD
            && self
                .shared
                .flushing
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
        {
            let mut state = self.shared.wake.lock().expect("evictor lock poisoned");
            state.run = true;
            self.shared.wake_cv.notify_one();
        }
    }

    /// Drops every cached plaintext and resets the gauge.
    pub fn force_cache_flush(&self) {
        for stripe in &self.shared.stripes {
            let mut map = stripe.write().expect("epc stripe poisoned");
            for entry in map.values_mut() {
                entry.cached = None;
            }
        }
        self.shared.acc_bytes.store(0, Ordering::SeqCst);
    }

    /// Stops the evictor thread.
    pub fn close(&self) {
        {
            let mut state = self.shared.wake.lock().expect("evictor lock poisoned");
            state.ended = true;
            self.shared.wake_cv.notify_one();
        }
        if let Some(handle) = self.evictor.lock().expect("evictor handle poisoned").take() {
            let _ = handle.join();
        }
    }
}

impl Default for Epc {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Epc {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replace_with_same_size_preserves_cache() {
        let epc = Epc::new();
        epc.set(0x100, [1u8; 16], 32);
        epc.install_cached(0x100, Arc::from(vec![7u8; 32].into_boxed_slice()));
        epc.set(0x100, [2u8; 16], 32);
        let entry = epc.peek(0x100).unwrap();
        assert!(entry.cached.is_some());
        assert_eq!(entry.tag, [2u8; 16]);
    }

    #[test]
    fn replace_with_new_size_drops_cache() {
        let epc = Epc::new();
        epc.set(0x100, [1u8; 16], 32);
        epc.install_cached(0x100, Arc::from(vec![7u8; 32].into_boxed_slice()));
        epc.set(0x100, [2u8; 16], 64);
        let entry = epc.peek(0x100).unwrap();
        assert!(entry.cached.is_none());
        assert_eq!(entry.logical_size(), 64);
        assert_eq!(epc.cached_bytes(), 0);
    }

    #[test]
    fn min_epoch_ignores_idle_lanes() {
        let epc = Epc::new();
        epc.update_lane_epoch(0, 5);
        epc.update_lane_epoch(1, 9);
        epc.set_min_epoch();
        assert_eq!(epc.min_epoch(), 5);
        epc.update_lane_epoch(0, u64::MAX);
        epc.set_min_epoch();
        assert_eq!(epc.min_epoch(), 9);
    }
}

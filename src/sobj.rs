//! Secure object API: pool create/open/close and the non-transactional
//! object operations. Every persistent-medium read or write routes through
//! the EPC and the manifest, so the trusted view of the pool is always
//! reconstructible from the authenticated journal alone.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::aead::{iv_pair, Aead};
use crate::constants::{
    DEFAULT_COUNTER_FLUSH_INTERVAL_MS, DEFAULT_MANIFEST_SIZE, DEFAULT_ML_FILE_SIZE,
    DEFAULT_ML_VOL_SIZE, DEFAULT_POOL_SIZE, DEFAULT_ULOG_CAPACITY, KEY_SIZE,
    LOGS_PER_LANE, MANIFEST_END_COUNTER_IDX, NLANES, POOL_HEADER_OFF, POOL_HEADER_SIZE,
};
use crate::counters::CounterBank;
use crate::epc::Epc;
use crate::error::{Error, Result};
use crate::manifest::{Manifest, ObjectKind};
use crate::mdlog::MetadataLog;
use crate::pool::PoolFile;
use crate::recovery;
use crate::stats::{StatKind, Stats};
use crate::tx::LaneBank;
use crate::ulog::UlogChain;

/// Persistent object id: the pool uuid and a byte offset inside it.
/// The zero pair denotes "none".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjId {
    pub pool_id: u64,
    pub offset: u64,
}

impl ObjId {
    pub const NONE: ObjId = ObjId {
        pool_id: 0,
        offset: 0,
    };

    pub fn is_none(&self) -> bool {
        self.pool_id == 0 && self.offset == 0
    }
}

/// Config options for a secure pool
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Pool file size in bytes
    pub pool_size: u64,
    /// Initial manifest size; compaction doubles it as needed
    pub manifest_size: u64,
    /// Persistent metadata-log file size
    pub ml_file_size: u64,
    /// Volatile metadata-log ring size
    pub ml_vol_size: u64,
    /// Data capacity of each ulog chain
    pub ulog_capacity: u64,
    /// Interval of the counter writer thread (the emulated stabilization
    /// delay; commits block for at most roughly this long)
    pub counter_flush_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            pool_size: DEFAULT_POOL_SIZE,
            manifest_size: DEFAULT_MANIFEST_SIZE,
            ml_file_size: DEFAULT_ML_FILE_SIZE,
            ml_vol_size: DEFAULT_ML_VOL_SIZE,
            ulog_capacity: DEFAULT_ULOG_CAPACITY,
            counter_flush_interval: Duration::from_millis(DEFAULT_COUNTER_FLUSH_INTERVAL_MS),
        }
    }
}

/// Locations of the pool file and its trusted side files.
#[derive(Debug, Clone)]
pub struct PoolPaths {
    pub pool: PathBuf,
    pub manifest: PathBuf,
    pub counters: PathBuf,
    pub metadata_log: PathBuf,
}

impl PoolPaths {
    /// Derives side-file names next to the pool file.
    pub fn derive(pool: impl Into<PathBuf>) -> Self {
        let pool: PathBuf = pool.into();
        let side = |ext: &str| {
            let mut p = pool.clone().into_os_string();
            p.push(ext);
            PathBuf::from(p)
        };
        Self {
            manifest: side(".manifest"),
            counters: side(".counters"),
            metadata_log: side(".mlog"),
            pool,
        }
    }
}

/// The pool's well-known header object: root binding and heap high-water.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct PoolHeader {
    pub root_off: u64,
    pub root_size: u64,
    pub heap_head: u64,
}

impl PoolHeader {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = vec![0u8; POOL_HEADER_SIZE as usize];
        out[0..8].copy_from_slice(&self.root_off.to_le_bytes());
        out[8..16].copy_from_slice(&self.root_size.to_le_bytes());
        out[16..24].copy_from_slice(&self.heap_head.to_le_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Self {
        Self {
            root_off: u64::from_le_bytes(bytes[0..8].try_into().expect("header word")),
            root_size: u64::from_le_bytes(bytes[8..16].try_into().expect("header word")),
            heap_head: u64::from_le_bytes(bytes[16..24].try_into().expect("header word")),
        }
    }
}

/// Encrypts an object image and publishes it: ciphertext to the pool, tag to
/// the manifest (direct lane) and the EPC. The single write path shared by
/// metadata writes, metadata-log apply and recovery restoration.
pub(crate) fn secure_object_rewrite(
    aead: &Aead,
    pool: &PoolFile,
    manifest: &Manifest,
    offset: u64,
    data: &[u8],
) -> Result<()> {
    let iv = iv_pair(pool.uuid(), offset);
    let (cipher, tag) = aead.encrypt(data, b"", &iv);
    pool.write(offset, &cipher, true);
    manifest.append_object_entry(
        ObjectKind::Undo,
        pool.uuid(),
        offset,
        Some(&tag),
        NLANES as u64,
        data.len() as u64,
        false,
        true,
    )?;
    Ok(())
}

/// The trusted persistent-object store handle. Owns the AEAD context, the
/// counter bank, the EPC, the manifest, the metadata log, the pool mapping
/// and the transaction lanes, together with their background threads.
pub struct SecurePool {
    pub(crate) aead: Arc<Aead>,
    pub(crate) counters: Arc<CounterBank>,
    pub(crate) epc: Arc<Epc>,
    pub(crate) manifest: Manifest,
    pub(crate) ml: MetadataLog,
    pub(crate) pool: PoolFile,
    pub(crate) lanes: LaneBank,
    pub(crate) header: Mutex<PoolHeader>,
    pub(crate) stats: Stats,
}

impl SecurePool {
    /// Creates a fresh pool together with its manifest, counter and
    /// metadata-log files.
    pub fn create(paths: &PoolPaths, config: &PoolConfig, key: &[u8; KEY_SIZE]) -> Result<Self> {
        let aead = Arc::new(Aead::new(key));
        let epc = Arc::new(Epc::new());
        let counters = Arc::new(CounterBank::open(
            &paths.counters,
            config.counter_flush_interval,
        )?);
        let (manifest, _outcome) = Manifest::open(
            &paths.manifest,
            config.manifest_size,
            Arc::clone(&aead),
            Arc::clone(&counters),
            Arc::clone(&epc),
        )?;

        let pool = PoolFile::create(&paths.pool, config.pool_size, config.ulog_capacity)?;
        manifest.set_pool_id(pool.uuid());
        let ml = MetadataLog::open(
            &paths.metadata_log,
            pool.uuid(),
            config.ml_file_size,
            config.ml_vol_size,
            Arc::clone(&aead),
            Arc::clone(&counters),
        )?;

        for lane in 0..NLANES {
            for chain in 0..LOGS_PER_LANE {
                UlogChain::new(lane, chain, &pool).construct(&pool, &aead, &manifest, &counters)?;
            }
        }

        let header = PoolHeader {
            root_off: 0,
            root_size: 0,
            heap_head: pool.heap_base(),
        };
        secure_object_rewrite(&aead, &pool, &manifest, POOL_HEADER_OFF, &header.encode())?;

        let lanes = LaneBank::new(&pool, &aead, &epc)?;
        Ok(Self {
            aead,
            counters,
            epc,
            manifest,
            ml,
            pool,
            lanes,
            header: Mutex::new(header),
            stats: Stats::new(),
        })
    }

    /// Opens an existing pool: replays the manifest into the EPC, runs the
    /// recovery coordinator over unfinished lanes, replays the metadata log
    /// and rebuilds the allocator's view of the heap.
    pub fn open(paths: &PoolPaths, config: &PoolConfig, key: &[u8; KEY_SIZE]) -> Result<Self> {
        let aead = Arc::new(Aead::new(key));
        let epc = Arc::new(Epc::new());
        let counters = Arc::new(CounterBank::open(
            &paths.counters,
            config.counter_flush_interval,
        )?);
        let (manifest, mut outcome) = Manifest::open(
            &paths.manifest,
            config.manifest_size,
            Arc::clone(&aead),
            Arc::clone(&counters),
            Arc::clone(&epc),
        )?;

        let pool = PoolFile::open(&paths.pool, config.ulog_capacity)?;
        manifest.set_pool_id(pool.uuid());
        let ml = MetadataLog::open(
            &paths.metadata_log,
            pool.uuid(),
            config.ml_file_size,
            config.ml_vol_size,
            Arc::clone(&aead),
            Arc::clone(&counters),
        )?;

        for lane in 0..NLANES {
            for chain in 0..LOGS_PER_LANE {
                UlogChain::new(lane, chain, &pool).ensure_counters(&counters);
            }
        }

        if outcome.needs_recovery() {
            recovery::recover(&pool, &aead, &counters, &epc, &manifest, &mut outcome)?;
        }

        {
            let mut apply =
                |off: u64, data: &[u8]| secure_object_rewrite(&aead, &pool, &manifest, off, data);
            ml.apply_rec(&mut apply)?;
        }

        let mut live = Vec::new();
        epc.for_each(|off, entry| {
            if off >= pool.heap_base() {
                live.push((off, entry.logical_size()));
            }
        });
        pool.rebuild_free(live);

        let header_entry = epc
            .peek(POOL_HEADER_OFF)
            .ok_or_else(|| Error::Corrupted("pool header missing from manifest".to_string()))?;
        let cipher = pool.read(POOL_HEADER_OFF, header_entry.logical_size() as usize);
        let iv = iv_pair(pool.uuid(), POOL_HEADER_OFF);
        let plain = aead
            .decrypt(&cipher, &header_entry.tag, b"", &iv)
            .ok_or(Error::TagMismatch {
                pool_id: pool.uuid(),
                offset: POOL_HEADER_OFF,
            })?;
        let header = PoolHeader::decode(&plain);

        let lanes = LaneBank::new(&pool, &aead, &epc)?;
        Ok(Self {
            aead,
            counters,
            epc,
            manifest,
            ml,
            pool,
            lanes,
            header: Mutex::new(header),
            stats: Stats::new(),
        })
    }

    /// The pool uuid (the `pool_id` half of every object id).
    pub fn pool_id(&self) -> u64 {
        self.pool.uuid()
    }

    /// Builds an object id for an offset inside this pool.
    pub fn oid(&self, offset: u64) -> ObjId {
        ObjId {
            pool_id: self.pool.uuid(),
            offset,
        }
    }

    /// Logical size of a live object, if the EPC knows it.
    pub fn object_size(&self, oid: ObjId) -> Option<u64> {
        self.epc.peek(oid.offset).map(|e| e.logical_size())
    }

    /// Reads and verifies an object; `Ok(None)` when the object is unknown.
    pub fn read(&self, oid: ObjId) -> Result<Option<Vec<u8>>> {
        self.stats.measure(StatKind::Read, || {
            let Some(entry) = self.epc.lookup(oid.offset) else {
                return Ok(None);
            };
            let size = entry.logical_size() as usize;
            if let Some(cached) = &entry.cached {
                return Ok(Some(cached.to_vec()));
            }
            let cipher = self.pool.read(oid.offset, size);
            let iv = iv_pair(oid.pool_id, oid.offset);
            let plain = self
                .aead
                .decrypt(&cipher, &entry.tag, b"", &iv)
                .ok_or(Error::TagMismatch {
                    pool_id: oid.pool_id,
                    offset: oid.offset,
                })?;
            Ok(Some(plain))
        })
    }

    /// Like `read`, but installs the plaintext into the EPC cache and
    /// returns the shared copy; racing readers converge on one buffer.
    pub fn direct(&self, oid: ObjId) -> Result<Option<Arc<[u8]>>> {
        self.stats.measure(StatKind::Read, || {
            let Some(entry) = self.epc.lookup(oid.offset) else {
                return Ok(None);
            };
            if let Some(cached) = entry.cached {
                return Ok(Some(cached));
            }
            let size = entry.logical_size() as usize;
            let cipher = self.pool.read(oid.offset, size);
            let iv = iv_pair(oid.pool_id, oid.offset);
            let plain = self
                .aead
                .decrypt(&cipher, &entry.tag, b"", &iv)
                .ok_or(Error::TagMismatch {
                    pool_id: oid.pool_id,
                    offset: oid.offset,
                })?;
            let plain: Arc<[u8]> = Arc::from(plain.into_boxed_slice());
            let winner = self
                .epc
                .install_cached(oid.offset, Arc::clone(&plain))
                .unwrap_or(plain);
            self.epc.cache_flush();
            Ok(Some(winner))
        })
    }

    /// Non-transactional whole-object write.
    pub fn write(&self, oid: ObjId, data: &[u8]) -> Result<()> {
        self.stats.measure(StatKind::Write, || {
            let entry = self
                .epc
                .lookup(oid.offset)
                .ok_or_else(|| Error::Other(format!("no object at {:#x}", oid.offset)))?;
            let size = entry.logical_size() as usize;
            if data.len() != size {
                return Err(Error::Other(format!(
                    "write of {} bytes into an object of {size} bytes",
                    data.len()
                )));
            }
            let iv = iv_pair(oid.pool_id, oid.offset);
            let (cipher, tag) = self.aead.encrypt(data, b"", &iv);
            self.pool.write(oid.offset, &cipher, false);
            self.manifest.append_object_entry(
                ObjectKind::Undo,
                oid.pool_id,
                oid.offset,
                Some(&tag),
                NLANES as u64,
                size as u64,
                false,
                true,
            )?;
            self.pool.flush_range(oid.offset, size);
            if entry.cached.is_some() {
                self.epc
                    .store_cached(oid.offset, Arc::from(data.to_vec().into_boxed_slice()));
            }
            Ok(())
        })
    }

    /// Non-transactional partial write: decrypt, overlay, re-encrypt, and
    /// stream only the touched sub-range back.
    pub fn write_part(&self, oid: ObjId, hoff: u64, data: &[u8]) -> Result<()> {
        self.stats.measure(StatKind::Write, || {
            let entry = self
                .epc
                .lookup(oid.offset)
                .ok_or_else(|| Error::Other(format!("no object at {:#x}", oid.offset)))?;
            let size = entry.logical_size() as usize;
            if hoff as usize + data.len() > size {
                return Err(Error::Other(format!(
                    "partial write [{hoff}; {}) past object of {size} bytes",
                    hoff as usize + data.len()
                )));
            }
            let iv = iv_pair(oid.pool_id, oid.offset);
            let mut plain = match &entry.cached {
                Some(cached) => cached.to_vec(),
                None => {
                    let cipher = self.pool.read(oid.offset, size);
                    self.aead
                        .decrypt(&cipher, &entry.tag, b"", &iv)
                        .ok_or(Error::TagMismatch {
                            pool_id: oid.pool_id,
                            offset: oid.offset,
                        })?
                }
            };
            plain[hoff as usize..hoff as usize + data.len()].copy_from_slice(data);
            let (cipher, tag) = self.aead.encrypt(&plain, b"", &iv);
            self.manifest.append_object_entry(
                ObjectKind::Undo,
                oid.pool_id,
                oid.offset,
                Some(&tag),
                NLANES as u64,
                size as u64,
                false,
                true,
            )?;
            self.pool.write(
                oid.offset + hoff,
                &cipher[hoff as usize..hoff as usize + data.len()],
                true,
            );
            if entry.cached.is_some() {
                self.epc
                    .store_cached(oid.offset, Arc::from(plain.into_boxed_slice()));
            }
            Ok(())
        })
    }

    /// Allocates a zero-initialized object and makes the allocation durable.
    pub fn zalloc(&self, size: u64) -> Result<ObjId> {
        self.stats.measure(StatKind::Alloc, || self.alloc_inner(size))
    }

    /// Allocates an object; contents start zeroed.
    pub fn alloc(&self, size: u64) -> Result<ObjId> {
        self.zalloc(size)
    }

    fn alloc_inner(&self, size: u64) -> Result<ObjId> {
        let resv = self.pool.reserve(size)?;
        secure_object_rewrite(
            &self.aead,
            &self.pool,
            &self.manifest,
            resv.offset,
            &vec![0u8; size as usize],
        )?;
        self.publish_heap_head(resv.offset + resv.size)?;
        Ok(self.oid(resv.offset))
    }

    /// Frees an object: delete marker in the manifest, extent back to the
    /// free list, allocator state through the metadata log.
    pub fn free(&self, oid: ObjId) -> Result<()> {
        self.stats.measure(StatKind::Free, || {
            let entry = self
                .epc
                .lookup(oid.offset)
                .ok_or_else(|| Error::Other(format!("no object at {:#x}", oid.offset)))?;
            self.manifest.append_object_entry(
                ObjectKind::Undo,
                oid.pool_id,
                oid.offset,
                None,
                NLANES as u64,
                0,
                false,
                true,
            )?;
            self.pool.release(oid.offset, entry.logical_size());
            self.publish_heap_head(0)?;
            Ok(())
        })
    }

    /// Reallocates: new extent, contents copied and truncated or
    /// zero-extended, old extent freed.
    pub fn realloc(&self, oid: ObjId, size: u64) -> Result<ObjId> {
        let old = self
            .read(oid)?
            .ok_or_else(|| Error::Other(format!("no object at {:#x}", oid.offset)))?;
        let new_oid = self.zalloc(size)?;
        let mut data = vec![0u8; size as usize];
        let copy = old.len().min(size as usize);
        data[..copy].copy_from_slice(&old[..copy]);
        self.write(new_oid, &data)?;
        self.free(oid)?;
        Ok(new_oid)
    }

    /// Returns the pool's root object, allocating it on first use.
    pub fn root(&self, size: u64) -> Result<ObjId> {
        {
            let header = self.header.lock().expect("pool header poisoned");
            if header.root_off != 0 {
                return Ok(self.oid(header.root_off));
            }
        }
        let oid = self.zalloc(size)?;
        let encoded = {
            let mut header = self.header.lock().expect("pool header poisoned");
            header.root_off = oid.offset;
            header.root_size = size;
            header.encode()
        };
        secure_object_rewrite(&self.aead, &self.pool, &self.manifest, POOL_HEADER_OFF, &encoded)?;
        Ok(oid)
    }

    /// Journals the heap high-water through the metadata log and applies the
    /// batch, keeping the post-allocation EPC state consistent with the pool.
    fn publish_heap_head(&self, candidate: u64) -> Result<()> {
        let encoded = {
            let mut header = self.header.lock().expect("pool header poisoned");
            header.heap_head = header.heap_head.max(candidate);
            header.encode()
        };
        self.stats.measure(StatKind::MlPersist, || {
            let mut apply = |off: u64, data: &[u8]| {
                secure_object_rewrite(&self.aead, &self.pool, &self.manifest, off, data)
            };
            self.ml.append(POOL_HEADER_OFF, &encoded, &mut apply)?;
            self.ml.persist(None, &mut apply)?;
            self.ml.apply_rt(&mut apply)
        })
    }

    /// Secure metadata write for allocator-internal objects:
    /// encrypt, optionally copy to the pool, then manifest + EPC.
    pub fn metadata_write(&self, offset: u64, data: &[u8], copy: bool, persist: bool) -> Result<()> {
        let iv = iv_pair(self.pool.uuid(), offset);
        let (cipher, tag) = self.aead.encrypt(data, b"", &iv);
        if copy {
            self.pool.write(offset, &cipher, persist);
        }
        self.manifest.append_object_entry(
            ObjectKind::Undo,
            self.pool.uuid(),
            offset,
            Some(&tag),
            NLANES as u64,
            data.len() as u64,
            false,
            true,
        )?;
        Ok(())
    }

    /// Partial metadata write: the object's logical size is unchanged; only
    /// `[copy_offset, copy_offset + copy_size)` of the fresh ciphertext is
    /// streamed to the pool.
    pub fn metadata_write_part(
        &self,
        offset: u64,
        data: &[u8],
        copy_offset: u64,
        copy_size: usize,
        persist: bool,
    ) -> Result<()> {
        let iv = iv_pair(self.pool.uuid(), offset);
        let (cipher, tag) = self.aead.encrypt(data, b"", &iv);
        self.pool.write(
            offset + copy_offset,
            &cipher[copy_offset as usize..copy_offset as usize + copy_size],
            persist,
        );
        self.manifest.append_object_entry(
            ObjectKind::Undo,
            self.pool.uuid(),
            offset,
            Some(&tag),
            NLANES as u64,
            data.len() as u64,
            false,
            true,
        )?;
        Ok(())
    }

    /// Atomic 8-byte metadata update: snapshots the pre-write ciphertext
    /// word into the manifest, writes the new word, then appends the
    /// validating entry that clears the snapshot on replay.
    pub fn metadata_write_atomic(&self, offset: u64, value: u64) -> Result<()> {
        let entry = self
            .epc
            .lookup(offset)
            .ok_or_else(|| Error::Other(format!("no object at {offset:#x}")))?;
        if entry.logical_size() != 8 {
            return Err(Error::Other(
                "atomic metadata writes require an 8-byte object".to_string(),
            ));
        }
        let old_word = u64::from_le_bytes(
            self.pool.read(offset, 8).try_into().expect("atomic word"),
        );
        self.manifest
            .append_atomic_snapshot(self.pool.uuid(), offset, 0, old_word)?;
        let iv = iv_pair(self.pool.uuid(), offset);
        let (cipher, tag) = self.aead.encrypt(&value.to_le_bytes(), b"", &iv);
        self.pool.write(offset, &cipher, true);
        self.manifest.append_object_entry(
            ObjectKind::Atomic,
            self.pool.uuid(),
            offset,
            Some(&tag),
            NLANES as u64,
            8,
            false,
            true,
        )?;
        Ok(())
    }

    /// Number of live objects the EPC tracks.
    pub fn live_objects(&self) -> usize {
        self.epc.len()
    }

    /// Current manifest freshness window `(start, end)`.
    pub fn manifest_window(&self) -> (u64, u64) {
        self.manifest.counter_window()
    }

    /// Whether a manifest compaction cycle is in flight or awaiting its
    /// handover.
    pub fn compaction_pending(&self) -> bool {
        self.manifest.compaction_pending()
    }

    /// Operation statistics as JSON.
    pub fn stats_json(&self) -> serde_json::Value {
        self.stats.to_json()
    }

    pub(crate) fn stats(&self) -> &Stats {
        &self.stats
    }

    /// Orderly shutdown: drain and invalidate the metadata log, wait for
    /// counter stability, stop every background thread, flush the counters.
    pub fn close(self) -> Result<()> {
        {
            let mut apply = |off: u64, data: &[u8]| {
                secure_object_rewrite(&self.aead, &self.pool, &self.manifest, off, data)
            };
            self.ml.close(&mut apply)?;
        }
        let end = self.counters.get(MANIFEST_END_COUNTER_IDX);
        self.counters.wait_stable(MANIFEST_END_COUNTER_IDX, end);
        self.manifest.close();
        self.epc.close();
        self.counters.persist_all();
        self.counters.close();
        Ok(())
    }

    /// Test aid: tears the pool down the way a crash would. Counters get one
    /// final flush (the writer thread would have done that within its
    /// interval anyway); the metadata log is neither persisted nor applied
    /// and the manifest is not finalized.
    pub fn simulate_crash(self) {
        self.counters.persist_all();
        self.manifest.close();
        self.epc.close();
        self.counters.close();
    }
}

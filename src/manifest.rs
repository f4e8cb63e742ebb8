//! Manifest: the append-only, counter-bound, authenticated journal of every
//! EPC-mutating event. Each 64-byte slot holds an encrypted typed record and
//! its trusted counter value; the half-open counter window
//! `[start, end)` is the only oracle for which slots are alive. A background
//! compactor rewrites the manifest in place once it crosses the occupancy
//! threshold.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};

use memmap2::MmapMut;

use crate::aead::{iv_pair, Aead, Tag};
use crate::constants::{
    compaction_mask, COMPACTION_THRESHOLD, ENTRY_DATA_SIZE, ENTRY_ENCRYPTED_DATA_SIZE,
    ENTRY_INVALID_MASK,
    ENTRY_LANE_MASK, ENTRY_LANE_SHIFT, ENTRY_OBJ_SIZE_MASK_OFF, ENTRY_TYPE_MASK,
    ENTRY_TYPE_MASK_OFF, ENTRY_TYPE_SHIFT, MANIFEST_END_COUNTER_IDX, MANIFEST_ENTRY_SIZE,
    MANIFEST_START_COUNTER_IDX, NLANES, TAG_SIZE,
};
use crate::counters::CounterBank;
use crate::epc::Epc;
use crate::error::{Error, Result};

// typed payload plus the appended counter is exactly the encrypted region
const _: () = assert!(ENTRY_DATA_SIZE + 8 == ENTRY_ENCRYPTED_DATA_SIZE);

const TYPE_UNDO_OBJECT: u64 = 0b001 << ENTRY_TYPE_SHIFT;
const TYPE_REDO_OBJECT: u64 = 0b010 << ENTRY_TYPE_SHIFT;
const TYPE_ULOG_OBJECT: u64 = 0b011 << ENTRY_TYPE_SHIFT;
const TYPE_ATOMIC_OBJECT: u64 = 0b100 << ENTRY_TYPE_SHIFT;
const TYPE_TX_INFO: u64 = 0b101 << ENTRY_TYPE_SHIFT;

/// Which path last changed an object's hash
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    Undo,
    Redo,
    Ulog,
    Atomic,
}

impl ObjectKind {
    fn type_bits(self) -> u64 {
        match self {
            ObjectKind::Undo => TYPE_UNDO_OBJECT,
            ObjectKind::Redo => TYPE_REDO_OBJECT,
            ObjectKind::Ulog => TYPE_ULOG_OBJECT,
            ObjectKind::Atomic => TYPE_ATOMIC_OBJECT,
        }
    }
}

/// Transaction lifecycle markers carried by TX_INFO entries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxStage {
    Start,
    Commit,
    Abort,
    RecRedo,
    RecUndo,
    Finish,
    UlogHdrUpdate,
}

impl TxStage {
    fn code(self) -> u64 {
        match self {
            TxStage::Start => 0,
            TxStage::Commit => 1,
            TxStage::Abort => 2,
            TxStage::RecRedo => 3,
            TxStage::RecUndo => 4,
            TxStage::Finish => 5,
            TxStage::UlogHdrUpdate => 6,
        }
    }

    fn from_code(code: u64) -> Option<Self> {
        Some(match code {
            0 => TxStage::Start,
            1 => TxStage::Commit,
            2 => TxStage::Abort,
            3 => TxStage::RecRedo,
            4 => TxStage::RecUndo,
            5 => TxStage::Finish,
            6 => TxStage::UlogHdrUpdate,
            _ => return None,
        })
    }
}

/// Decoded manifest record. Word 3 always carries the entry type in its top
/// three bits, matching the on-media packing.
#[derive(Debug, Clone)]
enum Record {
    Object {
        kind: ObjectKind,
        pool_id: u64,
        offset: u64,
        tag: Tag,
        /// size with lane (bits 52..57) and invalid (bit 63) folded in
        size_field: u64,
    },
    TxInfo {
        pool_id: u64,
        lane: u64,
        stage: TxStage,
    },
    AtomicSnapshot {
        pool_id: u64,
        offset: u64,
        old_data: u64,
        internal_offset: u64,
    },
}

impl Record {
    fn encode(&self, tcv: u64) -> [u8; ENTRY_ENCRYPTED_DATA_SIZE] {
        let words: [u64; 5] = match self {
            Record::Object {
                kind,
                pool_id,
                offset,
                tag,
                size_field,
            } => [
                u64::from_le_bytes(tag[..8].try_into().expect("tag half")),
                u64::from_le_bytes(tag[8..].try_into().expect("tag half")),
                *pool_id,
                offset | kind.type_bits(),
                *size_field,
            ],
            Record::TxInfo {
                pool_id,
                lane,
                stage,
            } => [*pool_id, *lane, stage.code(), TYPE_TX_INFO, 0],
            Record::AtomicSnapshot {
                pool_id,
                offset,
                old_data,
                internal_offset,
            } => [
                *pool_id,
                *offset,
                *old_data,
                internal_offset | TYPE_ATOMIC_OBJECT,
                ENTRY_INVALID_MASK,
            ],
        };
        let mut out = [0u8; ENTRY_ENCRYPTED_DATA_SIZE];
        for (i, w) in words.iter().enumerate() {
            out[i * 8..i * 8 + 8].copy_from_slice(&w.to_le_bytes());
        }
        out[40..48].copy_from_slice(&tcv.to_le_bytes());
        out
    }

    fn decode(bytes: &[u8]) -> Result<(Record, u64)> {
        let mut words = [0u64; 5];
        for (i, w) in words.iter_mut().enumerate() {
            *w = u64::from_le_bytes(bytes[i * 8..i * 8 + 8].try_into().expect("record word"));
        }
        let tcv = u64::from_le_bytes(bytes[40..48].try_into().expect("record word"));
        let type_bits = words[3] & ENTRY_TYPE_MASK;
        let record = match type_bits {
            TYPE_TX_INFO => Record::TxInfo {
                pool_id: words[0],
                lane: words[1],
                stage: TxStage::from_code(words[2]).ok_or_else(|| {
                    Error::Corrupted(format!("unknown tx stage {}", words[2]))
                })?,
            },
            TYPE_ATOMIC_OBJECT if (words[4] & ENTRY_INVALID_MASK) != 0 => Record::AtomicSnapshot {
                pool_id: words[0],
                offset: words[1],
                old_data: words[2],
                internal_offset: words[3] & ENTRY_TYPE_MASK_OFF,
            },
            TYPE_UNDO_OBJECT | TYPE_REDO_OBJECT | TYPE_ULOG_OBJECT | TYPE_ATOMIC_OBJECT => {
                let kind = match type_bits {
                    TYPE_UNDO_OBJECT => ObjectKind::Undo,
                    TYPE_REDO_OBJECT => ObjectKind::Redo,
                    TYPE_ULOG_OBJECT => ObjectKind::Ulog,
                    _ => ObjectKind::Atomic,
                };
                let mut tag = [0u8; TAG_SIZE];
                tag[..8].copy_from_slice(&words[0].to_le_bytes());
                tag[8..].copy_from_slice(&words[1].to_le_bytes());
                Record::Object {
                    kind,
                    pool_id: words[2],
                    offset: words[3] & ENTRY_TYPE_MASK_OFF,
                    tag,
                    size_field: words[4],
                }
            }
            _ => {
                return Err(Error::Corrupted(format!(
                    "unknown manifest entry type {type_bits:#x}"
                )))
            }
        };
        Ok((record, tcv))
    }
}

/// Entry buffered in a per-lane temp list during scan.
#[derive(Debug, Clone)]
pub(crate) struct TempEntry {
    pub pool_id: u64,
    pub offset: u64,
    pub tag: Tag,
    pub size: u64,
}

/// Insertion-ordered list of pending EPC updates for one lane; a later entry
/// for the same object replaces the earlier one in place.
#[derive(Debug, Default)]
pub(crate) struct TempList {
    entries: Vec<TempEntry>,
}

impl TempList {
    pub fn add_replace(&mut self, entry: TempEntry) {
        for existing in &mut self.entries {
            if existing.offset == entry.offset && existing.pool_id == entry.pool_id {
                *existing = entry;
                return;
            }
        }
        self.entries.push(entry);
    }

    pub fn discard(&mut self) {
        self.entries.clear();
    }

    pub fn find(&self, pool_id: u64, offset: u64) -> Option<&TempEntry> {
        self.entries
            .iter()
            .find(|e| e.offset == offset && e.pool_id == pool_id)
    }

    pub fn drain(&mut self) -> Vec<TempEntry> {
        std::mem::take(&mut self.entries)
    }

    pub fn entries(&self) -> &[TempEntry] {
        &self.entries
    }
}

/// Outstanding 8-byte atomic snapshot found during scan.
#[derive(Debug, Clone)]
pub(crate) struct SnapshotEntry {
    pub pool_id: u64,
    pub offset: u64,
    pub old_data: u64,
    pub internal_offset: u64,
}

/// Lane state reconstructed from TX_INFO entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TxRecState {
    Idle,
    Started,
    Committed,
}

/// Everything the recovery coordinator needs after a scan.
pub(crate) struct ScanOutcome {
    pub unfinished: Vec<TxRecState>,
    pub temp_undo: Vec<TempList>,
    pub temp_redo: Vec<TempList>,
    pub temp_ulog: Vec<TempList>,
    pub atomic_snapshots: Vec<SnapshotEntry>,
}

impl ScanOutcome {
    fn new() -> Self {
        Self {
            unfinished: vec![TxRecState::Idle; NLANES],
            temp_undo: (0..NLANES).map(|_| TempList::default()).collect(),
            temp_redo: (0..NLANES).map(|_| TempList::default()).collect(),
            temp_ulog: (0..NLANES).map(|_| TempList::default()).collect(),
            atomic_snapshots: Vec::new(),
        }
    }

    pub fn needs_recovery(&self) -> bool {
        self.unfinished.iter().any(|s| *s != TxRecState::Idle)
            || !self.atomic_snapshots.is_empty()
    }
}

struct Core {
    map: MmapMut,
    size: u64,
    /// Counter value whose record occupies slot zero of the current file
    offset_cnt: u64,
}

struct NewManifest {
    map: MmapMut,
    path: PathBuf,
    size: u64,
    /// First counter value of the new file
    starting_cnt: u64,
    /// Next free slot; starts at the survivor count k
    cursor: u64,
}

struct CompRequest {
    trigger: bool,
    ended: bool,
    starting_cnt: u64,
    old_size: u64,
}

struct ManifestShared {
    path: PathBuf,
    aead: Arc<Aead>,
    counters: Arc<CounterBank>,
    epc: Arc<Epc>,
    core: Mutex<Core>,
    new_m: Mutex<Option<NewManifest>>,
    new_cv: Condvar,
    comp: Mutex<CompRequest>,
    comp_cv: Condvar,
    active_tx: AtomicI64,
    compaction_active: AtomicBool,
    compaction_finished: AtomicBool,
    compaction_number: AtomicU64,
    serial_no: AtomicU64,
    pool_id: AtomicU64,
}

impl ManifestShared {
    fn encrypt_slot(&self, record: &Record, tcv: u64, slot_off: u64, map: &mut MmapMut) {
        let payload = record.encode(tcv);
        let iv = iv_pair(0, slot_off);
        let (cipher, tag) = self.aead.encrypt(&payload, b"", &iv);
        let base = slot_off as usize;
        map[base..base + ENTRY_ENCRYPTED_DATA_SIZE].copy_from_slice(&cipher);
        map[base + ENTRY_ENCRYPTED_DATA_SIZE..base + MANIFEST_ENTRY_SIZE].copy_from_slice(&tag);
        let _ = map.flush_range(base, MANIFEST_ENTRY_SIZE);
    }

    /// Compactor body: one rewrite cycle per trigger.
    fn compact_once(&self, starting_cnt: u64, old_size: u64) {
        // entries stamped with the new epoch during this cycle are already in
        // the new file via the concurrent-append path
        let epoch = (self.compaction_number.load(Ordering::SeqCst) + 1) & 0xF;
        self.compaction_number.store(epoch, Ordering::SeqCst);

        let new_size = old_size * 2;
        let serial = self.serial_no.fetch_add(1, Ordering::SeqCst);
        let mut new_path = self.path.clone().into_os_string();
        new_path.push(serial.to_string());
        let new_path = PathBuf::from(new_path);

        let file = match OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&new_path)
        {
            Ok(f) => f,
            Err(_) => return,
        };
        if file.set_len(new_size).is_err() {
            return;
        }
        let map = match unsafe { MmapMut::map_mut(&file) } {
            Ok(m) => m,
            Err(_) => return,
        };

        let k = self.epc.len() as u64;
        {
            let mut guard = self.new_m.lock().expect("new manifest lock poisoned");
            *guard = Some(NewManifest {
                map,
                path: new_path,
                size: new_size,
                starting_cnt,
                cursor: k,
            });
            self.new_cv.notify_all();
        }

        // copy survivors: every entry not yet stamped with the new epoch
        let pool_id = self.pool_id.load(Ordering::SeqCst);
        let current_mask = compaction_mask(epoch);
        let mut tcv_temp = starting_cnt;
        let mut copied = 0u64;
        let mut survivors: Vec<(u64, Tag, u64)> = Vec::with_capacity(k as usize);
        self.epc.for_each(|offset, entry| {
            if (entry.size & !crate::constants::COMPACTION_MASK_OFF) != current_mask {
                survivors.push((offset, entry.tag, entry.size));
            }
        });
        for (offset, tag, size) in survivors {
            if copied >= k {
                break;
            }
            let record = Record::Object {
                kind: ObjectKind::Undo,
                pool_id,
                offset,
                tag,
                size_field: (size & ENTRY_OBJ_SIZE_MASK_OFF) | ((NLANES as u64) << ENTRY_LANE_SHIFT),
            };
            let mut guard = self.new_m.lock().expect("new manifest lock poisoned");
            if let Some(nm) = guard.as_mut() {
                self.encrypt_slot(
                    &record,
                    tcv_temp,
                    copied * MANIFEST_ENTRY_SIZE as u64,
                    &mut nm.map,
                );
            }
            tcv_temp += 1;
            copied += 1;
        }
        // pad with dummy entries so the live prefix length equals k; each pad
        // consumes a counter value, keeping the handover arithmetic exact
        for slot in copied..k {
            let record = Record::Object {
                kind: ObjectKind::Undo,
                pool_id: 0,
                offset: 0,
                tag: [0u8; TAG_SIZE],
                size_field: (NLANES as u64) << ENTRY_LANE_SHIFT,
            };
            let mut guard = self.new_m.lock().expect("new manifest lock poisoned");
            if let Some(nm) = guard.as_mut() {
                self.encrypt_slot(
                    &record,
                    tcv_temp,
                    slot * MANIFEST_ENTRY_SIZE as u64,
                    &mut nm.map,
                );
            }
            tcv_temp += 1;
        }

        self.compaction_finished.store(true, Ordering::SeqCst);
    }
}

/// The manifest handle; owns the mapping and the compactor thread.
pub struct Manifest {
    shared: Arc<ManifestShared>,
    compactor: Mutex<Option<JoinHandle<()>>>,
}

impl Manifest {
    /// Opens (or creates) the manifest and replays it into the EPC.
    /// Returns the handle and the scan outcome for the recovery coordinator.
    pub(crate) fn open(
        path: &Path,
        default_size: u64,
        aead: Arc<Aead>,
        counters: Arc<CounterBank>,
        epc: Arc<Epc>,
    ) -> Result<(Self, ScanOutcome)> {
        let size = path.metadata().map(|m| m.len()).unwrap_or(0);
        let fresh_counters = !counters.exists(MANIFEST_END_COUNTER_IDX);
        if fresh_counters {
            counters.create_at(MANIFEST_START_COUNTER_IDX, 0);
            counters.create_at(MANIFEST_END_COUNTER_IDX, 0);
        }
        let size = if size == 0 { default_size } else { size };

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        file.set_len(size)?;
        let map = unsafe { MmapMut::map_mut(&file)? };

        let shared = Arc::new(ManifestShared {
            path: path.to_path_buf(),
            aead,
            counters,
            epc,
            core: Mutex::new(Core {
                map,
                size,
                offset_cnt: 0,
            }),
            new_m: Mutex::new(None),
            new_cv: Condvar::new(),
            comp: Mutex::new(CompRequest {
                trigger: false,
                ended: false,
                starting_cnt: 0,
                old_size: 0,
            }),
            comp_cv: Condvar::new(),
            active_tx: AtomicI64::new(0),
            compaction_active: AtomicBool::new(false),
            compaction_finished: AtomicBool::new(false),
            compaction_number: AtomicU64::new(0),
            serial_no: AtomicU64::new(1),
            pool_id: AtomicU64::new(0),
        });

        let manifest = Self {
            shared: Arc::clone(&shared),
            compactor: Mutex::new(None),
        };

        let outcome = manifest.scan()?;

        let comp_shared = Arc::clone(&shared);
        let handle = thread::spawn(move || loop {
            let (starting_cnt, old_size) = {
                let mut req = comp_shared.comp.lock().expect("compaction lock poisoned");
                while !req.trigger && !req.ended {
                    req = comp_shared
                        .comp_cv
                        .wait(req)
                        .expect("compaction lock poisoned");
                }
                if req.ended {
                    return;
                }
                req.trigger = false;
                (req.starting_cnt, req.old_size)
            };
            comp_shared.compact_once(starting_cnt, old_size);
        });
        *manifest.compactor.lock().expect("compactor handle poisoned") = Some(handle);

        Ok((manifest, outcome))
    }

    /// Binds the manifest to the opened pool's uuid (used by compaction).
    pub fn set_pool_id(&self, pool_id: u64) {
        self.shared.pool_id.store(pool_id, Ordering::SeqCst);
    }

    /// Stores a verified entry in the EPC. A zeroed tag with size zero is the
    /// delete marker and removes the object instead.
    pub(crate) fn store_epc_entry(&self, offset: u64, tag: Option<&Tag>, size: u64) {
        match tag {
            None => {
                self.shared.epc.remove(offset);
            }
            Some(t) if size == 0 && *t == [0u8; TAG_SIZE] => {
                self.shared.epc.remove(offset);
            }
            Some(t) => {
                let epoch = self.shared.compaction_number.load(Ordering::SeqCst);
                self.shared.epc.set(offset, *t, size | compaction_mask(epoch));
            }
        }
    }

    /// Appends an object-hash update. `lane == NLANES` publishes directly to
    /// the EPC on replay; a real lane id routes through the temp lists.
    pub(crate) fn append_object_entry(
        &self,
        kind: ObjectKind,
        pool_id: u64,
        offset: u64,
        tag: Option<&Tag>,
        lane: u64,
        size: u64,
        invalid: bool,
        publish_to_epc: bool,
    ) -> Result<u64> {
        let tag_bytes = tag.copied().unwrap_or([0u8; TAG_SIZE]);
        let mut size_field = size | (lane << ENTRY_LANE_SHIFT);
        if invalid {
            size_field |= ENTRY_INVALID_MASK;
        }
        if publish_to_epc {
            self.store_epc_entry(offset, tag, size);
        }
        self.append(Record::Object {
            kind,
            pool_id,
            offset,
            tag: tag_bytes,
            size_field,
        })
    }

    /// Appends a transaction lifecycle marker.
    pub(crate) fn append_tx_info(&self, pool_id: u64, lane: u64, stage: TxStage) -> Result<u64> {
        match stage {
            TxStage::Start => {
                self.shared.active_tx.fetch_add(1, Ordering::SeqCst);
            }
            TxStage::Finish => {
                self.shared.active_tx.fetch_sub(1, Ordering::SeqCst);
            }
            _ => {}
        }
        self.append(Record::TxInfo {
            pool_id,
            lane,
            stage,
        })
    }

    /// Appends an 8-byte atomic snapshot (pre-write ciphertext word).
    pub(crate) fn append_atomic_snapshot(
        &self,
        pool_id: u64,
        offset: u64,
        internal_offset: u64,
        old_data: u64,
    ) -> Result<u64> {
        self.append(Record::AtomicSnapshot {
            pool_id,
            offset,
            old_data,
            internal_offset,
        })
    }

    /// The single append path. Serialised under the core lock; performs a
    /// pending compaction handover, dual-writes while compaction is active
    /// and raises the compaction trigger when the threshold is crossed.
    fn append(&self, record: Record) -> Result<u64> {
        let shared = &self.shared;
        let mut core = shared.core.lock().expect("manifest core poisoned");

        if shared.compaction_finished.load(Ordering::SeqCst) {
            self.swap(&mut core)?;
        }

        let tcv = shared.counters.inc(MANIFEST_END_COUNTER_IDX);
        let slot_off = (tcv - core.offset_cnt) * MANIFEST_ENTRY_SIZE as u64;
        if slot_off + MANIFEST_ENTRY_SIZE as u64 > core.size {
            return Err(Error::ManifestFull);
        }
        shared.encrypt_slot(&record, tcv, slot_off, &mut core.map);

        // compaction trigger: threshold crossed with no transaction active
        if !shared.compaction_active.load(Ordering::SeqCst)
            && !shared.compaction_finished.load(Ordering::SeqCst)
            && shared.active_tx.load(Ordering::SeqCst) == 0
            && (slot_off as f64) > COMPACTION_THRESHOLD * core.size as f64
        {
            shared.compaction_active.store(true, Ordering::SeqCst);
            let mut req = shared.comp.lock().expect("compaction lock poisoned");
            req.trigger = true;
            req.starting_cnt = tcv + 1;
            req.old_size = core.size;
            shared.comp_cv.notify_one();
        }

        // while compaction runs, the same record also lands in the new file
        if shared.compaction_active.load(Ordering::SeqCst)
            && !shared.compaction_finished.load(Ordering::SeqCst)
        {
            let mut guard = shared.new_m.lock().expect("new manifest lock poisoned");
            while guard.is_none() {
                guard = shared.new_cv.wait(guard).expect("new manifest lock poisoned");
            }
            let nm = guard.as_mut().expect("new manifest mapped");
            let new_tcv = nm.starting_cnt + nm.cursor;
            let new_off = nm.cursor * MANIFEST_ENTRY_SIZE as u64;
            nm.cursor += 1;
            if new_off + MANIFEST_ENTRY_SIZE as u64 <= nm.size {
                shared.encrypt_slot(&record, new_tcv, new_off, &mut nm.map);
            }
        }

        Ok(tcv)
    }

    /// Compaction handover: runs on the first append after the compactor
    /// finishes. The core lock guarantees no other writer is active, which is
    /// the fence the handover needs. Atomicity comes from the counter pair:
    /// a crash leaves either the old window or the new one in effect.
    fn swap(&self, core: &mut MutexGuard<'_, Core>) -> Result<()> {
        let shared = &self.shared;
        let mut guard = shared.new_m.lock().expect("new manifest lock poisoned");
        let Some(nm) = guard.take() else {
            shared.compaction_finished.store(false, Ordering::SeqCst);
            return Ok(());
        };
        drop(guard);

        let end = nm.starting_cnt + nm.cursor;
        core.map = nm.map;
        core.size = nm.size;
        core.offset_cnt = nm.starting_cnt;
        shared.counters.set(MANIFEST_END_COUNTER_IDX, end);
        shared
            .counters
            .set(MANIFEST_START_COUNTER_IDX, nm.starting_cnt);
        std::fs::rename(&nm.path, &shared.path)?;
        shared.compaction_active.store(false, Ordering::SeqCst);
        shared.compaction_finished.store(false, Ordering::SeqCst);
        // the window move must be durable before any new append relies on it
        shared.counters.wait_stable(MANIFEST_END_COUNTER_IDX, end);
        Ok(())
    }

    /// Walks the live slot range, rebuilding the EPC and the per-lane temp
    /// lists. Aborts on any decrypt failure or counter gap.
    fn scan(&self) -> Result<ScanOutcome> {
        let shared = &self.shared;
        let mut core = shared.core.lock().expect("manifest core poisoned");
        let start = shared.counters.get(MANIFEST_START_COUNTER_IDX);
        let end = shared.counters.get(MANIFEST_END_COUNTER_IDX);
        core.offset_cnt = start;

        let mut outcome = ScanOutcome::new();
        let mut expected = start;

        while expected < end {
            let slot_off = ((expected - start) * MANIFEST_ENTRY_SIZE as u64) as usize;
            if slot_off + MANIFEST_ENTRY_SIZE > core.size as usize {
                break;
            }
            let slot = &core.map[slot_off..slot_off + MANIFEST_ENTRY_SIZE];
            if slot.iter().all(|b| *b == 0) {
                break;
            }
            let mut tag = [0u8; TAG_SIZE];
            tag.copy_from_slice(&slot[ENTRY_ENCRYPTED_DATA_SIZE..]);
            let iv = iv_pair(0, slot_off as u64);
            let payload = shared
                .aead
                .decrypt(&slot[..ENTRY_ENCRYPTED_DATA_SIZE], &tag, b"", &iv)
                .ok_or_else(|| Error::Corrupted("corrupted manifest entry".to_string()))?;
            let (record, tcv) = Record::decode(&payload)?;
            if tcv != expected {
                return Err(Error::Corrupted(format!(
                    "manifest counter mismatch: slot holds {tcv}, expected {expected}"
                )));
            }
            self.dispatch(record, &mut outcome);
            expected += 1;
        }

        // the end counter is the value to be appended next; stopping short of
        // it means entries went missing
        if expected < end {
            return Err(Error::Corrupted(
                "manifest freshness check failed".to_string(),
            ));
        }
        Ok(outcome)
    }

    fn dispatch(&self, record: Record, outcome: &mut ScanOutcome) {
        match record {
            Record::Object {
                kind,
                pool_id,
                offset,
                tag,
                size_field,
            } => {
                let lane = ((size_field & ENTRY_LANE_MASK) >> ENTRY_LANE_SHIFT) as usize;
                let size = size_field & ENTRY_OBJ_SIZE_MASK_OFF;
                if kind == ObjectKind::Atomic {
                    // successful atomic update: clear the pending snapshot
                    outcome
                        .atomic_snapshots
                        .retain(|s| !(s.pool_id == pool_id && s.offset == offset));
                    self.store_epc_entry(offset, Some(&tag), size);
                    return;
                }
                if lane < NLANES {
                    let list = match kind {
                        ObjectKind::Undo => &mut outcome.temp_undo[lane],
                        ObjectKind::Redo => &mut outcome.temp_redo[lane],
                        _ => &mut outcome.temp_ulog[lane],
                    };
                    list.add_replace(TempEntry {
                        pool_id,
                        offset,
                        tag,
                        size,
                    });
                } else {
                    self.store_epc_entry(offset, Some(&tag), size);
                }
            }
            Record::AtomicSnapshot {
                pool_id,
                offset,
                old_data,
                internal_offset,
            } => {
                if let Some(existing) = outcome
                    .atomic_snapshots
                    .iter_mut()
                    .find(|s| s.pool_id == pool_id && s.offset == offset
                        && s.internal_offset == internal_offset)
                {
                    existing.old_data = old_data;
                } else {
                    outcome.atomic_snapshots.push(SnapshotEntry {
                        pool_id,
                        offset,
                        old_data,
                        internal_offset,
                    });
                }
            }
            Record::TxInfo { lane, stage, .. } => {
                let lane = lane as usize;
                if lane >= NLANES {
                    return;
                }
                match stage {
                    TxStage::Start => {
                        outcome.unfinished[lane] = TxRecState::Started;
                        outcome.temp_redo[lane].discard();
                        outcome.temp_undo[lane].discard();
                    }
                    TxStage::Abort => {
                        outcome.unfinished[lane] = TxRecState::Idle;
                        outcome.temp_redo[lane].discard();
                        outcome.temp_undo[lane].discard();
                    }
                    TxStage::Commit => {
                        outcome.unfinished[lane] = TxRecState::Committed;
                    }
                    TxStage::Finish => {
                        outcome.unfinished[lane] = TxRecState::Idle;
                        for entry in outcome.temp_redo[lane].drain() {
                            self.store_epc_entry(entry.offset, Some(&entry.tag), entry.size);
                        }
                        for entry in outcome.temp_undo[lane].drain() {
                            self.store_epc_entry(entry.offset, Some(&entry.tag), entry.size);
                        }
                        for entry in outcome.temp_ulog[lane].drain() {
                            self.store_epc_entry(entry.offset, Some(&entry.tag), entry.size);
                        }
                    }
                    TxStage::RecRedo | TxStage::RecUndo | TxStage::UlogHdrUpdate => {}
                }
            }
        }
    }

    /// Drains a recovered lane's temp lists into the EPC.
    pub(crate) fn commit_temp_lists(&self, outcome: &mut ScanOutcome, lane: usize) {
        for entry in outcome.temp_redo[lane].drain() {
            self.store_epc_entry(entry.offset, Some(&entry.tag), entry.size);
        }
        for entry in outcome.temp_undo[lane].drain() {
            self.store_epc_entry(entry.offset, Some(&entry.tag), entry.size);
        }
        for entry in outcome.temp_ulog[lane].drain() {
            self.store_epc_entry(entry.offset, Some(&entry.tag), entry.size);
        }
    }

    /// Current (start, end) freshness window.
    pub fn counter_window(&self) -> (u64, u64) {
        (
            self.shared.counters.get(MANIFEST_START_COUNTER_IDX),
            self.shared.counters.get(MANIFEST_END_COUNTER_IDX),
        )
    }

    /// Whether a compaction cycle is in flight or awaiting handover.
    pub fn compaction_pending(&self) -> bool {
        self.shared.compaction_active.load(Ordering::SeqCst)
            || self.shared.compaction_finished.load(Ordering::SeqCst)
    }

    /// Stops the compactor thread.
    pub fn close(&self) {
        {
            let mut req = self.shared.comp.lock().expect("compaction lock poisoned");
            req.ended = true;
            self.shared.comp_cv.notify_one();
        }
        if let Some(handle) = self
            .compactor
            .lock()
            .expect("compactor handle poisoned")
            .take()
        {
            let _ = handle.join();
        }
    }
}

impl Drop for Manifest {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_codec_round_trips() {
        let record = Record::Object {
            kind: ObjectKind::Redo,
            pool_id: 9,
            offset: 0x4000,
            tag: [0xAB; 16],
            size_field: 512 | ((3u64) << ENTRY_LANE_SHIFT),
        };
        let bytes = record.encode(77);
        let (decoded, tcv) = Record::decode(&bytes).unwrap();
        assert_eq!(tcv, 77);
        match decoded {
            Record::Object {
                kind,
                pool_id,
                offset,
                tag,
                size_field,
            } => {
                assert_eq!(kind, ObjectKind::Redo);
                assert_eq!(pool_id, 9);
                assert_eq!(offset, 0x4000);
                assert_eq!(tag, [0xAB; 16]);
                assert_eq!(size_field & ENTRY_OBJ_SIZE_MASK_OFF, 512);
                assert_eq!((size_field & ENTRY_LANE_MASK) >> ENTRY_LANE_SHIFT, 3);
            }
            _ => panic!("decoded into the wrong shape"),
        }
    }

    #[test]
    fn snapshot_records_carry_the_invalid_bit() {
        let record = Record::AtomicSnapshot {
            pool_id: 1,
            offset: 0x8000,
            old_data: 0xDEAD,
            internal_offset: 8,
        };
        let bytes = record.encode(3);
        let (decoded, _) = Record::decode(&bytes).unwrap();
        match decoded {
            Record::AtomicSnapshot {
                offset, old_data, ..
            } => {
                assert_eq!(offset, 0x8000);
                assert_eq!(old_data, 0xDEAD);
            }
            _ => panic!("snapshot decoded into the wrong shape"),
        }
    }

    #[test]
    fn temp_list_replaces_same_object() {
        let mut list = TempList::default();
        list.add_replace(TempEntry {
            pool_id: 1,
            offset: 64,
            tag: [1; 16],
            size: 32,
        });
        list.add_replace(TempEntry {
            pool_id: 1,
            offset: 64,
            tag: [2; 16],
            size: 48,
        });
        assert_eq!(list.entries().len(), 1);
        assert_eq!(list.find(1, 64).unwrap().size, 48);
    }
}

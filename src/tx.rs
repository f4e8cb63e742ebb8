//! Transaction engine: per-lane undo/redo ulogs, snapshot range tree and the
//! commit/abort pipelines. During WORK every modification lands in the EPC's
//! cached plaintext; the pool itself changes only at commit, after the undo
//! chain and the redo entries are durable, so recovery can always pick a
//! winner from the logs.

use std::cell::Cell;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::aead::{iv_pair, Aead, Tag};
use crate::constants::{
    LANE_PRIMARY_ATTEMPTS, MANIFEST_END_COUNTER_IDX, MAX_ALLOC_SIZE, NLANES, POOL_HEADER_OFF,
};
use crate::epc::Epc;
use crate::error::{Error, Result};
use crate::manifest::{ObjectKind, TxStage};
use crate::pool::PoolFile;
use crate::sobj::{secure_object_rewrite, ObjId, SecurePool};
use crate::stats::StatKind;
use crate::ulog::{
    apply_val_op, RedoOp, UlogChain, UlogEntry, UlogHeader, EXTERNAL_REDO_CHAIN,
    INTERNAL_REDO_CHAIN, UNDO_CHAIN,
};

/// Transaction stage of a lane
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) enum Stage {
    #[default]
    None,
    Work,
    OnCommit,
    OnAbort,
}

impl Stage {
    fn name(self) -> &'static str {
        match self {
            Stage::None => "none",
            Stage::Work => "work",
            Stage::OnCommit => "on-commit",
            Stage::OnAbort => "on-abort",
        }
    }
}

/// How far the commit pipeline runs; the partial stops model a process
/// dying mid-commit and exist for crash testing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CommitStop {
    Full,
    /// Redo log durable, nothing applied to the pool yet
    BeforeApply,
    /// Pool updated, TX_FINISH not yet journaled
    BeforeFinish,
}

/// Flags attached to a snapshot range; merged ranges keep NO_FLUSH only if
/// both sides had it.
#[derive(Debug, Clone, Copy, Default)]
pub struct RangeFlags {
    pub no_flush: bool,
}

#[derive(Debug, Clone, Copy)]
struct RangeDef {
    len: u64,
    no_flush: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disposition {
    Existing,
    Created,
    Freed,
}

/// Pre-transaction EPC identity of an object the transaction touches.
#[derive(Debug, Clone)]
struct UndoObjId {
    offset: u64,
    saved_tag: Tag,
    saved_size: u64,
    disposition: Disposition,
}

#[derive(Debug, Clone)]
struct PendingVal {
    target_off: u64,
    op: RedoOp,
    value: u64,
    bitmap_base: u64,
}

/// Per-lane transaction state; protected by the lane mutex.
#[derive(Default)]
pub(crate) struct LaneState {
    stage: Stage,
    nest: u32,
    read_epoch: u64,
    undo_used: u64,
    undo_gen: u64,
    ext_used: u64,
    ext_gen: u64,
    ranges: BTreeMap<u64, RangeDef>,
    undo_oids: Vec<UndoObjId>,
    touched: Vec<u64>,
    pending_vals: Vec<PendingVal>,
    alloc_high: u64,
    freed: Vec<(u64, u64)>,
    bump_undo_gen: bool,
}

thread_local! {
    static PRIMARY_LANE: Cell<usize> = const { Cell::new(usize::MAX) };
}

/// The lane bank: round-robin lane assignment with a sticky per-thread
/// primary that is re-elected after `LANE_PRIMARY_ATTEMPTS` failed tries.
pub(crate) struct LaneBank {
    lanes: Vec<Mutex<LaneState>>,
    next: AtomicUsize,
}

impl LaneBank {
    pub(crate) fn new(pool: &PoolFile, aead: &Aead, epc: &Epc) -> Result<Self> {
        let mut lanes = Vec::with_capacity(NLANES);
        for lane in 0..NLANES {
            let mut state = LaneState::default();
            // reading every header doubles as the boot-time validation of
            // all three chains, internal redo included
            for chain in [UNDO_CHAIN, EXTERNAL_REDO_CHAIN, INTERNAL_REDO_CHAIN] {
                let c = UlogChain::new(lane, chain, pool);
                if let Some(hdr) = c.read_header(pool, aead, epc)? {
                    match chain {
                        UNDO_CHAIN => state.undo_gen = hdr.gen_num,
                        EXTERNAL_REDO_CHAIN => state.ext_gen = hdr.gen_num,
                        _ => {}
                    }
                }
            }
            lanes.push(Mutex::new(state));
        }
        Ok(Self {
            lanes,
            next: AtomicUsize::new(0),
        })
    }

    fn hold(&self) -> (usize, MutexGuard<'_, LaneState>) {
        let mut primary = PRIMARY_LANE.with(|c| c.get());
        if primary == usize::MAX {
            primary = fastrand::usize(..NLANES);
            PRIMARY_LANE.with(|c| c.set(primary));
        }
        for _ in 0..LANE_PRIMARY_ATTEMPTS {
            if let Ok(guard) = self.lanes[primary].try_lock() {
                return (primary, guard);
            }
            std::thread::yield_now();
        }
        // primary stayed contended; re-elect from the round-robin cursor
        loop {
            let lane = self.next.fetch_add(1, Ordering::SeqCst) % NLANES;
            if let Ok(guard) = self.lanes[lane].try_lock() {
                PRIMARY_LANE.with(|c| c.set(lane));
                return (lane, guard);
            }
            std::thread::yield_now();
        }
    }
}

/// Computes the uncovered sub-ranges of `[start, start+len)` and merges the
/// new range with every overlapping or adjacent one. Returns the gaps that
/// still need snapshotting.
fn merge_range(
    ranges: &mut BTreeMap<u64, RangeDef>,
    start: u64,
    len: u64,
    flags: RangeFlags,
) -> Vec<(u64, u64)> {
    let end = start + len;
    let mut merged_keys = Vec::new();
    let mut new_start = start;
    let mut new_end = end;
    let mut no_flush = flags.no_flush;

    for (&s, r) in ranges.range(..=end) {
        let r_end = s + r.len;
        if r_end < start {
            continue;
        }
        merged_keys.push(s);
        new_start = new_start.min(s);
        new_end = new_end.max(r_end);
        no_flush = no_flush && r.no_flush;
    }

    let mut covered: Vec<(u64, u64)> = merged_keys
        .iter()
        .map(|k| (*k, ranges[k].len))
        .collect();
    covered.sort_unstable();

    let mut gaps = Vec::new();
    let mut cursor = start;
    for (s, l) in covered {
        let e = s + l;
        if s > cursor {
            gaps.push((cursor, s.min(end) - cursor));
        }
        cursor = cursor.max(e);
        if cursor >= end {
            break;
        }
    }
    if cursor < end {
        gaps.push((cursor, end - cursor));
    }

    for k in merged_keys {
        ranges.remove(&k);
    }
    ranges.insert(
        new_start,
        RangeDef {
            len: new_end - new_start,
            no_flush,
        },
    );
    gaps
}

/// A transaction holding one lane. Dropping an uncommitted transaction
/// aborts it.
pub struct Tx<'p> {
    pool: &'p SecurePool,
    lane: usize,
    state: MutexGuard<'p, LaneState>,
    finalized: bool,
}

impl SecurePool {
    /// Begins a transaction: holds a lane, journals TX_START, snapshots the
    /// read epoch and re-initializes the lane's ulog chains.
    pub fn tx_begin(&self) -> Result<Tx<'_>> {
        let (lane, mut state) = self.lanes.hold();
        state.stage = Stage::Work;
        state.nest = 1;
        state.ranges.clear();
        state.undo_oids.clear();
        state.touched.clear();
        state.pending_vals.clear();
        state.alloc_high = 0;
        state.freed.clear();
        state.bump_undo_gen = false;
        for chain in [UNDO_CHAIN, EXTERNAL_REDO_CHAIN, INTERNAL_REDO_CHAIN] {
            UlogChain::new(lane, chain, &self.pool).invalidate(&self.counters);
        }
        state.undo_used = 0;
        state.ext_used = 0;

        self.manifest
            .append_tx_info(self.pool_id(), lane as u64, TxStage::Start)?;

        let epoch = self.epc.curr_epoch();
        state.read_epoch = epoch;
        self.epc.update_lane_epoch(lane, epoch);
        self.epc.set_min_epoch();

        Ok(Tx {
            pool: self,
            lane,
            state,
            finalized: false,
        })
    }
}

impl Tx<'_> {
    /// Begins a nested transaction on the same lane. Only the outermost
    /// commit flushes ranges and releases the lane.
    pub fn begin(&mut self) -> Result<()> {
        self.check_stage(Stage::Work)?;
        self.state.nest += 1;
        Ok(())
    }

    /// The global read epoch snapped at begin; the minimum over all active
    /// lanes bounds what the EPC evictor may drop.
    pub fn read_epoch(&self) -> u64 {
        self.state.read_epoch
    }

    fn check_stage(&self, expected: Stage) -> Result<()> {
        if self.state.stage != expected {
            return Err(Error::InvalidStage {
                expected: expected.name(),
                found: self.state.stage.name(),
            });
        }
        Ok(())
    }

    /// Aborts the transaction and surfaces `err` to the caller.
    fn fail(&mut self, err: Error) -> Error {
        let _ = self.do_abort();
        self.finalized = true;
        err
    }

    /// Reads through the pool; within a transaction the cached (modified)
    /// plaintext is what readers on this lane observe.
    pub fn read(&self, oid: ObjId) -> Result<Option<Vec<u8>>> {
        self.pool.read(oid)
    }

    /// Snapshots `[hoff, hoff+size)` of an object into the undo chain.
    pub fn add_range(&mut self, oid: ObjId, hoff: u64, size: usize) -> Result<()> {
        self.add_range_flags(oid, hoff, size, RangeFlags::default())
    }

    pub fn add_range_flags(
        &mut self,
        oid: ObjId,
        hoff: u64,
        size: usize,
        flags: RangeFlags,
    ) -> Result<()> {
        self.check_stage(Stage::Work)?;
        if size > MAX_ALLOC_SIZE {
            return Err(self.fail(Error::SnapshotTooLarge(size)));
        }
        let abs = oid.offset + hoff;
        if !self.pool.pool.in_heap(abs, size as u64) {
            return Err(self.fail(Error::SnapshotOutOfRange { offset: abs, size }));
        }
        let Some(entry) = self.pool.epc.lookup(oid.offset) else {
            return Err(self.fail(Error::Other(format!("no object at {:#x}", oid.offset))));
        };
        let obj_size = entry.logical_size();
        if hoff + size as u64 > obj_size {
            return Err(self.fail(Error::SnapshotOutOfRange { offset: abs, size }));
        }

        // the first snapshot schedules the commit-time gen_num bump that
        // invalidates the whole undo chain in one step
        if self.state.ranges.is_empty() {
            self.state.bump_undo_gen = true;
        }
        if !self
            .state
            .undo_oids
            .iter()
            .any(|u| u.offset == oid.offset)
        {
            self.state.undo_oids.push(UndoObjId {
                offset: oid.offset,
                saved_tag: entry.tag,
                saved_size: obj_size,
                disposition: Disposition::Existing,
            });
        }

        let gaps = merge_range(&mut self.state.ranges, abs, size as u64, flags);
        if gaps.is_empty() {
            return Ok(());
        }

        let plain = match self.object_plaintext(oid.offset, &entry.tag, obj_size as usize) {
            Ok(p) => p,
            Err(e) => return Err(self.fail(e)),
        };
        let undo = UlogChain::new(self.lane, UNDO_CHAIN, &self.pool.pool);
        let gen = self.state.undo_gen;
        for (s, l) in gaps {
            let lo = (s - oid.offset) as usize;
            let payload = &plain[lo..lo + l as usize];
            let res = undo.append_buf(
                &self.pool.pool,
                &self.pool.aead,
                &self.pool.counters,
                &mut self.state.undo_used,
                gen,
                oid.offset,
                s,
                payload,
            );
            if let Err(e) = res {
                return Err(self.fail(e));
            }
        }
        Ok(())
    }

    fn object_plaintext(&self, offset: u64, tag: &Tag, size: usize) -> Result<Vec<u8>> {
        if let Some(entry) = self.pool.epc.peek(offset) {
            if let Some(cached) = entry.cached {
                return Ok(cached.to_vec());
            }
        }
        let cipher = self.pool.pool.read(offset, size);
        let iv = iv_pair(self.pool.pool_id(), offset);
        self.pool
            .aead
            .decrypt(&cipher, tag, b"", &iv)
            .ok_or(Error::TagMismatch {
                pool_id: self.pool.pool_id(),
                offset,
            })
    }

    /// Whole-object transactional write; the modification lives in the EPC
    /// cache until commit.
    pub fn write(&mut self, oid: ObjId, data: &[u8]) -> Result<()> {
        self.check_stage(Stage::Work)?;
        let Some(entry) = self.pool.epc.lookup(oid.offset) else {
            return Err(Error::Other(format!("no object at {:#x}", oid.offset)));
        };
        if data.len() as u64 != entry.logical_size() {
            return Err(Error::Other(format!(
                "write of {} bytes into an object of {} bytes",
                data.len(),
                entry.logical_size()
            )));
        }
        self.pool
            .epc
            .store_cached(oid.offset, Arc::from(data.to_vec().into_boxed_slice()));
        self.mark_touched(oid.offset);
        Ok(())
    }

    /// Partial transactional write.
    pub fn write_part(&mut self, oid: ObjId, hoff: u64, data: &[u8]) -> Result<()> {
        self.check_stage(Stage::Work)?;
        let Some(entry) = self.pool.epc.lookup(oid.offset) else {
            return Err(Error::Other(format!("no object at {:#x}", oid.offset)));
        };
        let size = entry.logical_size() as usize;
        if hoff as usize + data.len() > size {
            return Err(Error::Other(format!(
                "partial write [{hoff}; {}) past object of {size} bytes",
                hoff as usize + data.len()
            )));
        }
        let mut plain = self.object_plaintext(oid.offset, &entry.tag, size)?;
        plain[hoff as usize..hoff as usize + data.len()].copy_from_slice(data);
        self.pool
            .epc
            .store_cached(oid.offset, Arc::from(plain.into_boxed_slice()));
        self.mark_touched(oid.offset);
        Ok(())
    }

    fn mark_touched(&mut self, offset: u64) {
        if !self.state.touched.contains(&offset) {
            self.state.touched.push(offset);
        }
    }

    /// Journals an 8-byte SET on a word inside `oid`.
    pub fn log_set(&mut self, oid: ObjId, word_off: u64, value: u64) -> Result<()> {
        self.log_val(oid, word_off, RedoOp::Set, value)
    }

    /// Journals an AND on an allocator-bitmap word inside `oid`.
    pub fn log_and(&mut self, oid: ObjId, word_off: u64, value: u64) -> Result<()> {
        self.log_val(oid, word_off, RedoOp::And, value)
    }

    /// Journals an OR on an allocator-bitmap word inside `oid`.
    pub fn log_or(&mut self, oid: ObjId, word_off: u64, value: u64) -> Result<()> {
        self.log_val(oid, word_off, RedoOp::Or, value)
    }

    fn log_val(&mut self, oid: ObjId, word_off: u64, op: RedoOp, value: u64) -> Result<()> {
        self.check_stage(Stage::Work)?;
        if self.pool.epc.peek(oid.offset).is_none() {
            return Err(Error::Other(format!("no object at {:#x}", oid.offset)));
        }
        self.state.pending_vals.push(PendingVal {
            target_off: oid.offset + word_off,
            op,
            value,
            bitmap_base: oid.offset,
        });
        Ok(())
    }

    /// Allocates a zeroed object inside the transaction; the allocation
    /// becomes durable at commit and is canceled on abort.
    pub fn zalloc(&mut self, size: u64) -> Result<ObjId> {
        self.check_stage(Stage::Work)?;
        if size as usize > MAX_ALLOC_SIZE {
            return Err(self.fail(Error::TxCanceled));
        }
        let resv = match self.pool.pool.reserve(size) {
            Ok(r) => r,
            Err(_) => return Err(self.fail(Error::TxCanceled)),
        };
        self.pool.epc.set(resv.offset, [0u8; 16], size);
        self.pool.epc.store_cached(
            resv.offset,
            Arc::from(vec![0u8; size as usize].into_boxed_slice()),
        );
        self.state.undo_oids.push(UndoObjId {
            offset: resv.offset,
            saved_tag: [0u8; 16],
            saved_size: resv.size,
            disposition: Disposition::Created,
        });
        self.state.alloc_high = self.state.alloc_high.max(resv.offset + resv.size);
        self.mark_touched(resv.offset);
        Ok(self.pool.oid(resv.offset))
    }

    pub fn alloc(&mut self, size: u64) -> Result<ObjId> {
        self.zalloc(size)
    }

    /// Frees an object inside the transaction. The EPC forgets it at once;
    /// abort reinstates it from the saved identity.
    pub fn free(&mut self, oid: ObjId) -> Result<()> {
        self.check_stage(Stage::Work)?;
        let Some(entry) = self.pool.epc.lookup(oid.offset) else {
            return Err(Error::Other(format!("no object at {:#x}", oid.offset)));
        };
        self.state.undo_oids.push(UndoObjId {
            offset: oid.offset,
            saved_tag: entry.tag,
            saved_size: entry.logical_size(),
            disposition: Disposition::Freed,
        });
        self.pool.epc.remove(oid.offset);
        self.pool.manifest.append_object_entry(
            ObjectKind::Redo,
            oid.pool_id,
            oid.offset,
            Some(&[0u8; 16]),
            self.lane as u64,
            0,
            false,
            false,
        )?;
        self.state.freed.push((oid.offset, entry.logical_size()));
        self.state.touched.retain(|&o| o != oid.offset);
        Ok(())
    }

    /// Commits. Inner commits only unwind nesting; the outermost commit runs
    /// the full pipeline and blocks until the finish entry's counter is
    /// stable.
    pub fn commit(&mut self) -> Result<()> {
        if self.finalized {
            return Err(Error::Other("transaction already finalized".to_string()));
        }
        self.check_stage(Stage::Work)?;
        if self.state.nest > 1 {
            self.state.nest -= 1;
            return Ok(());
        }
        let pool = self.pool;
        let result = pool
            .stats()
            .measure(StatKind::TxCommit, || self.do_commit(CommitStop::Full));
        self.finalized = true;
        result
    }

    /// Test aid: commits up to the point where the redo log is durable but
    /// no pool byte has changed, then stops as if the process died there.
    #[doc(hidden)]
    pub fn commit_halt_before_apply(&mut self) -> Result<()> {
        self.check_stage(Stage::Work)?;
        let result = self.do_commit(CommitStop::BeforeApply);
        self.finalized = true;
        result
    }

    /// Test aid: commits up to the point where the pool holds the new
    /// ciphertexts but TX_FINISH was never journaled.
    #[doc(hidden)]
    pub fn commit_halt_before_finish(&mut self) -> Result<()> {
        self.check_stage(Stage::Work)?;
        let result = self.do_commit(CommitStop::BeforeFinish);
        self.finalized = true;
        result
    }

    fn do_commit(&mut self, stop: CommitStop) -> Result<()> {
        let pool = self.pool;
        let lane = self.lane;
        let pool_id = pool.pool_id();
        self.state.stage = Stage::OnCommit;

        // flush every snapshotted range unless marked NO_FLUSH, then clear
        let ranges: Vec<(u64, RangeDef)> =
            self.state.ranges.iter().map(|(s, r)| (*s, *r)).collect();
        self.state.ranges.clear();
        for (s, r) in ranges {
            if !r.no_flush {
                pool.pool.flush_range(s, r.len as usize);
            }
        }

        // the undo chain must be durable before anything becomes visible; a
        // crash from here to the finish entry replays one of the two logs
        let undo = UlogChain::new(lane, UNDO_CHAIN, &pool.pool);
        undo.write_header(
            &pool.pool,
            &pool.aead,
            &pool.manifest,
            &UlogHeader {
                data_size: self.state.undo_used,
                gen_num: self.state.undo_gen,
                tcv: pool.counters.get(undo.end_counter),
                flags: 0,
            },
        )?;
        pool.manifest
            .append_tx_info(pool_id, lane as u64, TxStage::Commit)?;

        // fold journaled value ops into the cached plaintexts
        let pending = std::mem::take(&mut self.state.pending_vals);
        for v in &pending {
            let entry = pool.epc.peek(v.bitmap_base).ok_or_else(|| {
                Error::Other(format!("no object at {:#x}", v.bitmap_base))
            })?;
            let mut plain = self.object_plaintext(
                v.bitmap_base,
                &entry.tag,
                entry.logical_size() as usize,
            )?;
            let at = (v.target_off - v.bitmap_base) as usize;
            let word = u64::from_le_bytes(plain[at..at + 8].try_into().expect("val word"));
            let new = apply_val_op(word, v.op, v.value);
            plain[at..at + 8].copy_from_slice(&new.to_le_bytes());
            pool.epc
                .store_cached(v.bitmap_base, Arc::from(plain.into_boxed_slice()));
            self.mark_touched(v.bitmap_base);
        }

        // redo entries: post-image per modified object, then the value ops
        let mut objs = Vec::new();
        let mut seen = HashSet::new();
        for &off in &self.state.touched {
            if seen.insert(off) {
                objs.push(off);
            }
        }
        let ext = UlogChain::new(lane, EXTERNAL_REDO_CHAIN, &pool.pool);
        for &off in &objs {
            let entry = pool
                .epc
                .peek(off)
                .ok_or_else(|| Error::Other(format!("no object at {off:#x}")))?;
            let plain = entry
                .cached
                .ok_or_else(|| Error::Other(format!("object {off:#x} lost its cached copy")))?;
            let gen = self.state.ext_gen;
            ext.append_buf(
                &pool.pool,
                &pool.aead,
                &pool.counters,
                &mut self.state.ext_used,
                gen,
                off,
                off,
                &plain,
            )?;
        }
        for v in &pending {
            ext.append_val(
                &pool.pool,
                &pool.aead,
                &pool.counters,
                &mut self.state.ext_used,
                v.target_off,
                v.op,
                v.value,
                v.bitmap_base,
            )?;
        }
        ext.write_header(
            &pool.pool,
            &pool.aead,
            &pool.manifest,
            &UlogHeader {
                data_size: self.state.ext_used,
                gen_num: self.state.ext_gen,
                tcv: pool.counters.get(ext.end_counter),
                flags: 0,
            },
        )?;
        if stop == CommitStop::BeforeApply {
            return Ok(());
        }

        // publish allocator actions through the metadata log
        if self.state.alloc_high != 0 || !self.state.freed.is_empty() {
            let encoded = {
                let mut header = pool.header.lock().expect("pool header poisoned");
                header.heap_head = header.heap_head.max(self.state.alloc_high);
                header.encode()
            };
            let mut apply = |off: u64, data: &[u8]| {
                secure_object_rewrite(&pool.aead, &pool.pool, &pool.manifest, off, data)
            };
            pool.ml.append(POOL_HEADER_OFF, &encoded, &mut apply)?;
            pool.ml.persist(None, &mut apply)?;
            for (off, size) in self.state.freed.drain(..) {
                pool.pool.release(off, size);
            }
        }

        // per-object redo manifest entries, then the ciphertexts to the pool
        for &off in &objs {
            let entry = pool
                .epc
                .peek(off)
                .ok_or_else(|| Error::Other(format!("no object at {off:#x}")))?;
            let plain = entry
                .cached
                .ok_or_else(|| Error::Other(format!("object {off:#x} lost its cached copy")))?;
            let iv = iv_pair(pool_id, off);
            let (cipher, tag) = pool.aead.encrypt(&plain, b"", &iv);
            pool.manifest.append_object_entry(
                ObjectKind::Redo,
                pool_id,
                off,
                Some(&tag),
                lane as u64,
                plain.len() as u64,
                false,
                true,
            )?;
            pool.pool.write(off, &cipher, true);
        }
        if stop == CommitStop::BeforeFinish {
            return Ok(());
        }

        // the undo chain is logically empty from here on
        undo.invalidate(&pool.counters);
        self.state.undo_used = 0;
        if self.state.bump_undo_gen {
            self.state.undo_gen += 1;
            undo.write_header(
                &pool.pool,
                &pool.aead,
                &pool.manifest,
                &UlogHeader {
                    data_size: 0,
                    gen_num: self.state.undo_gen,
                    tcv: pool.counters.get(undo.end_counter),
                    flags: 0,
                },
            )?;
        }

        let finish_tcv = pool
            .manifest
            .append_tx_info(pool_id, lane as u64, TxStage::Finish)?;

        ext.invalidate(&pool.counters);
        self.state.ext_used = 0;
        {
            let mut apply = |off: u64, data: &[u8]| {
                secure_object_rewrite(&pool.aead, &pool.pool, &pool.manifest, off, data)
            };
            pool.ml.apply_rt(&mut apply)?;
        }
        pool.epc.update_lane_epoch(lane, u64::MAX);
        pool.epc.set_min_epoch();
        pool.epc.cache_flush();
        self.state.stage = Stage::None;
        self.state.nest = 0;

        // freshness proof: success is reported only once the finish entry's
        // counter value is stable
        pool.counters
            .wait_stable(MANIFEST_END_COUNTER_IDX, finish_tcv + 1);
        Ok(())
    }

    /// Aborts the whole transaction (nested or not): undo entries restore
    /// the cached plaintexts, saved identities restore the EPC, and the undo
    /// chain is invalidated by a generation bump.
    pub fn abort(&mut self) -> Result<()> {
        if self.finalized {
            return Err(Error::Other("transaction already finalized".to_string()));
        }
        let pool = self.pool;
        let result = pool
            .stats()
            .measure(StatKind::TxAbort, || self.do_abort());
        self.finalized = true;
        result
    }

    fn do_abort(&mut self) -> Result<()> {
        let pool = self.pool;
        let lane = self.lane;
        let pool_id = pool.pool_id();
        self.state.stage = Stage::OnAbort;

        // walk the undo chain and restore pre-images into the cached copies;
        // the pool itself was never touched during WORK
        let undo = UlogChain::new(lane, UNDO_CHAIN, &pool.pool);
        let hdr = UlogHeader {
            data_size: self.state.undo_used,
            gen_num: self.state.undo_gen,
            tcv: 0,
            flags: 0,
        };
        let entries = undo.fetch_entries(&pool.pool, &pool.aead, &pool.counters, &hdr);
        for entry in entries.iter().rev() {
            let UlogEntry::Buf(buf) = entry else { continue };
            let Some(epc_entry) = pool.epc.peek(buf.obj_off) else {
                continue;
            };
            let size = epc_entry.logical_size() as usize;
            let mut plain = match self.object_plaintext(buf.obj_off, &epc_entry.tag, size) {
                Ok(p) => p,
                Err(_) => continue,
            };
            let at = (buf.target_off - buf.obj_off) as usize;
            if at + buf.payload.len() > plain.len() {
                continue;
            }
            plain[at..at + buf.payload.len()].copy_from_slice(&buf.payload);
            pool.epc
                .store_cached(buf.obj_off, Arc::from(plain.into_boxed_slice()));
        }

        // reinstate saved EPC identities; the matching manifest entries make
        // the restoration replayable after a crash
        let undo_oids = std::mem::take(&mut self.state.undo_oids);
        for u in &undo_oids {
            match u.disposition {
                Disposition::Created => {
                    pool.epc.remove(u.offset);
                    pool.pool.release(u.offset, u.saved_size);
                    pool.manifest.append_object_entry(
                        ObjectKind::Undo,
                        pool_id,
                        u.offset,
                        Some(&[0u8; 16]),
                        lane as u64,
                        0,
                        false,
                        false,
                    )?;
                }
                Disposition::Freed | Disposition::Existing => {
                    pool.manifest.append_object_entry(
                        ObjectKind::Undo,
                        pool_id,
                        u.offset,
                        Some(&u.saved_tag),
                        lane as u64,
                        u.saved_size,
                        false,
                        true,
                    )?;
                }
            }
        }

        // dropped redo state: journaled value ops vanish with the lane
        self.state.pending_vals.clear();
        self.state.freed.clear();
        self.state.alloc_high = 0;
        self.state.touched.clear();
        self.state.ranges.clear();

        // invalidate the undo chain: stale entries fail their checksums
        self.state.undo_gen += 1;
        undo.write_header(
            &pool.pool,
            &pool.aead,
            &pool.manifest,
            &UlogHeader {
                data_size: 0,
                gen_num: self.state.undo_gen,
                tcv: pool.counters.get(undo.end_counter),
                flags: 0,
            },
        )?;
        undo.invalidate(&pool.counters);
        self.state.undo_used = 0;
        let ext = UlogChain::new(lane, EXTERNAL_REDO_CHAIN, &pool.pool);
        ext.invalidate(&pool.counters);
        self.state.ext_used = 0;

        let finish_tcv = pool
            .manifest
            .append_tx_info(pool_id, lane as u64, TxStage::Finish)?;

        pool.epc.update_lane_epoch(lane, u64::MAX);
        pool.epc.set_min_epoch();
        pool.epc.cache_flush();
        self.state.stage = Stage::None;
        self.state.nest = 0;

        pool.counters
            .wait_stable(MANIFEST_END_COUNTER_IDX, finish_tcv + 1);
        Ok(())
    }
}

impl Drop for Tx<'_> {
    fn drop(&mut self) {
        if !self.finalized {
            let _ = self.do_abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flags() -> RangeFlags {
        RangeFlags::default()
    }

    #[test]
    fn merge_disjoint_ranges() {
        let mut ranges = BTreeMap::new();
        let gaps = merge_range(&mut ranges, 100, 50, flags());
        assert_eq!(gaps, vec![(100, 50)]);
        let gaps = merge_range(&mut ranges, 300, 10, flags());
        assert_eq!(gaps, vec![(300, 10)]);
        assert_eq!(ranges.len(), 2);
    }

    #[test]
    fn merge_overlapping_snapshots_only_the_tail() {
        let mut ranges = BTreeMap::new();
        merge_range(&mut ranges, 100, 50, flags());
        // overlaps [100,150); only [150,170) still needs a snapshot
        let gaps = merge_range(&mut ranges, 120, 50, flags());
        assert_eq!(gaps, vec![(150, 20)]);
        assert_eq!(ranges.len(), 1);
        assert_eq!(ranges.get(&100).unwrap().len, 70);
    }

    #[test]
    fn merge_adjacent_extends_without_gap_between() {
        let mut ranges = BTreeMap::new();
        merge_range(&mut ranges, 100, 50, flags());
        let gaps = merge_range(&mut ranges, 150, 30, flags());
        assert_eq!(gaps, vec![(150, 30)]);
        assert_eq!(ranges.len(), 1);
        assert_eq!(ranges.get(&100).unwrap().len, 80);
    }

    #[test]
    fn merge_covered_range_needs_no_snapshot() {
        let mut ranges = BTreeMap::new();
        merge_range(&mut ranges, 100, 100, flags());
        let gaps = merge_range(&mut ranges, 120, 30, flags());
        assert!(gaps.is_empty());
        assert_eq!(ranges.len(), 1);
    }

    #[test]
    fn merge_bridges_two_ranges() {
        let mut ranges = BTreeMap::new();
        merge_range(&mut ranges, 100, 20, flags());
        merge_range(&mut ranges, 200, 20, flags());
        let gaps = merge_range(&mut ranges, 110, 100, flags());
        assert_eq!(gaps, vec![(120, 80)]);
        assert_eq!(ranges.len(), 1);
        assert_eq!(ranges.get(&100).unwrap().len, 120);
    }

    #[test]
    fn no_flush_survives_only_if_both_sides_had_it() {
        let mut ranges = BTreeMap::new();
        merge_range(&mut ranges, 100, 50, RangeFlags { no_flush: true });
        merge_range(&mut ranges, 120, 50, RangeFlags { no_flush: true });
        assert!(ranges.get(&100).unwrap().no_flush);
        merge_range(&mut ranges, 140, 50, RangeFlags { no_flush: false });
        assert!(!ranges.get(&100).unwrap().no_flush);
    }
}

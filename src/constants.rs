//! Crate-wide constants: counter index assignment, manifest record geometry,
//! bit packing masks and tunable defaults.

/// Total counter slots in the counter file: 6 per lane for 32 lanes,
/// plus 2 for the manifest, 2 for the metadata log, rounded up with spares.
pub const MAX_COUNTERS: usize = 303;

/// Number of transaction lanes. Lane ids occupy 6 bits in manifest entries,
/// so this must stay below 64; the value `NLANES` itself is the "no lane"
/// marker used by non-transactional writes.
pub const NLANES: usize = 32;

/// Manifest freshness counter pair
pub const MANIFEST_START_COUNTER_IDX: usize = 0;
pub const MANIFEST_END_COUNTER_IDX: usize = 1;

/// Metadata log freshness counter pair (end before start, as laid out on disk)
pub const ML_END_COUNTER_IDX: usize = 2;
pub const ML_START_COUNTER_IDX: usize = 3;

/// First counter index owned by the per-lane ulog chains
pub const LANE_COUNTER_BASE: usize = 4;
/// Chains per lane: undo, external redo, internal redo
pub const LOGS_PER_LANE: usize = 3;
/// Counters per chain: (end, start)
pub const COUNTERS_PER_LOG: usize = 2;

/// End counter index for a lane's ulog chain
pub fn ulog_end_counter_idx(lane: usize, chain: usize) -> usize {
    LANE_COUNTER_BASE + (lane * LOGS_PER_LANE + chain) * COUNTERS_PER_LOG
}

/// Start counter index for a lane's ulog chain
pub fn ulog_start_counter_idx(lane: usize, chain: usize) -> usize {
    ulog_end_counter_idx(lane, chain) + 1
}

/// Manifest slot geometry: 40 bytes of typed payload, 48 bytes under
/// encryption once the counter is appended, 64 bytes per slot with the tag.
pub const ENTRY_DATA_SIZE: usize = 40;
pub const ENTRY_ENCRYPTED_DATA_SIZE: usize = 48;
pub const MANIFEST_ENTRY_SIZE: usize = 64;

/// Manifest occupancy ratio after which compaction starts
pub const COMPACTION_THRESHOLD: f64 = 0.7;

/// Entry type lives in the top 3 bits of the offset/type word
pub const ENTRY_TYPE_SHIFT: u32 = 61;
pub const ENTRY_TYPE_MASK: u64 = 0b111 << ENTRY_TYPE_SHIFT;
pub const ENTRY_TYPE_MASK_OFF: u64 = !ENTRY_TYPE_MASK;

/// Lane id is folded into bits 52..57 of the size word
pub const ENTRY_LANE_SHIFT: u32 = 52;
pub const ENTRY_LANE_MASK: u64 = 0x3F << ENTRY_LANE_SHIFT;

/// Invalid / in-flight marker: the MSB of the size word
pub const ENTRY_INVALID_MASK: u64 = 1 << 63;

/// Clears lane, compaction and invalid bits from a size word
pub const ENTRY_OBJ_SIZE_MASK_OFF: u64 = !(0xFFF << ENTRY_LANE_SHIFT);

/// Compaction epoch occupies bits 58..61 of an EPC entry's size field
pub const COMPACTION_SHIFT: u32 = 58;
pub const COMPACTION_MASK_OFF: u64 = !(0xF << COMPACTION_SHIFT);

/// Folds a compaction epoch into a size word
pub fn compaction_mask(epoch: u64) -> u64 {
    (epoch & 0xF) << COMPACTION_SHIFT
}

/// AEAD geometry: 128-bit key, IV and tag
pub const KEY_SIZE: usize = 16;
pub const IV_SIZE: usize = 16;
pub const TAG_SIZE: usize = 16;

/// Accumulated cached plaintext bytes after which the EPC evictor runs
pub const CACHE_FLUSH_THRESHOLD: i64 = 30 * 1024 * 1024;

/// Number of EPC stripes; must be a power of two
pub const EPC_STRIPES: usize = 64;

/// Failed lane lock attempts before a thread re-elects its primary lane
pub const LANE_PRIMARY_ATTEMPTS: u32 = 16;

/// Largest single allocation (and therefore snapshot) the heap will serve
pub const MAX_ALLOC_SIZE: usize = 16 * 1024 * 1024;

/// Pool file layout: plaintext prologue, encrypted header object, ulog area
pub const POOL_MAGIC: &[u8; 8] = b"SEALPOOL";
pub const POOL_FORMAT_VERSION: u16 = 1;
pub const POOL_PROLOGUE_SIZE: u64 = 64;
pub const POOL_HEADER_OFF: u64 = 64;
pub const POOL_HEADER_SIZE: u64 = 64;
pub const ULOG_AREA_OFF: u64 = 4096;

/// Ulog chain geometry: 64-byte encrypted header followed by the data area
pub const ULOG_HEADER_SIZE: u64 = 64;

/// Defaults for `PoolConfig`
pub const DEFAULT_POOL_SIZE: u64 = 64 * 1024 * 1024;
pub const DEFAULT_MANIFEST_SIZE: u64 = 4 * 1024 * 1024;
pub const DEFAULT_ML_FILE_SIZE: u64 = 1024 * 1024;
pub const DEFAULT_ML_VOL_SIZE: u64 = 1024 * 1024;
pub const DEFAULT_ULOG_CAPACITY: u64 = 64 * 1024;
pub const DEFAULT_COUNTER_FLUSH_INTERVAL_MS: u64 = 15;

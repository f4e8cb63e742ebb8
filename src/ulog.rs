//! Ulog chains: per-lane encrypted undo/redo logs living inside the pool
//! file. Each chain is a 64-byte AEAD-encrypted header followed by a data
//! area of individually encrypted entries. The chain is never walked through
//! raw pointers; an iterator re-decrypts entry by entry and stops at the
//! first one outside the chain's counter window or failing its checksum.

use crate::aead::{iv_pair, Aead};
use crate::constants::{NLANES, TAG_SIZE, ULOG_HEADER_SIZE};
use crate::counters::CounterBank;
use crate::epc::Epc;
use crate::error::{Error, Result};
use crate::manifest::{Manifest, ObjectKind};
use crate::pool::PoolFile;

/// Chain indices within a lane
pub(crate) const UNDO_CHAIN: usize = 0;
pub(crate) const EXTERNAL_REDO_CHAIN: usize = 1;
pub(crate) const INTERNAL_REDO_CHAIN: usize = 2;

/// Encrypted header image is 48 bytes + 16-byte tag on media
const HEADER_ENC_SIZE: usize = 48;

/// Per-entry overhead: plaintext cipher length + detached tag
const ENTRY_OVERHEAD: usize = 8 + TAG_SIZE;

const ENTRY_KIND_VAL: u64 = 1;
const ENTRY_KIND_BUF: u64 = 2;

/// Decrypted chain header.
#[derive(Debug, Clone, Default)]
pub(crate) struct UlogHeader {
    /// Bytes of the data area holding entries
    pub data_size: u64,
    /// Generation number folded into every buf-entry checksum; bumping it
    /// invalidates the whole chain without touching the entries
    pub gen_num: u64,
    /// End-counter value at the last header persist
    pub tcv: u64,
    pub flags: u64,
}

impl UlogHeader {
    fn encode(&self) -> [u8; HEADER_ENC_SIZE] {
        let mut out = [0u8; HEADER_ENC_SIZE];
        out[0..8].copy_from_slice(&self.data_size.to_le_bytes());
        out[8..16].copy_from_slice(&self.gen_num.to_le_bytes());
        out[16..24].copy_from_slice(&self.tcv.to_le_bytes());
        out[24..32].copy_from_slice(&self.flags.to_le_bytes());
        out
    }

    fn decode(bytes: &[u8]) -> Self {
        Self {
            data_size: u64::from_le_bytes(bytes[0..8].try_into().expect("header word")),
            gen_num: u64::from_le_bytes(bytes[8..16].try_into().expect("header word")),
            tcv: u64::from_le_bytes(bytes[16..24].try_into().expect("header word")),
            flags: u64::from_le_bytes(bytes[24..32].try_into().expect("header word")),
        }
    }
}

/// Redo value operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedoOp {
    Set,
    And,
    Or,
}

impl RedoOp {
    fn code(self) -> u64 {
        match self {
            RedoOp::Set => 0,
            RedoOp::And => 1,
            RedoOp::Or => 2,
        }
    }

    fn from_code(code: u64) -> Option<Self> {
        Some(match code {
            0 => RedoOp::Set,
            1 => RedoOp::And,
            2 => RedoOp::Or,
            _ => return None,
        })
    }
}

/// Single-value redo record: SET/AND/OR of an 8-byte word. For bit
/// operations `bitmap_base` names the enclosing object so the apply path can
/// decrypt it whole, patch the word in plaintext and re-encrypt.
#[derive(Debug, Clone)]
pub(crate) struct ValEntry {
    pub target_off: u64,
    pub op: RedoOp,
    pub value: u64,
    pub tcv: u64,
    pub bitmap_base: u64,
}

/// Byte-range snapshot record; pre-image for undo chains, post-image for the
/// commit-time redo chain.
#[derive(Debug, Clone)]
pub(crate) struct BufEntry {
    /// Offset of the enclosing object
    pub obj_off: u64,
    /// Offset of the snapshotted range inside the pool
    pub target_off: u64,
    pub tcv: u64,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone)]
pub(crate) enum UlogEntry {
    Val(ValEntry),
    Buf(BufEntry),
}

impl UlogEntry {
    pub fn tcv(&self) -> u64 {
        match self {
            UlogEntry::Val(v) => v.tcv,
            UlogEntry::Buf(b) => b.tcv,
        }
    }
}

fn buf_checksum(obj_off: u64, target_off: u64, tcv: u64, gen_num: u64, payload: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&obj_off.to_le_bytes());
    hasher.update(&target_off.to_le_bytes());
    hasher.update(&tcv.to_le_bytes());
    hasher.update(&gen_num.to_le_bytes());
    hasher.update(payload);
    hasher.finalize()
}

/// Geometry and counter bindings of one chain. All state lives in the pool
/// and the counter bank; this struct is freely copyable.
#[derive(Debug, Clone, Copy)]
pub(crate) struct UlogChain {
    pub pool_id: u64,
    /// Header offset inside the pool
    pub offset: u64,
    pub capacity: u64,
    pub end_counter: usize,
    pub start_counter: usize,
}

impl UlogChain {
    pub fn new(lane: usize, chain: usize, pool: &PoolFile) -> Self {
        Self {
            pool_id: pool.uuid(),
            offset: pool.chain_off(lane, chain),
            capacity: pool.chain_capacity(),
            end_counter: crate::constants::ulog_end_counter_idx(lane, chain),
            start_counter: crate::constants::ulog_start_counter_idx(lane, chain),
        }
    }

    fn data_off(&self) -> u64 {
        self.offset + ULOG_HEADER_SIZE
    }

    /// Creates the chain's counters if this is the first boot of the pool.
    pub fn ensure_counters(&self, counters: &CounterBank) {
        if !counters.exists(self.end_counter) {
            counters.create_at(self.end_counter, 0);
            counters.create_at(self.start_counter, 0);
        }
    }

    /// Aligns start to end, logically emptying the chain.
    pub fn invalidate(&self, counters: &CounterBank) {
        counters.set(self.start_counter, counters.get(self.end_counter));
    }

    /// Writes a fresh all-empty header; used at pool creation.
    pub fn construct(
        &self,
        pool: &PoolFile,
        aead: &Aead,
        manifest: &Manifest,
        counters: &CounterBank,
    ) -> Result<()> {
        self.ensure_counters(counters);
        let hdr = UlogHeader::default();
        self.write_header(pool, aead, manifest, &hdr)
    }

    /// Encrypts and persists the header, publishing its fresh tag directly to
    /// the EPC through a ULOG_OBJECT manifest entry. Recovery depends on the
    /// published tag, so the entry never routes through a temp list.
    pub fn write_header(
        &self,
        pool: &PoolFile,
        aead: &Aead,
        manifest: &Manifest,
        hdr: &UlogHeader,
    ) -> Result<()> {
        let image = hdr.encode();
        let iv = iv_pair(self.pool_id, self.offset);
        let (cipher, tag) = aead.encrypt(&image, b"", &iv);
        let mut slot = vec![0u8; ULOG_HEADER_SIZE as usize];
        slot[..HEADER_ENC_SIZE].copy_from_slice(&cipher);
        slot[HEADER_ENC_SIZE..].copy_from_slice(&tag);
        pool.write(self.offset, &slot, true);
        manifest.append_object_entry(
            ObjectKind::Ulog,
            self.pool_id,
            self.offset,
            Some(&tag),
            NLANES as u64,
            ULOG_HEADER_SIZE,
            false,
            true,
        )?;
        Ok(())
    }

    /// Reads the header back through the EPC tag. `None` means the EPC has
    /// never seen this chain (fresh pool region).
    pub fn read_header(&self, pool: &PoolFile, aead: &Aead, epc: &Epc) -> Result<Option<UlogHeader>> {
        let Some(entry) = epc.peek(self.offset) else {
            return Ok(None);
        };
        let cipher = pool.read(self.offset, HEADER_ENC_SIZE);
        let iv = iv_pair(self.pool_id, self.offset);
        let plain = aead.decrypt(&cipher, &entry.tag, b"", &iv).ok_or(Error::TagMismatch {
            pool_id: self.pool_id,
            offset: self.offset,
        })?;
        Ok(Some(UlogHeader::decode(&plain)))
    }

    /// Appends a byte-range snapshot entry. `used` is the lane's volatile
    /// mirror of the header's data_size.
    #[allow(clippy::too_many_arguments)]
    pub fn append_buf(
        &self,
        pool: &PoolFile,
        aead: &Aead,
        counters: &CounterBank,
        used: &mut u64,
        gen_num: u64,
        obj_off: u64,
        target_off: u64,
        payload: &[u8],
    ) -> Result<()> {
        let tcv = counters.inc(self.end_counter);
        let checksum = buf_checksum(obj_off, target_off, tcv, gen_num, payload);
        let mut record = Vec::with_capacity(40 + payload.len());
        record.extend_from_slice(&ENTRY_KIND_BUF.to_le_bytes());
        record.extend_from_slice(&obj_off.to_le_bytes());
        record.extend_from_slice(&target_off.to_le_bytes());
        record.extend_from_slice(&tcv.to_le_bytes());
        record.extend_from_slice(&(checksum as u64).to_le_bytes());
        record.extend_from_slice(payload);
        self.append_record(pool, aead, used, tcv, &record)
    }

    /// Appends a single-value redo entry.
    #[allow(clippy::too_many_arguments)]
    pub fn append_val(
        &self,
        pool: &PoolFile,
        aead: &Aead,
        counters: &CounterBank,
        used: &mut u64,
        target_off: u64,
        op: RedoOp,
        value: u64,
        bitmap_base: u64,
    ) -> Result<()> {
        let tcv = counters.inc(self.end_counter);
        let mut record = Vec::with_capacity(48);
        record.extend_from_slice(&ENTRY_KIND_VAL.to_le_bytes());
        record.extend_from_slice(&target_off.to_le_bytes());
        record.extend_from_slice(&op.code().to_le_bytes());
        record.extend_from_slice(&value.to_le_bytes());
        record.extend_from_slice(&tcv.to_le_bytes());
        record.extend_from_slice(&bitmap_base.to_le_bytes());
        self.append_record(pool, aead, used, tcv, &record)
    }

    fn append_record(
        &self,
        pool: &PoolFile,
        aead: &Aead,
        used: &mut u64,
        tcv: u64,
        record: &[u8],
    ) -> Result<()> {
        let total = ENTRY_OVERHEAD + record.len();
        if *used + total as u64 > self.capacity {
            // a full chain cancels the transaction; the pool itself is intact
            return Err(Error::TxCanceled);
        }
        let entry_off = self.data_off() + *used;
        // entry offsets repeat across transactions once the chain resets, so
        // the counter value keys the IV instead of the pool id
        let iv = iv_pair(tcv, entry_off);
        let (cipher, tag) = aead.encrypt(record, b"", &iv);
        let mut slot = Vec::with_capacity(total);
        slot.extend_from_slice(&(record.len() as u64).to_le_bytes());
        slot.extend_from_slice(&cipher);
        slot.extend_from_slice(&tag);
        pool.write(entry_off, &slot, true);
        *used += total as u64;
        Ok(())
    }

    /// Walks the data area, decrypting entries while they stay inside the
    /// `[start, end)` counter window. A decrypt failure or a buf-entry
    /// checksum mismatch is treated as the end of the chain, not an error.
    pub fn fetch_entries(
        &self,
        pool: &PoolFile,
        aead: &Aead,
        counters: &CounterBank,
        hdr: &UlogHeader,
    ) -> Vec<UlogEntry> {
        let mut entries = Vec::new();
        let mut expected = counters.get(self.start_counter);
        let end = counters.get(self.end_counter);
        let mut off = 0u64;
        while off + ENTRY_OVERHEAD as u64 <= hdr.data_size && expected < end {
            let base = self.data_off() + off;
            let len_bytes = pool.read(base, 8);
            let len = u64::from_le_bytes(len_bytes.try_into().expect("entry length")) as usize;
            if off + (ENTRY_OVERHEAD + len) as u64 > hdr.data_size {
                break;
            }
            let cipher = pool.read(base + 8, len);
            let mut tag = [0u8; TAG_SIZE];
            tag.copy_from_slice(&pool.read(base + 8 + len as u64, TAG_SIZE));
            let iv = iv_pair(expected, base);
            let Some(plain) = aead.decrypt(&cipher, &tag, b"", &iv) else {
                break;
            };
            let Some(entry) = decode_entry(&plain, hdr.gen_num) else {
                break;
            };
            if entry.tcv() != expected {
                break;
            }
            entries.push(entry);
            expected += 1;
            off += (ENTRY_OVERHEAD + len) as u64;
        }
        entries
    }
}

fn decode_entry(plain: &[u8], gen_num: u64) -> Option<UlogEntry> {
    if plain.len() < 8 {
        return None;
    }
    let kind = u64::from_le_bytes(plain[..8].try_into().expect("entry kind"));
    match kind {
        ENTRY_KIND_VAL if plain.len() == 48 => {
            let target_off = u64::from_le_bytes(plain[8..16].try_into().expect("entry word"));
            let op = RedoOp::from_code(u64::from_le_bytes(
                plain[16..24].try_into().expect("entry word"),
            ))?;
            let value = u64::from_le_bytes(plain[24..32].try_into().expect("entry word"));
            let tcv = u64::from_le_bytes(plain[32..40].try_into().expect("entry word"));
            let bitmap_base = u64::from_le_bytes(plain[40..48].try_into().expect("entry word"));
            Some(UlogEntry::Val(ValEntry {
                target_off,
                op,
                value,
                tcv,
                bitmap_base,
            }))
        }
        ENTRY_KIND_BUF if plain.len() >= 40 => {
            let obj_off = u64::from_le_bytes(plain[8..16].try_into().expect("entry word"));
            let target_off = u64::from_le_bytes(plain[16..24].try_into().expect("entry word"));
            let tcv = u64::from_le_bytes(plain[24..32].try_into().expect("entry word"));
            let checksum = u64::from_le_bytes(plain[32..40].try_into().expect("entry word")) as u32;
            let payload = plain[40..].to_vec();
            if buf_checksum(obj_off, target_off, tcv, gen_num, &payload) != checksum {
                return None;
            }
            Some(UlogEntry::Buf(BufEntry {
                obj_off,
                target_off,
                tcv,
                payload,
            }))
        }
        _ => None,
    }
}

/// Applies a value operation to a plaintext word.
pub(crate) fn apply_val_op(current: u64, op: RedoOp, value: u64) -> u64 {
    match op {
        RedoOp::Set => value,
        RedoOp::And => current & value,
        RedoOp::Or => current | value,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_binds_gen_num() {
        let payload = b"snapshot bytes";
        let a = buf_checksum(64, 80, 5, 1, payload);
        let b = buf_checksum(64, 80, 5, 2, payload);
        assert_ne!(a, b);
    }

    #[test]
    fn val_ops() {
        assert_eq!(apply_val_op(0b1010, RedoOp::Set, 0b0101), 0b0101);
        assert_eq!(apply_val_op(0b1010, RedoOp::And, 0b0110), 0b0010);
        assert_eq!(apply_val_op(0b1010, RedoOp::Or, 0b0101), 0b1111);
    }

    #[test]
    fn decode_rejects_wrong_checksum() {
        let mut record = Vec::new();
        record.extend_from_slice(&ENTRY_KIND_BUF.to_le_bytes());
        record.extend_from_slice(&64u64.to_le_bytes());
        record.extend_from_slice(&80u64.to_le_bytes());
        record.extend_from_slice(&5u64.to_le_bytes());
        let checksum = buf_checksum(64, 80, 5, 1, b"payload") as u64;
        record.extend_from_slice(&checksum.to_le_bytes());
        record.extend_from_slice(b"payload");
        assert!(decode_entry(&record, 1).is_some());
        // a bumped generation invalidates the stored checksum
        assert!(decode_entry(&record, 2).is_none());
    }
}

//! Metadata log: batches allocator-internal metadata writes in a volatile
//! ring, pushes them to the persistent medium as authenticated AEAD chunks
//! bound to the `[ml_start, ml_end)` counter window, and lazily applies them
//! to the pool through the secure metadata-write path supplied by the caller.

use std::fs::OpenOptions;
use std::path::Path;
use std::sync::{Arc, Condvar, Mutex};

use memmap2::MmapMut;

use crate::aead::{iv_pair, Aead};
use crate::constants::{ML_END_COUNTER_IDX, ML_START_COUNTER_IDX, TAG_SIZE};
use crate::counters::CounterBank;
use crate::error::{Error, Result};

/// Volatile record header: target offset and payload size
const LOG_ENTRY_HDR: usize = 16;

/// Persistent chunk overhead: 16-byte tag, 8-byte plaintext size, then the
/// encrypted 16-byte header tail (pool_id, tcv) ahead of the payload
const CHUNK_PLAIN_HDR: usize = TAG_SIZE + 8;
const CHUNK_ENC_HDR: usize = 16;
const CHUNK_OVERHEAD: usize = CHUNK_PLAIN_HDR + CHUNK_ENC_HDR;

/// Callback applying one record to the pool via the secure write path.
pub type ApplyFn<'a> = &'a mut dyn FnMut(u64, &[u8]) -> Result<()>;

/// One buffered metadata write.
#[derive(Debug, Clone)]
pub struct LogRecord {
    pub offset: u64,
    pub data: Vec<u8>,
}

struct Vol {
    buf: Vec<u8>,
    start_off: usize,
    end_off: usize,
    persist_point: usize,
    reset_in_progress: bool,
}

struct Pm {
    map: MmapMut,
    size: usize,
    end_off: usize,
}

/// The metadata log handle. Invariants: `start_off <= persist_point <=
/// end_off`; every byte below `persist_point` has a persisted chunk whose
/// ciphertext decrypts to it.
pub struct MetadataLog {
    aead: Arc<Aead>,
    counters: Arc<CounterBank>,
    pool_id: u64,
    vol: Mutex<Vol>,
    vol_cv: Condvar,
    pm: Mutex<Pm>,
    persist_lock: Mutex<()>,
    apply_lock: Mutex<()>,
}

impl MetadataLog {
    /// Opens (or creates) the metadata log file.
    pub fn open(
        path: &Path,
        pool_id: u64,
        file_size: u64,
        vol_size: u64,
        aead: Arc<Aead>,
        counters: Arc<CounterBank>,
    ) -> Result<Self> {
        if !counters.exists(ML_END_COUNTER_IDX) {
            counters.create_at(ML_END_COUNTER_IDX, 0);
            counters.create_at(ML_START_COUNTER_IDX, 0);
        }
        let existing = path.metadata().map(|m| m.len()).unwrap_or(0);
        let size = if existing == 0 { file_size } else { existing };
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        file.set_len(size)?;
        let map = unsafe { MmapMut::map_mut(&file)? };

        Ok(Self {
            aead,
            counters,
            pool_id,
            vol: Mutex::new(Vol {
                buf: vec![0u8; vol_size as usize],
                start_off: 0,
                end_off: 0,
                persist_point: 0,
                reset_in_progress: false,
            }),
            vol_cv: Condvar::new(),
            pm: Mutex::new(Pm {
                map,
                size: size as usize,
                end_off: 0,
            }),
            persist_lock: Mutex::new(()),
            apply_lock: Mutex::new(()),
        })
    }

    /// Appends a record to the volatile ring. If the ring would overflow, the
    /// first appender past the end persists, applies and resets it; later
    /// appenders wait for the reset and retry.
    pub fn append(&self, offset: u64, data: &[u8], apply: ApplyFn<'_>) -> Result<()> {
        loop {
            let mut vol = self.vol.lock().expect("metadata log ring poisoned");
            if vol.reset_in_progress {
                let guard = self
                    .vol_cv
                    .wait_while(vol, |v| v.reset_in_progress)
                    .expect("metadata log ring poisoned");
                drop(guard);
                continue;
            }
            let needed = LOG_ENTRY_HDR + data.len();
            if vol.end_off + needed > vol.buf.len() {
                vol.reset_in_progress = true;
                let vol_end = vol.end_off;
                drop(vol);
                self.persist(Some(vol_end), apply)?;
                self.apply_rt(apply)?;
                let mut vol = self.vol.lock().expect("metadata log ring poisoned");
                vol.start_off = 0;
                vol.end_off = 0;
                vol.persist_point = 0;
                vol.reset_in_progress = false;
                self.vol_cv.notify_all();
                continue;
            }
            let at = vol.end_off;
            vol.buf[at..at + 8].copy_from_slice(&offset.to_le_bytes());
            vol.buf[at + 8..at + 16].copy_from_slice(&(data.len() as u64).to_le_bytes());
            vol.buf[at + 16..at + 16 + data.len()].copy_from_slice(data);
            vol.end_off = at + needed;
            return Ok(());
        }
    }

    /// Encrypts and writes the `[persist_point, end)` ring range to the
    /// persistent medium as one counter-bound chunk. `vol_end_point` of
    /// `None` persists everything buffered so far.
    pub fn persist(&self, vol_end_point: Option<usize>, apply: ApplyFn<'_>) -> Result<()> {
        let _persist = self.persist_lock.lock().expect("persist lock poisoned");
        let mut vol = self.vol.lock().expect("metadata log ring poisoned");

        let end_off = match vol_end_point {
            Some(point) => point.min(vol.end_off),
            None => vol.end_off,
        };
        if end_off <= vol.persist_point {
            return Ok(());
        }
        let start_off = vol.persist_point;
        let payload = vol.buf[start_off..end_off].to_vec();

        let mut pm = self.pm.lock().expect("metadata log file poisoned");
        if pm.end_off + CHUNK_OVERHEAD + payload.len() > pm.size {
            // the journal is only needed for unapplied records; apply
            // everything persisted so far, then restart the chunk sequence
            Self::apply_range(&mut vol, apply)?;
            self.counters
                .set(ML_START_COUNTER_IDX, self.counters.get(ML_END_COUNTER_IDX));
            pm.end_off = 0;
        }

        let tcv = self.counters.inc(ML_END_COUNTER_IDX);
        let mut enc_hdr = [0u8; CHUNK_ENC_HDR];
        enc_hdr[..8].copy_from_slice(&self.pool_id.to_le_bytes());
        enc_hdr[8..].copy_from_slice(&tcv.to_le_bytes());
        let iv = iv_pair(0, tcv);
        let (cipher, tag) = self.aead.encrypt_two_parts(&enc_hdr, &payload, b"", &iv);

        let base = pm.end_off;
        pm.map[base..base + TAG_SIZE].copy_from_slice(&tag);
        pm.map[base + TAG_SIZE..base + CHUNK_PLAIN_HDR]
            .copy_from_slice(&(payload.len() as u64).to_le_bytes());
        pm.map[base + CHUNK_PLAIN_HDR..base + CHUNK_OVERHEAD + payload.len()]
            .copy_from_slice(&cipher);
        let _ = pm.map.flush_range(base, CHUNK_OVERHEAD + payload.len());
        pm.end_off = base + CHUNK_OVERHEAD + payload.len();

        vol.persist_point = end_off;
        Ok(())
    }

    /// Applies every persisted-but-unapplied ring record to the pool.
    pub fn apply_rt(&self, apply: ApplyFn<'_>) -> Result<()> {
        let _apply = self.apply_lock.lock().expect("apply lock poisoned");
        let mut vol = self.vol.lock().expect("metadata log ring poisoned");
        Self::apply_range(&mut vol, apply)
    }

    fn apply_range(vol: &mut Vol, apply: ApplyFn<'_>) -> Result<()> {
        if vol.start_off == vol.persist_point {
            return Ok(());
        }
        let range = vol.buf[vol.start_off..vol.persist_point].to_vec();
        vol.start_off = vol.persist_point;
        for record in parse_records(&range)? {
            apply(record.offset, &record.data)?;
        }
        Ok(())
    }

    /// Recovery: re-reads the persistent journal chunk by chunk, verifies the
    /// counter chain, replays every record through the secure write path and
    /// truncates on success.
    pub fn apply_rec(&self, apply: ApplyFn<'_>) -> Result<()> {
        let start = self.counters.get(ML_START_COUNTER_IDX);
        let end = self.counters.get(ML_END_COUNTER_IDX);
        if end <= start {
            return Ok(());
        }

        let mut scratch = Vec::new();
        {
            let pm = self.pm.lock().expect("metadata log file poisoned");
            let mut off = 0usize;
            let mut current = start;
            while current < end {
                if off + CHUNK_OVERHEAD > pm.size {
                    return Err(Error::Corrupted(
                        "metadata log chunk chain runs past the file".to_string(),
                    ));
                }
                let mut tag = [0u8; TAG_SIZE];
                tag.copy_from_slice(&pm.map[off..off + TAG_SIZE]);
                let size = u64::from_le_bytes(
                    pm.map[off + TAG_SIZE..off + CHUNK_PLAIN_HDR]
                        .try_into()
                        .expect("chunk size"),
                ) as usize;
                if off + CHUNK_OVERHEAD + size > pm.size {
                    return Err(Error::Corrupted(
                        "metadata log chunk size runs past the file".to_string(),
                    ));
                }
                let cipher = &pm.map[off + CHUNK_PLAIN_HDR..off + CHUNK_OVERHEAD + size];
                let iv = iv_pair(0, current);
                let plain = self
                    .aead
                    .decrypt_two_parts(&cipher[..CHUNK_ENC_HDR], &cipher[CHUNK_ENC_HDR..], &tag, b"", &iv)
                    .ok_or_else(|| {
                        Error::Corrupted("metadata log chunk failed decryption".to_string())
                    })?;
                let chunk_pool = u64::from_le_bytes(plain[..8].try_into().expect("chunk pool"));
                let chunk_tcv = u64::from_le_bytes(plain[8..16].try_into().expect("chunk tcv"));
                if chunk_pool != self.pool_id || chunk_tcv != current {
                    return Err(Error::Corrupted(format!(
                        "metadata log counter mismatch: chunk holds {chunk_tcv}, expected {current}"
                    )));
                }
                scratch.extend_from_slice(&plain[CHUNK_ENC_HDR..]);
                off += CHUNK_OVERHEAD + size;
                current += 1;
            }
        }

        for record in parse_records(&scratch)? {
            apply(record.offset, &record.data)?;
        }
        self.truncate();
        Ok(())
    }

    /// Invalidates the persistent journal once its records are applied and
    /// stable.
    pub fn truncate(&self) {
        self.counters
            .set(ML_START_COUNTER_IDX, self.counters.get(ML_END_COUNTER_IDX));
        let mut pm = self.pm.lock().expect("metadata log file poisoned");
        pm.end_off = 0;
    }

    /// Persist-all + apply + invalidate; the shutdown sequence.
    pub fn close(&self, apply: ApplyFn<'_>) -> Result<()> {
        self.persist(None, apply)?;
        let end = self.counters.get(ML_END_COUNTER_IDX);
        self.counters.wait_stable(ML_END_COUNTER_IDX, end);
        self.apply_rt(apply)?;
        self.truncate();
        Ok(())
    }
}

fn parse_records(buf: &[u8]) -> Result<Vec<LogRecord>> {
    let mut records = Vec::new();
    let mut off = 0usize;
    while off + LOG_ENTRY_HDR <= buf.len() {
        let offset = u64::from_le_bytes(buf[off..off + 8].try_into().expect("record offset"));
        let size =
            u64::from_le_bytes(buf[off + 8..off + 16].try_into().expect("record size")) as usize;
        if off + LOG_ENTRY_HDR + size > buf.len() {
            return Err(Error::Corrupted(
                "metadata log record runs past its chunk".to_string(),
            ));
        }
        records.push(LogRecord {
            offset,
            data: buf[off + LOG_ENTRY_HDR..off + LOG_ENTRY_HDR + size].to_vec(),
        });
        off += LOG_ENTRY_HDR + size;
    }
    if off != buf.len() {
        return Err(Error::Corrupted(
            "metadata log record chain has trailing bytes".to_string(),
        ));
    }
    Ok(records)
}

//! Recovery coordinator: runs after the manifest scan, reconciling every
//! lane that crashed between TX_COMMIT and TX_FINISH. Redo wins if and only
//! if its first entry already reached the pool; otherwise the undo chain
//! rolls the lane back. Outstanding 8-byte atomic snapshots are restored
//! last.

use crate::aead::{iv_pair, Aead, Tag};
use crate::constants::{MANIFEST_END_COUNTER_IDX, NLANES};
use crate::counters::CounterBank;
use crate::epc::Epc;
use crate::error::{Error, Result};
use crate::manifest::{Manifest, ObjectKind, ScanOutcome, TxRecState, TxStage};
use crate::pool::PoolFile;
use crate::ulog::{apply_val_op, UlogChain, UlogEntry, EXTERNAL_REDO_CHAIN, UNDO_CHAIN};

/// Re-encrypts a restored plaintext and publishes it through the manifest,
/// exactly like a non-transactional metadata write.
fn rewrite_object(
    pool: &PoolFile,
    aead: &Aead,
    manifest: &Manifest,
    offset: u64,
    plain: &[u8],
) -> Result<()> {
    let iv = iv_pair(pool.uuid(), offset);
    let (cipher, tag) = aead.encrypt(plain, b"", &iv);
    pool.write(offset, &cipher, true);
    manifest.append_object_entry(
        ObjectKind::Undo,
        pool.uuid(),
        offset,
        Some(&tag),
        NLANES as u64,
        plain.len() as u64,
        false,
        true,
    )?;
    Ok(())
}

/// Decrypts an object with the given tag, preferring the post-state tag
/// from the lane's redo temp list over the EPC's pre-state one.
fn decrypt_object(
    pool: &PoolFile,
    aead: &Aead,
    offset: u64,
    size: usize,
    tags: &[&Tag],
) -> Option<Vec<u8>> {
    let cipher = pool.read(offset, size);
    let iv = iv_pair(pool.uuid(), offset);
    tags.iter().find_map(|tag| aead.decrypt(&cipher, tag, b"", &iv))
}

/// Reconciles all unfinished lanes and outstanding atomic snapshots.
pub(crate) fn recover(
    pool: &PoolFile,
    aead: &Aead,
    counters: &CounterBank,
    epc: &Epc,
    manifest: &Manifest,
    outcome: &mut ScanOutcome,
) -> Result<()> {
    let pool_id = pool.uuid();
    let mut recovered = 0u32;

    for lane in 0..NLANES {
        match outcome.unfinished[lane] {
            TxRecState::Idle => {}
            TxRecState::Started => {
                // the scan already discarded the temp lists on TX_START;
                // the pool never saw this transaction
                outcome.temp_undo[lane].discard();
                outcome.temp_redo[lane].discard();
            }
            TxRecState::Committed => {
                if replay_redo(pool, aead, counters, epc, manifest, outcome, lane)? {
                    manifest.commit_temp_lists(outcome, lane);
                    manifest.append_tx_info(pool_id, lane as u64, TxStage::Finish)?;
                } else {
                    replay_undo(pool, aead, counters, epc, manifest, lane)?;
                    manifest.append_tx_info(pool_id, lane as u64, TxStage::Abort)?;
                    outcome.temp_undo[lane].discard();
                    outcome.temp_redo[lane].discard();
                }
                outcome.unfinished[lane] = TxRecState::Idle;
                recovered += 1;
            }
        }
    }

    // pending atomic updates: put the pre-write ciphertext words back
    for snap in outcome.atomic_snapshots.drain(..) {
        pool.write(
            snap.offset + snap.internal_offset,
            &snap.old_data.to_le_bytes(),
            true,
        );
    }

    if recovered > 0 {
        counters.persist_all();
        let end = counters.get(MANIFEST_END_COUNTER_IDX);
        counters.wait_stable(MANIFEST_END_COUNTER_IDX, end);
    }
    Ok(())
}

/// Attempts redo replay on the lane's external chain. Returns true when the
/// first entry was already applied to the pool, in which case every entry is
/// (re-)applied — the operations are idempotent.
fn replay_redo(
    pool: &PoolFile,
    aead: &Aead,
    counters: &CounterBank,
    epc: &Epc,
    manifest: &Manifest,
    outcome: &ScanOutcome,
    lane: usize,
) -> Result<bool> {
    let chain = UlogChain::new(lane, EXTERNAL_REDO_CHAIN, pool);
    let Some(hdr) = chain.read_header(pool, aead, epc)? else {
        return Ok(false);
    };
    let entries = chain.fetch_entries(pool, aead, counters, &hdr);
    let Some(first) = entries.first() else {
        return Ok(false);
    };

    // "applied" means the pool ciphertext of the first entry's object
    // verifies under the post-state tag the redo temp list recorded
    let first_obj = match first {
        UlogEntry::Buf(b) => b.obj_off,
        UlogEntry::Val(v) => v.bitmap_base,
    };
    let Some(temp) = outcome.temp_redo[lane].find(pool.uuid(), first_obj) else {
        return Ok(false);
    };
    if decrypt_object(pool, aead, first_obj, temp.size as usize, &[&temp.tag]).is_none() {
        return Ok(false);
    }

    for entry in &entries {
        match entry {
            UlogEntry::Buf(buf) => {
                let size = outcome.temp_redo[lane]
                    .find(pool.uuid(), buf.obj_off)
                    .map(|t| t.size as usize)
                    .or_else(|| epc.peek(buf.obj_off).map(|e| e.logical_size() as usize))
                    .unwrap_or(buf.payload.len());
                let mut tags: Vec<&Tag> = Vec::new();
                let temp_tag = outcome.temp_redo[lane]
                    .find(pool.uuid(), buf.obj_off)
                    .map(|t| t.tag);
                let epc_tag = epc.peek(buf.obj_off).map(|e| e.tag);
                if let Some(t) = temp_tag.as_ref() {
                    tags.push(t);
                }
                if let Some(t) = epc_tag.as_ref() {
                    tags.push(t);
                }
                let mut plain = match decrypt_object(pool, aead, buf.obj_off, size, &tags) {
                    Some(p) => p,
                    None if buf.target_off == buf.obj_off && buf.payload.len() == size => {
                        // whole-object post-image carries everything needed
                        vec![0u8; size]
                    }
                    None => {
                        return Err(Error::Corrupted(format!(
                            "redo target {:#x} failed decryption during replay",
                            buf.obj_off
                        )))
                    }
                };
                let at = (buf.target_off - buf.obj_off) as usize;
                plain[at..at + buf.payload.len()].copy_from_slice(&buf.payload);
                rewrite_object(pool, aead, manifest, buf.obj_off, &plain)?;
            }
            UlogEntry::Val(val) => {
                let size = outcome.temp_redo[lane]
                    .find(pool.uuid(), val.bitmap_base)
                    .map(|t| t.size as usize)
                    .or_else(|| epc.peek(val.bitmap_base).map(|e| e.logical_size() as usize))
                    .ok_or_else(|| {
                        Error::Corrupted(format!(
                            "redo val target {:#x} unknown during replay",
                            val.bitmap_base
                        ))
                    })?;
                let mut tags: Vec<&Tag> = Vec::new();
                let temp_tag = outcome.temp_redo[lane]
                    .find(pool.uuid(), val.bitmap_base)
                    .map(|t| t.tag);
                let epc_tag = epc.peek(val.bitmap_base).map(|e| e.tag);
                if let Some(t) = temp_tag.as_ref() {
                    tags.push(t);
                }
                if let Some(t) = epc_tag.as_ref() {
                    tags.push(t);
                }
                let mut plain = decrypt_object(pool, aead, val.bitmap_base, size, &tags)
                    .ok_or_else(|| {
                        Error::Corrupted(format!(
                            "redo val target {:#x} failed decryption during replay",
                            val.bitmap_base
                        ))
                    })?;
                let at = (val.target_off - val.bitmap_base) as usize;
                let word = u64::from_le_bytes(plain[at..at + 8].try_into().expect("val word"));
                let new = apply_val_op(word, val.op, val.value);
                plain[at..at + 8].copy_from_slice(&new.to_le_bytes());
                rewrite_object(pool, aead, manifest, val.bitmap_base, &plain)?;
            }
        }
    }
    Ok(true)
}

/// Replays the undo chain, restoring pre-images to the pool. Only buf
/// entries live in undo chains; a missing or empty chain is a no-op.
fn replay_undo(
    pool: &PoolFile,
    aead: &Aead,
    counters: &CounterBank,
    epc: &Epc,
    manifest: &Manifest,
    lane: usize,
) -> Result<()> {
    let chain = UlogChain::new(lane, UNDO_CHAIN, pool);
    if counters.get(chain.end_counter) <= counters.get(chain.start_counter) {
        return Ok(());
    }
    let Some(hdr) = chain.read_header(pool, aead, epc)? else {
        return Ok(());
    };
    let entries = chain.fetch_entries(pool, aead, counters, &hdr);
    for entry in entries.iter().rev() {
        let UlogEntry::Buf(buf) = entry else { continue };
        let size = epc
            .peek(buf.obj_off)
            .map(|e| e.logical_size() as usize)
            .unwrap_or(buf.payload.len());
        let epc_tag = epc.peek(buf.obj_off).map(|e| e.tag);
        let tags: Vec<&Tag> = epc_tag.iter().collect();
        let mut plain = match decrypt_object(pool, aead, buf.obj_off, size, &tags) {
            Some(p) => p,
            None if buf.target_off == buf.obj_off && buf.payload.len() == size => {
                vec![0u8; size]
            }
            None => {
                return Err(Error::Corrupted(format!(
                    "undo target {:#x} failed decryption during replay",
                    buf.obj_off
                )))
            }
        };
        let at = (buf.target_off - buf.obj_off) as usize;
        plain[at..at + buf.payload.len()].copy_from_slice(&buf.payload);
        rewrite_object(pool, aead, manifest, buf.obj_off, &plain)?;
    }
    chain.invalidate(counters);
    Ok(())
}

//! Trusted counter bank: a fixed table of monotone counters backing every
//! freshness proof in the crate. Values live in memory and are mirrored into
//! an mmapped file by a background writer thread on a bounded interval,
//! modelling a hardware monotonic counter that takes time to become durable.
//! A counter value is *stable* once the writer has flushed it; commits must
//! wait for stability before reporting success.

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use memmap2::MmapMut;

use crate::constants::MAX_COUNTERS;
use crate::error::{Error, Result};

/// End-of-table sentinel written after the flush index
const SENTINEL: u64 = u64::MAX;

/// File holds every counter slot, the flush index and the sentinel
const FILE_SIZE: u64 = ((MAX_COUNTERS + 2) * 8) as u64;

/// Messages for communication between the bank and its writer thread
enum BankMessage {
    Flush,
    Shutdown,
}

struct BankShared {
    /// Flushes take the write side; counter mutations take the read side so
    /// concurrent increments proceed without serialisation.
    lock: RwLock<()>,
    values: Vec<AtomicU64>,
    present: Vec<AtomicBool>,
    max_index: AtomicUsize,
    /// Snapshot of the last flushed values, consulted by `stable_at_least`
    stable: Vec<AtomicU64>,
    hw_index: AtomicU64,
    map: Mutex<MmapMut>,
}

impl BankShared {
    /// Mirrors the live counters into the mmapped file and the stable
    /// snapshot. Caller must hold the write side of `lock`.
    fn flush(&self) {
        let mut map = self.map.lock().expect("counter map lock poisoned");
        let max = self.max_index.load(Ordering::SeqCst);
        for i in 0..max {
            let v = self.values[i].load(Ordering::SeqCst);
            map[i * 8..i * 8 + 8].copy_from_slice(&v.to_le_bytes());
            self.stable[i].store(v, Ordering::SeqCst);
        }
        let hw = self.hw_index.fetch_add(1, Ordering::SeqCst) + 1;
        map[max * 8..max * 8 + 8].copy_from_slice(&hw.to_le_bytes());
        map[(max + 1) * 8..(max + 1) * 8 + 8].copy_from_slice(&SENTINEL.to_le_bytes());
        let _ = map.flush();
    }
}

/// Process-global counter bank persisted through an mmapped file.
pub struct CounterBank {
    shared: Arc<BankShared>,
    sender: Sender<BankMessage>,
    writer: Mutex<Option<JoinHandle<()>>>,
}

impl CounterBank {
    /// Opens (or creates) the counter file at `path` and boots the writer
    /// thread flushing every `flush_interval`.
    pub fn open(path: &Path, flush_interval: Duration) -> Result<Self> {
        let preexisting = path.metadata().map(|m| m.len() >= 16).unwrap_or(false);
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        file.set_len(FILE_SIZE)?;
        let map = unsafe { MmapMut::map_mut(&file)? };

        let shared = Arc::new(BankShared {
            lock: RwLock::new(()),
            values: (0..MAX_COUNTERS).map(|_| AtomicU64::new(0)).collect(),
            present: (0..MAX_COUNTERS).map(|_| AtomicBool::new(false)).collect(),
            max_index: AtomicUsize::new(0),
            stable: (0..MAX_COUNTERS).map(|_| AtomicU64::new(0)).collect(),
            hw_index: AtomicU64::new(0),
            map: Mutex::new(map),
        });

        if preexisting {
            Self::load(&shared)?;
        }

        let (sender, receiver) = mpsc::channel();
        let writer_shared = Arc::clone(&shared);
        let writer = thread::spawn(move || loop {
            match receiver.recv_timeout(flush_interval) {
                Ok(BankMessage::Flush) | Err(RecvTimeoutError::Timeout) => {
                    let _guard = writer_shared.lock.write().expect("counter lock poisoned");
                    writer_shared.flush();
                }
                Ok(BankMessage::Shutdown) | Err(RecvTimeoutError::Disconnected) => {
                    let _guard = writer_shared.lock.write().expect("counter lock poisoned");
                    writer_shared.flush();
                    break;
                }
            }
        });

        let bank = Self {
            shared,
            sender,
            writer: Mutex::new(Some(writer)),
        };
        // A fresh file gets its sentinel immediately so a crash before the
        // first timed flush still leaves a well-formed table.
        if !preexisting {
            bank.persist_all();
        }
        Ok(bank)
    }

    /// Reads the persisted table back: counter values until the flush index,
    /// then the sentinel.
    fn load(shared: &BankShared) -> Result<()> {
        let map = shared.map.lock().expect("counter map lock poisoned");
        let mut collected = Vec::new();
        for i in 0..MAX_COUNTERS + 2 {
            let mut word = [0u8; 8];
            word.copy_from_slice(&map[i * 8..i * 8 + 8]);
            let v = u64::from_le_bytes(word);
            if v == SENTINEL {
                let count = collected.len().saturating_sub(1);
                let hw = collected.last().copied().unwrap_or(0);
                for (idx, value) in collected[..count].iter().enumerate() {
                    shared.values[idx].store(*value, Ordering::SeqCst);
                    shared.stable[idx].store(*value, Ordering::SeqCst);
                    shared.present[idx].store(true, Ordering::SeqCst);
                }
                shared.max_index.store(count, Ordering::SeqCst);
                shared.hw_index.store(hw, Ordering::SeqCst);
                return Ok(());
            }
            collected.push(v);
        }
        Err(Error::CounterFile(
            "no end sentinel found in counter table".to_string(),
        ))
    }

    /// Returns whether a counter was ever created at `idx`.
    pub fn exists(&self, idx: usize) -> bool {
        idx < MAX_COUNTERS && self.shared.present[idx].load(Ordering::SeqCst)
    }

    /// Creates a counter at `idx` with the given initial value.
    pub fn create_at(&self, idx: usize, init: u64) {
        assert!(idx < MAX_COUNTERS, "counter index out of range");
        let _guard = self.shared.lock.read().expect("counter lock poisoned");
        self.shared.values[idx].store(init, Ordering::SeqCst);
        self.shared.present[idx].store(true, Ordering::SeqCst);
        self.shared.max_index.fetch_max(idx + 1, Ordering::SeqCst);
    }

    /// Current live value of the counter at `idx`.
    pub fn get(&self, idx: usize) -> u64 {
        self.shared.values[idx].load(Ordering::SeqCst)
    }

    /// Overwrites the counter at `idx`.
    pub fn set(&self, idx: usize, v: u64) {
        let _guard = self.shared.lock.read().expect("counter lock poisoned");
        self.shared.values[idx].store(v, Ordering::SeqCst);
    }

    /// Increments the counter and returns its previous value, so the counter
    /// always holds the next value to be handed out.
    pub fn inc(&self, idx: usize) -> u64 {
        let _guard = self.shared.lock.read().expect("counter lock poisoned");
        self.shared.values[idx].fetch_add(1, Ordering::SeqCst)
    }

    /// Whether the persisted watermark for `idx` has reached `v`.
    pub fn stable_at_least(&self, idx: usize, v: u64) -> bool {
        self.shared.stable[idx].load(Ordering::SeqCst) >= v
    }

    /// Blocks until the counter at `idx` is stable at `v`. The writer thread
    /// flushes on a bounded interval, so this terminates.
    pub fn wait_stable(&self, idx: usize, v: u64) {
        while !self.stable_at_least(idx, v) {
            let _ = self.sender.send(BankMessage::Flush);
            thread::yield_now();
        }
    }

    /// Forces a synchronous flush of the whole table.
    pub fn persist_all(&self) {
        let _guard = self.shared.lock.write().expect("counter lock poisoned");
        self.shared.flush();
    }

    /// Stops the writer thread after a final flush.
    pub fn close(&self) {
        let _ = self.sender.send(BankMessage::Shutdown);
        if let Some(handle) = self.writer.lock().expect("writer handle lock poisoned").take() {
            let _ = handle.join();
        }
    }
}

impl Drop for CounterBank {
    fn drop(&mut self) {
        self.close();
    }
}

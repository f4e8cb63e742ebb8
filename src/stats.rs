//! Lightweight operation statistics: per-kind counters and accumulated
//! wall-clock, cheap enough to stay always-on.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Instrumented operation kinds
#[derive(Debug, Clone, Copy)]
pub enum StatKind {
    Read,
    Write,
    Alloc,
    Free,
    TxCommit,
    TxAbort,
    MlPersist,
}

const STAT_KINDS: usize = 7;

const STAT_NAMES: [&str; STAT_KINDS] = [
    "read",
    "write",
    "alloc",
    "free",
    "tx_commit",
    "tx_abort",
    "ml_persist",
];

/// Counter bank for operation statistics.
#[derive(Default)]
pub struct Stats {
    counts: [AtomicU64; STAT_KINDS],
    nanos: [AtomicU64; STAT_KINDS],
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `f`, accounting its duration under `kind`.
    pub fn measure<R>(&self, kind: StatKind, f: impl FnOnce() -> R) -> R {
        let start = Instant::now();
        let out = f();
        let elapsed = start.elapsed().as_nanos() as u64;
        self.counts[kind as usize].fetch_add(1, Ordering::Relaxed);
        self.nanos[kind as usize].fetch_add(elapsed, Ordering::Relaxed);
        out
    }

    /// Renders the counters as a JSON object keyed by operation name.
    pub fn to_json(&self) -> serde_json::Value {
        let mut map = serde_json::Map::new();
        for (i, name) in STAT_NAMES.iter().enumerate() {
            let count = self.counts[i].load(Ordering::Relaxed);
            let nanos = self.nanos[i].load(Ordering::Relaxed);
            map.insert(
                (*name).to_string(),
                serde_json::json!({
                    "count": count,
                    "total_us": nanos / 1_000,
                }),
            );
        }
        serde_json::Value::Object(map)
    }
}

use std::fmt;
use std::io;

/// Custom error type for sealpool operations
#[derive(Debug)]
pub enum Error {
    /// I/O error from underlying file operations
    Io(io::Error),
    /// Decryption tag mismatch on an object read; the pool is corrupted
    TagMismatch { pool_id: u64, offset: u64 },
    /// Manifest, metadata log or counter state failed verification
    Corrupted(String),
    /// Counter file is missing or malformed
    CounterFile(String),
    /// Manifest ran out of slots before compaction could reclaim space
    ManifestFull,
    /// Pool heap cannot satisfy an allocation of this many bytes
    PoolFull(usize),
    /// Snapshot request exceeds the maximum allocation size
    SnapshotTooLarge(usize),
    /// Snapshot range falls outside the pool heap
    SnapshotOutOfRange { offset: u64, size: usize },
    /// The active transaction was canceled (allocator failure mid-commit)
    TxCanceled,
    /// A lane was used in the wrong transaction stage
    InvalidStage { expected: &'static str, found: &'static str },
    /// Pool file is locked by another process
    Locked(String),
    /// Other errors
    Other(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(err) => write!(f, "I/O error: {err}"),
            Error::TagMismatch { pool_id, offset } => write!(
                f,
                "decryption tag mismatch for object {pool_id:#x}:{offset:#x}: pool corrupted"
            ),
            Error::Corrupted(msg) => write!(f, "corrupted state: {msg}"),
            Error::CounterFile(msg) => write!(f, "counter file error: {msg}"),
            Error::ManifestFull => write!(f, "manifest is full"),
            Error::PoolFull(size) => write!(f, "pool heap cannot allocate {size} bytes"),
            Error::SnapshotTooLarge(size) => {
                write!(f, "snapshot of {size} bytes exceeds the maximum allocation size")
            }
            Error::SnapshotOutOfRange { offset, size } => {
                write!(f, "snapshot [{offset:#x}; {size} bytes) lies outside the pool heap")
            }
            Error::TxCanceled => write!(f, "transaction canceled"),
            Error::InvalidStage { expected, found } => {
                write!(f, "lane held in stage {found}, expected {expected}")
            }
            Error::Locked(msg) => write!(f, "pool file is locked: {msg}"),
            Error::Other(msg) => write!(f, "pool error: {msg}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(err)
    }
}

/// Result type for sealpool operations
pub type Result<T> = std::result::Result<T, Error>;

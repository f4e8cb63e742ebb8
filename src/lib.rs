//! # Examples
//!
//! ```no_run
//! use tempfile::tempdir;
//! use sealpool::{PoolConfig, PoolPaths, Result, SecurePool};
//!
//! # fn main() -> Result<()> {
//!     let dir = tempdir()?;
//!     let paths = PoolPaths::derive(dir.path().join("demo.pool"));
//!     let key = b"0123456789012345";
//!
//!     let pool = SecurePool::create(&paths, &PoolConfig::default(), key)?;
//!     let oid = pool.zalloc(512)?;
//!     pool.write(oid, &vec![1u8; 512])?;
//!
//!     let mut tx = pool.tx_begin()?;
//!     tx.add_range(oid, 0, 16)?;
//!     tx.write_part(oid, 0, &[0xFF; 16])?;
//!     tx.commit()?;
//!
//!     assert_eq!(pool.read(oid)?.unwrap()[0], 0xFF);
//!     drop(tx);
//!     pool.close()?;
//!     # Ok(())
//! # }
//! ```

mod aead;
mod constants;
pub mod counters;
pub mod epc;
mod error;
mod manifest;
mod mdlog;
mod pool;
mod recovery;
mod sobj;
mod stats;
mod tx;
mod ulog;

pub use constants::{KEY_SIZE, MAX_ALLOC_SIZE, NLANES};
pub use error::{Error, Result};
pub use sobj::{ObjId, PoolConfig, PoolPaths, SecurePool};
pub use tx::{RangeFlags, Tx};
pub use ulog::RedoOp;

//! # blockpool
//!
//! A concurrent allocator of fixed-size memory blocks for data-parallel
//! workloads. Each worker thread owns a private cache of free blocks, so
//! allocation and deallocation are usually a couple of pointer writes with
//! no synchronization; whole lists of blocks move through a lock-free
//! shared pool when a worker runs dry or accumulates too many.
//!
//! ## Quick start
//!
//! ```
//! use std::sync::Arc;
//! use blockpool::{BlockPool, BlockPoolConfig, RayonScheduler};
//!
//! # fn main() -> Result<(), blockpool::PoolError> {
//! let scheduler = Arc::new(RayonScheduler::new(2)?);
//! let pool = BlockPool::new(BlockPoolConfig::new(128), scheduler.clone())?;
//!
//! scheduler.install(|| {
//!     let block = pool.allocate()?;
//!     // ... use the 128 bytes at `block` ...
//!     unsafe { pool.free(block) }
//! })?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Design
//!
//! - **Fixed block size.** One pool serves one size; run several pools for
//!   several sizes.
//! - **Worker-owned caches.** The fast path touches only the calling
//!   worker's cache. A midpoint watermark lets an overfull cache shed half
//!   its blocks in constant time.
//! - **List-granular sharing.** Workers exchange blocks only in full lists
//!   through a lock-free stack, keeping contention off the common case.
//! - **Memory retention.** System memory is acquired in large regions and
//!   returned only by [`BlockPool::clear`] or on drop, never block by block.
//!
//! Blocks may be freed on a different worker than the one that allocated
//! them. Calls from threads the scheduler does not manage fail with
//! [`PoolError::ForeignThread`].

pub mod error;
pub mod platform;
pub mod pool;
pub mod scheduler;
pub mod utils;

pub use error::{PoolError, PoolResult};
pub use pool::{BlockPool, BlockPoolConfig, DEFAULT_LIST_BYTES, PoolStatsSnapshot};
pub use scheduler::{RayonScheduler, WorkerScheduler};

/// Commonly used types.
pub mod prelude {
    pub use crate::error::{PoolError, PoolResult};
    pub use crate::pool::{BlockPool, BlockPoolConfig, PoolStatsSnapshot};
    pub use crate::scheduler::{RayonScheduler, WorkerScheduler};
}

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

//! Concurrent fixed-size block pool.
//!
//! [`BlockPool`] serves equal-sized blocks to a fixed set of worker threads.
//! Each worker keeps a private stack of free blocks, so the common case of
//! allocating and freeing on the same worker touches no shared state at all.
//! Workers exchange memory in whole lists of blocks through a lock-free
//! shared pool, which bounds how much memory any one worker can hoard.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use blockpool::{BlockPool, BlockPoolConfig, RayonScheduler};
//!
//! let scheduler = Arc::new(RayonScheduler::new(4)?);
//! let pool = BlockPool::new(BlockPoolConfig::new(64), scheduler.clone())?;
//!
//! scheduler.install(|| {
//!     let block = pool.allocate()?;
//!     unsafe { pool.free(block) }
//! })?;
//! # Ok::<(), blockpool::PoolError>(())
//! ```

mod block_pool;
mod free_list;
mod regions;
mod stats;

pub use block_pool::BlockPool;
pub use stats::PoolStatsSnapshot;

use crate::error::{PoolError, PoolResult};
use crate::platform;
use crate::utils::is_aligned;

/// Default bytes of blocks per exchanged list: 4 MiB less room for an
/// allocator header.
pub const DEFAULT_LIST_BYTES: usize = (1 << 22) - 64;

/// Smallest usable list length. Below this the cache watermark and the
/// split threshold coincide and the spill protocol degenerates.
const MIN_LIST_LENGTH: usize = 2;

/// Configuration for a [`BlockPool`].
///
/// Only the block size is required; everything else has defaults sized for
/// typical workloads.
///
/// ```
/// use blockpool::BlockPoolConfig;
///
/// let config = BlockPoolConfig::new(64)
///     .with_reserved_blocks(10_000)
///     .with_max_blocks(1 << 24);
/// ```
#[derive(Debug, Clone)]
pub struct BlockPoolConfig {
    /// Size of every block in bytes.
    pub block_size: usize,
    /// Blocks to pre-allocate before the pool is returned.
    pub reserved_blocks: usize,
    /// Target bytes of blocks per exchanged list.
    pub list_bytes: usize,
    /// Ceiling on total allocated blocks; defaults to a fraction of RAM.
    pub max_blocks: Option<usize>,
}

impl BlockPoolConfig {
    /// Configuration with defaults for the given block size.
    pub fn new(block_size: usize) -> Self {
        Self {
            block_size,
            reserved_blocks: 0,
            list_bytes: DEFAULT_LIST_BYTES,
            max_blocks: None,
        }
    }

    /// Pre-allocate at least this many blocks at construction.
    #[must_use]
    pub fn with_reserved_blocks(mut self, blocks: usize) -> Self {
        self.reserved_blocks = blocks;
        self
    }

    /// Override the target bytes per exchanged list.
    #[must_use]
    pub fn with_list_bytes(mut self, bytes: usize) -> Self {
        self.list_bytes = bytes;
        self
    }

    /// Cap the total number of blocks the pool may carve out.
    #[must_use]
    pub fn with_max_blocks(mut self, max_blocks: usize) -> Self {
        self.max_blocks = Some(max_blocks);
        self
    }

    /// Blocks per exchanged list under this configuration.
    pub fn list_length(&self) -> usize {
        (self.list_bytes / self.block_size).max(MIN_LIST_LENGTH)
    }

    pub(crate) fn validate(&self) -> PoolResult<()> {
        let min = size_of::<usize>();
        if self.block_size < min {
            return Err(PoolError::invalid_config(format!(
                "block size {} is below the minimum of {min} bytes",
                self.block_size
            )));
        }
        if !is_aligned(self.block_size, align_of::<usize>()) {
            return Err(PoolError::invalid_config(format!(
                "block size {} is not a multiple of the pointer alignment",
                self.block_size
            )));
        }
        Ok(())
    }

    /// Effective ceiling: the explicit setting, or three quarters of
    /// physical memory, or unlimited when memory size is unknown.
    pub(crate) fn resolved_max_blocks(&self) -> usize {
        if let Some(max) = self.max_blocks {
            return max;
        }
        let total = platform::total_memory();
        if total == 0 {
            usize::MAX
        } else {
            (total / self.block_size).saturating_mul(3) / 4
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_list_length_derivation() {
        let config = BlockPoolConfig::new(64).with_list_bytes(6400);
        assert_eq!(config.list_length(), 100);
    }

    #[test]
    fn test_list_length_clamped() {
        // A list shorter than the block leaves room for less than one
        // block; the clamp keeps the exchange protocol meaningful.
        let config = BlockPoolConfig::new(4096).with_list_bytes(100);
        assert_eq!(config.list_length(), MIN_LIST_LENGTH);
    }

    #[test]
    fn test_validate_rejects_tiny_blocks() {
        assert!(BlockPoolConfig::new(4).validate().is_err());
        assert!(BlockPoolConfig::new(size_of::<usize>()).validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_misaligned_blocks() {
        let odd = size_of::<usize>() + 1;
        assert!(BlockPoolConfig::new(odd).validate().is_err());
        assert!(BlockPoolConfig::new(64).validate().is_ok());
    }

    #[test]
    fn test_explicit_max_blocks_wins() {
        let config = BlockPoolConfig::new(64).with_max_blocks(123);
        assert_eq!(config.resolved_max_blocks(), 123);
    }
}

//! Error types for block pool operations

use thiserror::Error;

/// Result type for pool operations
pub type PoolResult<T> = Result<T, PoolError>;

/// Block pool errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PoolError {
    /// The operating system refused a memory request
    #[error("out of memory: requested {requested} bytes from the system")]
    OutOfMemory {
        /// Bytes requested from the system allocator
        requested: usize,
    },

    /// The configured block ceiling would be exceeded
    #[error("block limit exceeded: {allocated} blocks allocated, limit is {max_blocks}")]
    BlockLimitExceeded {
        /// Total blocks carved out of raw memory so far
        allocated: usize,
        /// Configured ceiling
        max_blocks: usize,
    },

    /// Teardown was requested while blocks are still checked out
    #[error("{used} blocks still outstanding; refusing to release pool memory")]
    BlocksOutstanding {
        /// Blocks currently held by callers
        used: usize,
    },

    /// The calling thread is not one of the scheduler's workers
    #[error("calling thread is not a scheduler worker")]
    ForeignThread,

    /// Invalid pool or scheduler configuration
    #[error("invalid configuration: {message}")]
    InvalidConfig {
        /// Human-readable description of the problem
        message: String,
    },
}

impl PoolError {
    /// Create an out of memory error
    pub fn out_of_memory(requested: usize) -> Self {
        Self::OutOfMemory { requested }
    }

    /// Create a block limit error
    pub fn block_limit(allocated: usize, max_blocks: usize) -> Self {
        Self::BlockLimitExceeded { allocated, max_blocks }
    }

    /// Create a blocks outstanding error
    pub fn blocks_outstanding(used: usize) -> Self {
        Self::BlocksOutstanding { used }
    }

    /// Create a configuration error
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig { message: message.into() }
    }
}

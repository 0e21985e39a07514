//! Point-in-time pool statistics.

use std::fmt;

use crate::utils::format_bytes;

/// Snapshot of pool usage counters.
///
/// Taken while other workers run, the numbers are individually accurate but
/// may not describe a single instant; quiesce the pool first for exact
/// figures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatsSnapshot {
    /// Blocks currently checked out by callers.
    pub used_blocks: usize,
    /// Blocks carved out of raw memory over the pool's lifetime.
    pub allocated_blocks: usize,
    /// Size of every block in bytes.
    pub block_size: usize,
    /// Bytes held in regions obtained from the system.
    pub total_bytes: usize,
}

impl PoolStatsSnapshot {
    /// Fraction of allocated blocks currently in use, in `[0.0, 1.0]`.
    pub fn utilization(&self) -> f64 {
        if self.allocated_blocks == 0 {
            0.0
        } else {
            self.used_blocks as f64 / self.allocated_blocks as f64
        }
    }
}

impl fmt::Display for PoolStatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "used: {}/{} blocks ({:.1}%), block size: {}, region bytes: {}",
            self.used_blocks,
            self.allocated_blocks,
            self.utilization() * 100.0,
            format_bytes(self.block_size),
            format_bytes(self.total_bytes),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_utilization() {
        let stats = PoolStatsSnapshot {
            used_blocks: 50,
            allocated_blocks: 200,
            block_size: 64,
            total_bytes: 12800,
        };
        assert!((stats.utilization() - 0.25).abs() < 1e-9);

        let empty = PoolStatsSnapshot {
            used_blocks: 0,
            allocated_blocks: 0,
            block_size: 64,
            total_bytes: 0,
        };
        assert_eq!(empty.utilization(), 0.0);
    }

    #[test]
    fn test_display() {
        let stats = PoolStatsSnapshot {
            used_blocks: 50,
            allocated_blocks: 200,
            block_size: 64,
            total_bytes: 12800,
        };
        let text = stats.to_string();
        assert!(text.contains("50/200 blocks"));
        assert!(text.contains("25.0%"));
        assert!(text.contains("block size: 64 B"));
        assert!(text.contains("region bytes: 12.50 KB"));
    }
}

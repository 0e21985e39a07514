//! Worker scheduler seam.
//!
//! The pool never spawns threads of its own; it relies on an external
//! scheduler that assigns every managed thread a stable worker id in
//! `[0, num_workers)`. The id selects the worker's private cache, so the
//! fast path must only ever run on managed threads.
//!
//! [`RayonScheduler`] is the provided backend, wrapping a fixed-size
//! `rayon::ThreadPool`. Other runtimes can plug in by implementing
//! [`WorkerScheduler`].

use std::ops::Range;

use rayon::prelude::*;

use crate::error::{PoolError, PoolResult};

/// A fixed pool of cooperating worker threads.
///
/// Implementations must keep `num_workers` constant and must return the same
/// `current_worker` id for a given thread for that thread's entire lifetime.
pub trait WorkerScheduler: Send + Sync {
    /// Number of workers, fixed for the scheduler's lifetime.
    fn num_workers(&self) -> usize;

    /// Stable id of the calling worker in `[0, num_workers)`, or `None`
    /// when called from a thread the scheduler does not manage.
    fn current_worker(&self) -> Option<usize>;

    /// Apply `body` to every index in `range`, parallelized across workers.
    ///
    /// `grain` is the minimum number of indices worth splitting off into a
    /// separate task; ranges at or below the grain run sequentially.
    fn parallel_for(&self, range: Range<usize>, grain: usize, body: &(dyn Fn(usize) + Sync));
}

/// [`WorkerScheduler`] backed by a dedicated `rayon::ThreadPool`.
pub struct RayonScheduler {
    pool: rayon::ThreadPool,
}

impl RayonScheduler {
    /// Build a scheduler with exactly `num_workers` threads.
    pub fn new(num_workers: usize) -> PoolResult<Self> {
        if num_workers == 0 {
            return Err(PoolError::invalid_config("worker count must be at least 1"));
        }
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(num_workers)
            .build()
            .map_err(|e| PoolError::invalid_config(format!("failed to build worker pool: {e}")))?;
        Ok(Self { pool })
    }

    /// Run `op` on the worker pool, blocking until it completes.
    ///
    /// Allocator calls must originate from worker threads; this is the entry
    /// point that moves a workload onto them.
    pub fn install<R: Send>(&self, op: impl FnOnce() -> R + Send) -> R {
        self.pool.install(op)
    }
}

impl WorkerScheduler for RayonScheduler {
    fn num_workers(&self) -> usize {
        self.pool.current_num_threads()
    }

    fn current_worker(&self) -> Option<usize> {
        self.pool.current_thread_index()
    }

    fn parallel_for(&self, range: Range<usize>, grain: usize, body: &(dyn Fn(usize) + Sync)) {
        if range.is_empty() {
            return;
        }
        let len = range.end - range.start;
        if len <= grain.max(1) {
            for i in range {
                body(i);
            }
            return;
        }
        self.pool.install(|| {
            range
                .into_par_iter()
                .with_min_len(grain.max(1))
                .for_each(|i| body(i));
        });
    }
}

impl std::fmt::Debug for RayonScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RayonScheduler")
            .field("num_workers", &self.num_workers())
            .finish()
    }
}

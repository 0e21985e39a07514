//! The pool itself: per-worker caches over a shared list exchange.

use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam_queue::SegQueue;
use crossbeam_utils::CachePadded;

use crate::error::{PoolError, PoolResult};
use crate::scheduler::WorkerScheduler;
use crate::utils::is_aligned_ptr;

use super::BlockPoolConfig;
use super::free_list::{FreeBlock, ListHead, SendPtr, WorkerCache, link_blocks};
use super::regions::{RawRegion, RegionRegistry};
use super::stats::PoolStatsSnapshot;

/// Concurrent allocator of fixed-size blocks for a set of worker threads.
///
/// Allocation and deallocation must happen on threads managed by the pool's
/// scheduler; other threads get [`PoolError::ForeignThread`]. Blocks may be
/// freed on a different worker than the one that allocated them.
///
/// Memory obtained from the system is only returned by [`BlockPool::clear`]
/// or on drop, and only once every block has been freed back.
pub struct BlockPool {
    scheduler: Arc<dyn WorkerScheduler>,
    caches: Box<[CachePadded<WorkerCache>]>,
    global: SegQueue<ListHead>,
    regions: RegionRegistry,
    /// Monotonic while the pool is live; reset only by a successful clear.
    blocks_allocated: AtomicUsize,
    block_size: usize,
    list_length: usize,
    max_blocks: usize,
}

impl BlockPool {
    /// Build a pool over the scheduler's workers.
    ///
    /// Fails on an invalid configuration, and propagates allocation errors
    /// when the configuration asks for reserved blocks.
    pub fn new(config: BlockPoolConfig, scheduler: Arc<dyn WorkerScheduler>) -> PoolResult<Self> {
        config.validate()?;
        let workers = scheduler.num_workers();
        if workers == 0 {
            return Err(PoolError::invalid_config("scheduler reports zero workers"));
        }

        let caches: Box<[CachePadded<WorkerCache>]> =
            (0..workers).map(|_| CachePadded::new(WorkerCache::new())).collect();

        let pool = Self {
            scheduler,
            caches,
            global: SegQueue::new(),
            regions: RegionRegistry::new(),
            blocks_allocated: AtomicUsize::new(0),
            block_size: config.block_size,
            list_length: config.list_length(),
            max_blocks: config.resolved_max_blocks(),
        };

        if config.reserved_blocks > 0 {
            pool.reserve(config.reserved_blocks)?;
        }
        Ok(pool)
    }

    /// Hand out one block.
    ///
    /// The returned pointer addresses `block_size` bytes of uninitialized
    /// memory, valid until passed back to [`BlockPool::free`] or until the
    /// pool releases its regions.
    pub fn allocate(&self) -> PoolResult<NonNull<u8>> {
        let worker = self.scheduler.current_worker().ok_or(PoolError::ForeignThread)?;
        let cache = &self.caches[worker];

        if cache.len() == 0 {
            let list = self.acquire_list()?;
            // Safety: this thread owns cache `worker` and it is empty.
            unsafe { cache.install_list(list, self.list_length) };
        }

        // Safety: the cache is non-empty and owned by this worker; blocks
        // point into live region memory and are never null.
        let block = unsafe { cache.pop() };
        Ok(unsafe { NonNull::new_unchecked(block.cast()) })
    }

    /// Return a block to the pool.
    ///
    /// # Safety
    ///
    /// `block` must have come from [`BlockPool::allocate`] on this pool and
    /// must not be freed twice or used after this call.
    pub unsafe fn free(&self, block: NonNull<u8>) -> PoolResult<()> {
        debug_assert!(is_aligned_ptr(block.as_ptr(), align_of::<usize>()));
        let worker = self.scheduler.current_worker().ok_or(PoolError::ForeignThread)?;
        let cache = &self.caches[worker];

        let spill = unsafe { cache.push(block.as_ptr().cast::<FreeBlock>(), self.list_length) };
        if let Some(list) = spill {
            self.global.push(list);
        }
        Ok(())
    }

    /// Pre-allocate enough lists to cover `num_blocks` plus one list per
    /// worker, carved out of a single region.
    pub fn reserve(&self, num_blocks: usize) -> PoolResult<()> {
        let num_lists =
            self.scheduler.num_workers().saturating_add(num_blocks.div_ceil(self.list_length));
        let total_blocks = num_lists
            .checked_mul(self.list_length)
            .ok_or_else(|| PoolError::invalid_config("reservation size overflows"))?;

        let start = self.allocate_blocks(total_blocks)?;
        let base = SendPtr(start);
        let stride = self.list_length * self.block_size;

        self.scheduler.parallel_for(0..num_lists, 1, &|i| {
            // Name the wrapper whole so the closure captures the Sync wrapper
            // rather than disjointly capturing only the raw pointer field.
            let base = base;
            let SendPtr(region_base) = base;
            // Safety: each index covers a disjoint list_length-block slice
            // of the fresh region.
            let list = unsafe {
                link_blocks(
                    self.scheduler.as_ref(),
                    region_base.add(i * stride),
                    self.list_length,
                    self.block_size,
                )
            };
            self.global.push(list);
        });

        tracing::debug!(
            blocks = total_blocks,
            lists = num_lists,
            block_size = self.block_size,
            "reserved block lists"
        );
        Ok(())
    }

    /// Release all pool memory back to the system.
    ///
    /// Refuses, with a warning, if any block is still checked out; exclusive
    /// access guarantees no worker is mid-operation. After a successful
    /// clear the pool is empty but fully usable.
    pub fn clear(&mut self) -> PoolResult<()> {
        self.clear_inner()
    }

    fn clear_inner(&self) -> PoolResult<()> {
        let used = self.num_used_blocks();
        if used > 0 {
            tracing::warn!(used, "refusing to clear pool with blocks still in use");
            return Err(PoolError::blocks_outstanding(used));
        }

        for cache in &self.caches {
            // Safety: the caller holds exclusive access, so no worker is
            // touching its cache.
            unsafe { cache.reset() };
        }
        while self.global.pop().is_some() {}
        // Safety: every block is back in a cache or list we just dropped.
        unsafe { self.regions.release_all() };
        self.blocks_allocated.store(0, Ordering::Relaxed);
        Ok(())
    }

    /// Take a full list from the shared pool, or carve a new one.
    fn acquire_list(&self) -> PoolResult<ListHead> {
        if let Some(list) = self.global.pop() {
            return Ok(list);
        }
        let start = self.allocate_blocks(self.list_length)?;
        // Safety: the region is fresh and exactly list_length blocks long.
        Ok(unsafe { link_blocks(self.scheduler.as_ref(), start, self.list_length, self.block_size) })
    }

    /// Obtain a region for `num_blocks` blocks and account for them.
    ///
    /// On a ceiling violation the region is released and the counter rolled
    /// back before returning, so a failed call leaves the pool unchanged.
    fn allocate_blocks(&self, num_blocks: usize) -> PoolResult<*mut u8> {
        let bytes = num_blocks
            .checked_mul(self.block_size)
            .ok_or_else(|| PoolError::invalid_config("allocation size overflows"))?;

        let region = RawRegion::allocate(bytes)?;
        let base = region.base();

        let allocated = self.blocks_allocated.fetch_add(num_blocks, Ordering::Relaxed) + num_blocks;
        if allocated > self.max_blocks {
            self.blocks_allocated.fetch_sub(num_blocks, Ordering::Relaxed);
            // Safety: no pointer into the region has escaped.
            unsafe { region.release() };
            tracing::warn!(
                requested = num_blocks,
                max_blocks = self.max_blocks,
                "block limit exceeded"
            );
            return Err(PoolError::block_limit(allocated, self.max_blocks));
        }

        self.regions.register(region);
        Ok(base)
    }

    /// Size of every block in bytes.
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Blocks per list exchanged through the shared pool.
    pub fn list_length(&self) -> usize {
        self.list_length
    }

    /// Number of workers the pool serves.
    pub fn worker_count(&self) -> usize {
        self.caches.len()
    }

    /// Blocks carved out of raw memory so far.
    pub fn num_allocated_blocks(&self) -> usize {
        self.blocks_allocated.load(Ordering::Relaxed)
    }

    /// Blocks currently checked out by callers.
    ///
    /// Exact when the pool is quiescent; a point-in-time estimate otherwise.
    pub fn num_used_blocks(&self) -> usize {
        let allocated = self.blocks_allocated.load(Ordering::Relaxed);
        let in_lists = self.global.len().saturating_mul(self.list_length);
        let in_caches: usize = self.caches.iter().map(|c| c.len()).sum();
        allocated.saturating_sub(in_lists).saturating_sub(in_caches)
    }

    /// Bytes currently held in regions obtained from the system.
    pub fn total_bytes(&self) -> usize {
        self.regions.total_bytes()
    }

    /// Snapshot of the usage counters.
    pub fn stats(&self) -> PoolStatsSnapshot {
        PoolStatsSnapshot {
            used_blocks: self.num_used_blocks(),
            allocated_blocks: self.num_allocated_blocks(),
            block_size: self.block_size,
            total_bytes: self.total_bytes(),
        }
    }

    /// Emit the current stats at info level.
    pub fn log_stats(&self) {
        let stats = self.stats();
        tracing::info!(%stats, "block pool");
    }
}

impl Drop for BlockPool {
    fn drop(&mut self) {
        // Outstanding blocks mean callers still hold pointers into the
        // regions; leaking them is the only sound option, and clear_inner
        // has already logged a warning.
        let _ = self.clear_inner();
    }
}

impl std::fmt::Debug for BlockPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockPool")
            .field("block_size", &self.block_size)
            .field("list_length", &self.list_length)
            .field("workers", &self.caches.len())
            .field("allocated_blocks", &self.num_allocated_blocks())
            .field("used_blocks", &self.num_used_blocks())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use parking_lot::Mutex;
    use proptest::prelude::*;

    use super::*;
    use crate::scheduler::RayonScheduler;

    fn pool_with(
        workers: usize,
        block_size: usize,
        list_bytes: usize,
    ) -> (Arc<RayonScheduler>, BlockPool) {
        let scheduler = Arc::new(RayonScheduler::new(workers).unwrap());
        let config = BlockPoolConfig::new(block_size).with_list_bytes(list_bytes);
        let pool = BlockPool::new(config, scheduler.clone()).unwrap();
        (scheduler, pool)
    }

    #[test]
    fn test_construction_allocates_nothing() {
        let (_scheduler, pool) = pool_with(2, 64, 6400);
        assert_eq!(pool.list_length(), 100);
        assert_eq!(pool.num_allocated_blocks(), 0);
        assert_eq!(pool.num_used_blocks(), 0);
        assert_eq!(pool.total_bytes(), 0);
    }

    #[test]
    fn test_reserved_blocks_prefill_shared_pool() {
        let scheduler = Arc::new(RayonScheduler::new(2).unwrap());
        let config = BlockPoolConfig::new(64).with_list_bytes(6400).with_reserved_blocks(250);
        let pool = BlockPool::new(config, scheduler).unwrap();

        // 2 workers + ceil(250 / 100) lists of 100 blocks each.
        assert_eq!(pool.num_allocated_blocks(), 500);
        assert_eq!(pool.global.len(), 5);
        assert_eq!(pool.num_used_blocks(), 0);
        assert_eq!(pool.regions.len(), 1);
    }

    #[test]
    fn test_single_worker_alloc_free_cycle() {
        // block_size 64 and list_bytes 6400 give a list length of 100.
        let (scheduler, pool) = pool_with(1, 64, 6400);

        scheduler.install(|| {
            let mut held = Vec::new();
            for _ in 0..250 {
                held.push(pool.allocate().unwrap().as_ptr() as usize);
            }

            // Three lists were carved: at allocation 1, 101, and 201.
            assert_eq!(pool.num_allocated_blocks(), 300);
            assert_eq!(pool.num_used_blocks(), 250);
            assert_eq!(pool.caches[0].len(), 50);

            for addr in held.iter().rev() {
                unsafe {
                    pool.free(NonNull::new(*addr as *mut u8).unwrap()).unwrap();
                }
            }

            // One split fired on the way back up, parking one full list.
            assert_eq!(pool.num_used_blocks(), 0);
            assert_eq!(pool.num_allocated_blocks(), 300);
            assert_eq!(pool.global.len(), 1);
            assert_eq!(pool.caches[0].len(), 200);
        });
    }

    #[test]
    fn test_blocks_are_distinct_and_reused() {
        let (scheduler, pool) = pool_with(1, 64, 640);

        scheduler.install(|| {
            let first: HashSet<usize> =
                (0..30).map(|_| pool.allocate().unwrap().as_ptr() as usize).collect();
            assert_eq!(first.len(), 30, "live blocks must not alias");
            for &addr in &first {
                assert_eq!(addr % align_of::<usize>(), 0);
                unsafe { pool.free(NonNull::new(addr as *mut u8).unwrap()).unwrap() };
            }

            // No growth on the second pass: every block comes from memory
            // the pool already owns.
            let allocated = pool.num_allocated_blocks();
            let second: HashSet<usize> =
                (0..30).map(|_| pool.allocate().unwrap().as_ptr() as usize).collect();
            assert_eq!(second.len(), 30);
            assert_eq!(pool.num_allocated_blocks(), allocated);
            for &addr in &second {
                unsafe { pool.free(NonNull::new(addr as *mut u8).unwrap()).unwrap() };
            }
        });
    }

    #[test]
    fn test_cache_stays_bounded() {
        // list length 4, so no cache may exceed 8 blocks.
        let (scheduler, pool) = pool_with(1, 64, 256);
        assert_eq!(pool.list_length(), 4);

        scheduler.install(|| {
            let mut held = Vec::new();
            for _ in 0..40 {
                held.push(pool.allocate().unwrap());
            }
            for block in held {
                unsafe { pool.free(block).unwrap() };
                assert!(pool.caches[0].len() <= 2 * pool.list_length());
            }
            assert_eq!(pool.num_used_blocks(), 0);
        });
    }

    #[test]
    fn test_block_limit_enforced_and_recoverable() {
        let scheduler = Arc::new(RayonScheduler::new(1).unwrap());
        let config = BlockPoolConfig::new(64).with_list_bytes(6400).with_max_blocks(150);
        let pool = BlockPool::new(config, scheduler.clone()).unwrap();

        scheduler.install(|| {
            let mut held = Vec::new();
            for _ in 0..100 {
                held.push(pool.allocate().unwrap());
            }

            // The next list would put allocation at 200 against a cap of 150.
            let err = pool.allocate().unwrap_err();
            assert_eq!(err, PoolError::block_limit(200, 150));

            // The failed attempt left no trace and the pool keeps working.
            assert_eq!(pool.num_allocated_blocks(), 100);
            for block in held.drain(..) {
                unsafe { pool.free(block).unwrap() };
            }
            assert_eq!(pool.num_used_blocks(), 0);
            held.push(pool.allocate().unwrap());
            unsafe { pool.free(held.pop().unwrap()).unwrap() };
        });
    }

    #[test]
    fn test_foreign_thread_rejected() {
        let (_scheduler, pool) = pool_with(1, 64, 640);
        // The test harness thread is not a scheduler worker.
        assert_eq!(pool.allocate().unwrap_err(), PoolError::ForeignThread);
    }

    #[test]
    fn test_clear_refuses_then_releases() {
        let (scheduler, mut pool) = pool_with(1, 64, 640);

        let addr = scheduler.install(|| pool.allocate().unwrap().as_ptr() as usize);
        assert_eq!(pool.clear().unwrap_err(), PoolError::blocks_outstanding(1));

        scheduler.install(|| unsafe {
            pool.free(NonNull::new(addr as *mut u8).unwrap()).unwrap();
        });
        pool.clear().unwrap();
        assert_eq!(pool.num_allocated_blocks(), 0);
        assert_eq!(pool.total_bytes(), 0);

        // Idempotent, and the pool is reusable afterwards.
        pool.clear().unwrap();
        scheduler.install(|| {
            let block = pool.allocate().unwrap();
            unsafe { pool.free(block).unwrap() };
        });
        assert!(pool.num_allocated_blocks() > 0);
    }

    #[test]
    fn test_cross_worker_traffic() {
        let (scheduler, pool) = pool_with(2, 64, 512);
        let live = Mutex::new(HashSet::new());

        scheduler.install(|| {
            let churn = |rounds: usize| {
                for _ in 0..rounds {
                    let mut held = Vec::new();
                    for _ in 0..32 {
                        let addr = pool.allocate().unwrap().as_ptr() as usize;
                        assert!(live.lock().insert(addr), "block {addr:#x} handed out twice");
                        held.push(addr);
                    }
                    for addr in held {
                        assert!(live.lock().remove(&addr));
                        unsafe {
                            pool.free(NonNull::new(addr as *mut u8).unwrap()).unwrap();
                        }
                    }
                }
            };
            rayon::join(|| churn(200), || churn(200));
        });

        assert!(live.lock().is_empty());
        assert_eq!(pool.num_used_blocks(), 0);
    }

    #[test]
    fn test_stats_snapshot() {
        let (scheduler, pool) = pool_with(1, 64, 640);
        scheduler.install(|| {
            let a = pool.allocate().unwrap();
            let b = pool.allocate().unwrap();
            let stats = pool.stats();
            assert_eq!(stats.used_blocks, 2);
            assert_eq!(stats.allocated_blocks, 10);
            assert_eq!(stats.block_size, 64);
            assert_eq!(stats.total_bytes, 640);
            unsafe {
                pool.free(b).unwrap();
                pool.free(a).unwrap();
            }
        });
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        // Any interleaving of allocations and frees keeps the used-block
        // counter equal to the number of live pointers, with no aliasing.
        #[test]
        fn prop_accounting_matches_live_set(ops in proptest::collection::vec(any::<bool>(), 1..200)) {
            let (scheduler, pool) = pool_with(1, 64, 512);

            scheduler.install(|| {
                let mut live: Vec<usize> = Vec::new();
                for alloc in ops {
                    if alloc {
                        let addr = pool.allocate().unwrap().as_ptr() as usize;
                        prop_assert!(!live.contains(&addr));
                        live.push(addr);
                    } else if let Some(addr) = live.pop() {
                        unsafe {
                            pool.free(NonNull::new(addr as *mut u8).unwrap()).unwrap();
                        }
                    }
                    prop_assert_eq!(pool.num_used_blocks(), live.len());
                }
                for addr in live.drain(..) {
                    unsafe {
                        pool.free(NonNull::new(addr as *mut u8).unwrap()).unwrap();
                    }
                }
                prop_assert_eq!(pool.num_used_blocks(), 0);
                Ok(())
            })?;
        }
    }
}

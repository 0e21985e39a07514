//! Intrusive free lists and the per-worker cache.
//!
//! Free blocks store their list linkage in their own first word, so a block
//! must be at least pointer sized. A worker's cache is a singly linked stack
//! with a recorded midpoint: when the stack grows past twice the list length,
//! the older half below the midpoint is detached in O(1) and handed back to
//! the shared pool.

use std::cell::UnsafeCell;
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::scheduler::WorkerScheduler;

/// Minimum index count per parallel linking task.
pub(crate) const LINK_GRAIN: usize = 1000;

/// Link node written into the first word of every free block.
#[repr(C)]
pub(crate) struct FreeBlock {
    pub(crate) next: *mut FreeBlock,
}

/// Head of a detached, null-terminated block list.
///
/// The list owns no memory; blocks live in regions held by the registry.
#[derive(Clone, Copy)]
pub(crate) struct ListHead(pub(crate) *mut FreeBlock);

// Lists are only handed between workers through the shared queue, never
// aliased; the blocks they thread through are plain memory.
unsafe impl Send for ListHead {}

/// Raw base pointer that can cross task boundaries during parallel linking.
#[derive(Clone, Copy)]
pub(crate) struct SendPtr(pub(crate) *mut u8);

unsafe impl Send for SendPtr {}
unsafe impl Sync for SendPtr {}

/// Thread `count` contiguous blocks starting at `start` into one free list.
///
/// Linking touches every block once and is parallelized for large lists.
///
/// # Safety
///
/// `start` must point to `count * block_size` writable bytes, with
/// `block_size` at least `size_of::<usize>()` and pointer aligned, and no
/// other thread may access the range during the call.
pub(crate) unsafe fn link_blocks(
    scheduler: &dyn WorkerScheduler,
    start: *mut u8,
    count: usize,
    block_size: usize,
) -> ListHead {
    debug_assert!(count > 0);
    let base = SendPtr(start);

    scheduler.parallel_for(0..count - 1, LINK_GRAIN, &move |i| {
        // Name the wrapper whole so the closure captures the Sync wrapper
        // rather than disjointly capturing only the raw pointer field.
        let base = base;
        let SendPtr(base) = base;
        // Each index writes only its own block's first word.
        unsafe {
            let block = base.add(i * block_size) as *mut FreeBlock;
            (*block).next = base.add((i + 1) * block_size) as *mut FreeBlock;
        }
    });

    unsafe {
        let last = start.add((count - 1) * block_size) as *mut FreeBlock;
        (*last).next = ptr::null_mut();
    }
    ListHead(start as *mut FreeBlock)
}

/// Link fields of a worker cache, touched only by the owning worker.
pub(crate) struct CacheLinks {
    pub(crate) head: *mut FreeBlock,
    pub(crate) mid: *mut FreeBlock,
}

/// A single worker's private stack of free blocks.
///
/// Only the owning worker mutates the cache. The length lives in an atomic
/// so that accounting on other threads can read a consistent (if slightly
/// stale) snapshot without touching the link words.
pub(crate) struct WorkerCache {
    len: AtomicUsize,
    links: UnsafeCell<CacheLinks>,
}

// The links cell is only dereferenced by the cache's owning worker; cross
// thread access is limited to the atomic length.
unsafe impl Send for WorkerCache {}
unsafe impl Sync for WorkerCache {}

impl WorkerCache {
    pub(crate) fn new() -> Self {
        Self {
            len: AtomicUsize::new(0),
            links: UnsafeCell::new(CacheLinks { head: ptr::null_mut(), mid: ptr::null_mut() }),
        }
    }

    /// Current block count. Safe to call from any thread.
    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    /// Adopt a detached list of exactly `list_length` blocks.
    ///
    /// # Safety
    ///
    /// Caller must be the owning worker and the cache must be empty.
    #[inline]
    pub(crate) unsafe fn install_list(&self, list: ListHead, list_length: usize) {
        let links = unsafe { &mut *self.links.get() };
        debug_assert!(links.head.is_null());
        links.head = list.0;
        self.len.store(list_length, Ordering::Relaxed);
    }

    /// Pop the most recently pushed block.
    ///
    /// # Safety
    ///
    /// Caller must be the owning worker and the cache must be non-empty.
    #[inline]
    pub(crate) unsafe fn pop(&self) -> *mut FreeBlock {
        let links = unsafe { &mut *self.links.get() };
        let block = links.head;
        debug_assert!(!block.is_null());
        links.head = unsafe { (*block).next };
        let len = self.len.load(Ordering::Relaxed);
        self.len.store(len - 1, Ordering::Relaxed);
        block
    }

    /// Push a freed block, maintaining the midpoint watermark.
    ///
    /// Growing past `list_length` records the current head as the midpoint;
    /// reaching `2 * list_length` detaches everything below the midpoint as
    /// a full list of `list_length` blocks and returns it for the shared
    /// pool. At most one detached list is produced per call.
    ///
    /// # Safety
    ///
    /// Caller must be the owning worker; `block` must be a live block of
    /// this pool that is not already on any free list.
    #[inline]
    pub(crate) unsafe fn push(&self, block: *mut FreeBlock, list_length: usize) -> Option<ListHead> {
        let links = unsafe { &mut *self.links.get() };
        let mut len = self.len.load(Ordering::Relaxed);
        let mut spill = None;

        if len == list_length + 1 {
            links.mid = links.head;
        } else if len == 2 * list_length {
            // The midpoint sits list_length - 1 links above the tail, so the
            // suffix starting below it holds exactly list_length blocks.
            let tail = unsafe { (*links.mid).next };
            unsafe { (*links.mid).next = ptr::null_mut() };
            spill = Some(ListHead(tail));
            len = list_length;
        }

        unsafe { (*block).next = links.head };
        links.head = block;
        self.len.store(len + 1, Ordering::Relaxed);
        spill
    }

    /// Drop all linkage. Blocks themselves are owned by the regions.
    ///
    /// # Safety
    ///
    /// No worker may touch the cache concurrently.
    pub(crate) unsafe fn reset(&self) {
        let links = unsafe { &mut *self.links.get() };
        links.head = ptr::null_mut();
        links.mid = ptr::null_mut();
        self.len.store(0, Ordering::Relaxed);
    }
}

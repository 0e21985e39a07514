//! Raw memory regions and the registry that owns them.
//!
//! Every byte the pool hands out comes from a region obtained from the
//! system allocator in one request. Regions are recorded in a registry so
//! teardown can walk and release them; individual blocks are never returned
//! to the system on their own.

use std::alloc::{self, Layout};
use std::ptr::NonNull;

use parking_lot::Mutex;

use crate::error::{PoolError, PoolResult};

/// Alignment of every region base pointer.
pub(crate) const REGION_ALIGN: usize = 256;

/// One system allocation, released only through [`RawRegion::release`].
pub(crate) struct RawRegion {
    ptr: NonNull<u8>,
    layout: Layout,
}

// Regions are plain byte ranges; ownership moves with the struct.
unsafe impl Send for RawRegion {}

impl RawRegion {
    /// Request `bytes` of region-aligned memory from the system.
    pub(crate) fn allocate(bytes: usize) -> PoolResult<Self> {
        let layout = Layout::from_size_align(bytes, REGION_ALIGN)
            .map_err(|_| PoolError::invalid_config(format!("unrepresentable region size {bytes}")))?;
        // Safety: layout has non-zero size for any valid block request.
        let raw = unsafe { alloc::alloc(layout) };
        let ptr = NonNull::new(raw).ok_or_else(|| PoolError::out_of_memory(bytes))?;
        Ok(Self { ptr, layout })
    }

    #[inline]
    pub(crate) fn base(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.layout.size()
    }

    /// Return the region to the system.
    ///
    /// # Safety
    ///
    /// No live pointer into the region may be dereferenced afterwards.
    pub(crate) unsafe fn release(self) {
        unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

/// Registry of all regions the pool has obtained.
///
/// Registration happens on the slow path only, so a mutex is fine here.
pub(crate) struct RegionRegistry {
    regions: Mutex<Vec<RawRegion>>,
}

impl RegionRegistry {
    pub(crate) fn new() -> Self {
        Self { regions: Mutex::new(Vec::new()) }
    }

    pub(crate) fn register(&self, region: RawRegion) {
        self.regions.lock().push(region);
    }

    pub(crate) fn len(&self) -> usize {
        self.regions.lock().len()
    }

    pub(crate) fn total_bytes(&self) -> usize {
        self.regions.lock().iter().map(RawRegion::len).sum()
    }

    /// Release every registered region.
    ///
    /// # Safety
    ///
    /// All blocks carved from the regions must be dead: no cache, shared
    /// list, or caller may still reference them.
    pub(crate) unsafe fn release_all(&self) {
        let mut regions = self.regions.lock();
        for region in regions.drain(..) {
            unsafe { region.release() };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::is_aligned_ptr;

    #[test]
    fn test_region_is_aligned() {
        let region = RawRegion::allocate(4096).unwrap();
        assert!(is_aligned_ptr(region.base(), REGION_ALIGN));
        assert_eq!(region.len(), 4096);
        unsafe { region.release() };
    }

    #[test]
    fn test_registry_tracks_and_releases() {
        let registry = RegionRegistry::new();
        registry.register(RawRegion::allocate(1024).unwrap());
        registry.register(RawRegion::allocate(2048).unwrap());
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.total_bytes(), 3072);

        unsafe { registry.release_all() };
        assert_eq!(registry.len(), 0);
        assert_eq!(registry.total_bytes(), 0);

        // Releasing an empty registry is a no-op.
        unsafe { registry.release_all() };
    }
}

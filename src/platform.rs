//! System memory queries used to size pool ceilings.
//!
//! The default block ceiling is derived from physical memory, so the pool
//! needs one platform-dependent fact: how much RAM the machine has.

/// Total physical memory in bytes, or 0 when it cannot be determined.
#[cfg(unix)]
pub fn total_memory() -> usize {
    // Safety: sysconf reads a system constant and has no preconditions.
    let pages = unsafe { libc::sysconf(libc::_SC_PHYS_PAGES) };
    let page_size = unsafe { libc::sysconf(libc::_SC_PAGE_SIZE) };
    if pages <= 0 || page_size <= 0 {
        return 0;
    }
    (pages as usize).saturating_mul(page_size as usize)
}

/// Total physical memory in bytes, or 0 when it cannot be determined.
#[cfg(windows)]
pub fn total_memory() -> usize {
    use winapi::um::sysinfoapi::{GlobalMemoryStatusEx, MEMORYSTATUSEX};

    let mut status: MEMORYSTATUSEX = unsafe { core::mem::zeroed() };
    status.dwLength = core::mem::size_of::<MEMORYSTATUSEX>() as u32;
    // Safety: status is a properly sized, writable out-parameter.
    let ok = unsafe { GlobalMemoryStatusEx(&mut status) };
    if ok == 0 { 0 } else { status.ullTotalPhys as usize }
}

/// Total physical memory in bytes, or 0 when it cannot be determined.
#[cfg(not(any(unix, windows)))]
pub fn total_memory() -> usize {
    0
}

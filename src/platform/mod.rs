//! OS memory provider: page-size query, anonymous page mappings, and the
//! break pool that emulates program-break extension.
//!
//! # Safety
//!
//! `map.rs` performs unsafe FFI calls to OS primitives (mmap/munmap on
//! unix, VirtualAlloc/VirtualFree on windows, `std::alloc` elsewhere).
//! Callers must uphold the usual mapping lifecycle contracts: regions are
//! unmapped exactly once, with the length they were mapped with, and never
//! touched afterwards.

mod brk;
mod map;

pub(crate) use brk::BreakPool;
pub(crate) use map::{map_region, unmap_region};

/// Queries the system page size.
pub fn page_size() -> usize {
    #[cfg(unix)]
    {
        // SAFETY: FFI call to libc::sysconf with a valid parameter; the OS
        // validates the query and page size is always positive.
        let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if size > 0 { size as usize } else { 4096 }
    }

    #[cfg(windows)]
    {
        use winapi::um::sysinfoapi::{GetSystemInfo, SYSTEM_INFO};

        // SAFETY: SYSTEM_INFO is plain data, all-zero bytes are a valid
        // initial state, and GetSystemInfo fills every field.
        unsafe {
            let mut info: SYSTEM_INFO = std::mem::zeroed();
            GetSystemInfo(&mut info);
            info.dwPageSize as usize
        }
    }

    #[cfg(not(any(unix, windows)))]
    {
        4096
    }
}

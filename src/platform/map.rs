//! Anonymous read-write page mappings.
//!
//! Thin wrappers over the platform mapping primitive, shaped for allocator
//! use: private, anonymous, readable and writable, length in bytes.

use std::io;

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        /// Maps `len` bytes of private anonymous read-write memory.
        ///
        /// The returned address is page-aligned. `len` need not be a page
        /// multiple; the OS rounds the mapping up internally, but the
        /// region must be unmapped with the same `len`.
        pub(crate) fn map_region(len: usize) -> io::Result<*mut u8> {
            use libc::{MAP_ANONYMOUS, MAP_FAILED, MAP_PRIVATE, PROT_READ, PROT_WRITE};

            // SAFETY: FFI call to mmap with a null hint (the OS picks the
            // address), fd -1 and offset 0 for an anonymous mapping. The OS
            // validates the parameters and returns MAP_FAILED on error.
            let ptr = unsafe {
                libc::mmap(
                    std::ptr::null_mut(),
                    len,
                    PROT_READ | PROT_WRITE,
                    MAP_PRIVATE | MAP_ANONYMOUS,
                    -1,
                    0,
                )
            };

            if ptr == MAP_FAILED {
                Err(io::Error::last_os_error())
            } else {
                Ok(ptr.cast::<u8>())
            }
        }

        /// Unmaps a region previously returned by [`map_region`].
        pub(crate) fn unmap_region(addr: *mut u8, len: usize) -> io::Result<()> {
            // SAFETY: FFI call to munmap; the caller guarantees addr/len
            // come from a single map_region call and the region is not
            // accessed afterwards.
            let result = unsafe { libc::munmap(addr.cast::<libc::c_void>(), len) };
            if result == -1 {
                Err(io::Error::last_os_error())
            } else {
                Ok(())
            }
        }
    } else if #[cfg(windows)] {
        /// Maps `len` bytes of committed read-write memory.
        pub(crate) fn map_region(len: usize) -> io::Result<*mut u8> {
            use winapi::um::memoryapi::VirtualAlloc;
            use winapi::um::winnt::{MEM_COMMIT, MEM_RESERVE, PAGE_READWRITE};

            // SAFETY: FFI call to VirtualAlloc with a null hint; the OS
            // validates the parameters and returns null on error.
            let ptr = unsafe {
                VirtualAlloc(
                    std::ptr::null_mut(),
                    len,
                    MEM_COMMIT | MEM_RESERVE,
                    PAGE_READWRITE,
                )
            };

            if ptr.is_null() {
                Err(io::Error::last_os_error())
            } else {
                Ok(ptr.cast::<u8>())
            }
        }

        /// Releases a region previously returned by [`map_region`].
        pub(crate) fn unmap_region(addr: *mut u8, len: usize) -> io::Result<()> {
            use winapi::um::memoryapi::VirtualFree;
            use winapi::um::winnt::MEM_RELEASE;

            let _ = len; // MEM_RELEASE frees the whole reservation.

            // SAFETY: FFI call to VirtualFree; the caller guarantees addr
            // is the base of a VirtualAlloc reservation.
            let result = unsafe { VirtualFree(addr.cast(), 0, MEM_RELEASE) };
            if result == 0 {
                Err(io::Error::last_os_error())
            } else {
                Ok(())
            }
        }
    } else {
        /// Fallback mapping through the global allocator, page-aligned.
        pub(crate) fn map_region(len: usize) -> io::Result<*mut u8> {
            let layout = std::alloc::Layout::from_size_align(len, 4096)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

            // SAFETY: layout is non-zero and validated above.
            let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
            if ptr.is_null() {
                Err(io::Error::from(io::ErrorKind::OutOfMemory))
            } else {
                Ok(ptr)
            }
        }

        /// Releases a region previously returned by [`map_region`].
        pub(crate) fn unmap_region(addr: *mut u8, len: usize) -> io::Result<()> {
            let layout = std::alloc::Layout::from_size_align(len, 4096)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

            // SAFETY: the caller guarantees addr/len match the allocation.
            unsafe { std::alloc::dealloc(addr, layout) };
            Ok(())
        }
    }
}

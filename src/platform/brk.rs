//! Break pool: a program-break emulation over one reserved mapping.
//!
//! Sub-threshold arenas are carved from this pool the way the classic
//! allocator carved them from `sbrk`. The pool keeps a break cursor that
//! only the arena-list lock mutates: `extend` bumps it, `retract` pulls it
//! back when the topmost arena is released. Regions in the middle cannot
//! be returned individually; callers clear them in place instead, exactly
//! like a non-top `sbrk` region.

use tracing::debug;

use crate::error::{HeapError, HeapResult};
use crate::platform::{map_region, unmap_region};

pub(crate) struct BreakPool {
    base: *mut u8,
    capacity: usize,
    brk: usize,
}

// SAFETY: the pool is only ever mutated under the heap's arena-list lock;
// the raw base pointer is not shared outside that critical section.
unsafe impl Send for BreakPool {}

impl BreakPool {
    /// Creates an unmapped pool; the reservation happens on first use.
    pub(crate) const fn new(capacity: usize) -> Self {
        Self {
            base: std::ptr::null_mut(),
            capacity,
            brk: 0,
        }
    }

    fn ensure_mapped(&mut self) -> HeapResult<()> {
        if !self.base.is_null() {
            return Ok(());
        }
        let base =
            map_region(self.capacity).map_err(|e| HeapError::os_failure("break-pool map", e))?;
        debug!(capacity = self.capacity, "break pool mapped");
        self.base = base;
        Ok(())
    }

    /// Extends the break by `len` bytes and returns the region start.
    ///
    /// `len` must be a page multiple so every carved region starts
    /// page-aligned.
    pub(crate) fn extend(&mut self, len: usize) -> HeapResult<*mut u8> {
        self.ensure_mapped()?;
        let remaining = self.capacity - self.brk;
        if len > remaining {
            return Err(HeapError::os_failure(
                "break-extend",
                std::io::Error::from(std::io::ErrorKind::OutOfMemory),
            ));
        }
        // SAFETY: brk + len <= capacity, so the offset stays inside the
        // mapped reservation.
        let start = unsafe { self.base.add(self.brk) };
        self.brk += len;
        Ok(start)
    }

    /// Pulls the break back by `len` bytes.
    ///
    /// Only valid when the topmost `len` bytes belong to the region being
    /// released; the caller checks `break_top` first.
    pub(crate) fn retract(&mut self, len: usize) {
        debug_assert!(len <= self.brk);
        self.brk -= len.min(self.brk);
    }

    /// Current break position (null while the pool is unmapped).
    pub(crate) fn break_top(&self) -> *mut u8 {
        if self.base.is_null() {
            std::ptr::null_mut()
        } else {
            // SAFETY: brk <= capacity, inside the reservation.
            unsafe { self.base.add(self.brk) }
        }
    }

    /// Bytes currently extended.
    #[cfg(test)]
    pub(crate) fn extended(&self) -> usize {
        self.brk
    }

    /// Drops the whole reservation and resets the break.
    pub(crate) fn release(&mut self) {
        if self.base.is_null() {
            return;
        }
        if let Err(source) = unmap_region(self.base, self.capacity) {
            debug!(%source, "break pool unmap failed");
        }
        self.base = std::ptr::null_mut();
        self.brk = 0;
    }
}

impl Drop for BreakPool {
    fn drop(&mut self) {
        self.release();
    }
}

//! Page-aligned host memory shared by every buffer backend.

use crate::error::{DpuError, Result};
use std::alloc::Layout;
use std::ptr::NonNull;

/// Zeroed, page-aligned host allocation
///
/// The capacity is the requested length rounded up to whole pages (at least
/// one page).
#[derive(Debug)]
pub struct HostPages {
    ptr: NonNull<u8>,
    layout: Layout,
}

impl HostPages {
    /// Allocate at least `len` zeroed bytes on page boundaries.
    ///
    /// # Errors
    ///
    /// Returns `AllocationFailure` on an impossible layout or when the
    /// allocator is out of memory.
    pub fn new(len: usize) -> Result<Self> {
        let page = rustix::param::page_size();
        let size = len.max(1).div_ceil(page) * page;
        let layout = Layout::from_size_align(size, page)
            .map_err(|e| DpuError::allocation_failure(format!("invalid host layout for {len} bytes: {e}")))?;

        // SAFETY: alloc_zeroed with a non-zero size and power-of-two alignment
        // from Layout::from_size_align. The pointer is checked for null below
        // and released in Drop with the same layout.
        let raw = unsafe { std::alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(raw)
            .ok_or_else(|| DpuError::allocation_failure(format!("out of host memory for {size} bytes")))?;

        Ok(Self { ptr, layout })
    }

    /// Allocated size in bytes
    pub const fn capacity(&self) -> usize {
        self.layout.size()
    }

    /// Start of the allocation
    pub const fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Whole allocation as a slice
    pub const fn as_slice(&self) -> &[u8] {
        // SAFETY: ptr is valid for layout.size() initialized (zeroed) bytes
        // for the lifetime of self; &self excludes concurrent mutation.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.layout.size()) }
    }

    /// Whole allocation as a mutable slice
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: as above; &mut self gives exclusive access.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.layout.size()) }
    }
}

impl Drop for HostPages {
    fn drop(&mut self) {
        // SAFETY: ptr came from alloc_zeroed with exactly this layout and is
        // released once.
        unsafe { std::alloc::dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

// SAFETY: HostPages exclusively owns its allocation; no thread-local state.
unsafe impl Send for HostPages {}

// SAFETY: shared access is read-only through &self; writes need &mut self.
unsafe impl Sync for HostPages {}

//! OS page source for the page heap and the metadata pools.
//!
//! `page_alloc` hands out zeroed memory aligned to the allocator's
//! [`PAGE_SIZE`](crate::config::PAGE_SIZE), which may be larger than the OS
//! page. Under Miri, `std::alloc` serves as the backing store instead.

cfg_if::cfg_if! {
    if #[cfg(miri)] {
        mod miri;
        use miri as os;
    } else if #[cfg(windows)] {
        mod windows;
        use windows as os;
    } else if #[cfg(unix)] {
        mod unix;
        use unix as os;
    } else {
        compile_error!("tiermalloc has no page source for this target");
    }
}

/// Reserve and commit `size` bytes of zeroed, `PAGE_SIZE`-aligned memory.
/// Returns null on failure.
///
/// # Safety
/// `size` must be a non-zero multiple of `PAGE_SIZE`. The region must only be
/// returned through `page_dealloc` with the same `size`.
#[inline]
pub unsafe fn page_alloc(size: usize) -> *mut u8 {
    debug_assert!(size > 0 && size % crate::config::PAGE_SIZE == 0);
    unsafe { os::page_alloc(size) }
}

/// Write bytes to standard error without allocating. Returns the number of
/// bytes written, or a value below 1 on failure.
#[inline]
pub fn write_stderr(buf: &[u8]) -> isize {
    os::write_stderr(buf)
}

/// Return a region obtained from `page_alloc` to the OS.
///
/// # Safety
/// `ptr` and `size` must describe exactly one live `page_alloc` result.
#[inline]
pub unsafe fn page_dealloc(ptr: *mut u8, size: usize) {
    unsafe { os::page_dealloc(ptr, size) }
}

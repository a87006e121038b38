//! Miri page source backed by `std::alloc`.
//!
//! Miri can't execute mmap/VirtualAlloc, so page-aligned memory comes from the
//! host allocator. This lets Miri check the allocator's pointer logic.

extern crate alloc;

use crate::config::PAGE_SIZE;
use core::alloc::Layout;

pub unsafe fn page_alloc(size: usize) -> *mut u8 {
    match Layout::from_size_align(size, PAGE_SIZE) {
        Ok(layout) => unsafe { alloc::alloc::alloc_zeroed(layout) },
        Err(_) => core::ptr::null_mut(),
    }
}

pub unsafe fn page_dealloc(ptr: *mut u8, size: usize) {
    if let Ok(layout) = Layout::from_size_align(size, PAGE_SIZE) {
        unsafe { alloc::alloc::dealloc(ptr, layout) };
    }
}

#[cfg(unix)]
pub fn write_stderr(buf: &[u8]) -> isize {
    unsafe { libc::write(libc::STDERR_FILENO, buf.as_ptr().cast(), buf.len()) }
}

#[cfg(not(unix))]
pub fn write_stderr(buf: &[u8]) -> isize {
    buf.len() as isize
}

//! Unix page source using mmap/munmap.
//!
//! mmap only guarantees OS-page alignment, so regions are over-mapped by one
//! allocator page and the misaligned head and tail are unmapped again.

use crate::config::PAGE_SIZE;
use core::ptr;

unsafe fn map(len: usize) -> *mut u8 {
    let ptr = unsafe {
        libc::mmap(
            ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        ptr::null_mut()
    } else {
        ptr.cast()
    }
}

pub unsafe fn page_alloc(size: usize) -> *mut u8 {
    let ptr = unsafe { map(size) };
    if ptr.is_null() || (ptr as usize) % PAGE_SIZE == 0 {
        return ptr;
    }

    // Misaligned: retry with slack and trim.
    unsafe { page_dealloc(ptr, size) };
    let Some(padded) = size.checked_add(PAGE_SIZE) else {
        return ptr::null_mut();
    };
    let raw = unsafe { map(padded) };
    if raw.is_null() {
        return raw;
    }

    let start = raw as usize;
    let aligned = (start + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);
    let head = aligned - start;
    let tail = padded - head - size;
    unsafe {
        if head > 0 {
            page_dealloc(raw, head);
        }
        if tail > 0 {
            page_dealloc((aligned + size) as *mut u8, tail);
        }
    }
    aligned as *mut u8
}

pub unsafe fn page_dealloc(ptr: *mut u8, size: usize) {
    unsafe { libc::munmap(ptr.cast(), size) };
}

pub fn write_stderr(buf: &[u8]) -> isize {
    unsafe { libc::write(libc::STDERR_FILENO, buf.as_ptr().cast(), buf.len()) }
}

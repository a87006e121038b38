//! C-ABI exports for linking the allocator into non-Rust programs.
//!
//! Gated behind `features = ["ffi"]`. Both entry points follow the C
//! conventions: failure is a null pointer and freeing null does nothing.

use crate::allocator;
use core::ffi::c_void;
use core::ptr::{self, NonNull};

/// Allocate at least `size` bytes, aligned to at least 8. Returns null when
/// memory is exhausted.
#[unsafe(no_mangle)]
pub extern "C" fn tiermalloc_malloc(size: usize) -> *mut c_void {
    match allocator::allocate(size) {
        Ok(ptr) => ptr.as_ptr().cast(),
        Err(_) => ptr::null_mut(),
    }
}

/// Free memory returned by [`tiermalloc_malloc`].
///
/// # Safety
/// `ptr` must be null or a live pointer from `tiermalloc_malloc`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn tiermalloc_free(ptr: *mut c_void) {
    if let Some(ptr) = NonNull::new(ptr.cast::<u8>()) {
        unsafe { allocator::deallocate(ptr) };
    }
}

/// Bytes usable at `ptr`, or 0 for null.
///
/// # Safety
/// `ptr` must be null or a live pointer from `tiermalloc_malloc`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn tiermalloc_usable_size(ptr: *mut c_void) -> usize {
    match NonNull::new(ptr.cast::<u8>()) {
        Some(ptr) => unsafe { allocator::usable_size(ptr) },
        None => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_malloc_free() {
        let p = tiermalloc_malloc(100);
        assert!(!p.is_null());
        unsafe {
            assert!(tiermalloc_usable_size(p) >= 100);
            ptr::write_bytes(p.cast::<u8>(), 0x11, 100);
            tiermalloc_free(p);
        }
    }

    #[test]
    fn test_free_null_is_noop() {
        unsafe {
            tiermalloc_free(ptr::null_mut());
            assert_eq!(tiermalloc_usable_size(ptr::null_mut()), 0);
        }
    }

    #[test]
    fn test_malloc_too_large_is_null() {
        assert!(tiermalloc_malloc(usize::MAX).is_null());
    }
}

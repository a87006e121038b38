//! Alignment edge case tests.
//!
//! Verifies that allocations respect alignment requirements for various
//! alignment values, including over-aligned allocations (> 8 bytes) served
//! from size classes and from trimmed page runs.

use std::alloc::{GlobalAlloc, Layout};
use tiermalloc::{PAGE_SIZE, TierMalloc};

#[global_allocator]
static GLOBAL: TierMalloc = TierMalloc;

/// Allocate, check alignment, fill, verify, free.
fn round_trip(size: usize, align: usize, fill: u8) {
    let layout = Layout::from_size_align(size, align).unwrap();
    let ptr = unsafe { GLOBAL.alloc(layout) };
    assert!(!ptr.is_null(), "alloc failed: size={size}, align={align}");
    assert_eq!(
        ptr as usize % align,
        0,
        "misaligned: ptr={ptr:?}, size={size}, align={align}"
    );
    unsafe { ptr.write_bytes(fill, size) };
    for i in 0..size {
        assert_eq!(unsafe { *ptr.add(i) }, fill, "byte {i} of size={size}, align={align}");
    }
    unsafe { GLOBAL.dealloc(ptr, layout) };
}

#[test]
fn test_standard_alignments() {
    for align in [1, 2, 4, 8] {
        for &size in &[1, 7, 8, 15, 16, 31, 64, 255, 256, 1024, 4096] {
            if size >= align {
                round_trip(size, align, 0xAB);
            }
        }
    }
}

#[test]
fn test_over_aligned_from_size_classes() {
    for align in [16, 32, 64, 256, 1024, 4096] {
        for &size in &[1, align, align + 1, 3 * align, 5000, 70_000] {
            round_trip(size, align, 0xCD);
        }
    }
}

#[test]
fn test_over_aligned_page_size() {
    for &size in &[1, PAGE_SIZE, 2 * PAGE_SIZE, 300_000] {
        round_trip(size, PAGE_SIZE, 0xEF);
    }
}

#[test]
fn test_over_aligned_above_page_size() {
    for align in [2 * PAGE_SIZE, 4 * PAGE_SIZE, 8 * PAGE_SIZE] {
        for &size in &[1, align, align * 2, 300_000] {
            round_trip(size, align, 0xBE);
        }
    }
}

#[test]
fn test_many_over_aligned_above_page_size() {
    // Prefix and suffix trimming must hand pages back without overlap.
    let align = 2 * PAGE_SIZE;
    let size = align;
    let layout = Layout::from_size_align(size, align).unwrap();

    let ptrs: Vec<_> = (0..20u8)
        .map(|i| {
            let ptr = unsafe { GLOBAL.alloc(layout) };
            assert!(!ptr.is_null());
            assert_eq!(ptr as usize % align, 0, "misaligned in batch alloc");
            unsafe { ptr.write_bytes(i, size) };
            ptr
        })
        .collect();

    for (i, &ptr) in ptrs.iter().enumerate() {
        for j in 0..size {
            assert_eq!(unsafe { *ptr.add(j) }, i as u8);
        }
    }
    for ptr in ptrs {
        unsafe { GLOBAL.dealloc(ptr, layout) };
    }
}

#[test]
fn test_alignment_realloc_preserves_alignment() {
    for align in [16, 32, 64, 256, 2 * PAGE_SIZE] {
        let size = align * 2;
        let layout = Layout::from_size_align(size, align).unwrap();
        let ptr = unsafe { GLOBAL.alloc(layout) };
        assert!(!ptr.is_null());
        unsafe { ptr.write_bytes(0xBB, size) };

        let new_size = size * 4;
        let new_ptr = unsafe { GLOBAL.realloc(ptr, layout, new_size) };
        assert!(!new_ptr.is_null(), "realloc failed: align={align}");
        assert_eq!(new_ptr as usize % align, 0, "realloc lost alignment: align={align}");
        for i in 0..size {
            assert_eq!(unsafe { *new_ptr.add(i) }, 0xBB, "realloc corrupted byte {i}");
        }

        let new_layout = Layout::from_size_align(new_size, align).unwrap();
        unsafe { GLOBAL.dealloc(new_ptr, new_layout) };
    }
}

#[test]
fn test_many_aligned_allocations() {
    let align = 64;
    let layout = Layout::from_size_align(align, align).unwrap();

    let ptrs: Vec<_> = (0..500)
        .map(|_| {
            let ptr = unsafe { GLOBAL.alloc(layout) };
            assert!(!ptr.is_null());
            assert_eq!(ptr as usize % align, 0, "misaligned in batch alloc");
            unsafe { ptr.write_bytes(0xDD, align) };
            ptr
        })
        .collect();

    for &ptr in &ptrs {
        for i in 0..align {
            assert_eq!(unsafe { *ptr.add(i) }, 0xDD);
        }
    }
    for ptr in ptrs {
        unsafe { GLOBAL.dealloc(ptr, layout) };
    }
}

#[test]
fn test_zero_size_layout() {
    let layout = Layout::from_size_align(0, 16).unwrap();
    let ptr = unsafe { GLOBAL.alloc(layout) };
    assert!(!ptr.is_null());
    assert_eq!(ptr as usize % 16, 0);
    unsafe { GLOBAL.dealloc(ptr, layout) };
}

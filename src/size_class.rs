//! Size class table and lookup functions.
//!
//! Requests up to `MAX_CACHED_SIZE` are rounded up inside alignment brackets
//! (see `tiermalloc.toml`): each bracket covers `(previous limit, limit]` and
//! rounds to a multiple of its alignment. Every rounded size is one class.
//! The table and all lookups are computed at compile time from the brackets.

use crate::config::{
    ALIGN_BRACKETS, MAX_CACHED_SIZE, MAX_MOVE_COUNT, MIN_MOVE_COUNT, PAGE_SIZE,
};

/// Information about a single size class.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SizeClassInfo {
    /// Allocation size for this class (bytes). All allocations in this class
    /// are rounded up to this size.
    pub size: usize,
    /// Number of pages per span for this class.
    pub pages: usize,
    /// Number of objects to transfer between thread cache and central cache at once.
    pub batch_size: usize,
}

/// Number of size classes, index 0 being the 8-byte class.
pub const NUM_SIZE_CLASSES: usize = {
    let mut n = 0;
    let mut prev = 0;
    let mut i = 0;
    while i < ALIGN_BRACKETS.len() {
        let b = ALIGN_BRACKETS[i];
        n += (b.limit - prev) / b.align;
        prev = b.limit;
        i += 1;
    }
    n
};

/// Map a size in `(0, MAX_CACHED_SIZE]` to its class index.
/// Zero maps to the smallest class.
#[inline]
pub const fn index(size: usize) -> usize {
    debug_assert!(size <= MAX_CACHED_SIZE);
    let size = if size == 0 { 1 } else { size };
    let mut base = 0;
    let mut prev = 0;
    let mut i = 0;
    while i < ALIGN_BRACKETS.len() {
        let b = ALIGN_BRACKETS[i];
        if size <= b.limit {
            return base + (size - prev).div_ceil(b.align) - 1;
        }
        base += (b.limit - prev) / b.align;
        prev = b.limit;
        i += 1;
    }
    NUM_SIZE_CLASSES - 1
}

/// Smallest class size that holds `size` bytes.
#[inline]
pub const fn round_up(size: usize) -> usize {
    debug_assert!(size <= MAX_CACHED_SIZE);
    let size = if size == 0 { 1 } else { size };
    let mut prev = 0;
    let mut i = 0;
    while i < ALIGN_BRACKETS.len() {
        let b = ALIGN_BRACKETS[i];
        if size <= b.limit {
            return prev + (size - prev).div_ceil(b.align) * b.align;
        }
        prev = b.limit;
        i += 1;
    }
    MAX_CACHED_SIZE
}

/// Objects moved between the thread and central caches in one batch.
/// Small objects move many at a time, large ones few.
#[inline]
pub const fn object_move_count(aligned: usize) -> usize {
    let n = MAX_CACHED_SIZE / aligned;
    if n < MIN_MOVE_COUNT {
        MIN_MOVE_COUNT
    } else if n > MAX_MOVE_COUNT {
        MAX_MOVE_COUNT
    } else {
        n
    }
}

/// Pages in a fresh span for objects of `aligned` bytes.
#[inline]
pub const fn page_move_count(aligned: usize) -> usize {
    let pages = object_move_count(aligned) * aligned / PAGE_SIZE;
    if pages == 0 { 1 } else { pages }
}

pub static SIZE_CLASSES: [SizeClassInfo; NUM_SIZE_CLASSES] = {
    let mut table = [SizeClassInfo {
        size: 0,
        pages: 0,
        batch_size: 0,
    }; NUM_SIZE_CLASSES];
    let mut cls = 0;
    let mut prev = 0;
    let mut i = 0;
    while i < ALIGN_BRACKETS.len() {
        let b = ALIGN_BRACKETS[i];
        let mut size = prev + b.align;
        while size <= b.limit {
            table[cls] = SizeClassInfo {
                size,
                pages: page_move_count(size),
                batch_size: object_move_count(size),
            };
            cls += 1;
            size += b.align;
        }
        prev = b.limit;
        i += 1;
    }
    table
};

/// Get the allocation size for a given size class.
#[inline]
pub fn class_to_size(cls: usize) -> usize {
    SIZE_CLASSES[cls].size
}

/// Get the size class info for a given class index.
#[inline]
pub fn class_info(cls: usize) -> &'static SizeClassInfo {
    &SIZE_CLASSES[cls]
}

/// Smallest class size of at least `size` bytes that is a multiple of
/// `align`. Objects of such a class are `align`-aligned because spans start
/// on page boundaries. `None` when no cached class qualifies.
pub fn aligned_class_size(size: usize, align: usize) -> Option<usize> {
    if size > MAX_CACHED_SIZE || align > PAGE_SIZE {
        return None;
    }
    SIZE_CLASSES[index(size)..]
        .iter()
        .map(|info| info.size)
        .find(|s| s % align == 0)
}

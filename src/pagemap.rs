//! 3-level radix tree mapping page IDs to Span pointers.
//!
//! For 48-bit virtual addresses the page ID has `48 - PAGE_SHIFT` bits. They
//! are split as: root 12 bits, mid 12 bits, leaf the rest (11 bits with the
//! default 8 KiB pages).
//!
//! The root is statically allocated. Mid and leaf nodes are allocated from the
//! OS by [`PageMap::ensure`] before any page in their range is written, so
//! [`PageMap::set`] never allocates. Reads are lock-free (AtomicPtr with
//! Acquire). Writes must happen under external synchronization (the page heap
//! lock).

use crate::config::{PAGE_SHIFT, PAGE_SIZE};
use crate::error::AllocError;
use crate::platform;
use crate::span::Span;
use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicPtr, Ordering};

const ADDRESS_BITS: usize = 48;
const ROOT_BITS: usize = 12;
const MID_BITS: usize = 12;
const LEAF_BITS: usize = ADDRESS_BITS - PAGE_SHIFT - ROOT_BITS - MID_BITS;

const ROOT_LEN: usize = 1 << ROOT_BITS;
const MID_LEN: usize = 1 << MID_BITS;
const LEAF_LEN: usize = 1 << LEAF_BITS;

const MID_SHIFT: usize = LEAF_BITS;
const ROOT_SHIFT: usize = LEAF_BITS + MID_BITS;

const MID_MASK: usize = (1 << MID_BITS) - 1;
const LEAF_MASK: usize = (1 << LEAF_BITS) - 1;

#[repr(C)]
struct MidNode {
    children: [AtomicPtr<LeafNode>; MID_LEN],
}

#[repr(C)]
struct LeafNode {
    spans: [AtomicPtr<Span>; LEAF_LEN],
}

/// 3-level radix tree for page_id -> Span lookup.
pub struct PageMap {
    root: [AtomicPtr<MidNode>; ROOT_LEN],
}

impl Default for PageMap {
    fn default() -> Self {
        Self::new()
    }
}

#[inline]
fn split(page_id: usize) -> (usize, usize, usize) {
    (
        page_id >> ROOT_SHIFT,
        (page_id >> MID_SHIFT) & MID_MASK,
        page_id & LEAF_MASK,
    )
}

impl PageMap {
    /// Create a new empty page map. All root entries are null.
    pub const fn new() -> Self {
        Self {
            root: [const { AtomicPtr::new(ptr::null_mut()) }; ROOT_LEN],
        }
    }

    /// Look up the span for a given page ID. Lock-free.
    #[inline]
    pub fn get(&self, page_id: usize) -> Option<NonNull<Span>> {
        let (root_idx, mid_idx, leaf_idx) = split(page_id);
        if root_idx >= ROOT_LEN {
            return None;
        }

        let mid = self.root[root_idx].load(Ordering::Acquire);
        if mid.is_null() {
            return None;
        }

        let leaf = unsafe { (*mid).children[mid_idx].load(Ordering::Acquire) };
        if leaf.is_null() {
            return None;
        }

        NonNull::new(unsafe { (*leaf).spans[leaf_idx].load(Ordering::Acquire) })
    }

    /// Look up the span owning an address.
    #[inline]
    pub fn lookup(&self, addr: *const u8) -> Option<NonNull<Span>> {
        self.get(addr as usize >> PAGE_SHIFT)
    }

    /// Make sure the nodes covering `[start, start + count)` exist.
    ///
    /// Must be called under external synchronization.
    pub fn ensure(&self, start: usize, count: usize) -> Result<(), AllocError> {
        let mut page_id = start;
        let end = start + count;
        while page_id < end {
            let (root_idx, mid_idx, _) = split(page_id);
            if root_idx >= ROOT_LEN {
                return Err(AllocError::MetadataExhausted);
            }

            let mut mid = self.root[root_idx].load(Ordering::Acquire);
            if mid.is_null() {
                mid = unsafe { alloc_node::<MidNode>() }?;
                // Release so readers see the zeroed node.
                self.root[root_idx].store(mid, Ordering::Release);
            }

            let slot = unsafe { &(*mid).children[mid_idx] };
            if slot.load(Ordering::Acquire).is_null() {
                let leaf = unsafe { alloc_node::<LeafNode>() }?;
                slot.store(leaf, Ordering::Release);
            }

            // Advance to the first page of the next leaf.
            page_id = (page_id | LEAF_MASK) + 1;
        }
        Ok(())
    }

    /// Set the span for a given page ID.
    ///
    /// # Safety
    /// Must be called under external synchronization, and the page must lie
    /// in a range previously passed to [`ensure`](Self::ensure).
    pub unsafe fn set(&self, page_id: usize, span: *mut Span) {
        let (root_idx, mid_idx, leaf_idx) = split(page_id);
        let mid = self.root[root_idx].load(Ordering::Acquire);
        debug_assert!(!mid.is_null(), "page {:#x} was never ensured", page_id);
        let leaf = unsafe { (*mid).children[mid_idx].load(Ordering::Acquire) };
        debug_assert!(!leaf.is_null(), "page {:#x} was never ensured", page_id);
        unsafe { (*leaf).spans[leaf_idx].store(span, Ordering::Release) };
    }

    /// Register a span for all pages it covers. Used for spans in use, where
    /// any interior address can be looked up.
    ///
    /// # Safety
    /// As for [`set`](Self::set), for every page of the span.
    pub unsafe fn register_run(&self, span: NonNull<Span>) {
        let (start, count) = unsafe { ((*span.as_ptr()).start_page, (*span.as_ptr()).num_pages) };
        for page_id in start..start + count {
            unsafe { self.set(page_id, span.as_ptr()) };
        }
    }

    /// Register only the first and last pages of a free span. Coalescing
    /// only ever looks at the pages just outside a neighbor.
    ///
    /// # Safety
    /// As for [`set`](Self::set), for the span's first and last page.
    pub unsafe fn register_endpoints(&self, span: NonNull<Span>) {
        let (start, count) = unsafe { ((*span.as_ptr()).start_page, (*span.as_ptr()).num_pages) };
        unsafe { self.set(start, span.as_ptr()) };
        if count > 1 {
            unsafe { self.set(start + count - 1, span.as_ptr()) };
        }
    }
}

/// Zeroed memory is a valid node: every `AtomicPtr` is null.
unsafe fn alloc_node<N>() -> Result<*mut N, AllocError> {
    let size = core::mem::size_of::<N>();
    let alloc_size = (size + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);
    let node = unsafe { platform::page_alloc(alloc_size) };
    if node.is_null() {
        Err(AllocError::MetadataExhausted)
    } else {
        Ok(node.cast::<N>())
    }
}

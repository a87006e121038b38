//! Top-level allocator: ties all tiers together and implements GlobalAlloc.
//!
//! Static state lives here. `TierMalloc` is zero-sized; all mutable state is
//! in module-level statics protected by spinlocks or atomics.
//!
//! Cache strategy (fastest to slowest):
//! - `std` feature: a `std::thread_local!` slot pointing at a pooled
//!   ThreadCache, flushed at thread exit
//! - no `std`, or TLS already torn down: single objects through the central
//!   cache (locked)

use crate::central_cache::CentralCache;
use crate::config::{MAX_CACHED_SIZE, PAGE_SHIFT, PAGE_SIZE};
use crate::error::AllocError;
use crate::free_list::Batch;
use crate::page_heap::PageHeap;
use crate::size_class;
use crate::span::SpanState;
use core::alloc::{GlobalAlloc, Layout};
use core::ptr::{self, NonNull};

static PAGE_HEAP: PageHeap = PageHeap::new();
static CENTRAL_CACHE: CentralCache = CentralCache::new();

/// The process-wide page heap.
pub fn page_heap() -> &'static PageHeap {
    &PAGE_HEAP
}

/// The process-wide central cache.
pub fn central_cache() -> &'static CentralCache {
    &CENTRAL_CACHE
}

cfg_if::cfg_if! {
    if #[cfg(feature = "std")] {
        use crate::object_pool::ObjectPool;
        use crate::sync::{LockDomain, SpinMutex};
        use crate::thread_cache::ThreadCache;
        use core::cell::Cell;

        static THREAD_CACHE_POOL: SpinMutex<ObjectPool<ThreadCache>> =
            SpinMutex::in_domain(LockDomain::Metadata, ObjectPool::new());

        /// Owns the calling thread's ThreadCache. Dropped at thread exit.
        struct ThreadCacheSlot {
            cache: Cell<*mut ThreadCache>,
        }

        impl Drop for ThreadCacheSlot {
            fn drop(&mut self) {
                let Some(tc) = NonNull::new(self.cache.replace(ptr::null_mut())) else {
                    return;
                };
                unsafe {
                    (*tc.as_ptr()).flush(&CENTRAL_CACHE, &PAGE_HEAP);
                    THREAD_CACHE_POOL.lock().release(tc);
                }
            }
        }

        std::thread_local! {
            static THREAD_CACHE: ThreadCacheSlot = const {
                ThreadCacheSlot { cache: Cell::new(ptr::null_mut()) }
            };
        }

        /// Run `f` on the calling thread's cache, binding one on first use.
        /// `None` when the thread has no usable cache.
        #[inline]
        fn with_thread_cache<R>(f: impl FnOnce(&mut ThreadCache) -> R) -> Option<R> {
            THREAD_CACHE
                .try_with(|slot| {
                    let mut tc = slot.cache.get();
                    if tc.is_null() {
                        tc = bind_thread_cache()?;
                        slot.cache.set(tc);
                    }
                    // SAFETY: the cache is only reachable from this thread.
                    Some(f(unsafe { &mut *tc }))
                })
                .ok()
                .flatten()
        }

        #[cold]
        fn bind_thread_cache() -> Option<*mut ThreadCache> {
            let tc = THREAD_CACHE_POOL.lock().acquire().ok()?;
            crate::trace!("[allocator] bound thread cache {:p}", tc);
            Some(tc.as_ptr())
        }
    } else {
        #[inline(always)]
        fn with_thread_cache<R>(_f: impl FnOnce(&mut crate::thread_cache::ThreadCache) -> R) -> Option<R> {
            None
        }
    }
}

/// Allocate at least `size` bytes, aligned to at least 8.
///
/// Sizes up to `MAX_CACHED_SIZE` go through the calling thread's cache; larger
/// ones are rounded up to whole pages and taken straight from the page heap.
/// A zero size is served from the smallest class.
pub fn allocate(size: usize) -> Result<NonNull<u8>, AllocError> {
    if size <= MAX_CACHED_SIZE {
        allocate_small(size)
    } else {
        allocate_large(size)
    }
}

/// Free a pointer returned by [`allocate`]. The size is recovered from the
/// owning span.
///
/// # Safety
/// `ptr` must come from this allocator and not have been freed already.
pub unsafe fn deallocate(ptr: NonNull<u8>) {
    let Some(span) = PAGE_HEAP.resolve_span(ptr.as_ptr()) else {
        debug_assert!(false, "{:p} was not allocated here", ptr);
        return;
    };
    let (state, object_size) = unsafe { ((*span.as_ptr()).state, (*span.as_ptr()).object_size) };
    match state {
        SpanState::Small => unsafe { deallocate_small(ptr, object_size) },
        SpanState::Large => unsafe { PAGE_HEAP.reclaim_page_run(span) },
        SpanState::Free => debug_assert!(false, "double free of {:p}", ptr),
    }
}

/// Bytes usable at `ptr`, which is at least the size requested for it.
///
/// # Safety
/// `ptr` must be a live allocation from this allocator.
pub unsafe fn usable_size(ptr: NonNull<u8>) -> usize {
    let Some(span) = PAGE_HEAP.resolve_span(ptr.as_ptr()) else {
        return 0;
    };
    let span = unsafe { &*span.as_ptr() };
    match span.state {
        SpanState::Small => span.object_size,
        SpanState::Large => span.start_addr() as usize + span.byte_size() - ptr.as_ptr() as usize,
        SpanState::Free => 0,
    }
}

#[inline]
fn allocate_small(size: usize) -> Result<NonNull<u8>, AllocError> {
    if let Some(result) = with_thread_cache(|tc| tc.allocate(size, &CENTRAL_CACHE, &PAGE_HEAP)) {
        return result;
    }
    allocate_from_central(size)
}

#[cold]
fn allocate_from_central(size: usize) -> Result<NonNull<u8>, AllocError> {
    let object_size = size_class::round_up(size);
    let mut batch = CENTRAL_CACHE.remove_range(1, object_size, &PAGE_HEAP)?;
    batch.pop_front().ok_or(AllocError::OutOfMemory {
        pages: size_class::page_move_count(object_size),
    })
}

#[inline]
unsafe fn deallocate_small(ptr: NonNull<u8>, object_size: usize) {
    let cached = with_thread_cache(|tc| unsafe {
        tc.deallocate(ptr, object_size, &CENTRAL_CACHE, &PAGE_HEAP)
    });
    if cached.is_none() {
        let batch = unsafe { Batch::single(ptr.as_ptr()) };
        CENTRAL_CACHE.insert_range(batch, object_size, &PAGE_HEAP);
    }
}

fn pages_for(size: usize) -> Result<usize, AllocError> {
    if size > isize::MAX as usize - PAGE_SIZE {
        return Err(AllocError::TooLarge { size });
    }
    Ok(size.div_ceil(PAGE_SIZE))
}

fn allocate_large(size: usize) -> Result<NonNull<u8>, AllocError> {
    let pages = pages_for(size)?;
    let span = PAGE_HEAP.allocate_page_run(pages)?;
    unsafe {
        let s = span.as_ptr();
        (*s).object_size = (*s).byte_size();
        Ok(NonNull::new_unchecked((*s).start_addr()))
    }
}

fn allocate_aligned_large(size: usize, align: usize) -> Result<NonNull<u8>, AllocError> {
    let pages = pages_for(size)?;
    let span = PAGE_HEAP.allocate_aligned_run(pages, align)?;
    unsafe {
        let s = span.as_ptr();
        (*s).object_size = (*s).byte_size();
        debug_assert_eq!((*s).start_page & ((align >> PAGE_SHIFT).max(1) - 1), 0);
        Ok(NonNull::new_unchecked((*s).start_addr()))
    }
}

/// Allocate for an arbitrary layout. Alignments up to 8 use the class path
/// directly; larger ones use a class whose size is a multiple of the
/// alignment, else a suitably aligned page run.
fn allocate_layout(layout: Layout) -> Result<NonNull<u8>, AllocError> {
    let size = layout.size();
    let align = layout.align();

    if align <= 8 {
        return allocate(size);
    }
    if let Some(class_size) = size_class::aligned_class_size(size.max(align), align) {
        return allocate_small(class_size);
    }
    if align <= PAGE_SIZE {
        allocate_large(size)
    } else {
        allocate_aligned_large(size, align)
    }
}

/// Three-tier allocator for Rust.
///
/// Register as the global allocator with:
/// ```ignore
/// #[global_allocator]
/// static GLOBAL: tiermalloc::TierMalloc = tiermalloc::TierMalloc;
/// ```
pub struct TierMalloc;

unsafe impl GlobalAlloc for TierMalloc {
    #[inline]
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.size() == 0 {
            return layout.align() as *mut u8;
        }
        match allocate_layout(layout) {
            Ok(ptr) => ptr.as_ptr(),
            Err(_) => ptr::null_mut(),
        }
    }

    #[inline]
    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        if layout.size() == 0 {
            return;
        }
        if let Some(ptr) = NonNull::new(ptr) {
            unsafe { deallocate(ptr) };
        }
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        let ptr = unsafe { self.alloc(layout) };
        if !ptr.is_null() && layout.size() > 0 {
            unsafe { ptr::write_bytes(ptr, 0, layout.size()) };
        }
        ptr
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        let new_layout = unsafe { Layout::from_size_align_unchecked(new_size, layout.align()) };
        let Some(old) = NonNull::new(ptr).filter(|_| layout.size() > 0) else {
            return unsafe { self.alloc(new_layout) };
        };

        if new_size == 0 {
            unsafe { self.dealloc(ptr, layout) };
            return layout.align() as *mut u8;
        }

        // The span knows the real capacity; an earlier in-place shrink may
        // have left `layout.size()` smaller than it.
        let old_usable = unsafe { usable_size(old) };
        if new_size <= old_usable {
            return ptr;
        }

        let new_ptr = unsafe { self.alloc(new_layout) };
        if !new_ptr.is_null() {
            unsafe {
                ptr::copy_nonoverlapping(ptr, new_ptr, old_usable.min(new_size));
                deallocate(old);
            }
        }
        new_ptr
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page_heap::PageAccounting;
    use std::collections::HashSet;
    use std::vec::Vec;

    fn balanced(acct: PageAccounting) -> bool {
        acct.free + acct.in_use == acct.acquired
    }

    #[test]
    fn test_allocate_round_trip_every_class() {
        for cls in 0..size_class::NUM_SIZE_CLASSES {
            let size = size_class::class_to_size(cls);
            let ptr = allocate(size).unwrap();
            assert_eq!(ptr.as_ptr() as usize % 8, 0);
            unsafe {
                assert_eq!(usable_size(ptr), size);
                ptr.as_ptr().write_bytes(0x5A, size);
                deallocate(ptr);
            }
            let again = allocate(size).unwrap();
            unsafe { deallocate(again) };
        }
        assert!(balanced(page_heap().accounting()));
    }

    #[test]
    fn test_zero_size_uses_smallest_class() {
        let ptr = allocate(0).unwrap();
        assert_eq!(unsafe { usable_size(ptr) }, 8);
        unsafe { deallocate(ptr) };
    }

    #[test]
    fn test_large_allocation_is_page_run() {
        let size = MAX_CACHED_SIZE + 1;
        let ptr = allocate(size).unwrap();
        assert_eq!(ptr.as_ptr() as usize % PAGE_SIZE, 0);
        let usable = unsafe { usable_size(ptr) };
        assert_eq!(usable, size.div_ceil(PAGE_SIZE) * PAGE_SIZE);
        unsafe {
            ptr.as_ptr().write_bytes(0xCD, size);
            deallocate(ptr);
        }
    }

    #[test]
    fn test_too_large() {
        assert_eq!(
            allocate(usize::MAX).unwrap_err(),
            AllocError::TooLarge { size: usize::MAX }
        );
    }

    #[test]
    fn test_live_allocations_do_not_alias() {
        let sizes = [1, 6, 7, 24, 100, 1000, 5000, 70_000, 300_000];
        let mut live = Vec::new();
        for round in 0..20 {
            for &size in &sizes {
                let ptr = allocate(size).unwrap();
                unsafe { ptr.as_ptr().write_bytes(round as u8, size) };
                live.push((ptr, size));
            }
        }
        let mut ranges: Vec<_> = live
            .iter()
            .map(|&(p, s)| (p.as_ptr() as usize, p.as_ptr() as usize + s))
            .collect();
        ranges.sort_unstable();
        for pair in ranges.windows(2) {
            assert!(pair[0].1 <= pair[1].0, "overlap: {:?}", pair);
        }
        let unique: HashSet<_> = live.iter().map(|(p, _)| p.as_ptr() as usize).collect();
        assert_eq!(unique.len(), live.len());
        for (ptr, _) in live {
            unsafe { deallocate(ptr) };
        }
    }

    #[test]
    fn test_global_alloc_alignment() {
        let alloc = TierMalloc;
        for &align in &[16usize, 64, 256, 4096, PAGE_SIZE, 4 * PAGE_SIZE] {
            for &size in &[1usize, 24, 3000, 100_000, 400_000] {
                let layout = Layout::from_size_align(size, align).unwrap();
                unsafe {
                    let ptr = alloc.alloc(layout);
                    assert!(!ptr.is_null());
                    assert_eq!(ptr as usize % align, 0, "size {} align {}", size, align);
                    ptr.write_bytes(0xEE, size);
                    alloc.dealloc(ptr, layout);
                }
            }
        }
    }

    #[test]
    fn test_realloc_in_place_and_grow() {
        let alloc = TierMalloc;
        unsafe {
            let layout = Layout::from_size_align(10, 8).unwrap();
            let p = alloc.alloc(layout);
            for i in 0..10 {
                *p.add(i) = i as u8;
            }
            // 10 rounds to 16, so growing to 16 stays put.
            assert_eq!(alloc.realloc(p, layout, 16), p);

            let q = alloc.realloc(p, Layout::from_size_align(16, 8).unwrap(), 5000);
            assert!(!q.is_null());
            for i in 0..10 {
                assert_eq!(*q.add(i), i as u8);
            }
            alloc.dealloc(q, Layout::from_size_align(5000, 8).unwrap());
        }
    }

    #[test]
    fn test_alloc_zeroed() {
        let alloc = TierMalloc;
        let layout = Layout::from_size_align(256, 8).unwrap();
        unsafe {
            let p = alloc.alloc(layout);
            p.write_bytes(0xFF, 256);
            alloc.dealloc(p, layout);
            let z = alloc.alloc_zeroed(layout);
            assert!((0..256).all(|i| *z.add(i) == 0));
            alloc.dealloc(z, layout);
        }
    }
}

//! Thread Cache (front-end): per-thread free lists for lock-free allocation.
//!
//! Each thread gets its own ThreadCache, bound on first use. The fast path
//! (thread cache hit) requires zero synchronization. When a list is empty or
//! too long, objects move to or from the central cache in batches whose size
//! grows by slow start.

use crate::central_cache::CentralCache;
use crate::error::AllocError;
use crate::free_list::FreeList;
use crate::page_heap::PageHeap;
use crate::size_class::{self, NUM_SIZE_CLASSES};
use core::ptr::NonNull;

/// Per-thread cache holding free lists for each size class.
pub struct ThreadCache {
    lists: [FreeList; NUM_SIZE_CLASSES],
}

// SAFETY: a ThreadCache is used by one thread at a time; it only moves
// between threads through the metadata pool.
unsafe impl Send for ThreadCache {}

impl Default for ThreadCache {
    fn default() -> Self {
        Self::new()
    }
}

impl ThreadCache {
    pub const fn new() -> Self {
        Self {
            lists: [const { FreeList::new() }; NUM_SIZE_CLASSES],
        }
    }

    /// Allocate an object of at least `bytes` bytes (at most `MAX_CACHED_SIZE`).
    #[inline]
    pub fn allocate(
        &mut self,
        bytes: usize,
        central: &CentralCache,
        heap: &PageHeap,
    ) -> Result<NonNull<u8>, AllocError> {
        let class = size_class::index(bytes);
        if let Some(obj) = self.lists[class].pop() {
            // SAFETY: free lists only hold non-null objects.
            return Ok(unsafe { NonNull::new_unchecked(obj) });
        }
        self.fetch_from_central(class, central, heap)
    }

    /// Cache a freed object of `bytes` bytes, sending a batch back to the
    /// central cache when the list grows past its ceiling.
    ///
    /// # Safety
    /// `ptr` must be an object of the class of `bytes` that is no longer used.
    #[inline]
    pub unsafe fn deallocate(
        &mut self,
        ptr: NonNull<u8>,
        bytes: usize,
        central: &CentralCache,
        heap: &PageHeap,
    ) {
        let class = size_class::index(bytes);
        let list = &mut self.lists[class];
        unsafe { list.push(ptr.as_ptr()) };
        if list.len() > list.max_size() {
            self.release_to_central(class, central, heap);
        }
    }

    /// Return every cached object to the central cache.
    pub fn flush(&mut self, central: &CentralCache, heap: &PageHeap) {
        for (class, list) in self.lists.iter_mut().enumerate() {
            if list.is_empty() {
                continue;
            }
            let batch = list.pop_batch(list.len());
            central.insert_range(batch, size_class::class_to_size(class), heap);
        }
    }

    /// Current batch ceiling of a size class.
    pub fn max_size(&self, size_class: usize) -> usize {
        self.lists[size_class].max_size()
    }

    /// Objects cached for a size class.
    pub fn cached(&self, size_class: usize) -> usize {
        self.lists[size_class].len()
    }

    /// Slow path: fetch a batch from the central cache.
    ///
    /// Slow start: fetch `min(move_count, max_size)` objects, and raise
    /// `max_size` by one each time a full `max_size` batch arrives. A failed
    /// or short fetch leaves `max_size` alone.
    #[cold]
    fn fetch_from_central(
        &mut self,
        class: usize,
        central: &CentralCache,
        heap: &PageHeap,
    ) -> Result<NonNull<u8>, AllocError> {
        let info = size_class::class_info(class);
        let list = &mut self.lists[class];

        let want = info.batch_size.min(list.max_size());
        let mut batch = central.remove_range(want, info.size, heap)?;
        if want == list.max_size() && batch.len == want {
            list.grow_max_size(info.batch_size);
        }

        let obj = batch
            .pop_front()
            .ok_or(AllocError::OutOfMemory { pages: info.pages })?;
        unsafe { list.push_batch(batch) };
        Ok(obj)
    }

    /// Send `max_size` objects of a class back to the central cache.
    fn release_to_central(&mut self, class: usize, central: &CentralCache, heap: &PageHeap) {
        let list = &mut self.lists[class];
        let batch = list.pop_batch(list.max_size());
        central.insert_range(batch, size_class::class_to_size(class), heap);
    }
}

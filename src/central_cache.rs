//! Central Cache (middle-end): per-size-class shared span lists.
//!
//! Each size class has its own `CentralFreeList` behind its own lock. Thread
//! caches fetch and return objects here in batches. When no span of a class
//! has free objects, a run is taken from the page heap and carved. A span
//! whose objects have all come back is returned to the page heap.
//!
//! A size-class lock is never held while the page heap lock is taken: both
//! slow paths drop the class lock, call the page heap, and lock again.

use crate::error::AllocError;
use crate::free_list::{Batch, FreeObject};
use crate::page_heap::PageHeap;
use crate::size_class::{self, NUM_SIZE_CLASSES};
use crate::span::{Span, SpanList, SpanState};
use crate::sync::{LockDomain, SpinMutex};
use core::ptr::NonNull;

/// Central free list for a single size class.
pub struct CentralFreeList {
    /// Every span of this class handed out by the page heap, whether
    /// fully allocated, partially free or freshly carved.
    spans: SpanList,
}

impl Default for CentralFreeList {
    fn default() -> Self {
        Self::new()
    }
}

impl CentralFreeList {
    pub const fn new() -> Self {
        Self {
            spans: SpanList::new(),
        }
    }

    /// Spans currently owned by this class.
    pub fn span_count(&self) -> usize {
        self.spans.len()
    }

    /// First span with at least one free object.
    fn first_with_free(&self) -> Option<NonNull<Span>> {
        self.spans
            .iter()
            .find(|span| unsafe { (*span.as_ptr()).has_free_objects() })
    }
}

/// Array of central free lists, one per size class.
/// Each is individually locked for fine-grained concurrency.
pub struct CentralCache {
    lists: [SpinMutex<CentralFreeList>; NUM_SIZE_CLASSES],
}

impl Default for CentralCache {
    fn default() -> Self {
        Self::new()
    }
}

impl CentralCache {
    pub const fn new() -> Self {
        Self {
            lists: [const { SpinMutex::in_domain(LockDomain::SizeClass, CentralFreeList::new()) };
                NUM_SIZE_CLASSES],
        }
    }

    /// Get a reference to the central free list for a size class.
    #[inline]
    pub fn get(&self, size_class: usize) -> &SpinMutex<CentralFreeList> {
        &self.lists[size_class]
    }

    /// Take up to `batch` objects of `object_size` bytes, all from one span.
    /// The returned batch is never empty.
    pub fn remove_range(
        &self,
        batch: usize,
        object_size: usize,
        heap: &PageHeap,
    ) -> Result<Batch, AllocError> {
        debug_assert!(batch > 0);
        let list_lock = self.get(size_class::index(object_size));

        let mut list = list_lock.lock();
        let span = match list.first_with_free() {
            Some(span) => span,
            None => {
                drop(list);
                let span = fetch_span(object_size, heap)?;
                list = list_lock.lock();
                unsafe { list.spans.push_front(span) };
                span
            }
        };

        let taken = unsafe { (*span.as_ptr()).take_objects(batch) };
        debug_assert!(!taken.is_empty());
        Ok(taken)
    }

    /// Give a chain of objects of `object_size` bytes back to their spans.
    /// Spans left with nothing handed out go back to the page heap.
    pub fn insert_range(&self, batch: Batch, object_size: usize, heap: &PageHeap) {
        if batch.is_empty() {
            return;
        }
        let list_lock = self.get(size_class::index(object_size));

        let mut list = list_lock.lock();
        let mut obj = batch.head;
        while !obj.is_null() {
            let next = unsafe { FreeObject::next(obj) };

            let Some(span) = heap.resolve_span(obj as *const u8) else {
                debug_assert!(false, "freed object {:p} is not from this heap", obj);
                obj = next;
                continue;
            };
            debug_assert_eq!(unsafe { (*span.as_ptr()).state }, SpanState::Small);
            debug_assert_eq!(unsafe { (*span.as_ptr()).object_size }, object_size);

            if unsafe { (*span.as_ptr()).return_object(obj) } {
                unsafe {
                    list.spans.remove(span);
                    (*span.as_ptr()).reset();
                }
                drop(list);
                unsafe { heap.reclaim_page_run(span) };
                list = list_lock.lock();
            }
            obj = next;
        }
    }
}

/// A fresh run from the page heap, carved into `object_size` objects.
/// No lock is held while carving: the span is not reachable yet.
fn fetch_span(object_size: usize, heap: &PageHeap) -> Result<NonNull<Span>, AllocError> {
    let pages = size_class::page_move_count(object_size);
    let span = heap.allocate_page_run(pages)?;
    unsafe { (*span.as_ptr()).carve(object_size) };
    crate::trace!(
        "[central_cache] carved {} pages into {} objects of {} bytes",
        pages,
        unsafe { (*span.as_ptr()).capacity },
        object_size
    );
    Ok(span)
}

//! Span management: metadata for contiguous runs of pages, and the pool that
//! holds Span structs themselves.

use crate::config::{PAGE_SHIFT, PAGE_SIZE};
use crate::error::AllocError;
use crate::free_list::{self, Batch, FreeObject};
use crate::object_pool::ObjectPool;
use crate::sync::{LockDomain, SpinMutex};
use core::ptr::{self, NonNull};

/// State of a span.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
#[repr(u8)]
pub enum SpanState {
    /// Span is tracked as a free run by the page heap.
    #[default]
    Free = 0,
    /// Span is carved into equal objects and owned by the central cache.
    Small = 1,
    /// Span is checked out whole (a large allocation, or not yet carved).
    Large = 2,
}

/// Metadata for a contiguous run of pages.
///
/// Span structs come from a dedicated [`ObjectPool`], never from the
/// allocator they describe.
#[repr(C)]
pub struct Span {
    /// Starting page ID (address >> PAGE_SHIFT).
    pub start_page: usize,
    /// Number of pages in this span.
    pub num_pages: usize,
    /// Size of each carved object, or the usable bytes of a large run.
    /// Zero while the span is an uncarved page run.
    pub object_size: usize,
    pub state: SpanState,
    /// Objects currently handed out of this span.
    pub use_count: u32,
    /// Objects carved from this span.
    pub capacity: u32,
    /// Free objects remaining inside this span.
    pub free_list: *mut FreeObject,
    pub prev: *mut Span,
    pub next: *mut Span,
}

// SAFETY: a Span is only mutated under the lock of the structure that
// currently owns it (page heap, central free list, or span pool).
unsafe impl Send for Span {}

impl Default for Span {
    fn default() -> Self {
        Self {
            start_page: 0,
            num_pages: 0,
            object_size: 0,
            state: SpanState::Free,
            use_count: 0,
            capacity: 0,
            free_list: ptr::null_mut(),
            prev: ptr::null_mut(),
            next: ptr::null_mut(),
        }
    }
}

impl Span {
    /// The base address of the memory region this span covers.
    #[inline]
    pub fn start_addr(&self) -> *mut u8 {
        (self.start_page << PAGE_SHIFT) as *mut u8
    }

    /// Total bytes covered by this span.
    #[inline]
    pub fn byte_size(&self) -> usize {
        self.num_pages * PAGE_SIZE
    }

    /// One past the last page ID in this span.
    #[inline]
    pub fn end_page(&self) -> usize {
        self.start_page + self.num_pages
    }

    #[inline]
    pub fn has_free_objects(&self) -> bool {
        !self.free_list.is_null()
    }

    /// Split the whole run into `object_size` objects and mark it small.
    /// The tail shorter than one object is left unused.
    ///
    /// # Safety
    /// The span's pages must be owned by the caller and not visible to any
    /// other thread yet.
    pub unsafe fn carve(&mut self, object_size: usize) {
        debug_assert!(object_size >= core::mem::size_of::<FreeObject>());
        let count = self.byte_size() / object_size;
        debug_assert!(count >= 1, "span too small for its object size");
        let batch = unsafe { free_list::carve(self.start_addr(), object_size, count) };
        self.object_size = object_size;
        self.capacity = count as u32;
        self.use_count = 0;
        self.free_list = batch.head;
        self.state = SpanState::Small;
    }

    /// Detach up to `n` free objects and count them as handed out.
    pub fn take_objects(&mut self, n: usize) -> Batch {
        let batch = unsafe { Batch::take(&mut self.free_list, n) };
        self.use_count += batch.len as u32;
        batch
    }

    /// Put one object back on this span's free list. Returns true when the
    /// span has no objects handed out anymore.
    ///
    /// # Safety
    /// `obj` must be an object carved from this span that is currently handed out.
    pub unsafe fn return_object(&mut self, obj: *mut FreeObject) -> bool {
        debug_assert!(self.use_count > 0, "object returned to an idle span");
        unsafe { FreeObject::set_next(obj, self.free_list) };
        self.free_list = obj;
        self.use_count -= 1;
        self.use_count == 0
    }

    /// Forget carving state before the run goes back to the page heap.
    pub fn reset(&mut self) {
        self.object_size = 0;
        self.use_count = 0;
        self.capacity = 0;
        self.free_list = ptr::null_mut();
    }
}

/// A doubly-linked list of spans.
pub struct SpanList {
    head: *mut Span,
    count: usize,
}

// SAFETY: see `Span`.
unsafe impl Send for SpanList {}

impl Default for SpanList {
    fn default() -> Self {
        Self::new()
    }
}

impl SpanList {
    pub const fn new() -> Self {
        Self {
            head: ptr::null_mut(),
            count: 0,
        }
    }

    /// First span in the list, or null.
    #[inline]
    pub fn first(&self) -> *mut Span {
        self.head
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.count
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.head.is_null()
    }

    /// Prepend a span to the front of the list.
    ///
    /// # Safety
    /// `span` must be valid and not already in a list.
    pub unsafe fn push_front(&mut self, span: NonNull<Span>) {
        let span = span.as_ptr();
        unsafe {
            (*span).next = self.head;
            (*span).prev = ptr::null_mut();
            if !self.head.is_null() {
                (*self.head).prev = span;
            }
        }
        self.head = span;
        self.count += 1;
    }

    /// Remove a specific span from the list.
    ///
    /// # Safety
    /// `span` must be valid and currently in this list.
    pub unsafe fn remove(&mut self, span: NonNull<Span>) {
        let span = span.as_ptr();
        unsafe {
            let prev = (*span).prev;
            let next = (*span).next;
            if !prev.is_null() {
                (*prev).next = next;
            } else {
                self.head = next;
            }
            if !next.is_null() {
                (*next).prev = prev;
            }
            (*span).prev = ptr::null_mut();
            (*span).next = ptr::null_mut();
        }
        self.count -= 1;
    }

    /// Iterate the spans in list order. The list must not change while the
    /// iterator is alive.
    pub fn iter(&self) -> SpanIter<'_> {
        SpanIter {
            current: self.head,
            _list: self,
        }
    }
}

pub struct SpanIter<'a> {
    current: *mut Span,
    _list: &'a SpanList,
}

impl Iterator for SpanIter<'_> {
    type Item = NonNull<Span>;

    fn next(&mut self) -> Option<NonNull<Span>> {
        let span = NonNull::new(self.current)?;
        self.current = unsafe { (*span.as_ptr()).next };
        Some(span)
    }
}

static SPAN_POOL: SpinMutex<ObjectPool<Span>> =
    SpinMutex::in_domain(LockDomain::Metadata, ObjectPool::new());

/// Allocate a zeroed Span struct.
pub fn new_span() -> Result<NonNull<Span>, AllocError> {
    SPAN_POOL.lock().acquire()
}

/// Return a Span struct to the pool.
///
/// # Safety
/// `span` must have come from [`new_span`] and must not be in any list.
pub unsafe fn delete_span(span: NonNull<Span>) {
    unsafe { SPAN_POOL.lock().release(span) };
}

//! Page Heap (back-end): manages runs of contiguous pages.
//!
//! Responsibilities:
//! - Hand out page runs of exactly N pages (exact free run, split of a larger
//!   one, or fresh OS pages)
//! - Take runs back, coalescing with adjacent free runs
//! - Grow the heap by requesting memory from the OS
//! - Keep the page map current so any issued address resolves to its Span
//!
//! All mutation happens under one lock in the `PageHeap` lock domain. Address
//! lookups go through the page map and take no lock.

use crate::config::{HEAP_GROWTH_PAGES, MAX_PAGES, PAGE_SHIFT, PAGE_SIZE};
use crate::error::AllocError;
use crate::pagemap::PageMap;
use crate::platform;
use crate::span::{self, Span, SpanList, SpanState};
use crate::sync::{LockDomain, SpinMutex};
use core::ptr::NonNull;

/// Page counts of a heap, read atomically under the heap lock.
/// `free + in_use == acquired` always holds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PageAccounting {
    /// Pages obtained from the OS.
    pub acquired: usize,
    /// Pages in free runs.
    pub free: usize,
    /// Pages in spans checked out of the heap.
    pub in_use: usize,
}

struct PageRuns {
    /// free_lists[k] holds free runs of exactly k pages (index 0 unused).
    free_lists: [SpanList; MAX_PAGES + 1],
    /// Free runs larger than MAX_PAGES pages.
    large_runs: SpanList,
    /// Most pages this heap may ever take from the OS.
    limit_pages: usize,
    acquired_pages: usize,
    free_pages: usize,
    in_use_pages: usize,
}

pub struct PageHeap {
    runs: SpinMutex<PageRuns>,
    pagemap: PageMap,
}

impl Default for PageHeap {
    fn default() -> Self {
        Self::new()
    }
}

impl PageHeap {
    pub const fn new() -> Self {
        Self::with_limit(usize::MAX)
    }

    /// A heap that refuses to take more than `pages` pages from the OS.
    pub const fn with_limit(pages: usize) -> Self {
        Self {
            runs: SpinMutex::in_domain(
                LockDomain::PageHeap,
                PageRuns {
                    free_lists: [const { SpanList::new() }; MAX_PAGES + 1],
                    large_runs: SpanList::new(),
                    limit_pages: pages,
                    acquired_pages: 0,
                    free_pages: 0,
                    in_use_pages: 0,
                },
            ),
            pagemap: PageMap::new(),
        }
    }

    /// Take a run of exactly `pages` pages. The span comes back in the
    /// `Large` state with every page registered.
    pub fn allocate_page_run(&self, pages: usize) -> Result<NonNull<Span>, AllocError> {
        assert!(pages > 0);
        self.runs.lock().allocate(&self.pagemap, pages)
    }

    /// Take a run of `pages` pages whose start address is a multiple of
    /// `align` bytes. `align` must be a power of two.
    pub fn allocate_aligned_run(
        &self,
        pages: usize,
        align: usize,
    ) -> Result<NonNull<Span>, AllocError> {
        assert!(pages > 0);
        assert!(align.is_power_of_two());
        let align_pages = (align >> PAGE_SHIFT).max(1);
        self.runs
            .lock()
            .allocate_aligned(&self.pagemap, pages, align_pages)
    }

    /// Give a run back to the heap, merging it with free neighbors.
    ///
    /// # Safety
    /// `span` must have come from this heap, be checked out, and be in no list.
    pub unsafe fn reclaim_page_run(&self, span: NonNull<Span>) {
        let mut runs = self.runs.lock();
        let pages = unsafe { (*span.as_ptr()).num_pages };
        debug_assert_ne!(
            unsafe { (*span.as_ptr()).state },
            SpanState::Free,
            "page run reclaimed twice"
        );
        runs.in_use_pages -= pages;
        runs.free_pages += pages;
        unsafe { runs.insert_free(&self.pagemap, span) };
    }

    /// The span owning an address issued by this heap. Takes no lock.
    #[inline]
    pub fn resolve_span(&self, addr: *const u8) -> Option<NonNull<Span>> {
        self.pagemap.lookup(addr)
    }

    pub fn accounting(&self) -> PageAccounting {
        let runs = self.runs.lock();
        PageAccounting {
            acquired: runs.acquired_pages,
            free: runs.free_pages,
            in_use: runs.in_use_pages,
        }
    }
}

impl PageRuns {
    fn allocate(&mut self, pagemap: &PageMap, pages: usize) -> Result<NonNull<Span>, AllocError> {
        if let Some(span) = self.find_free(pages) {
            return unsafe { self.split_run(pagemap, span, pages) };
        }

        self.grow(pagemap, pages)?;

        match self.find_free(pages) {
            Some(span) => unsafe { self.split_run(pagemap, span, pages) },
            None => Err(AllocError::OutOfMemory { pages }),
        }
    }

    /// Over-allocate by `align_pages - 1` and give the unaligned prefix and
    /// the leftover suffix back as free runs.
    fn allocate_aligned(
        &mut self,
        pagemap: &PageMap,
        pages: usize,
        align_pages: usize,
    ) -> Result<NonNull<Span>, AllocError> {
        if align_pages == 1 {
            return self.allocate(pagemap, pages);
        }
        let total = pages
            .checked_add(align_pages - 1)
            .ok_or(AllocError::OutOfMemory { pages })?;

        // Metadata first, so a failure leaves nothing half done.
        let prefix = span::new_span()?;
        let suffix = match span::new_span() {
            Ok(s) => s,
            Err(e) => {
                unsafe { span::delete_span(prefix) };
                return Err(e);
            }
        };
        let run = match self.allocate(pagemap, total) {
            Ok(run) => run,
            Err(e) => {
                unsafe {
                    span::delete_span(prefix);
                    span::delete_span(suffix);
                }
                return Err(e);
            }
        };

        let r = run.as_ptr();
        let start = unsafe { (*r).start_page };
        let aligned = (start + align_pages - 1) & !(align_pages - 1);
        let prefix_pages = aligned - start;
        let suffix_pages = total - prefix_pages - pages;

        unsafe {
            (*r).start_page = aligned;
            (*r).num_pages = pages;
            self.trim(pagemap, prefix, start, prefix_pages);
            self.trim(pagemap, suffix, aligned + pages, suffix_pages);
        }
        Ok(run)
    }

    /// Return `[start, start + pages)` of a checked-out run to free tracking
    /// through the spare span `meta`, or discard `meta` when there is nothing
    /// to return.
    unsafe fn trim(&mut self, pagemap: &PageMap, meta: NonNull<Span>, start: usize, pages: usize) {
        if pages == 0 {
            unsafe { span::delete_span(meta) };
            return;
        }
        unsafe {
            (*meta.as_ptr()).start_page = start;
            (*meta.as_ptr()).num_pages = pages;
            (*meta.as_ptr()).state = SpanState::Large;
        }
        self.in_use_pages -= pages;
        self.free_pages += pages;
        unsafe { self.insert_free(pagemap, meta) };
    }

    /// Smallest free run with at least `pages` pages: exact list first, then
    /// larger lists, then best fit among the large runs.
    fn find_free(&self, pages: usize) -> Option<NonNull<Span>> {
        if pages <= MAX_PAGES {
            for n in pages..=MAX_PAGES {
                if let Some(span) = NonNull::new(self.free_lists[n].first()) {
                    return Some(span);
                }
            }
        }

        let mut best: Option<NonNull<Span>> = None;
        let mut best_pages = usize::MAX;
        for span in self.large_runs.iter() {
            let n = unsafe { (*span.as_ptr()).num_pages };
            if n >= pages && n < best_pages {
                best = Some(span);
                best_pages = n;
                if n == pages {
                    break;
                }
            }
        }
        best
    }

    /// Check out the first `pages` pages of the free run `span` and put the
    /// remainder back as a free run.
    unsafe fn split_run(
        &mut self,
        pagemap: &PageMap,
        span: NonNull<Span>,
        pages: usize,
    ) -> Result<NonNull<Span>, AllocError> {
        let s = span.as_ptr();
        let total = unsafe { (*s).num_pages };
        debug_assert!(total >= pages);

        // Remainder metadata before touching the lists.
        let remainder = if total > pages {
            Some(span::new_span()?)
        } else {
            None
        };

        unsafe { self.unlink_free(span) };

        if let Some(rem) = remainder {
            crate::trace!("[page_heap] split {} pages off a {} page run", pages, total);
            unsafe {
                let r = rem.as_ptr();
                (*r).start_page = (*s).start_page + pages;
                (*r).num_pages = total - pages;
                (*r).state = SpanState::Free;
                (*s).num_pages = pages;
                pagemap.register_endpoints(rem);
                self.link_free(rem);
            }
        }

        unsafe {
            (*s).state = SpanState::Large;
            (*s).reset();
            pagemap.register_run(span);
        }
        self.free_pages -= pages;
        self.in_use_pages += pages;
        Ok(span)
    }

    /// Request at least `pages` pages from the OS and add them as a free run.
    fn grow(&mut self, pagemap: &PageMap, pages: usize) -> Result<(), AllocError> {
        let headroom = self.limit_pages - self.acquired_pages;
        if pages > headroom {
            return Err(AllocError::OutOfMemory { pages });
        }

        let preferred = pages.max(HEAP_GROWTH_PAGES).min(headroom);
        let (base, got) = match unsafe { os_pages(preferred) } {
            Some(base) => (base, preferred),
            None if preferred > pages => match unsafe { os_pages(pages) } {
                Some(base) => (base, pages),
                None => return Err(AllocError::OutOfMemory { pages }),
            },
            None => return Err(AllocError::OutOfMemory { pages }),
        };

        let start_page = base as usize >> PAGE_SHIFT;
        let meta = pagemap
            .ensure(start_page, got)
            .and_then(|()| span::new_span());
        let meta = match meta {
            Ok(meta) => meta,
            Err(e) => {
                unsafe { platform::page_dealloc(base, got * PAGE_SIZE) };
                return Err(e);
            }
        };

        crate::trace!("[page_heap] grow by {} pages at {:p}", got, base);

        unsafe {
            (*meta.as_ptr()).start_page = start_page;
            (*meta.as_ptr()).num_pages = got;
        }
        self.acquired_pages += got;
        self.free_pages += got;
        unsafe { self.insert_free(pagemap, meta) };
        Ok(())
    }

    /// Mark a run free, merge it with free neighbors and file it.
    unsafe fn insert_free(&mut self, pagemap: &PageMap, span: NonNull<Span>) {
        unsafe {
            (*span.as_ptr()).state = SpanState::Free;
            (*span.as_ptr()).reset();
            let span = self.coalesce_left(pagemap, span);
            let span = self.coalesce_right(pagemap, span);
            pagemap.register_endpoints(span);
            self.link_free(span);
        }
    }

    unsafe fn link_free(&mut self, span: NonNull<Span>) {
        let n = unsafe { (*span.as_ptr()).num_pages };
        if n <= MAX_PAGES {
            unsafe { self.free_lists[n].push_front(span) };
        } else {
            unsafe { self.large_runs.push_front(span) };
        }
    }

    unsafe fn unlink_free(&mut self, span: NonNull<Span>) {
        let n = unsafe { (*span.as_ptr()).num_pages };
        if n <= MAX_PAGES {
            unsafe { self.free_lists[n].remove(span) };
        } else {
            unsafe { self.large_runs.remove(span) };
        }
    }

    /// Merge with the free run ending right before `span`.
    unsafe fn coalesce_left(&mut self, pagemap: &PageMap, span: NonNull<Span>) -> NonNull<Span> {
        let start = unsafe { (*span.as_ptr()).start_page };
        if start == 0 {
            return span;
        }
        let Some(left) = pagemap.get(start - 1) else {
            return span;
        };
        if left == span {
            return span;
        }

        unsafe {
            let l = left.as_ptr();
            if (*l).state != SpanState::Free || (*l).end_page() != start {
                return span;
            }
            self.unlink_free(left);
            (*l).num_pages += (*span.as_ptr()).num_pages;
            span::delete_span(span);
        }
        left
    }

    /// Merge with the free run starting right after `span`.
    unsafe fn coalesce_right(&mut self, pagemap: &PageMap, span: NonNull<Span>) -> NonNull<Span> {
        let end = unsafe { (*span.as_ptr()).end_page() };
        let Some(right) = pagemap.get(end) else {
            return span;
        };
        if right == span {
            return span;
        }

        unsafe {
            let r = right.as_ptr();
            if (*r).state != SpanState::Free || (*r).start_page != end {
                return span;
            }
            self.unlink_free(right);
            (*span.as_ptr()).num_pages += (*r).num_pages;
            span::delete_span(right);
        }
        span
    }
}

/// Fresh zeroed pages from the OS, or `None`.
unsafe fn os_pages(pages: usize) -> Option<*mut u8> {
    let bytes = pages.checked_mul(PAGE_SIZE)?;
    if bytes > isize::MAX as usize {
        return None;
    }
    let base = unsafe { platform::page_alloc(bytes) };
    if base.is_null() { None } else { Some(base) }
}

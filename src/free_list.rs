//! Intrusive free lists of same-size objects.
//!
//! A free object stores the link to the next free object in its own first
//! machine word, so free memory carries no side metadata. This module is the
//! only place that reads or writes those in-place links; the tiers above move
//! objects around as [`FreeObject`] pointers and [`Batch`] chains.

use core::ptr::{self, NonNull};

/// An intrusive free list node stored inside freed memory.
/// The `next` pointer occupies the first word of the freed object.
#[repr(C)]
pub struct FreeObject {
    next: *mut FreeObject,
}

impl FreeObject {
    /// Read the link stored in a free object.
    ///
    /// # Safety
    /// `obj` must point to a free object of at least one word.
    #[inline]
    pub unsafe fn next(obj: *mut FreeObject) -> *mut FreeObject {
        unsafe { (*obj).next }
    }

    /// Overwrite the link stored in a free object.
    ///
    /// # Safety
    /// `obj` must point to a free object of at least one word.
    #[inline]
    pub unsafe fn set_next(obj: *mut FreeObject, next: *mut FreeObject) {
        unsafe { (*obj).next = next };
    }
}

/// A null-terminated chain of free objects moved between tiers in one piece.
#[derive(Clone, Copy, Debug)]
pub struct Batch {
    pub head: *mut FreeObject,
    pub tail: *mut FreeObject,
    pub len: usize,
}

impl Batch {
    pub const EMPTY: Batch = Batch {
        head: ptr::null_mut(),
        tail: ptr::null_mut(),
        len: 0,
    };

    /// A one-object batch.
    ///
    /// # Safety
    /// `obj` must point to an object of at least one word that the caller owns.
    pub unsafe fn single(obj: *mut u8) -> Batch {
        let obj = obj as *mut FreeObject;
        unsafe { FreeObject::set_next(obj, ptr::null_mut()) };
        Batch {
            head: obj,
            tail: obj,
            len: 1,
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Detach the first object of the chain.
    pub fn pop_front(&mut self) -> Option<NonNull<u8>> {
        let obj = NonNull::new(self.head)?;
        self.head = unsafe { FreeObject::next(obj.as_ptr()) };
        self.len -= 1;
        if self.head.is_null() {
            self.tail = ptr::null_mut();
        }
        Some(obj.cast())
    }

    /// Detach up to `n` objects from the front of the chain starting at `*head`.
    /// `*head` is left pointing at the first object not taken.
    ///
    /// # Safety
    /// `*head` must be null or the start of a valid null-terminated chain.
    pub unsafe fn take(head: &mut *mut FreeObject, n: usize) -> Batch {
        let first = *head;
        if first.is_null() || n == 0 {
            return Batch::EMPTY;
        }
        let mut tail = first;
        let mut len = 1;
        unsafe {
            while len < n {
                let next = FreeObject::next(tail);
                if next.is_null() {
                    break;
                }
                tail = next;
                len += 1;
            }
            *head = FreeObject::next(tail);
            FreeObject::set_next(tail, ptr::null_mut());
        }
        Batch {
            head: first,
            tail,
            len,
        }
    }
}

/// Link `count` consecutive objects of `object_size` bytes starting at `base`
/// into a chain, lowest address first.
///
/// # Safety
/// `[base, base + count * object_size)` must be writable memory owned by the
/// caller, and `object_size` must be at least one word and word aligned.
pub unsafe fn carve(base: *mut u8, object_size: usize, count: usize) -> Batch {
    if count == 0 {
        return Batch::EMPTY;
    }
    let head = base as *mut FreeObject;
    let mut prev = head;
    for i in 1..count {
        let obj = unsafe { base.add(i * object_size) } as *mut FreeObject;
        unsafe { FreeObject::set_next(prev, obj) };
        prev = obj;
    }
    unsafe { FreeObject::set_next(prev, ptr::null_mut()) };
    Batch {
        head,
        tail: prev,
        len: count,
    }
}

/// Per-size-class free list owned by one thread cache.
pub struct FreeList {
    head: *mut FreeObject,
    len: usize,
    /// Batch ceiling, grown by slow start.
    max_size: usize,
}

impl Default for FreeList {
    fn default() -> Self {
        Self::new()
    }
}

impl FreeList {
    pub const fn new() -> Self {
        Self {
            head: ptr::null_mut(),
            len: 0,
            max_size: 1,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.head.is_null()
    }

    #[inline]
    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Raise the batch ceiling by one, never past `cap`.
    #[inline]
    pub fn grow_max_size(&mut self, cap: usize) {
        if self.max_size < cap {
            self.max_size += 1;
        }
    }

    /// # Safety
    /// `obj` must be a free object of this list's size class owned by the caller.
    #[inline]
    pub unsafe fn push(&mut self, obj: *mut u8) {
        let obj = obj as *mut FreeObject;
        unsafe { FreeObject::set_next(obj, self.head) };
        self.head = obj;
        self.len += 1;
    }

    #[inline]
    pub fn pop(&mut self) -> Option<*mut u8> {
        if self.head.is_null() {
            return None;
        }
        let obj = self.head;
        self.head = unsafe { FreeObject::next(obj) };
        self.len -= 1;
        Some(obj as *mut u8)
    }

    /// Splice a whole batch onto the front of the list.
    ///
    /// # Safety
    /// `batch` must be a valid chain of free objects of this list's class.
    pub unsafe fn push_batch(&mut self, batch: Batch) {
        if batch.is_empty() {
            return;
        }
        unsafe { FreeObject::set_next(batch.tail, self.head) };
        self.head = batch.head;
        self.len += batch.len;
    }

    /// Detach up to `n` objects from the front of the list.
    pub fn pop_batch(&mut self, n: usize) -> Batch {
        let batch = unsafe { Batch::take(&mut self.head, n) };
        self.len -= batch.len;
        batch
    }
}

//! Fixed-size object pool for allocator metadata.
//!
//! Spans and thread caches cannot be allocated through the allocator they
//! describe. `ObjectPool<T>` carves equal slots out of large blocks taken
//! straight from the OS page source and recycles released slots through an
//! intrusive free list. Blocks are never returned to the OS.
//!
//! The pool itself has no lock; the global instances live behind a
//! `SpinMutex` in the [`LockDomain::Metadata`](crate::sync::LockDomain) domain.

use crate::config::{PAGE_SIZE, POOL_BLOCK_SIZE};
use crate::error::AllocError;
use crate::free_list::FreeObject;
use crate::platform;
use core::marker::PhantomData;
use core::mem;
use core::ptr::{self, NonNull};

pub struct ObjectPool<T> {
    /// Released slots, linked through their first word.
    free_list: *mut FreeObject,
    /// Next unused byte of the current block.
    bump: *mut u8,
    /// Bytes left in the current block.
    remaining: usize,
    /// Slots currently handed out.
    live: usize,
    _marker: PhantomData<T>,
}

// SAFETY: the pool only hands out slots; ownership of the `T` values moves
// with the returned pointers, so the pool can move between threads when `T` can.
unsafe impl<T: Send> Send for ObjectPool<T> {}

impl<T> Default for ObjectPool<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ObjectPool<T> {
    const SLOT_ALIGN: usize = if mem::align_of::<T>() > mem::align_of::<FreeObject>() {
        mem::align_of::<T>()
    } else {
        mem::align_of::<FreeObject>()
    };

    /// Every slot holds either a `T` or a free-list link.
    const SLOT_SIZE: usize = {
        let raw = if mem::size_of::<T>() > mem::size_of::<FreeObject>() {
            mem::size_of::<T>()
        } else {
            mem::size_of::<FreeObject>()
        };
        (raw + Self::SLOT_ALIGN - 1) & !(Self::SLOT_ALIGN - 1)
    };

    const BLOCK_SIZE: usize = {
        let min = (Self::SLOT_SIZE + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);
        if min > POOL_BLOCK_SIZE { min } else { POOL_BLOCK_SIZE }
    };

    const ALIGN_FITS_PAGE: () = assert!(
        Self::SLOT_ALIGN <= PAGE_SIZE,
        "ObjectPool slots cannot be aligned beyond a page"
    );

    pub const fn new() -> Self {
        Self {
            free_list: ptr::null_mut(),
            bump: ptr::null_mut(),
            remaining: 0,
            live: 0,
            _marker: PhantomData,
        }
    }

    /// Number of slots handed out and not yet released.
    pub fn live(&self) -> usize {
        self.live
    }

    /// Hand out a slot holding `T::default()`.
    pub fn acquire(&mut self) -> Result<NonNull<T>, AllocError>
    where
        T: Default,
    {
        let slot = self.take_slot()?;
        unsafe { slot.as_ptr().write(T::default()) };
        Ok(slot)
    }

    /// Drop the value in place and recycle its slot.
    ///
    /// # Safety
    /// `obj` must have come from `acquire` on this pool and not been released.
    pub unsafe fn release(&mut self, obj: NonNull<T>) {
        unsafe { ptr::drop_in_place(obj.as_ptr()) };
        let slot = obj.as_ptr() as *mut FreeObject;
        unsafe { FreeObject::set_next(slot, self.free_list) };
        self.free_list = slot;
        self.live -= 1;
    }

    fn take_slot(&mut self) -> Result<NonNull<T>, AllocError> {
        #[allow(clippy::let_unit_value)]
        let () = Self::ALIGN_FITS_PAGE;

        if let Some(slot) = NonNull::new(self.free_list) {
            self.free_list = unsafe { FreeObject::next(slot.as_ptr()) };
            self.live += 1;
            return Ok(slot.cast());
        }

        if self.remaining < Self::SLOT_SIZE {
            self.refill()?;
        }

        let slot = self.bump;
        self.bump = unsafe { self.bump.add(Self::SLOT_SIZE) };
        self.remaining -= Self::SLOT_SIZE;
        self.live += 1;
        NonNull::new(slot as *mut T).ok_or(AllocError::MetadataExhausted)
    }

    #[cold]
    fn refill(&mut self) -> Result<(), AllocError> {
        let block = unsafe { platform::page_alloc(Self::BLOCK_SIZE) };
        if block.is_null() {
            return Err(AllocError::MetadataExhausted);
        }
        crate::trace!(
            "[object_pool] new {} byte block for {} byte slots",
            Self::BLOCK_SIZE,
            Self::SLOT_SIZE
        );
        self.bump = block;
        self.remaining = Self::BLOCK_SIZE;
        Ok(())
    }
}

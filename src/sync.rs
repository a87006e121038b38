//! Lightweight synchronization primitives for use in the allocator.
//!
//! We cannot use `std::sync::Mutex` because it may allocate. Instead we provide
//! a test-and-set spinlock and a `SpinMutex<T>` wrapper.
//!
//! Every allocator lock belongs to a [`LockDomain`]. A thread may only acquire
//! a lock whose domain ranks strictly above every domain it already holds.
//! `SizeClass` and `PageHeap` share a rank, so a size-class lock is always
//! released before the page heap lock is taken and vice versa. Debug builds
//! with `std` check this on every acquisition.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, Ordering};

/// A simple test-and-set spinlock.
pub struct SpinLock {
    locked: AtomicBool,
}

impl Default for SpinLock {
    fn default() -> Self {
        Self::new()
    }
}

impl SpinLock {
    pub const fn new() -> Self {
        Self {
            locked: AtomicBool::new(false),
        }
    }

    #[inline]
    pub fn lock(&self) {
        if self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            return;
        }
        self.lock_slow();
    }

    #[cold]
    fn lock_slow(&self) {
        loop {
            // Spin on a plain load so waiters don't bounce the cache line.
            while self.locked.load(Ordering::Relaxed) {
                core::hint::spin_loop();
            }
            if self
                .locked
                .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return;
            }
        }
    }

    #[inline]
    pub fn unlock(&self) {
        self.locked.store(false, Ordering::Release);
    }

    #[inline]
    pub fn try_lock(&self) -> bool {
        self.locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }
}

/// Lock domains of the allocator, ordered by rank.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum LockDomain {
    /// A central cache size-class lock.
    SizeClass,
    /// The page heap lock.
    PageHeap,
    /// An object pool lock for allocator metadata.
    Metadata,
}

impl LockDomain {
    pub const ALL: [LockDomain; 3] = [
        LockDomain::SizeClass,
        LockDomain::PageHeap,
        LockDomain::Metadata,
    ];

    #[inline]
    pub const fn rank(self) -> u8 {
        match self {
            LockDomain::SizeClass | LockDomain::PageHeap => 1,
            LockDomain::Metadata => 2,
        }
    }

    #[inline]
    const fn bit(self) -> u8 {
        1 << (self as u8)
    }

    /// Whether `self` may be acquired while every domain in `held` is held.
    pub fn may_follow(self, held: u8) -> bool {
        Self::ALL
            .iter()
            .filter(|d| held & d.bit() != 0)
            .all(|d| d.rank() < self.rank())
    }
}

cfg_if::cfg_if! {
    if #[cfg(all(debug_assertions, feature = "std"))] {
        mod order {
            use super::LockDomain;
            use core::cell::Cell;

            std::thread_local! {
                static HELD: Cell<u8> = const { Cell::new(0) };
            }

            pub(super) fn acquire(domain: LockDomain) {
                let _ = HELD.try_with(|held| {
                    let h = held.get();
                    if !domain.may_follow(h) {
                        violation(domain, h);
                    }
                    held.set(h | domain.bit());
                });
            }

            /// Must not allocate: this runs inside the allocator.
            #[cold]
            fn violation(domain: LockDomain, held: u8) -> ! {
                crate::stderr::print_line(format_args!(
                    "lock order violation: acquiring {:?} while holding {:#05b}",
                    domain, held
                ));
                if cfg!(test) {
                    panic!("lock order violation");
                } else {
                    std::process::abort()
                }
            }

            pub(super) fn release(domain: LockDomain) {
                let _ = HELD.try_with(|held| held.set(held.get() & !domain.bit()));
            }

            #[cfg(test)]
            pub(super) fn held() -> u8 {
                HELD.try_with(Cell::get).unwrap_or(0)
            }
        }
    } else {
        mod order {
            use super::LockDomain;

            #[inline(always)]
            pub(super) fn acquire(_domain: LockDomain) {}

            #[inline(always)]
            pub(super) fn release(_domain: LockDomain) {}

        }
    }
}

/// Bitmask of the lock domains the calling thread holds.
#[cfg(all(test, debug_assertions, feature = "std"))]
fn held_domains() -> u8 {
    order::held()
}

/// A mutex that uses a spinlock for synchronization.
/// Does not allocate and can be used in a `static`.
pub struct SpinMutex<T> {
    lock: SpinLock,
    domain: Option<LockDomain>,
    data: UnsafeCell<T>,
}

impl<T> SpinMutex<T> {
    /// A mutex outside the allocator's lock hierarchy.
    pub const fn new(val: T) -> Self {
        Self {
            lock: SpinLock::new(),
            domain: None,
            data: UnsafeCell::new(val),
        }
    }

    /// A mutex whose acquisitions are checked against the domain order.
    pub const fn in_domain(domain: LockDomain, val: T) -> Self {
        Self {
            lock: SpinLock::new(),
            domain: Some(domain),
            data: UnsafeCell::new(val),
        }
    }

    #[inline]
    pub fn lock(&self) -> SpinMutexGuard<'_, T> {
        if let Some(domain) = self.domain {
            order::acquire(domain);
        }
        self.lock.lock();
        SpinMutexGuard { mutex: self }
    }

}

unsafe impl<T: Send> Send for SpinMutex<T> {}
unsafe impl<T: Send> Sync for SpinMutex<T> {}

/// RAII guard for `SpinMutex`. Unlocks on drop.
pub struct SpinMutexGuard<'a, T> {
    mutex: &'a SpinMutex<T>,
}

impl<T> Deref for SpinMutexGuard<'_, T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        unsafe { &*self.mutex.data.get() }
    }
}

impl<T> DerefMut for SpinMutexGuard<'_, T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<T> Drop for SpinMutexGuard<'_, T> {
    #[inline]
    fn drop(&mut self) {
        self.mutex.lock.unlock();
        if let Some(domain) = self.mutex.domain {
            order::release(domain);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::vec::Vec;

    #[test]
    fn test_spinlock_try() {
        let lock = SpinLock::new();
        assert!(lock.try_lock());
        assert!(!lock.try_lock());
        lock.unlock();
        assert!(lock.try_lock());
        lock.unlock();
    }

    #[test]
    fn test_spinmutex_concurrent() {
        let mutex = Arc::new(SpinMutex::new(0u64));
        let num_threads = 8;
        let iterations = 10_000;

        let handles: Vec<_> = (0..num_threads)
            .map(|_| {
                let m = Arc::clone(&mutex);
                std::thread::spawn(move || {
                    for _ in 0..iterations {
                        let mut guard = m.lock();
                        *guard += 1;
                    }
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(*mutex.lock(), num_threads * iterations);
    }

    #[test]
    fn test_domain_ranks() {
        let size_class = LockDomain::SizeClass.bit();
        let page_heap = LockDomain::PageHeap.bit();

        assert!(LockDomain::SizeClass.may_follow(0));
        assert!(LockDomain::PageHeap.may_follow(0));
        assert!(LockDomain::Metadata.may_follow(size_class));
        assert!(LockDomain::Metadata.may_follow(page_heap));

        assert!(!LockDomain::PageHeap.may_follow(size_class));
        assert!(!LockDomain::SizeClass.may_follow(page_heap));
        assert!(!LockDomain::SizeClass.may_follow(size_class));
        assert!(!LockDomain::PageHeap.may_follow(LockDomain::Metadata.bit()));
    }

    #[cfg(all(debug_assertions, feature = "std"))]
    #[test]
    fn test_guard_tracks_held_domains() {
        let heap = SpinMutex::in_domain(LockDomain::PageHeap, ());
        let pool = SpinMutex::in_domain(LockDomain::Metadata, ());
        {
            let _h = heap.lock();
            assert_eq!(held_domains(), LockDomain::PageHeap.bit());
            let _p = pool.lock();
            assert_eq!(
                held_domains(),
                LockDomain::PageHeap.bit() | LockDomain::Metadata.bit()
            );
        }
        assert_eq!(held_domains(), 0);
    }

    #[cfg(all(debug_assertions, feature = "std"))]
    #[test]
    #[should_panic(expected = "lock order violation")]
    fn test_page_heap_under_size_class_panics() {
        let class = SpinMutex::in_domain(LockDomain::SizeClass, ());
        let heap = SpinMutex::in_domain(LockDomain::PageHeap, ());
        let _c = class.lock();
        let _h = heap.lock();
    }

    #[cfg(all(debug_assertions, feature = "std"))]
    #[test]
    #[should_panic(expected = "lock order violation")]
    fn test_size_class_under_page_heap_panics() {
        let heap = SpinMutex::in_domain(LockDomain::PageHeap, ());
        let class = SpinMutex::in_domain(LockDomain::SizeClass, ());
        let _h = heap.lock();
        let _c = class.lock();
    }
}

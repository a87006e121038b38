//! A thread's cache is flushed when the thread exits.
//!
//! Kept in its own test binary: nothing else here allocates through the
//! allocator, so page accounting is exact.

use tiermalloc::{allocate, central_cache, deallocate, page_heap, size_class};

#[test]
fn thread_exit_returns_cached_objects() {
    let size = 3000;
    let class = size_class::index(size);

    std::thread::spawn(move || {
        let ptrs: Vec<_> = (0..200).map(|_| allocate(size).unwrap()).collect();
        for ptr in ptrs {
            unsafe { deallocate(ptr) };
        }
    })
    .join()
    .unwrap();

    assert_eq!(central_cache().get(class).lock().span_count(), 0);
    let acct = page_heap().accounting();
    assert!(acct.acquired > 0);
    assert_eq!(acct.in_use, 0);
    assert_eq!(acct.free, acct.acquired);
}

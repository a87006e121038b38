//! Stress tests with fill-pattern corruption detection.
//!
//! Allocate memory, fill it with a known pattern, pass it between threads,
//! and verify the pattern before freeing. Any use-after-free, double free or
//! overlap between live blocks shows up as a pattern mismatch.

use std::alloc::{GlobalAlloc, Layout};
use std::ptr::NonNull;
use std::sync::mpsc;
use tiermalloc::{MAX_CACHED_SIZE, TierMalloc};

#[global_allocator]
static GLOBAL: TierMalloc = TierMalloc;

/// Deterministic byte for offset `i` of a block seeded with `seed`.
fn pattern_byte(seed: usize, i: usize) -> u8 {
    (seed.wrapping_add(i).wrapping_mul(0x9E37_79B9) & 0xFF) as u8
}

fn fill(ptr: *mut u8, size: usize, seed: usize) {
    for i in 0..size {
        unsafe { *ptr.add(i) = pattern_byte(seed, i) };
    }
}

fn intact(ptr: *mut u8, size: usize, seed: usize) -> bool {
    (0..size).all(|i| unsafe { *ptr.add(i) } == pattern_byte(seed, i))
}

/// Seed derived from the block itself, so neighbors never share a pattern.
fn addr_seed(ptr: *mut u8, size: usize) -> usize {
    ptr as usize ^ size
}

#[test]
fn stress_fill_pattern_single_thread() {
    let sizes: &[usize] = &[8, 16, 32, 64, 128, 256, 512, 1024, 4096, 8192, 100_000, 300_000];
    let mut live: Vec<(*mut u8, Layout)> = Vec::new();

    for round in 0..50 {
        for &size in sizes {
            let layout = Layout::from_size_align(size, 8).unwrap();
            let ptr = unsafe { GLOBAL.alloc(layout) };
            assert!(!ptr.is_null(), "alloc failed for size {size}");
            fill(ptr, size, addr_seed(ptr, size));
            live.push((ptr, layout));
        }

        for &(ptr, layout) in &live {
            assert!(
                intact(ptr, layout.size(), addr_seed(ptr, layout.size())),
                "corruption detected at round {round}, size {}",
                layout.size()
            );
        }

        // Free half, interleaved to shuffle free-list order.
        for _ in 0..live.len() / 2 {
            let idx = (round * 7 + 3) % live.len();
            let (ptr, layout) = live.swap_remove(idx);
            assert!(intact(ptr, layout.size(), addr_seed(ptr, layout.size())));
            unsafe { GLOBAL.dealloc(ptr, layout) };
        }
    }

    for (ptr, layout) in live {
        assert!(intact(ptr, layout.size(), addr_seed(ptr, layout.size())));
        unsafe { GLOBAL.dealloc(ptr, layout) };
    }
}

#[test]
fn stress_fill_pattern_cross_thread() {
    let npairs = 4;
    let ops = 200;
    let sizes: &[usize] = &[16, 64, 256, 1024, 20_000];

    let mut producers = Vec::new();
    let mut consumers = Vec::new();

    for pair_id in 0..npairs {
        let (tx, rx) = mpsc::channel::<(usize, Layout)>();

        producers.push(std::thread::spawn(move || {
            for i in 0..ops {
                let size = sizes[(pair_id + i) % sizes.len()];
                let layout = Layout::from_size_align(size, 8).unwrap();
                let ptr = unsafe { GLOBAL.alloc(layout) };
                assert!(!ptr.is_null());
                fill(ptr, size, addr_seed(ptr, size));
                tx.send((ptr as usize, layout)).unwrap();
            }
        }));

        // Objects freed here came from another thread's cache.
        consumers.push(std::thread::spawn(move || {
            let mut count = 0usize;
            for (addr, layout) in rx {
                let ptr = addr as *mut u8;
                assert!(
                    intact(ptr, layout.size(), addr_seed(ptr, layout.size())),
                    "cross-thread corruption at pair {pair_id}, item {count}"
                );
                unsafe { GLOBAL.dealloc(ptr, layout) };
                count += 1;
            }
            count
        }));
    }

    for h in producers {
        h.join().unwrap();
    }
    let total: usize = consumers.into_iter().map(|h| h.join().unwrap()).sum();
    assert_eq!(total, npairs * ops);
}

#[test]
fn stress_realloc_pattern() {
    let initial_size = 64;
    let layout = Layout::from_size_align(initial_size, 8).unwrap();

    for round in 0..100 {
        let seed = round * 31 + 7;
        let ptr = unsafe { GLOBAL.alloc(layout) };
        assert!(!ptr.is_null());
        fill(ptr, initial_size, seed);

        let grown_size = if round % 10 == 0 { MAX_CACHED_SIZE + 1 } else { 256 };
        let grown = unsafe { GLOBAL.realloc(ptr, layout, grown_size) };
        assert!(!grown.is_null());
        assert!(
            intact(grown, initial_size, seed),
            "realloc corrupted original content during grow (round {round})"
        );

        let grown_layout = Layout::from_size_align(grown_size, 8).unwrap();
        let shrunk = unsafe { GLOBAL.realloc(grown, grown_layout, 32) };
        assert!(!shrunk.is_null());
        assert!(
            intact(shrunk, 32, seed),
            "realloc corrupted content during shrink (round {round})"
        );

        unsafe { GLOBAL.dealloc(shrunk, Layout::from_size_align(32, 8).unwrap()) };
    }
}

#[test]
fn stress_many_threads_concurrent() {
    let nthreads = 8;
    let ops_per_thread = 2000;

    let handles: Vec<_> = (0..nthreads)
        .map(|tid| {
            std::thread::spawn(move || {
                let mut live: Vec<(*mut u8, Layout)> = Vec::with_capacity(64);

                for i in 0..ops_per_thread {
                    let size = [8, 32, 64, 128, 512, 2048, 40_000][(tid + i) % 7];
                    let layout = Layout::from_size_align(size, 8).unwrap();
                    let ptr = unsafe { GLOBAL.alloc(layout) };
                    assert!(!ptr.is_null());
                    fill(ptr, size, addr_seed(ptr, size));
                    live.push((ptr, layout));

                    if live.len() > 32 {
                        for _ in 0..16 {
                            let (ptr, layout) = live.pop().unwrap();
                            assert!(
                                intact(ptr, layout.size(), addr_seed(ptr, layout.size())),
                                "thread {tid} corruption at op {i}"
                            );
                            unsafe { GLOBAL.dealloc(ptr, layout) };
                        }
                    }
                }

                for (ptr, layout) in live {
                    assert!(intact(ptr, layout.size(), addr_seed(ptr, layout.size())));
                    unsafe { GLOBAL.dealloc(ptr, layout) };
                }
            })
        })
        .collect();

    for h in handles {
        h.join().unwrap();
    }
}

/// 64 threads, 10,000 alternating allocate/free operations each, over a
/// spread of sizes. Completing at all is the deadlock check.
#[test]
fn stress_64_threads_alternating() {
    let nthreads = 64;
    let ops = 10_000;

    let handles: Vec<_> = (0..nthreads)
        .map(|tid: usize| {
            std::thread::spawn(move || {
                let mut held: Option<(NonNull<u8>, usize)> = None;
                for i in 0..ops {
                    match held.take() {
                        None => {
                            let size = (16 + tid * 131 + i * 17) % 8192 + 1;
                            let ptr = tiermalloc::allocate(size).unwrap();
                            fill(ptr.as_ptr(), size, tid ^ i);
                            held = Some((ptr, size));
                        }
                        Some((ptr, size)) => {
                            assert!(intact(ptr.as_ptr(), size, tid ^ (i - 1)));
                            unsafe { tiermalloc::deallocate(ptr) };
                        }
                    }
                }
                if let Some((ptr, _)) = held {
                    unsafe { tiermalloc::deallocate(ptr) };
                }
            })
        })
        .collect();

    for h in handles {
        h.join().unwrap();
    }
}

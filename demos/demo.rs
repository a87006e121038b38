use std::collections::HashMap;
use std::time::Instant;
use tiermalloc::TierMalloc;

#[global_allocator]
static GLOBAL: TierMalloc = TierMalloc;

fn main() {
    println!("tiermalloc demo");
    println!("===============\n");

    let boxed = Box::new(42u64);
    println!("Box<u64>:    value = {boxed}");

    let mut v: Vec<i32> = (0..1000).collect();
    v.sort_unstable_by(|a, b| b.cmp(a));
    println!("Vec<i32>:    len = {}, sorted[0] = {}", v.len(), v[0]);

    let map: HashMap<_, _> = (0..500).map(|i| (i, format!("val_{i}"))).collect();
    println!("HashMap:     len = {}", map.len());

    // Above the largest size class: served straight from the page heap.
    let big = vec![0u8; 1024 * 1024];
    println!(
        "Large alloc: {} bytes, all zero = {}",
        big.len(),
        big.iter().all(|&b| b == 0)
    );

    let acct = tiermalloc::page_heap().accounting();
    println!(
        "Page heap:   acquired = {}, in use = {}, free = {}",
        acct.acquired, acct.in_use, acct.free
    );

    println!("\nMulti-threaded workload (8 threads, 100k allocs each):");
    let start = Instant::now();
    let handles: Vec<_> = (0..8)
        .map(|_| {
            std::thread::spawn(|| {
                let mut vecs: Vec<Vec<u64>> = Vec::new();
                for i in 0u64..100_000 {
                    vecs.push(vec![i; (i % 64) as usize + 1]);
                    if vecs.len() > 100 {
                        vecs.drain(..50);
                    }
                }
                vecs.len()
            })
        })
        .collect();

    let total: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
    println!("  completed in {:?} ({total} live vecs remaining)", start.elapsed());
}

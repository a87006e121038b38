#![no_std]

//! tiermalloc: a three-tier memory allocator for Rust.
//!
//! Allocation flows through three tiers:
//! - Thread-local caches (fast path, no locks), with the `std` feature
//! - A central cache of per-size-class span lists (one lock per class)
//! - A page heap of page runs (one lock), backed by the OS
//!
//! Freed objects are attributed to their span by address, so no header is
//! stored in front of any allocation.
//!
//! # Usage
//!
//! ```ignore
//! #[global_allocator]
//! static GLOBAL: tiermalloc::TierMalloc = tiermalloc::TierMalloc;
//! ```
//!
//! or call [`allocate`] and [`deallocate`] directly.

#[cfg(any(test, feature = "std"))]
extern crate std;

#[macro_use]
mod macros;

pub mod allocator;
pub mod central_cache;
pub mod config;
pub mod error;
#[cfg(feature = "ffi")]
pub mod ffi;
pub mod free_list;
pub mod object_pool;
pub mod page_heap;
pub mod pagemap;
pub mod platform;
pub mod size_class;
pub mod span;
pub mod stderr;
pub mod sync;
pub mod thread_cache;

pub use allocator::{TierMalloc, allocate, central_cache, deallocate, page_heap, usable_size};
pub use config::{MAX_CACHED_SIZE, PAGE_SHIFT, PAGE_SIZE};
pub use error::AllocError;
pub use object_pool::ObjectPool;

// Panic handler for staticlib builds (no_std has no default panic handler).
// Only active when panic="abort" (i.e., the `fast` profile), not during normal checks.
#[cfg(all(feature = "ffi", not(test), not(feature = "std"), panic = "abort"))]
#[panic_handler]
fn panic(_: &core::panic::PanicInfo) -> ! {
    unsafe extern "C" {
        fn abort() -> !;
    }
    unsafe { abort() }
}

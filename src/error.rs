//! Failure results surfaced by the allocation entry points.
//!
//! A miss in one tier is never an error; only exhaustion at the bottom of the
//! pipeline (or a request that cannot be represented) reaches the caller.

use thiserror::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum AllocError {
    /// The OS page source (or the heap's page limit) could not supply a run.
    #[error("out of memory: could not obtain {pages} pages")]
    OutOfMemory { pages: usize },
    /// An object pool could not obtain a block for allocator metadata.
    #[error("out of memory for allocator metadata")]
    MetadataExhausted,
    /// The request cannot be rounded up to whole pages without overflowing.
    #[error("allocation of {size} bytes is too large")]
    TooLarge { size: usize },
}

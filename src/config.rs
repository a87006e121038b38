//! Compile-time configuration generated by `build.rs` from `tiermalloc.toml`.

/// One alignment bracket of the size-class map: sizes in
/// `(previous limit, limit]` round up to a multiple of `align`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AlignBracket {
    pub limit: usize,
    pub align: usize,
}

include!(concat!(env!("OUT_DIR"), "/config_gen.rs"));

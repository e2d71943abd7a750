//! PocketLLM Library
//!
//! On-device LLM inference sessions on top of llama.cpp: resource probing,
//! GPU-offload fallback loading, incremental decoding and generation.

pub mod inference;
pub mod storage;
pub mod system;

/// Largest char boundary of `s` at or below `index`. Never panics.
pub fn floor_char_boundary(s: &str, index: usize) -> usize {
    if index >= s.len() {
        return s.len();
    }
    // Walk backwards from index to find a valid char boundary
    let mut end = index;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    end
}

//! Memory pools and index structures.
//!
//! Two pool disciplines back the hot-path data structures:
//! - [`BumpArena`]: monotone chunked allocation, freed only wholesale via
//!   `reset`; the trading day is the natural lifetime.
//! - [`SlotPool`]: chunked storage with a free bitmap, supporting O(1)
//!   individual reclamation by slot handle.
//!
//! On top of them sit [`PoolHashMap`], a chained hash map whose nodes come
//! from a bump arena and which never rehashes after construction, and
//! [`PriceBitmap`], a 65536-bit bitmap with word-at-a-time scans used for
//! the visible-price index.
//!
//! Chunks are sized so that `chunk_len * size_of::<T>()` is about 1 MiB,
//! keeping the working set inside L2.

pub mod bitmap_pool;
pub mod bump;
pub mod fast_bitmap;
pub mod hash_map;

pub use bitmap_pool::SlotPool;
pub use bump::BumpArena;
pub use fast_bitmap::PriceBitmap;
pub use hash_map::PoolHashMap;

/// Pick a power-of-two chunk length targeting ~1 MiB per chunk.
pub(crate) const fn chunk_shift(elem_size: usize) -> u32 {
    // 16B x 2^16 = 1 MiB, 32B x 2^15 = 1 MiB, ... floor at 2^12 objects.
    if elem_size <= 16 {
        16
    } else if elem_size <= 32 {
        15
    } else if elem_size <= 64 {
        14
    } else if elem_size <= 128 {
        13
    } else {
        12
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_shift_targets_one_mib() {
        assert_eq!(chunk_shift(8), 16);
        assert_eq!(chunk_shift(16), 16);
        assert_eq!(chunk_shift(24), 15);
        assert_eq!(chunk_shift(64), 14);
        assert_eq!(chunk_shift(100), 13);
        assert_eq!(chunk_shift(512), 12);
        // 16 bytes * 2^16 slots = 1 MiB
        assert_eq!(16usize << chunk_shift(16), 1024 * 1024);
    }
}

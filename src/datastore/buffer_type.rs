//! Buffer type (size class) management for the buffer pool

use super::entry_ref::EntryRef;
use std::cmp::Reverse;
use std::collections::BinaryHeap;

/// A buffer type describes how buffers of one size class are laid out and grown
///
/// `array_size` is the number of `u32` words per array. A type with
/// `array_size == 1` stores variable-length entries; larger array sizes
/// store fixed-size entries and recycle freed arrays through a free list.
///
/// The free list is a min-heap so arrays are reused lowest reference first
/// (better cache locality).
#[derive(Debug)]
pub struct BufferType {
    /// Words per array
    pub array_size: u32,
    /// Arrays allocated when a buffer is first activated
    pub min_arrays: u32,
    /// Upper bound on arrays per buffer
    pub max_arrays: u32,
    /// Geometric growth factor applied when the primary buffer is full
    pub grow_factor: f64,
    /// Buffer currently receiving allocations for this type
    pub(crate) primary_buffer: Option<u32>,
    /// Buffers in active state for this type
    pub(crate) active_buffers: u32,
    free_list: BinaryHeap<Reverse<EntryRef>>,
}

impl BufferType {
    /// Create a new buffer type
    pub fn new(array_size: u32, min_arrays: u32, max_arrays: u32) -> Self {
        assert!(array_size > 0, "array size must be positive");
        Self {
            array_size,
            min_arrays: min_arrays.max(2),
            max_arrays: max_arrays.max(min_arrays.max(2)),
            grow_factor: 2.0,
            primary_buffer: None,
            active_buffers: 0,
            free_list: BinaryHeap::new(),
        }
    }

    /// Override the growth factor (must be > 1.0)
    pub fn with_grow_factor(mut self, grow_factor: f64) -> Self {
        self.grow_factor = grow_factor.max(1.1);
        self
    }

    /// Whether this type stores fixed-size arrays
    pub fn is_fixed_size(&self) -> bool {
        self.array_size > 1
    }

    /// Capacity in words for a buffer of this type, clamped to `limit_words`
    pub fn max_words(&self, limit_words: u64) -> u64 {
        let words = self.max_arrays as u64 * self.array_size as u64;
        // Round the layout limit down to a whole number of arrays
        let limit = limit_words - limit_words % self.array_size as u64;
        words.min(limit)
    }

    /// Capacity in words for a freshly activated buffer that must fit `needed` words
    pub fn initial_words(&self, needed: u64, limit_words: u64) -> u64 {
        let words = self.min_arrays as u64 * self.array_size as u64;
        words.max(needed).min(self.max_words(limit_words))
    }

    /// Next capacity in words when growing from `current` to fit `needed` words
    ///
    /// Returns `None` when the buffer cannot grow enough.
    pub fn grown_words(&self, current: u64, needed: u64, limit_words: u64) -> Option<u64> {
        let max = self.max_words(limit_words);
        if needed > max {
            return None;
        }
        let grown = (current as f64 * self.grow_factor).ceil() as u64;
        let arrays = grown.max(needed).div_ceil(self.array_size as u64);
        Some((arrays * self.array_size as u64).min(max))
    }

    /// Take a freed array for reuse, if any
    pub(crate) fn pop_free(&mut self) -> Option<EntryRef> {
        self.free_list.pop().map(|Reverse(r)| r)
    }

    /// Return a reclaimed array to the free list
    pub(crate) fn push_free(&mut self, entry_ref: EntryRef) {
        self.free_list.push(Reverse(entry_ref));
    }

    /// Drop free-list entries that belong to a buffer being retired
    pub(crate) fn retain_free(&mut self, mut keep: impl FnMut(EntryRef) -> bool) {
        self.free_list.retain(|Reverse(r)| keep(*r));
    }

    /// Get the number of free arrays
    pub fn free_count(&self) -> usize {
        self.free_list.len()
    }

    /// Get the number of active buffers
    pub fn active_buffers(&self) -> u32 {
        self.active_buffers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_type_reuse_order() {
        let mut bt = BufferType::new(4, 16, 1024);
        bt.push_free(EntryRef::new(40));
        bt.push_free(EntryRef::new(8));
        bt.push_free(EntryRef::new(24));
        assert_eq!(bt.free_count(), 3);

        // Lowest reference first
        assert_eq!(bt.pop_free(), Some(EntryRef::new(8)));
        assert_eq!(bt.pop_free(), Some(EntryRef::new(24)));
        assert_eq!(bt.pop_free(), Some(EntryRef::new(40)));
        assert_eq!(bt.pop_free(), None);
    }

    #[test]
    fn test_initial_and_grown_words() {
        let bt = BufferType::new(1, 1024, 1 << 18);
        assert_eq!(bt.initial_words(10, 1 << 18), 1024);
        assert_eq!(bt.initial_words(5000, 1 << 18), 5000);

        // Doubles, but never past the layout limit
        assert_eq!(bt.grown_words(1024, 1025, 1 << 18), Some(2048));
        assert_eq!(bt.grown_words(200_000, 200_001, 1 << 18), Some(1 << 18));
        assert_eq!(bt.grown_words(1 << 18, (1 << 18) + 1, 1 << 18), None);
    }

    #[test]
    fn test_fixed_size_rounding() {
        let bt = BufferType::new(3, 4, 100).with_grow_factor(1.5);
        assert!(bt.is_fixed_size());
        // 100 arrays * 3 words, but the layout only has room for 64 words
        assert_eq!(bt.max_words(64), 63);
        assert_eq!(bt.grown_words(12, 15, 64), Some(18));
    }

    #[test]
    fn test_retain_free() {
        let mut bt = BufferType::new(2, 4, 64);
        for raw in [2, 4, 130, 132] {
            bt.push_free(EntryRef::new(raw));
        }
        bt.retain_free(|r| r.raw() < 128);
        assert_eq!(bt.free_count(), 2);
    }
}

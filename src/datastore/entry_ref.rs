//! Compact entry references for the buffer pool

use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque handle to an entry stored in a [`DataStore`](super::DataStore).
///
/// The raw value packs a buffer id and an offset according to a
/// [`RefLayout`]. Raw value `0` is the null reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct EntryRef(u32);

impl EntryRef {
    /// Wrap a raw reference value
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// The null reference
    pub const fn invalid() -> Self {
        Self(0)
    }

    /// Raw packed value
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Whether this reference points at anything
    pub const fn valid(self) -> bool {
        self.0 != 0
    }
}

impl fmt::Display for EntryRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EntryRef({:#010x})", self.0)
    }
}

/// Bit layout of an [`EntryRef`]: low bits are the offset, high bits the buffer id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefLayout {
    offset_bits: u32,
    buffer_bits: u32,
}

impl RefLayout {
    /// Create a layout. Panics if the widths do not fit in 32 bits.
    pub const fn new(offset_bits: u32, buffer_bits: u32) -> Self {
        assert!(offset_bits > 0 && buffer_bits > 0);
        assert!(offset_bits + buffer_bits <= 32);
        Self {
            offset_bits,
            buffer_bits,
        }
    }

    pub const fn offset_bits(&self) -> u32 {
        self.offset_bits
    }

    pub const fn buffer_bits(&self) -> u32 {
        self.buffer_bits
    }

    /// Number of addressable elements per buffer
    pub const fn offset_size(&self) -> u64 {
        1u64 << self.offset_bits
    }

    /// Number of buffers addressable by this layout
    pub const fn num_buffers(&self) -> u32 {
        1u32 << self.buffer_bits
    }

    /// Mask covering every bit a reference of this layout may use
    pub const fn ref_mask(&self) -> u32 {
        if self.offset_bits + self.buffer_bits == 32 {
            u32::MAX
        } else {
            (1u32 << (self.offset_bits + self.buffer_bits)) - 1
        }
    }

    /// Pack a buffer id and offset
    pub fn make(&self, buffer_id: u32, offset: u64) -> EntryRef {
        debug_assert!(buffer_id < self.num_buffers());
        debug_assert!(offset < self.offset_size());
        EntryRef((buffer_id << self.offset_bits) | offset as u32)
    }

    pub fn buffer_id(&self, entry_ref: EntryRef) -> u32 {
        (entry_ref.raw() & self.ref_mask()) >> self.offset_bits
    }

    pub fn offset(&self, entry_ref: EntryRef) -> u64 {
        (entry_ref.raw() & ((1u32 << self.offset_bits) - 1)) as u64
    }
}

impl Default for RefLayout {
    fn default() -> Self {
        Self::new(22, 10)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_ref_null() {
        assert!(!EntryRef::invalid().valid());
        assert!(!EntryRef::default().valid());
        assert!(EntryRef::new(1).valid());
    }

    #[test]
    fn test_layout_roundtrip() {
        let layout = RefLayout::new(18, 6);
        assert_eq!(layout.offset_size(), 1 << 18);
        assert_eq!(layout.num_buffers(), 64);
        assert_eq!(layout.ref_mask(), 0x00ff_ffff);

        let r = layout.make(5, 1024);
        assert_eq!(layout.buffer_id(r), 5);
        assert_eq!(layout.offset(r), 1024);

        let last = layout.make(63, (1 << 18) - 1);
        assert_eq!(last.raw(), 0x00ff_ffff);
    }

    #[test]
    fn test_full_width_layout() {
        let layout = RefLayout::new(22, 10);
        assert_eq!(layout.ref_mask(), u32::MAX);
        let r = layout.make(1023, 7);
        assert_eq!(layout.buffer_id(r), 1023);
        assert_eq!(layout.offset(r), 7);
    }

    #[test]
    fn test_extra_high_bits_ignored() {
        let layout = RefLayout::new(18, 6);
        let r = EntryRef::new(0xab00_0000 | layout.make(3, 9).raw());
        assert_eq!(layout.buffer_id(r), 3);
        assert_eq!(layout.offset(r), 9);
    }
}

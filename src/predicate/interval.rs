//! Interval entry types
//!
//! An interval packs `begin` in the high 16 bits and `end` in the low 16
//! bits of one word. Bounds entries carry an extra word of range bounds.

use crate::datastore::EntryView;
use serde::{Deserialize, Serialize};
use std::fmt;

/// An entry stored as a fixed number of `u32` words
pub trait IntervalEntry: Copy + fmt::Debug + PartialEq {
    /// Words per entry
    const WORDS: usize;

    /// Append this entry's words to `out`
    fn push_words(&self, out: &mut Vec<u32>);

    /// Read the entry starting at word `offset` of `words`
    fn load(words: &EntryView<'_>, offset: usize) -> Self;

    /// Rebuild an entry whose single word was inlined into a reference
    fn from_inline(value: u32) -> Self;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Interval {
    pub interval: u32,
}

impl Interval {
    pub fn new(begin: u16, end: u16) -> Self {
        Self {
            interval: (begin as u32) << 16 | end as u32,
        }
    }

    pub fn begin(&self) -> u16 {
        (self.interval >> 16) as u16
    }

    pub fn end(&self) -> u16 {
        self.interval as u16
    }
}

impl Default for Interval {
    fn default() -> Self {
        Self::new(1, 1)
    }
}

impl IntervalEntry for Interval {
    const WORDS: usize = 1;

    fn push_words(&self, out: &mut Vec<u32>) {
        out.push(self.interval);
    }

    fn load(words: &EntryView<'_>, offset: usize) -> Self {
        Self {
            interval: words.get(offset),
        }
    }

    fn from_inline(value: u32) -> Self {
        Self { interval: value }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IntervalWithBounds {
    pub interval: u32,
    pub bounds: u32,
}

impl IntervalWithBounds {
    pub fn new(interval: u32, bounds: u32) -> Self {
        Self { interval, bounds }
    }
}

impl Default for IntervalWithBounds {
    fn default() -> Self {
        Self {
            interval: Interval::default().interval,
            bounds: 0x8000_0000,
        }
    }
}

impl IntervalEntry for IntervalWithBounds {
    const WORDS: usize = 2;

    fn push_words(&self, out: &mut Vec<u32>) {
        out.push(self.interval);
        out.push(self.bounds);
    }

    fn load(words: &EntryView<'_>, offset: usize) -> Self {
        Self {
            interval: words.get(offset),
            bounds: words.get(offset + 1),
        }
    }

    fn from_inline(value: u32) -> Self {
        Self {
            interval: value,
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interval_packing() {
        let interval = Interval::new(3, 0x1234);
        assert_eq!(interval.interval, 0x0003_1234);
        assert_eq!(interval.begin(), 3);
        assert_eq!(interval.end(), 0x1234);
        assert_eq!(Interval::default().interval, 0x0001_0001);
    }

    #[test]
    fn test_push_words() {
        let mut words = Vec::new();
        Interval::new(1, 2).push_words(&mut words);
        IntervalWithBounds::new(7, 9).push_words(&mut words);
        assert_eq!(words, vec![0x0001_0002, 7, 9]);
    }
}

//! Content-addressed reference cache
//!
//! Maps the words of a stored entry to its tagged reference so identical
//! payloads share storage. A tagged reference carries the payload size in
//! words in its top 8 bits:
//!
//! ```text
//! [ size code: 8 | data ref: 24 ]
//!   0       inlined single value, data ref bits are the value
//!   1..254  payload length in words
//!   255     payload length stored in the first word
//! ```

use crate::datastore::{DataStore, EntryRef, EntryView};
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::Hasher;

pub const SIZE_BITS: u32 = 8;
pub const SIZE_SHIFT: u32 = 32 - SIZE_BITS;
pub const DATA_REF_MASK: u32 = (1 << SIZE_SHIFT) - 1;
pub const MAX_SIZE: u32 = (1 << SIZE_BITS) - 1;

pub fn size_code(entry_ref: EntryRef) -> u32 {
    entry_ref.raw() >> SIZE_SHIFT
}

pub fn data_ref(entry_ref: EntryRef) -> EntryRef {
    EntryRef::new(entry_ref.raw() & DATA_REF_MASK)
}

/// Tag a data reference with the size of its payload
pub fn tag(data_ref: EntryRef, payload_words: usize) -> EntryRef {
    debug_assert_eq!(data_ref.raw() & !DATA_REF_MASK, 0);
    let code = (payload_words as u32).min(MAX_SIZE);
    EntryRef::new(code << SIZE_SHIFT | data_ref.raw())
}

/// Words allocated for a payload, length prefix included
pub fn allocated_words(payload_words: usize) -> usize {
    if payload_words >= MAX_SIZE as usize {
        payload_words + 1
    } else {
        payload_words
    }
}

/// Resolve a stored (non-inlined) tagged reference to its payload words
pub fn stored_words<'a>(
    entry_ref: EntryRef,
    fetch: impl Fn(EntryRef, usize) -> EntryView<'a>,
) -> EntryView<'a> {
    let data = data_ref(entry_ref);
    match size_code(entry_ref) {
        MAX_SIZE => {
            let len = fetch(data, 1).get(0) as usize;
            fetch(data, len + 1).skip(1)
        }
        code => fetch(data, code as usize),
    }
}

fn content_hash(words: impl IntoIterator<Item = u32>) -> u64 {
    let mut hasher = DefaultHasher::new();
    let mut len = 0u32;
    for word in words {
        hasher.write_u32(word);
        len += 1;
    }
    hasher.write_u32(len);
    hasher.finish()
}

#[derive(Debug)]
struct CachedEntry {
    entry_ref: EntryRef,
    ref_count: u32,
}

/// Outcome of releasing one reference
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Release {
    /// Not a cached reference
    Unknown,
    /// Still referenced this many times
    Shared(u32),
    /// Last reference gone; the entry was dropped from the cache
    Last,
}

/// Dedup table over a buffer pool
#[derive(Debug, Default)]
pub struct RefCache {
    buckets: HashMap<u64, Vec<CachedEntry>>,
    hashes: HashMap<EntryRef, u64>,
}

impl RefCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a payload and take a reference to it
    pub fn find(&mut self, words: &[u32], store: &DataStore) -> Option<EntryRef> {
        let bucket = self.buckets.get_mut(&content_hash(words.iter().copied()))?;
        let entry = bucket.iter_mut().find(|e| {
            stored_words(e.entry_ref, |r, n| store.get(r, n)).eq_words(words)
        })?;
        entry.ref_count += 1;
        Some(entry.entry_ref)
    }

    /// Record a freshly stored payload with one reference
    pub fn insert(&mut self, words: &[u32], entry_ref: EntryRef) {
        let hash = content_hash(words.iter().copied());
        self.buckets.entry(hash).or_default().push(CachedEntry {
            entry_ref,
            ref_count: 1,
        });
        self.hashes.insert(entry_ref, hash);
    }

    /// Drop one reference to `entry_ref`
    ///
    /// Unknown references are reported without touching storage.
    pub fn release(&mut self, entry_ref: EntryRef) -> Release {
        let Some(&hash) = self.hashes.get(&entry_ref) else {
            return Release::Unknown;
        };
        let Some(bucket) = self.buckets.get_mut(&hash) else {
            return Release::Unknown;
        };
        let Some(pos) = bucket.iter().position(|e| e.entry_ref == entry_ref) else {
            return Release::Unknown;
        };
        bucket[pos].ref_count -= 1;
        if bucket[pos].ref_count > 0 {
            return Release::Shared(bucket[pos].ref_count);
        }
        bucket.swap_remove(pos);
        if bucket.is_empty() {
            self.buckets.remove(&hash);
        }
        self.hashes.remove(&entry_ref);
        Release::Last
    }

    /// References held on `entry_ref` (0 if unknown)
    pub fn ref_count(&self, entry_ref: EntryRef) -> u32 {
        self.hashes
            .get(&entry_ref)
            .and_then(|hash| self.buckets.get(hash))
            .and_then(|bucket| bucket.iter().find(|e| e.entry_ref == entry_ref))
            .map_or(0, |e| e.ref_count)
    }

    /// Distinct payloads cached
    pub fn len(&self) -> usize {
        self.hashes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hashes.is_empty()
    }
}

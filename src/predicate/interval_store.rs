//! Interval store
//!
//! Stores arrays of interval entries in a buffer pool, sharing storage
//! between identical arrays and inlining single small intervals directly
//! into the returned reference.

use super::interval::IntervalEntry;
use super::ref_cache::{self, RefCache, Release, DATA_REF_MASK};
use crate::datastore::{
    BufferType, DataStore, DataStoreReader, EntryRef, EntryView, Generation, GenerationGuard,
    GenerationHandler, MemoryUsage, RefLayout,
};
use crate::error::Result;
use tracing::{debug, warn};

/// Reference layout of the data part of a tagged reference
pub const DATA_LAYOUT: RefLayout = RefLayout::new(18, 6);

/// Distinct entries above which a capacity warning is logged
pub const DEFAULT_CARDINALITY_WARNING: usize = 1 << 20;

/// Entries of one stored interval array
#[derive(Debug, Clone, Copy)]
pub struct Intervals<'a, T> {
    repr: Repr<'a, T>,
}

#[derive(Debug, Clone, Copy)]
enum Repr<'a, T> {
    Empty,
    Inline(T),
    Stored(EntryView<'a>),
}

impl<'a, T: IntervalEntry> Intervals<'a, T> {
    fn decode(entry_ref: EntryRef, fetch: impl Fn(EntryRef, usize) -> EntryView<'a>) -> Self {
        let repr = if !entry_ref.valid() {
            Repr::Empty
        } else if ref_cache::size_code(entry_ref) == 0 {
            Repr::Inline(T::from_inline(entry_ref.raw()))
        } else {
            Repr::Stored(ref_cache::stored_words(entry_ref, fetch))
        };
        Self { repr }
    }

    pub fn len(&self) -> usize {
        match &self.repr {
            Repr::Empty => 0,
            Repr::Inline(_) => 1,
            Repr::Stored(words) => words.len() / T::WORDS,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Entry at `index` (panics when out of range)
    pub fn get(&self, index: usize) -> T {
        match &self.repr {
            Repr::Inline(entry) if index == 0 => *entry,
            Repr::Stored(words) => T::load(words, index * T::WORDS),
            _ => panic!("interval index {} out of range (len {})", index, self.len()),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = T> + '_ {
        (0..self.len()).map(move |i| self.get(i))
    }

    pub fn to_vec(&self) -> Vec<T> {
        self.iter().collect()
    }
}

/// Interval array store (single writer)
pub struct PredicateIntervalStore {
    store: DataStore,
    type_id: u32,
    ref_cache: RefCache,
    cardinality_warning: usize,
    warned: bool,
}

impl PredicateIntervalStore {
    pub fn new(generations: &GenerationHandler) -> Self {
        let mut store = DataStore::new(DATA_LAYOUT, generations);
        let type_id = store.add_type(BufferType::new(
            1,
            1024,
            DATA_LAYOUT.offset_size() as u32,
        ));
        Self {
            store,
            type_id,
            ref_cache: RefCache::new(),
            cardinality_warning: DEFAULT_CARDINALITY_WARNING,
            warned: false,
        }
    }

    /// Log a warning once the number of distinct arrays exceeds `threshold`
    pub fn with_cardinality_warning(mut self, threshold: usize) -> Self {
        self.cardinality_warning = threshold;
        self
    }

    /// Store an interval array and return its reference
    ///
    /// An empty array yields the null reference.
    pub fn insert<T: IntervalEntry>(&mut self, intervals: &[T]) -> Result<EntryRef> {
        let mut words = Vec::with_capacity(intervals.len() * T::WORDS);
        for interval in intervals {
            interval.push_words(&mut words);
        }
        if words.is_empty() {
            return Ok(EntryRef::invalid());
        }
        if let [value] = words[..] {
            if value != 0 && value <= DATA_REF_MASK {
                return Ok(EntryRef::new(value));
            }
        }
        if let Some(entry_ref) = self.ref_cache.find(&words, &self.store) {
            debug!(%entry_ref, "Reusing cached interval array");
            return Ok(entry_ref);
        }

        let allocated = ref_cache::allocated_words(words.len());
        let (data_ref, mut entry) = self.store.allocate(self.type_id, allocated)?;
        if allocated > words.len() {
            entry.set(0, words.len() as u32);
            for (i, &word) in words.iter().enumerate() {
                entry.set(i + 1, word);
            }
        } else {
            entry.copy_from_slice(&words);
        }
        let entry_ref = ref_cache::tag(data_ref, words.len());
        self.ref_cache.insert(&words, entry_ref);

        if self.ref_cache.len() > self.cardinality_warning && !self.warned {
            self.warned = true;
            warn!(
                distinct = self.ref_cache.len(),
                threshold = self.cardinality_warning,
                "Interval store cardinality exceeds threshold"
            );
        }
        Ok(entry_ref)
    }

    /// Drop one reference; storage is held once the last one is gone
    ///
    /// The entry stays readable by guards taken before the next generation.
    pub fn remove(&mut self, entry_ref: EntryRef) {
        if !entry_ref.valid() || ref_cache::size_code(entry_ref) == 0 {
            return;
        }
        match self.ref_cache.release(entry_ref) {
            Release::Last => {
                let payload = ref_cache::stored_words(entry_ref, |r, n| self.store.get(r, n)).len();
                self.store.hold_elem(
                    ref_cache::data_ref(entry_ref),
                    ref_cache::allocated_words(payload),
                );
                debug!(%entry_ref, "Released interval array");
            }
            Release::Shared(_) => {}
            Release::Unknown => warn!(%entry_ref, "Removing unknown interval reference"),
        }
    }

    /// Writer-side read
    pub fn get<T: IntervalEntry>(&self, entry_ref: EntryRef) -> Intervals<'_, T> {
        Intervals::decode(entry_ref, |r, n| self.store.get(r, n))
    }

    /// References held on a stored array (0 for inlined or unknown refs)
    pub fn ref_count(&self, entry_ref: EntryRef) -> u32 {
        if !entry_ref.valid() || ref_cache::size_code(entry_ref) == 0 {
            return 0;
        }
        self.ref_cache.ref_count(entry_ref)
    }

    /// Distinct stored arrays
    pub fn len(&self) -> usize {
        self.ref_cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ref_cache.is_empty()
    }

    pub fn transfer_hold_lists(&mut self, generation: Generation) {
        self.store.transfer_hold_lists(generation);
    }

    pub fn trim_hold_lists(&mut self, used_generation: Generation) -> usize {
        self.store.trim_hold_lists(used_generation)
    }

    /// Memory of the underlying buffer pool
    pub fn memory_usage(&self) -> MemoryUsage {
        self.store.memory_usage()
    }

    pub fn reader(&self) -> IntervalStoreReader {
        IntervalStoreReader {
            store: self.store.reader(),
        }
    }
}

impl std::fmt::Debug for PredicateIntervalStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PredicateIntervalStore")
            .field("distinct", &self.ref_cache.len())
            .field("memory", &self.store.memory_usage())
            .finish()
    }
}

/// Lock-free reader for a [`PredicateIntervalStore`]
#[derive(Debug, Clone)]
pub struct IntervalStoreReader {
    store: DataStoreReader,
}

impl IntervalStoreReader {
    pub fn get<'g, T: IntervalEntry>(
        &'g self,
        guard: &'g GenerationGuard<'_>,
        entry_ref: EntryRef,
    ) -> Intervals<'g, T> {
        Intervals::decode(entry_ref, |r, n| self.store.get(guard, r, n))
    }
}

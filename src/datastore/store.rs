//! Buffer pool implementation
//!
//! Owns up to `2^buffer_bits` buffers of `u32` words. Callers hold
//! [`EntryRef`] handles, never addresses. Memory that readers might still be
//! looking at (freed entries, pre-growth copies of a buffer, retired buffers)
//! goes through a generation hold list before it is reused or dropped.

use super::buffer_state::{BufferAlloc, BufferState, BufferStatus};
use super::buffer_type::BufferType;
use super::entry_ref::{EntryRef, RefLayout};
use super::generation::{Generation, GenerationGuard, GenerationHandler, GenerationReader};
use super::hold_list::GenerationHoldList;
use super::memory_usage::MemoryUsage;
use crate::error::{Error, Result};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicPtr, AtomicU32, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

const WORD_BYTES: usize = std::mem::size_of::<u32>();

/// Buffer table shared between the writer and its readers
struct BufferTable {
    buffers: Box<[AtomicPtr<BufferAlloc>]>,
    /// Allocations still on hold when the writer went away
    orphans: Mutex<Vec<Box<BufferAlloc>>>,
}

impl BufferTable {
    fn new(num_buffers: u32) -> Self {
        Self {
            buffers: (0..num_buffers)
                .map(|_| AtomicPtr::new(std::ptr::null_mut()))
                .collect(),
            orphans: Mutex::new(Vec::new()),
        }
    }

    /// Words of a buffer's current allocation (empty if the buffer is free)
    fn words(&self, buffer_id: u32) -> &[AtomicU32] {
        let ptr = match self.buffers.get(buffer_id as usize) {
            Some(slot) => slot.load(Ordering::SeqCst),
            None => return &[],
        };
        if ptr.is_null() {
            return &[];
        }
        // SAFETY: a non-null slot always holds a pointer produced by
        // `Box::into_raw` in `publish`. When an allocation is replaced or
        // retired, its box is moved to the writer's hold list and dropped only
        // after every generation that could have loaded it has been released
        // (or parked in `orphans`, which lives as long as `self`). Writers
        // borrow `&self` here, which excludes a concurrent trim.
        unsafe { (*ptr).words() }
    }

    /// Install `alloc` for `buffer_id`, returning the allocation it replaced
    fn publish(&self, buffer_id: u32, alloc: Box<BufferAlloc>) -> Option<Box<BufferAlloc>> {
        let new = Box::into_raw(alloc);
        let old = self.buffers[buffer_id as usize].swap(new, Ordering::SeqCst);
        // SAFETY: `old` is either null or was produced by `Box::into_raw` and
        // has just been unlinked, so ownership returns to us exactly once.
        (!old.is_null()).then(|| unsafe { Box::from_raw(old) })
    }

    /// Unlink a buffer's allocation
    fn retire(&self, buffer_id: u32) -> Option<Box<BufferAlloc>> {
        let old = self.buffers[buffer_id as usize].swap(std::ptr::null_mut(), Ordering::SeqCst);
        // SAFETY: as in `publish`.
        (!old.is_null()).then(|| unsafe { Box::from_raw(old) })
    }
}

impl Drop for BufferTable {
    fn drop(&mut self) {
        for slot in self.buffers.iter() {
            let ptr = slot.swap(std::ptr::null_mut(), Ordering::SeqCst);
            if !ptr.is_null() {
                // SAFETY: produced by `Box::into_raw`; no handle remains.
                drop(unsafe { Box::from_raw(ptr) });
            }
        }
    }
}

/// Read-only view of an entry's words
#[derive(Debug, Clone, Copy)]
pub struct EntryView<'a> {
    words: &'a [AtomicU32],
}

impl<'a> EntryView<'a> {
    pub fn len(&self) -> usize {
        self.words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    /// Word at `index` (panics when out of range)
    pub fn get(&self, index: usize) -> u32 {
        self.words[index].load(Ordering::Relaxed)
    }

    pub fn iter(&self) -> impl Iterator<Item = u32> + 'a {
        self.words.iter().map(|w| w.load(Ordering::Relaxed))
    }

    pub fn to_vec(&self) -> Vec<u32> {
        self.iter().collect()
    }

    /// Sub-view starting at `start`
    pub fn skip(&self, start: usize) -> EntryView<'a> {
        EntryView {
            words: &self.words[start..],
        }
    }

    pub fn eq_words(&self, other: &[u32]) -> bool {
        self.len() == other.len() && self.iter().zip(other).all(|(a, &b)| a == b)
    }
}

/// Writable view of a freshly allocated entry
#[derive(Debug)]
pub struct EntryMut<'a> {
    words: &'a [AtomicU32],
}

impl EntryMut<'_> {
    pub fn len(&self) -> usize {
        self.words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    pub fn set(&mut self, index: usize, value: u32) {
        self.words[index].store(value, Ordering::Relaxed);
    }

    /// Copy `src` into the entry; lengths must match
    pub fn copy_from_slice(&mut self, src: &[u32]) {
        assert_eq!(src.len(), self.words.len(), "entry length mismatch");
        for (dst, &value) in self.words.iter().zip(src) {
            dst.store(value, Ordering::Relaxed);
        }
    }
}

enum HoldItem {
    /// A freed entry
    Elem { entry_ref: EntryRef, words: u64 },
    /// A superseded allocation left behind by buffer growth
    Alloc(Box<BufferAlloc>),
    /// A buffer whose entries are all dead
    Buffer(u32),
}

/// Per-buffer statistics
#[derive(Debug, Clone, Copy)]
pub struct BufferStats {
    pub buffer_id: u32,
    pub type_id: u32,
    pub status: BufferStatus,
    pub capacity_words: u64,
    pub used_words: u64,
    pub dead_words: u64,
    pub hold_words: u64,
}

/// Generation-reclaimed buffer pool (writer handle)
///
/// There is exactly one writer per pool: every mutation takes `&mut self`.
/// Readers use [`DataStoreReader`] together with a guard from the same
/// generation handler.
pub struct DataStore {
    layout: RefLayout,
    table: Arc<BufferTable>,
    generations: GenerationReader,
    types: Vec<BufferType>,
    states: Vec<BufferState>,
    hold_list: GenerationHoldList<HoldItem>,
    /// Bytes of superseded allocations on hold
    hold_alloc_bytes: usize,
}

impl DataStore {
    /// Create a buffer pool whose reclamation is gated by `generations`
    pub fn new(layout: RefLayout, generations: &GenerationHandler) -> Self {
        let num_buffers = layout.num_buffers();
        info!(
            offset_bits = layout.offset_bits(),
            buffer_bits = layout.buffer_bits(),
            "Initializing buffer pool with {} buffers",
            num_buffers
        );
        Self {
            layout,
            table: Arc::new(BufferTable::new(num_buffers)),
            generations: generations.reader(),
            types: Vec::new(),
            states: (0..num_buffers).map(|_| BufferState::new()).collect(),
            hold_list: GenerationHoldList::new(),
            hold_alloc_bytes: 0,
        }
    }

    pub fn layout(&self) -> RefLayout {
        self.layout
    }

    /// Register a buffer type, returning its type id
    pub fn add_type(&mut self, buffer_type: BufferType) -> u32 {
        self.types.push(buffer_type);
        (self.types.len() - 1) as u32
    }

    pub fn buffer_type(&self, type_id: u32) -> Option<&BufferType> {
        self.types.get(type_id as usize)
    }

    /// Handle for reader threads
    pub fn reader(&self) -> DataStoreReader {
        DataStoreReader {
            layout: self.layout,
            table: Arc::clone(&self.table),
            generations: self.generations.clone(),
        }
    }

    /// Allocate `words` words for an entry of `type_id`
    ///
    /// Returns the reference and a writable view of the (zeroed or recycled)
    /// words. The reference must not be handed to readers before the entry
    /// has been filled in.
    pub fn allocate(&mut self, type_id: u32, words: usize) -> Result<(EntryRef, EntryMut<'_>)> {
        let words = words as u64;
        let (array_size, fixed) = {
            let bt = self.types.get(type_id as usize).ok_or_else(|| {
                Error::InvalidArgument(format!("Unknown buffer type id: {}", type_id))
            })?;
            (bt.array_size as u64, bt.is_fixed_size())
        };
        if words == 0 {
            return Err(Error::InvalidArgument("Cannot allocate an empty entry".to_string()));
        }
        if fixed && words != array_size {
            return Err(Error::InvalidArgument(format!(
                "Type {} stores arrays of {} words, not {}",
                type_id, array_size, words
            )));
        }

        let entry_ref = match self.pop_free(type_id) {
            Some(entry_ref) => entry_ref,
            None => self.bump_allocate(type_id, words)?,
        };

        let buffer_id = self.layout.buffer_id(entry_ref);
        let offset = self.layout.offset(entry_ref) as usize;
        let slice = &self.table.words(buffer_id)[offset..offset + words as usize];
        debug!(type_id, words, %entry_ref, "Allocated entry");
        Ok((entry_ref, EntryMut { words: slice }))
    }

    /// Allocate and fill an entry in one step
    pub fn insert(&mut self, type_id: u32, data: &[u32]) -> Result<EntryRef> {
        let (entry_ref, mut entry) = self.allocate(type_id, data.len())?;
        entry.copy_from_slice(data);
        Ok(entry_ref)
    }

    fn pop_free(&mut self, type_id: u32) -> Option<EntryRef> {
        let entry_ref = self.types[type_id as usize].pop_free()?;
        let words = self.types[type_id as usize].array_size as u64;
        let state = &mut self.states[self.layout.buffer_id(entry_ref) as usize];
        state.dead -= words;
        // Recycled words still hold the previous entry
        Some(entry_ref)
    }

    fn bump_allocate(&mut self, type_id: u32, words: u64) -> Result<EntryRef> {
        let primary = self.types[type_id as usize].primary_buffer;
        let buffer_id = match primary {
            Some(id) if self.states[id as usize].remaining() >= words => id,
            Some(id) => match self.try_grow(id, words)? {
                true => id,
                false => self.switch_primary(type_id, words)?,
            },
            None => self.switch_primary(type_id, words)?,
        };
        let state = &mut self.states[buffer_id as usize];
        let offset = state.used;
        state.used += words;
        Ok(self.layout.make(buffer_id, offset))
    }

    /// Grow `buffer_id` in place so it fits `words` more words
    fn try_grow(&mut self, buffer_id: u32, words: u64) -> Result<bool> {
        let limit = self.layout.offset_size();
        let (type_id, used, current_capacity) = {
            let state = &self.states[buffer_id as usize];
            (state.type_id, state.used, state.capacity)
        };
        let Some(capacity) =
            self.types[type_id as usize].grown_words(current_capacity, used + words, limit)
        else {
            return Ok(false);
        };
        if capacity <= current_capacity {
            return Ok(false);
        }

        let current = self.table.buffers[buffer_id as usize].load(Ordering::SeqCst);
        if current.is_null() {
            return Err(Error::Internal(format!(
                "Active buffer {} has no allocation",
                buffer_id
            )));
        }
        // SAFETY: the writer owns the only path that replaces or frees this
        // allocation, and holds `&mut self`.
        let grown = unsafe { &*current }.grow(capacity as usize, used as usize)?;
        if let Some(old) = self.table.publish(buffer_id, Box::new(grown)) {
            self.hold_alloc_bytes += old.size_bytes();
            self.hold_list.hold(HoldItem::Alloc(old));
        }
        self.states[buffer_id as usize].capacity = capacity;
        debug!(buffer_id, from = current_capacity, to = capacity, "Grew buffer");
        Ok(true)
    }

    /// Activate a free buffer as the new primary buffer for `type_id`
    fn switch_primary(&mut self, type_id: u32, words: u64) -> Result<u32> {
        let limit = self.layout.offset_size();
        let bt = &self.types[type_id as usize];
        let reserved = bt.array_size as u64;
        if reserved + words > bt.max_words(limit) {
            return Err(Error::AllocationFailed(format!(
                "Entry of {} words exceeds buffer capacity {} for type {}",
                words,
                bt.max_words(limit) - reserved,
                type_id
            )));
        }
        let capacity = bt.initial_words(reserved + words, limit);

        let buffer_id = self
            .states
            .iter()
            .position(|s| s.status == BufferStatus::Free)
            .ok_or_else(|| {
                Error::AllocationFailed(format!(
                    "All {} buffers are in use",
                    self.layout.num_buffers()
                ))
            })? as u32;

        let alloc = BufferAlloc::new(capacity as usize)?;
        if self.table.publish(buffer_id, Box::new(alloc)).is_some() {
            return Err(Error::Internal(format!(
                "Free buffer {} still had an allocation",
                buffer_id
            )));
        }
        self.states[buffer_id as usize].activate(type_id, capacity, reserved);

        let bt = &mut self.types[type_id as usize];
        let previous = bt.primary_buffer.replace(buffer_id);
        bt.active_buffers += 1;
        debug!(type_id, buffer_id, capacity, ?previous, "Switched primary buffer");

        // A full former primary whose entries already died can be retired now
        if let Some(previous) = previous {
            self.maybe_hold_buffer(previous);
        }
        Ok(buffer_id)
    }

    /// Writer-side read; no guard needed since only the writer reclaims
    pub fn get(&self, entry_ref: EntryRef, words: usize) -> EntryView<'_> {
        let buffer_id = self.layout.buffer_id(entry_ref);
        let offset = self.layout.offset(entry_ref) as usize;
        EntryView {
            words: &self.table.words(buffer_id)[offset..offset + words],
        }
    }

    /// Free an entry; it stays readable until its generation is trimmed
    pub fn hold_elem(&mut self, entry_ref: EntryRef, words: usize) {
        if !entry_ref.valid() {
            return;
        }
        let buffer_id = self.layout.buffer_id(entry_ref);
        let state = &mut self.states[buffer_id as usize];
        debug_assert_eq!(state.status, BufferStatus::Active);
        state.hold += words as u64;
        self.hold_list.hold(HoldItem::Elem {
            entry_ref,
            words: words as u64,
        });
    }

    /// Tag everything held since the last transfer with `generation`
    ///
    /// The tag never goes below the handler's current generation.
    pub fn transfer_hold_lists(&mut self, generation: Generation) {
        let generation = generation.max(self.generations.current_generation());
        self.hold_list.transfer(generation);
    }

    /// Reclaim everything held in generations older than `used_generation`
    ///
    /// `used_generation` is clamped to the floor published by the generation
    /// handler, so a too-high value cannot reclaim memory a guard still pins.
    pub fn trim_hold_lists(&mut self, used_generation: Generation) -> usize {
        let used_generation = used_generation.min(self.generations.reclaim_limit());
        let mut reclaimed = Vec::new();
        self.hold_list.trim(used_generation, |item| reclaimed.push(item));
        let count = reclaimed.len();
        for item in reclaimed {
            self.reclaim(item);
        }
        if count > 0 {
            debug!(used_generation, count, "Trimmed hold lists");
        }
        count
    }

    fn reclaim(&mut self, item: HoldItem) {
        match item {
            HoldItem::Elem { entry_ref, words } => {
                let buffer_id = self.layout.buffer_id(entry_ref);
                let state = &mut self.states[buffer_id as usize];
                state.hold -= words;
                state.dead += words;
                let type_id = state.type_id;
                if self.types[type_id as usize].is_fixed_size() {
                    self.types[type_id as usize].push_free(entry_ref);
                }
                self.maybe_hold_buffer(buffer_id);
            }
            HoldItem::Alloc(alloc) => {
                self.hold_alloc_bytes -= alloc.size_bytes();
                drop(alloc);
            }
            HoldItem::Buffer(buffer_id) => {
                let state = &mut self.states[buffer_id as usize];
                debug_assert_eq!(state.status, BufferStatus::Hold);
                state.reset();
                drop(self.table.retire(buffer_id));
                debug!(buffer_id, "Buffer freed");
            }
        }
    }

    /// Retire a non-primary buffer once every entry in it is dead
    fn maybe_hold_buffer(&mut self, buffer_id: u32) {
        let state = &self.states[buffer_id as usize];
        if !state.is_all_dead() {
            return;
        }
        let type_id = state.type_id;
        if self.types[type_id as usize].primary_buffer == Some(buffer_id) {
            return;
        }
        let layout = self.layout;
        let bt = &mut self.types[type_id as usize];
        bt.retain_free(|r| layout.buffer_id(r) != buffer_id);
        bt.active_buffers -= 1;
        self.states[buffer_id as usize].status = BufferStatus::Hold;
        self.hold_list.hold(HoldItem::Buffer(buffer_id));
        debug!(buffer_id, type_id, "Holding dead buffer");
    }

    /// Memory usage across all buffers
    pub fn memory_usage(&self) -> MemoryUsage {
        let mut usage = MemoryUsage::default();
        for state in self.states.iter().filter(|s| s.status != BufferStatus::Free) {
            usage.inc_allocated_bytes(state.capacity as usize * WORD_BYTES);
            usage.inc_used_bytes(state.used as usize * WORD_BYTES);
            usage.inc_dead_bytes(state.dead as usize * WORD_BYTES);
            usage.inc_allocated_bytes_on_hold(state.hold as usize * WORD_BYTES);
        }
        // Superseded copies count as used and on hold until trimmed
        usage.inc_allocated_bytes(self.hold_alloc_bytes);
        usage.inc_used_bytes(self.hold_alloc_bytes);
        usage.inc_allocated_bytes_on_hold(self.hold_alloc_bytes);
        usage
    }

    /// Bytes held by live entries
    pub fn memory_used(&self) -> usize {
        self.memory_usage().live_bytes()
    }

    /// Bytes of bookkeeping around the entries
    pub fn memory_meta(&self) -> usize {
        let free_lists: usize = self.types.iter().map(|t| t.free_count()).sum();
        std::mem::size_of::<Self>()
            + self.states.len() * std::mem::size_of::<BufferState>()
            + self.table.buffers.len() * std::mem::size_of::<AtomicPtr<BufferAlloc>>()
            + self.types.len() * std::mem::size_of::<BufferType>()
            + free_lists * std::mem::size_of::<EntryRef>()
            + (self.hold_list.pending_len() + self.hold_list.held_len())
                * std::mem::size_of::<HoldItem>()
    }

    pub fn buffer_state(&self, buffer_id: u32) -> Option<&BufferState> {
        self.states.get(buffer_id as usize)
    }

    /// Statistics for every non-free buffer
    pub fn buffer_stats(&self) -> Vec<BufferStats> {
        self.states
            .iter()
            .enumerate()
            .filter(|(_, s)| s.status != BufferStatus::Free)
            .map(|(id, s)| BufferStats {
                buffer_id: id as u32,
                type_id: s.type_id,
                status: s.status,
                capacity_words: s.capacity,
                used_words: s.used,
                dead_words: s.dead,
                hold_words: s.hold,
            })
            .collect()
    }

    /// Items waiting on the hold list (pending and transferred)
    pub fn hold_list_len(&self) -> usize {
        self.hold_list.pending_len() + self.hold_list.held_len()
    }
}

impl Drop for DataStore {
    fn drop(&mut self) {
        // Readers may outlive the writer; keep superseded allocations alive with them
        let mut orphans = Vec::new();
        for item in self.hold_list.drain_all() {
            if let HoldItem::Alloc(alloc) = item {
                orphans.push(alloc);
            }
        }
        if !orphans.is_empty() {
            warn!(count = orphans.len(), "Buffer pool dropped with allocations on hold");
            self.table.orphans.lock().extend(orphans);
        }
    }
}

impl std::fmt::Debug for DataStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataStore")
            .field("layout", &self.layout)
            .field("types", &self.types.len())
            .field("memory", &self.memory_usage())
            .finish()
    }
}

/// Reader handle for a [`DataStore`]; clone freely across threads
#[derive(Clone)]
pub struct DataStoreReader {
    layout: RefLayout,
    table: Arc<BufferTable>,
    generations: GenerationReader,
}

impl DataStoreReader {
    /// Read an entry of `words` words under `guard`
    ///
    /// The view borrows the guard, so it cannot outlive the pinned generation.
    /// Panics if the guard comes from a different generation handler.
    pub fn get<'g>(
        &'g self,
        guard: &'g GenerationGuard<'_>,
        entry_ref: EntryRef,
        words: usize,
    ) -> EntryView<'g> {
        assert!(
            self.generations.owns(guard),
            "guard belongs to a different generation handler"
        );
        let buffer_id = self.layout.buffer_id(entry_ref);
        let offset = self.layout.offset(entry_ref) as usize;
        EntryView {
            words: &self.table.words(buffer_id)[offset..offset + words],
        }
    }

    pub fn layout(&self) -> RefLayout {
        self.layout
    }

    /// Generation handle matching this store
    pub fn generations(&self) -> &GenerationReader {
        &self.generations
    }
}

impl std::fmt::Debug for DataStoreReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataStoreReader")
            .field("layout", &self.layout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn commit(store: &mut DataStore, handler: &mut GenerationHandler) -> usize {
        store.transfer_hold_lists(handler.current_generation());
        handler.inc_generation();
        store.trim_hold_lists(handler.oldest_used_generation())
    }

    fn small_store(handler: &GenerationHandler) -> (DataStore, u32, u32) {
        let mut store = DataStore::new(RefLayout::new(10, 4), handler);
        let var = store.add_type(BufferType::new(1, 16, 1 << 10));
        let fixed = store.add_type(BufferType::new(4, 4, 64));
        (store, var, fixed)
    }

    #[test]
    fn test_allocate_and_read() -> Result<()> {
        let handler = GenerationHandler::new();
        let (mut store, var, _) = small_store(&handler);

        let r1 = store.insert(var, &[1, 2, 3])?;
        let r2 = store.insert(var, &[4, 5])?;
        assert!(r1.valid());
        assert_ne!(r1, r2);

        assert_eq!(store.get(r1, 3).to_vec(), vec![1, 2, 3]);
        assert_eq!(store.get(r2, 2).to_vec(), vec![4, 5]);

        let reader = store.reader();
        let generations = handler.reader();
        let guard = generations.take_guard();
        assert_eq!(reader.get(&guard, r1, 3).to_vec(), vec![1, 2, 3]);
        Ok(())
    }

    #[test]
    fn test_first_offset_is_reserved() -> Result<()> {
        let handler = GenerationHandler::new();
        let (mut store, var, _) = small_store(&handler);
        let r = store.insert(var, &[42])?;
        assert_eq!(store.layout().buffer_id(r), 0);
        assert_eq!(store.layout().offset(r), 1);
        Ok(())
    }

    #[test]
    fn test_invalid_arguments() {
        let handler = GenerationHandler::new();
        let (mut store, var, fixed) = small_store(&handler);
        assert!(matches!(store.allocate(99, 1), Err(Error::InvalidArgument(_))));
        assert!(matches!(store.allocate(var, 0), Err(Error::InvalidArgument(_))));
        assert!(matches!(store.allocate(fixed, 3), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn test_growth_keeps_old_allocation_on_hold() -> Result<()> {
        let mut handler = GenerationHandler::new();
        let (mut store, var, _) = small_store(&handler);

        let first = store.insert(var, &[7; 10])?;
        let before = store.buffer_state(0).map(|s| s.capacity);
        assert_eq!(before, Some(16));

        // Forces growth of buffer 0
        let second = store.insert(var, &[8; 10])?;
        assert_eq!(store.buffer_state(0).map(|s| s.capacity), Some(32));
        assert_eq!(store.hold_list_len(), 1);
        assert!(store.memory_usage().allocated_bytes_on_hold >= 16 * 4);

        // Old and new data both readable after growth
        assert_eq!(store.get(first, 10).to_vec(), vec![7; 10]);
        assert_eq!(store.get(second, 10).to_vec(), vec![8; 10]);

        assert_eq!(commit(&mut store, &mut handler), 1);
        assert_eq!(store.hold_list_len(), 0);
        assert_eq!(store.memory_usage().allocated_bytes_on_hold, 0);
        Ok(())
    }

    #[test]
    fn test_guard_blocks_reclaim() -> Result<()> {
        let mut handler = GenerationHandler::new();
        let (mut store, _, fixed) = small_store(&handler);
        let generations = handler.reader();

        let r = store.insert(fixed, &[1, 2, 3, 4])?;
        let guard = generations.take_guard();
        store.hold_elem(r, 4);
        assert_eq!(commit(&mut store, &mut handler), 0);

        // Reader still sees the entry and the array is not reused
        let reader = store.reader();
        assert_eq!(reader.get(&guard, r, 4).to_vec(), vec![1, 2, 3, 4]);
        let other = store.insert(fixed, &[5, 6, 7, 8])?;
        assert_ne!(other, r);

        drop(guard);
        handler.update_oldest_used_generation();
        assert_eq!(store.trim_hold_lists(handler.oldest_used_generation()), 1);

        // Reclaimed array is reused
        let reused = store.insert(fixed, &[9, 9, 9, 9])?;
        assert_eq!(reused, r);
        Ok(())
    }

    #[test]
    fn test_trim_is_idempotent() -> Result<()> {
        let mut handler = GenerationHandler::new();
        let (mut store, var, _) = small_store(&handler);
        let r = store.insert(var, &[1, 2])?;
        store.hold_elem(r, 2);
        assert_eq!(commit(&mut store, &mut handler), 1);
        let oldest = handler.oldest_used_generation();
        assert_eq!(store.trim_hold_lists(oldest), 0);
        assert_eq!(store.trim_hold_lists(oldest), 0);
        Ok(())
    }

    #[test]
    fn test_trim_clamped_to_handler_floor() -> Result<()> {
        let mut handler = GenerationHandler::new();
        let (mut store, var, _) = small_store(&handler);
        let generations = handler.reader();
        let _guard = generations.take_guard();

        let r = store.insert(var, &[3])?;
        store.hold_elem(r, 1);
        store.transfer_hold_lists(handler.current_generation());
        handler.inc_generation();

        // Asking for more than the handler allows reclaims nothing
        assert_eq!(store.trim_hold_lists(u64::MAX), 0);
        Ok(())
    }

    #[test]
    fn test_memory_accounting() -> Result<()> {
        let mut handler = GenerationHandler::new();
        let (mut store, var, _) = small_store(&handler);
        let r1 = store.insert(var, &[1, 2, 3, 4])?;
        let _r2 = store.insert(var, &[5, 6])?;
        assert_eq!(store.memory_used(), 6 * 4);

        store.hold_elem(r1, 4);
        let usage = store.memory_usage();
        assert_eq!(usage.allocated_bytes_on_hold, 16);
        assert_eq!(store.memory_used(), 2 * 4);

        commit(&mut store, &mut handler);
        let usage = store.memory_usage();
        assert_eq!(usage.allocated_bytes_on_hold, 0);
        // reserved word + freed entry
        assert_eq!(usage.dead_bytes, 5 * 4);
        assert_eq!(store.memory_used(), 2 * 4);
        assert!(store.memory_meta() > 0);
        Ok(())
    }

    #[test]
    fn test_switch_primary_and_retire_dead_buffer() -> Result<()> {
        let mut handler = GenerationHandler::new();
        // 4 offset bits: 16 words per buffer, 15 usable
        let mut store = DataStore::new(RefLayout::new(4, 2), &handler);
        let var = store.add_type(BufferType::new(1, 16, 16));

        let a = store.insert(var, &[1; 10])?;
        let b = store.insert(var, &[2; 10])?;
        assert_eq!(store.layout().buffer_id(a), 0);
        assert_eq!(store.layout().buffer_id(b), 1);
        assert_eq!(store.buffer_type(var).map(|t| t.active_buffers()), Some(2));

        store.hold_elem(a, 10);
        commit(&mut store, &mut handler);
        // Buffer 0 is fully dead and no longer primary → held
        assert_eq!(store.buffer_state(0).map(|s| s.status), Some(BufferStatus::Hold));

        commit(&mut store, &mut handler);
        assert_eq!(store.buffer_state(0).map(|s| s.status), Some(BufferStatus::Free));
        assert_eq!(store.buffer_type(var).map(|t| t.active_buffers()), Some(1));

        // Freed buffer id is reused
        let c = store.insert(var, &[3; 10])?;
        assert_eq!(store.layout().buffer_id(c), 0);
        assert_eq!(store.get(b, 10).to_vec(), vec![2; 10]);
        Ok(())
    }

    #[test]
    fn test_allocation_failure() -> Result<()> {
        let handler = GenerationHandler::new();
        let mut store = DataStore::new(RefLayout::new(4, 1), &handler);
        let var = store.add_type(BufferType::new(1, 16, 16));

        assert!(matches!(store.allocate(var, 16), Err(Error::AllocationFailed(_))));

        store.insert(var, &[1; 15])?;
        store.insert(var, &[2; 15])?;
        // Both buffers full, nothing left to switch to
        assert!(matches!(store.insert(var, &[3; 15]), Err(Error::AllocationFailed(_))));
        // Committed state is untouched
        assert_eq!(store.memory_used(), 30 * 4);
        Ok(())
    }

    #[test]
    #[should_panic(expected = "different generation handler")]
    fn test_foreign_guard_rejected() {
        let handler = GenerationHandler::new();
        let other = GenerationHandler::new();
        let (mut store, var, _) = small_store(&handler);
        let r = store.insert(var, &[1]).unwrap();
        let reader = store.reader();
        let foreign = other.take_guard();
        let _ = reader.get(&foreign, r, 1);
    }

    #[test]
    fn test_readers_survive_writer_drop() -> Result<()> {
        let handler = GenerationHandler::new();
        let (mut store, var, _) = small_store(&handler);
        let r = store.insert(var, &[11; 12])?;
        store.insert(var, &[12; 12])?;
        let reader = store.reader();
        drop(store);

        let guard = handler.take_guard();
        assert_eq!(reader.get(&guard, r, 12).to_vec(), vec![11; 12]);
        Ok(())
    }
}

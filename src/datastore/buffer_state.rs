//! Per-buffer state and backing allocations

use crate::error::{Error, Result};
use std::sync::atomic::{AtomicU32, Ordering};

/// Lifecycle of a buffer
///
/// ```text
/// Free ──allocate──→ Active ──all entries dead──→ Hold ──trim──→ Free
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferStatus {
    /// No memory, id available
    Free,
    /// Holds live entries (and possibly accepts allocations)
    Active,
    /// Retired; memory kept until no reader can observe it
    Hold,
}

/// Backing words of one buffer
///
/// Words are atomics so the writer can fill fresh entries while readers
/// access other entries of the same allocation.
#[derive(Debug)]
pub struct BufferAlloc {
    words: Box<[AtomicU32]>,
}

impl BufferAlloc {
    /// Allocate `capacity` zeroed words
    pub fn new(capacity: usize) -> Result<Self> {
        let mut words = Vec::new();
        words.try_reserve_exact(capacity).map_err(|e| {
            Error::AllocationFailed(format!("Failed to allocate {} words: {}", capacity, e))
        })?;
        words.extend((0..capacity).map(|_| AtomicU32::new(0)));
        Ok(Self {
            words: words.into_boxed_slice(),
        })
    }

    /// Allocate `capacity` words and copy the first `used` words from `self`
    pub fn grow(&self, capacity: usize, used: usize) -> Result<Self> {
        let grown = Self::new(capacity)?;
        for (dst, src) in grown.words[..used].iter().zip(&self.words[..used]) {
            dst.store(src.load(Ordering::Relaxed), Ordering::Relaxed);
        }
        Ok(grown)
    }

    pub fn words(&self) -> &[AtomicU32] {
        &self.words
    }

    pub fn capacity(&self) -> usize {
        self.words.len()
    }

    pub fn size_bytes(&self) -> usize {
        self.words.len() * std::mem::size_of::<u32>()
    }
}

/// Writer-side bookkeeping for one buffer. All counts are in words.
#[derive(Debug, Clone)]
pub struct BufferState {
    pub status: BufferStatus,
    pub type_id: u32,
    pub capacity: u64,
    pub used: u64,
    pub dead: u64,
    pub hold: u64,
    /// Words reserved at the start of the buffer (never handed out)
    pub reserved: u64,
}

impl BufferState {
    pub fn new() -> Self {
        Self {
            status: BufferStatus::Free,
            type_id: 0,
            capacity: 0,
            used: 0,
            dead: 0,
            hold: 0,
            reserved: 0,
        }
    }

    /// Activate for `type_id` with `capacity` words, reserving the first array
    pub fn activate(&mut self, type_id: u32, capacity: u64, reserved: u64) {
        debug_assert_eq!(self.status, BufferStatus::Free);
        self.status = BufferStatus::Active;
        self.type_id = type_id;
        self.capacity = capacity;
        self.used = reserved;
        self.dead = reserved;
        self.hold = 0;
        self.reserved = reserved;
    }

    /// Words that can still be handed out without growing
    pub fn remaining(&self) -> u64 {
        self.capacity - self.used
    }

    /// Words held by live entries
    pub fn live(&self) -> u64 {
        self.used - self.dead - self.hold
    }

    /// Every handed-out word has been freed and reclaimed
    pub fn is_all_dead(&self) -> bool {
        self.status == BufferStatus::Active && self.dead == self.used && self.hold == 0
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }
}

impl Default for BufferState {
    fn default() -> Self {
        Self::new()
    }
}

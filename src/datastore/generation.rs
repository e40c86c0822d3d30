//! Generation handler
//!
//! Readers pin the current generation with a [`GenerationGuard`] before
//! touching buffer pool memory. The writer advances the generation at commit
//! points and may only reclaim memory held in generations older than
//! [`GenerationHandler::oldest_used_generation`].
//!
//! # Architecture
//!
//! ```text
//! active holds (writer-owned queue)          shared.last
//!   [gen 3: 2 guards] → [gen 4: 0, invalid] → [gen 5: 1 guard]
//!        ^ oldest used = 3                         ^ new guards land here
//! ```
//!
//! Each generation has a hold record with an atomic guard count. Taking a
//! guard is a CAS on the current record; superseded records are marked
//! invalid so late readers retry on the newer one. Records are recycled,
//! never freed, while any handle is alive.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicPtr, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::trace;

/// Reclamation epoch
pub type Generation = u64;

/// Guard count moves in steps of two; bit 0 marks a superseded record
const INVALID: u32 = 1;
const ONE_GUARD: u32 = 2;

struct GenerationHold {
    generation: AtomicU64,
    ref_count: AtomicU32,
}

impl GenerationHold {
    fn new(generation: Generation) -> Self {
        Self {
            generation: AtomicU64::new(generation),
            ref_count: AtomicU32::new(0),
        }
    }

    fn try_acquire(&self) -> bool {
        let mut current = self.ref_count.load(Ordering::SeqCst);
        loop {
            if current & INVALID != 0 {
                return false;
            }
            match self.ref_count.compare_exchange_weak(
                current,
                current + ONE_GUARD,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    fn release(&self) {
        self.ref_count.fetch_sub(ONE_GUARD, Ordering::SeqCst);
    }

    fn invalidate(&self) {
        self.ref_count.fetch_or(INVALID, Ordering::SeqCst);
    }

    /// Superseded and unguarded: can never be acquired again
    fn is_unused(&self) -> bool {
        self.ref_count.load(Ordering::SeqCst) == INVALID
    }

    fn guards(&self) -> u32 {
        self.ref_count.load(Ordering::SeqCst) / ONE_GUARD
    }
}

struct Shared {
    generation: AtomicU64,
    /// Floor published by the writer; never above any live guard's generation
    oldest_used: AtomicU64,
    last: AtomicPtr<GenerationHold>,
    /// Every hold record ever allocated, freed with the last handle
    holds: Mutex<Vec<NonNull<GenerationHold>>>,
}

// SAFETY: the raw pointers in `holds` and `last` refer to heap records that
// only contain atomics and live until `Shared` is dropped.
unsafe impl Send for Shared {}
unsafe impl Sync for Shared {}

impl Shared {
    fn alloc_hold(&self, generation: Generation) -> NonNull<GenerationHold> {
        let hold = NonNull::from(Box::leak(Box::new(GenerationHold::new(generation))));
        self.holds.lock().push(hold);
        hold
    }

    fn take_guard(&self) -> GenerationGuard<'_> {
        loop {
            let last = self.last.load(Ordering::SeqCst);
            // SAFETY: `last` is set to a live record in `GenerationHandler::new`
            // and only ever replaced by other records from `holds`, which are
            // not freed before `self` is dropped. The returned borrow is tied
            // to `&self`.
            let hold = unsafe { &*last };
            if hold.try_acquire() {
                return GenerationGuard { shared: self, hold };
            }
            std::hint::spin_loop();
        }
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        for hold in self.holds.get_mut().drain(..) {
            // SAFETY: each record came from `Box::leak` in `alloc_hold` and is
            // freed exactly once here. Guards borrow a handle that keeps this
            // `Shared` alive, so none can be outstanding.
            drop(unsafe { Box::from_raw(hold.as_ptr()) });
        }
    }
}

/// Scoped pin on a generation
///
/// Not `Clone`; borrows the handler or reader it came from and releases the
/// pin when dropped, on every exit path.
pub struct GenerationGuard<'a> {
    shared: &'a Shared,
    hold: &'a GenerationHold,
}

impl GenerationGuard<'_> {
    /// Generation pinned by this guard
    pub fn generation(&self) -> Generation {
        self.hold.generation.load(Ordering::SeqCst)
    }
}

impl Drop for GenerationGuard<'_> {
    fn drop(&mut self) {
        self.hold.release();
    }
}

impl std::fmt::Debug for GenerationGuard<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GenerationGuard")
            .field("generation", &self.generation())
            .finish()
    }
}

/// Reader-side handle; cheap to clone and share across threads
#[derive(Clone)]
pub struct GenerationReader {
    shared: Arc<Shared>,
}

impl GenerationReader {
    /// Pin the current generation
    pub fn take_guard(&self) -> GenerationGuard<'_> {
        self.shared.take_guard()
    }

    pub fn current_generation(&self) -> Generation {
        self.shared.generation.load(Ordering::SeqCst)
    }

    /// Whether `guard` was taken from this handler
    pub fn owns(&self, guard: &GenerationGuard<'_>) -> bool {
        std::ptr::eq(Arc::as_ptr(&self.shared), guard.shared)
    }

    /// Highest generation that is safe to reclaim below
    pub fn reclaim_limit(&self) -> Generation {
        self.shared.oldest_used.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for GenerationReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GenerationReader")
            .field("current", &self.current_generation())
            .finish()
    }
}

/// Writer-side generation handler
pub struct GenerationHandler {
    shared: Arc<Shared>,
    /// Hold records from oldest (front) to current (back)
    active: VecDeque<NonNull<GenerationHold>>,
    /// Superseded, unguarded records ready for reuse
    free: Vec<NonNull<GenerationHold>>,
}

// SAFETY: the pointers refer to records owned by `shared`; only the writer
// mutates the queues, through `&mut self`.
unsafe impl Send for GenerationHandler {}

impl GenerationHandler {
    pub fn new() -> Self {
        let shared = Arc::new(Shared {
            generation: AtomicU64::new(0),
            oldest_used: AtomicU64::new(0),
            last: AtomicPtr::new(std::ptr::null_mut()),
            holds: Mutex::new(Vec::new()),
        });
        let first = shared.alloc_hold(0);
        shared.last.store(first.as_ptr(), Ordering::SeqCst);
        let mut active = VecDeque::new();
        active.push_back(first);
        Self {
            shared,
            active,
            free: Vec::new(),
        }
    }

    fn hold(&self, hold: NonNull<GenerationHold>) -> &GenerationHold {
        // SAFETY: every pointer in `active`/`free` comes from `shared.holds`,
        // which outlives `self`.
        unsafe { hold.as_ref() }
    }

    pub fn current_generation(&self) -> Generation {
        self.shared.generation.load(Ordering::SeqCst)
    }

    /// Pin the current generation from the writer thread
    pub fn take_guard(&self) -> GenerationGuard<'_> {
        self.shared.take_guard()
    }

    /// Handle for reader threads
    pub fn reader(&self) -> GenerationReader {
        GenerationReader {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Advance to the next generation
    ///
    /// Call after `transfer_hold_lists(current_generation())` on every store
    /// sharing this handler.
    pub fn inc_generation(&mut self) {
        let next = self.current_generation() + 1;
        let hold = match self.free.pop() {
            Some(hold) => hold,
            None => self.shared.alloc_hold(next),
        };
        // The record stays invalid until the new generation number is visible
        self.hold(hold).generation.store(next, Ordering::SeqCst);
        self.shared.generation.store(next, Ordering::SeqCst);
        self.hold(hold).ref_count.store(0, Ordering::SeqCst);
        self.shared.last.store(hold.as_ptr(), Ordering::SeqCst);
        if let Some(&previous) = self.active.back() {
            self.hold(previous).invalidate();
        }
        self.active.push_back(hold);
        self.update_oldest_used_generation();
        trace!(generation = next, "Advanced generation");
    }

    /// Recycle hold records for generations no guard can reach any more
    pub fn update_oldest_used_generation(&mut self) {
        while self.active.len() > 1 {
            let front = self.active[0];
            if !self.hold(front).is_unused() {
                break;
            }
            self.active.pop_front();
            self.free.push(front);
        }
        let oldest = self.oldest_used_generation();
        self.shared.oldest_used.store(oldest, Ordering::SeqCst);
    }

    /// Oldest generation still pinned by a guard, or the current generation
    pub fn oldest_used_generation(&self) -> Generation {
        self.active
            .iter()
            .map(|&h| self.hold(h))
            .find(|h| !h.is_unused())
            .map(|h| h.generation.load(Ordering::SeqCst))
            .unwrap_or_else(|| self.current_generation())
    }

    /// Number of guards currently pinning `generation`
    pub fn generation_ref_count(&self, generation: Generation) -> u32 {
        self.active
            .iter()
            .map(|&h| self.hold(h))
            .filter(|h| h.generation.load(Ordering::SeqCst) == generation)
            .map(|h| h.guards())
            .sum()
    }

    /// Hold records allocated so far
    pub fn hold_records(&self) -> usize {
        self.shared.holds.lock().len()
    }
}

impl Default for GenerationHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for GenerationHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GenerationHandler")
            .field("current", &self.current_generation())
            .field("oldest_used", &self.oldest_used_generation())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::thread;

    #[test]
    fn test_initial_generation() {
        let handler = GenerationHandler::new();
        assert_eq!(handler.current_generation(), 0);
        assert_eq!(handler.oldest_used_generation(), 0);
    }

    #[test]
    fn test_guard_pins_generation() {
        let mut handler = GenerationHandler::new();
        let reader = handler.reader();
        {
            let guard = reader.take_guard();
            assert_eq!(guard.generation(), 0);
            handler.inc_generation();
            handler.inc_generation();
            assert_eq!(handler.current_generation(), 2);
            assert_eq!(handler.oldest_used_generation(), 0);
            assert_eq!(handler.generation_ref_count(0), 1);
        }
        handler.update_oldest_used_generation();
        assert_eq!(handler.oldest_used_generation(), 2);
        assert_eq!(handler.generation_ref_count(0), 0);
    }

    #[test]
    fn test_oldest_is_minimum_over_guards() {
        let mut handler = GenerationHandler::new();
        let reader = handler.reader();
        handler.inc_generation();
        let g1 = reader.take_guard();
        handler.inc_generation();
        let g2 = reader.take_guard();
        let g2b = reader.take_guard();
        handler.inc_generation();

        assert_eq!(g1.generation(), 1);
        assert_eq!(g2.generation(), 2);
        assert_eq!(handler.generation_ref_count(2), 2);
        assert_eq!(handler.oldest_used_generation(), 1);

        drop(g1);
        handler.update_oldest_used_generation();
        assert_eq!(handler.oldest_used_generation(), 2);

        drop(g2);
        drop(g2b);
        handler.update_oldest_used_generation();
        assert_eq!(handler.oldest_used_generation(), 3);
    }

    #[test]
    fn test_newer_guard_does_not_hide_older_one() {
        let mut handler = GenerationHandler::new();
        let reader = handler.reader();
        let old = reader.take_guard();
        handler.inc_generation();
        handler.inc_generation();
        let new = reader.take_guard();
        assert_eq!(new.generation(), 2);
        drop(new);
        handler.update_oldest_used_generation();
        assert_eq!(handler.oldest_used_generation(), 0);
        drop(old);
        handler.update_oldest_used_generation();
        assert_eq!(handler.oldest_used_generation(), 2);
    }

    #[test]
    fn test_hold_records_are_recycled() {
        let mut handler = GenerationHandler::new();
        for _ in 0..1000 {
            handler.inc_generation();
        }
        assert_eq!(handler.current_generation(), 1000);
        assert!(handler.hold_records() <= 2);
    }

    #[test]
    fn test_concurrent_guards() {
        let mut handler = GenerationHandler::new();
        let stop = Arc::new(AtomicBool::new(false));
        let mut workers = Vec::new();
        for _ in 0..4 {
            let reader = handler.reader();
            let stop = Arc::clone(&stop);
            workers.push(thread::spawn(move || {
                let mut taken = 0u64;
                while !stop.load(Ordering::Relaxed) {
                    let guard = reader.take_guard();
                    assert!(guard.generation() <= reader.current_generation());
                    taken += 1;
                }
                taken
            }));
        }

        for _ in 0..2000 {
            handler.inc_generation();
            assert!(handler.oldest_used_generation() <= handler.current_generation());
        }
        stop.store(true, Ordering::Relaxed);
        for worker in workers {
            worker.join().unwrap();
        }

        handler.update_oldest_used_generation();
        assert_eq!(handler.oldest_used_generation(), handler.current_generation());
    }
}

//! Generation-tagged hold lists
//!
//! ```text
//! hold(x) ──→ pending ──transfer(g)──→ [(g, x), ...] ──trim(used > g)──→ reclaimed
//! ```

use super::generation::Generation;
use std::collections::VecDeque;

/// Items awaiting reclamation, tagged with the generation they were held in
#[derive(Debug)]
pub struct GenerationHoldList<T> {
    pending: Vec<T>,
    held: VecDeque<(Generation, T)>,
}

impl<T> GenerationHoldList<T> {
    pub fn new() -> Self {
        Self {
            pending: Vec::new(),
            held: VecDeque::new(),
        }
    }

    /// Queue an item freed in the current (not yet committed) generation
    pub fn hold(&mut self, item: T) {
        self.pending.push(item);
    }

    /// Tag every pending item with `generation`
    pub fn transfer(&mut self, generation: Generation) {
        debug_assert!(self.held.back().map_or(true, |(g, _)| *g <= generation));
        self.held
            .extend(self.pending.drain(..).map(|item| (generation, item)));
    }

    /// Hand every item held in a generation older than `used_generation` to `reclaim`
    ///
    /// Returns the number of items reclaimed.
    pub fn trim(&mut self, used_generation: Generation, mut reclaim: impl FnMut(T)) -> usize {
        let mut reclaimed = 0;
        while let Some((generation, _)) = self.held.front() {
            if *generation >= used_generation {
                break;
            }
            if let Some((_, item)) = self.held.pop_front() {
                reclaim(item);
                reclaimed += 1;
            }
        }
        reclaimed
    }

    /// Remove everything, pending included, in hold order
    pub fn drain_all(&mut self) -> Vec<T> {
        let mut items: Vec<T> = self.held.drain(..).map(|(_, item)| item).collect();
        items.append(&mut self.pending);
        items
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn held_len(&self) -> usize {
        self.held.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty() && self.held.is_empty()
    }

    /// Iterate pending and held items
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.pending.iter().chain(self.held.iter().map(|(_, item)| item))
    }
}

impl<T> Default for GenerationHoldList<T> {
    fn default() -> Self {
        Self::new()
    }
}

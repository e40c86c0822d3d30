//! Memory accounting for the buffer pool

use serde::{Deserialize, Serialize};
use std::ops::AddAssign;

/// Memory usage snapshot, all values in bytes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryUsage {
    /// Bytes allocated for buffers (including superseded copies on hold)
    pub allocated_bytes: usize,
    /// Bytes handed out to entries (live, dead and on hold)
    pub used_bytes: usize,
    /// Bytes of entries that have been freed and reclaimed
    pub dead_bytes: usize,
    /// Bytes freed but still waiting on a generation
    pub allocated_bytes_on_hold: usize,
}

impl MemoryUsage {
    pub fn new(
        allocated_bytes: usize,
        used_bytes: usize,
        dead_bytes: usize,
        allocated_bytes_on_hold: usize,
    ) -> Self {
        Self {
            allocated_bytes,
            used_bytes,
            dead_bytes,
            allocated_bytes_on_hold,
        }
    }

    /// Bytes occupied by entries nobody has freed
    pub fn live_bytes(&self) -> usize {
        self.used_bytes
            .saturating_sub(self.dead_bytes)
            .saturating_sub(self.allocated_bytes_on_hold)
    }

    pub fn inc_allocated_bytes(&mut self, bytes: usize) {
        self.allocated_bytes += bytes;
    }

    pub fn inc_used_bytes(&mut self, bytes: usize) {
        self.used_bytes += bytes;
    }

    pub fn inc_dead_bytes(&mut self, bytes: usize) {
        self.dead_bytes += bytes;
    }

    pub fn inc_allocated_bytes_on_hold(&mut self, bytes: usize) {
        self.allocated_bytes_on_hold += bytes;
    }
}

impl AddAssign for MemoryUsage {
    fn add_assign(&mut self, rhs: Self) {
        self.allocated_bytes += rhs.allocated_bytes;
        self.used_bytes += rhs.used_bytes;
        self.dead_bytes += rhs.dead_bytes;
        self.allocated_bytes_on_hold += rhs.allocated_bytes_on_hold;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_live_bytes() {
        let usage = MemoryUsage::new(4096, 1000, 200, 100);
        assert_eq!(usage.live_bytes(), 700);
    }

    #[test]
    fn test_add_assign() {
        let mut total = MemoryUsage::default();
        total += MemoryUsage::new(10, 5, 1, 1);
        total += MemoryUsage::new(20, 10, 2, 0);
        assert_eq!(total, MemoryUsage::new(30, 15, 3, 1));
    }
}

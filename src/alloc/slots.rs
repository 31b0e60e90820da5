//! A bounded allocation log: `N` slots, scanned linearly.
//!
//! This is the simple mode behind the `memtrack_tracked_*` entry points. It
//! needs no allocator at all, at the cost of O(N) inserts and removes and a
//! hard cap on how many blocks can be live at once.

use thiserror::Error;

use super::stats::{Change, Stats};

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("all {capacity} allocation slots are in use")]
pub struct CapacityExhausted {
    pub capacity: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Slot {
    pub address: usize,
    pub size: usize,
    /// Seconds since the Unix epoch
    pub timestamp: u64,
    active: bool,
}

impl Slot {
    const EMPTY: Self = Self {
        address: 0,
        size: 0,
        timestamp: 0,
        active: false,
    };
}

pub struct SlotTable<const N: usize> {
    slots: [Slot; N],
    active: usize,
    stats: Stats,
}

impl<const N: usize> SlotTable<N> {
    pub const fn new() -> Self {
        Self {
            slots: [Slot::EMPTY; N],
            active: 0,
            stats: Stats::new(),
        }
    }

    pub const fn capacity(&self) -> usize {
        N
    }

    /// Record a block in the first free slot.
    pub fn insert(
        &mut self,
        address: usize,
        size: usize,
        timestamp: u64,
    ) -> Result<Change, CapacityExhausted> {
        let slot = self
            .slots
            .iter_mut()
            .find(|slot| !slot.active)
            .ok_or(CapacityExhausted { capacity: N })?;
        *slot = Slot {
            address,
            size,
            timestamp,
            active: true,
        };
        self.active += 1;
        Ok(self.stats.record_alloc(size))
    }

    /// Forget the block at `address`. `None` (and an untracked free on the
    /// counters) if it isn't in the table.
    pub fn remove(&mut self, address: usize) -> Option<Change> {
        let Some(slot) = self
            .slots
            .iter_mut()
            .find(|slot| slot.active && slot.address == address)
        else {
            self.stats.record_untracked_free();
            return None;
        };
        slot.active = false;
        self.active -= 1;
        Some(self.stats.record_free(slot.size))
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    /// Number of live blocks
    pub fn active(&self) -> usize {
        self.active
    }

    /// Live blocks, in slot order
    pub fn live(&self) -> impl Iterator<Item = &Slot> + '_ {
        self.slots.iter().filter(|slot| slot.active)
    }
}

impl<const N: usize> Default for SlotTable<N> {
    fn default() -> Self {
        Self::new()
    }
}

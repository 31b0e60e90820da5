/// Aggregate counters for a set of tracked allocations.
///
/// `current_usage` is always the sum of the sizes of the live records, and
/// `peak_usage` is the largest `current_usage` ever seen.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Stats {
    pub total_allocated: usize,
    pub total_freed: usize,
    pub current_usage: usize,
    pub peak_usage: usize,
    pub allocation_count: u64,
    pub free_count: u64,
    /// Frees (and reallocs) of addresses we had no record of: double frees,
    /// blocks from before we were loaded, or blocks we lost track of.
    pub untracked_frees: u64,
}

/// What a single insert or remove did, for the per-event log line.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Change {
    pub size: usize,
    /// `current_usage` straight after the change
    pub current_usage: usize,
}

impl Stats {
    pub const fn new() -> Self {
        Self {
            total_allocated: 0,
            total_freed: 0,
            current_usage: 0,
            peak_usage: 0,
            allocation_count: 0,
            free_count: 0,
            untracked_frees: 0,
        }
    }

    pub fn record_alloc(&mut self, size: usize) -> Change {
        self.total_allocated = self.total_allocated.wrapping_add(size);
        self.current_usage = self.current_usage.wrapping_add(size);
        self.allocation_count += 1;
        self.peak_usage = usize::max(self.peak_usage, self.current_usage);
        Change {
            size,
            current_usage: self.current_usage,
        }
    }

    pub fn record_free(&mut self, size: usize) -> Change {
        self.total_freed = self.total_freed.wrapping_add(size);
        self.current_usage = self.current_usage.wrapping_sub(size);
        self.free_count += 1;
        Change {
            size,
            current_usage: self.current_usage,
        }
    }

    pub fn record_untracked_free(&mut self) {
        self.untracked_frees += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peak_only_moves_up() {
        let mut stats = Stats::new();
        stats.record_alloc(100);
        stats.record_alloc(200);
        stats.record_free(100);
        stats.record_alloc(50);
        assert_eq!(stats.current_usage, 250);
        assert_eq!(stats.peak_usage, 300);
        assert_eq!(stats.total_allocated, 350);
        assert_eq!(stats.total_freed, 100);
    }

    #[test]
    fn untracked_frees_leave_usage_alone() {
        let mut stats = Stats::new();
        stats.record_alloc(10);
        stats.record_untracked_free();
        assert_eq!(stats.current_usage, 10);
        assert_eq!(stats.free_count, 0);
        assert_eq!(stats.untracked_frees, 1);
    }
}

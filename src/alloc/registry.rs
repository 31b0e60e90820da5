//! The allocation registry: every live allocation, keyed by address.
//!
//! This is a fixed-size, separately-chained hash table. The buckets are an
//! inline array (so a `Registry` can be a `static` with no constructor), and
//! each chain node is a [`Raw`] block from the *real* allocator. One
//! [`RawLock`] guards the whole table and the counters. It is held for one
//! chain walk at a time.
//!
//! ```plaintext
//! buckets[(addr >> 3) % NR_BUCKETS]
//!    |
//!    +--> Node { record, next } --> Node { record, next } --> null
//! ```

use std::{cell::UnsafeCell, ptr};

use super::{
    lock::RawLock,
    raw::{Raw, RealAlloc},
    stats::{Change, Stats},
};
use crate::stack::CapturedStack;

/// Prime, so that the `>> 3` of 16-byte aligned addresses still spreads well
pub const NR_BUCKETS: usize = 10007;

/// One live allocation
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AllocationRecord {
    pub address: usize,
    /// The requested size, in bytes
    pub size: usize,
    pub stack: CapturedStack,
    /// Seconds since the Unix epoch
    pub timestamp: u64,
}

struct Node {
    record: AllocationRecord,
    next: *mut Node,
}

struct Table {
    buckets: [*mut Node; NR_BUCKETS],
    stats: Stats,
}

fn bucket_of(address: usize) -> usize {
    (address >> 3) % NR_BUCKETS
}

impl Table {
    /// Unlink the node for `address` from its chain, if there is one
    fn unlink(&mut self, address: usize) -> *mut Node {
        let mut link: *mut *mut Node = &mut self.buckets[bucket_of(address)];
        // SAFETY: every non-null pointer in a chain is a live node that we
        // own, and we have `&mut self`, so nobody else is walking it.
        unsafe {
            while !(*link).is_null() {
                let node = *link;
                if (*node).record.address == address {
                    *link = (*node).next;
                    return node;
                }
                link = &mut (*node).next;
            }
        }
        ptr::null_mut()
    }
}

/// Iterator over the records in a locked [`Registry`], in bucket-then-chain
/// order.
pub struct Records<'a> {
    buckets: &'a [*mut Node],
    node: *const Node,
}

impl<'a> Iterator for Records<'a> {
    type Item = &'a AllocationRecord;

    fn next(&mut self) -> Option<Self::Item> {
        while self.node.is_null() {
            let (&head, rest) = self.buckets.split_first()?;
            self.node = head;
            self.buckets = rest;
        }
        // SAFETY: the registry lock is held for `'a`, so the node is live and
        // nobody is relinking it.
        let node = unsafe { &*self.node };
        self.node = node.next;
        Some(&node.record)
    }
}

pub struct Registry<A>
where
    A: RealAlloc,
{
    lock: RawLock,
    table: UnsafeCell<Table>,
    allocator: A,
}

// SAFETY: `table` is only ever touched with `lock` held, and the nodes it
// points to are owned by the table.
unsafe impl<A> Sync for Registry<A> where A: RealAlloc + Sync {}
unsafe impl<A> Send for Registry<A> where A: RealAlloc + Send {}

impl<A> Registry<A>
where
    A: RealAlloc,
{
    pub const fn new(allocator: A) -> Self {
        Self {
            lock: RawLock::new(),
            table: UnsafeCell::new(Table {
                buckets: [ptr::null_mut(); NR_BUCKETS],
                stats: Stats::new(),
            }),
            allocator,
        }
    }

    /// The allocator that our nodes (and, for the tracker, the tracked
    /// blocks themselves) come from
    pub const fn allocator(&self) -> &A {
        &self.allocator
    }

    fn with_table<R>(&self, f: impl FnOnce(&mut Table) -> R) -> R {
        let _guard = self.lock.lock();
        // SAFETY: we hold the lock
        f(unsafe { &mut *self.table.get() })
    }

    /// Start tracking `address`. Returns `None` if we couldn't get memory for
    /// the node, in which case the allocation simply goes untracked.
    ///
    /// If `address` is somehow already tracked, its free was never observed
    /// (e.g. it went through a path we don't interpose); the stale record is
    /// retired as if freed, so addresses stay unique.
    pub fn insert(
        &self,
        address: usize,
        size: usize,
        stack: CapturedStack,
        timestamp: u64,
    ) -> Option<Change> {
        let record = AllocationRecord {
            address,
            size,
            stack,
            timestamp,
        };
        let node = Raw::new_in(
            Node {
                record,
                next: ptr::null_mut(),
            },
            &self.allocator,
        )?
        .into_ptr();

        let (change, stale) = self.with_table(|table| {
            let stale = table.unlink(address);
            if !stale.is_null() {
                // SAFETY: just unlinked, still live
                table.stats.record_free(unsafe { (*stale).record.size });
            }
            let head = &mut table.buckets[bucket_of(address)];
            // SAFETY: `node` is ours and not yet shared
            unsafe { (*node).next = *head };
            *head = node;
            (table.stats.record_alloc(size), stale)
        });

        // SAFETY: the stale node was unlinked under the lock; nobody else can
        // reach it now
        if let Some(stale) = unsafe { Raw::from_ptr(stale) } {
            stale.free_in(&self.allocator);
        }
        Some(change)
    }

    /// Stop tracking `address`, returning its size and the usage after
    /// removal. `None` means we had no record of it, which is counted as an
    /// untracked free.
    pub fn remove(&self, address: usize) -> Option<Change> {
        let (node, change) = self.with_table(|table| {
            let node = table.unlink(address);
            if node.is_null() {
                table.stats.record_untracked_free();
                (node, None)
            } else {
                // SAFETY: just unlinked, still live
                let size = unsafe { (*node).record.size };
                (node, Some(table.stats.record_free(size)))
            }
        });
        // SAFETY: unlinked under the lock above
        if let Some(node) = unsafe { Raw::from_ptr(node) } {
            node.free_in(&self.allocator);
        }
        change
    }

    pub fn contains(&self, address: usize) -> bool {
        self.visit(|_, mut records| records.any(|record| record.address == address))
    }

    pub fn stats(&self) -> Stats {
        self.with_table(|table| table.stats)
    }

    /// Wait out any thread inside the registry, and keep everyone out until
    /// [`Registry::after_fork`].
    pub fn before_fork(&self) {
        self.lock.acquire();
    }

    /// Undo [`Registry::before_fork`], in the parent or the child.
    pub fn after_fork(&self, child: bool) {
        if child {
            // the threads that might have been waiting are gone
            self.lock.reset();
        } else {
            // SAFETY: `before_fork()` took it on this thread
            unsafe { self.lock.release() };
        }
    }

    /// Look at the counters and every live record under one lock hold.
    ///
    /// # Deadlock
    ///
    /// The lock is held for the whole of `f`. If `f` (or anything it calls)
    /// allocates through the *tracked* path on this thread, that will hang
    /// forever. Run it under the tracker's re-entry guard.
    pub fn visit<R>(&self, f: impl FnOnce(&Stats, Records<'_>) -> R) -> R {
        let _guard = self.lock.lock();
        // SAFETY: we hold the lock for as long as `Records` is borrowed
        let table = unsafe { &*self.table.get() };
        f(
            &table.stats,
            Records {
                buckets: &table.buckets,
                node: ptr::null(),
            },
        )
    }

    /// [`Registry::visit`], but gives up instead of waiting if the lock is
    /// held. For signal handlers, which may have interrupted the holder.
    pub fn try_visit<R>(&self, f: impl FnOnce(&Stats, Records<'_>) -> R) -> Option<R> {
        let _guard = self.lock.try_lock()?;
        // SAFETY: as in `visit()`
        let table = unsafe { &*self.table.get() };
        Some(f(
            &table.stats,
            Records {
                buckets: &table.buckets,
                node: ptr::null(),
            },
        ))
    }

    /// Every record still present. Allocates the returned `Vec` through the
    /// global allocator, with the same caveat as [`Registry::visit`].
    pub fn snapshot(&self) -> Vec<AllocationRecord> {
        self.visit(|_, records| records.copied().collect())
    }

    /// Drop every record and reset the counters.
    pub fn clear(&self) {
        let mut nodes: Vec<*mut Node> = Vec::new();
        self.with_table(|table| {
            for head in table.buckets.iter_mut() {
                let mut node = std::mem::replace(head, ptr::null_mut());
                while !node.is_null() {
                    nodes.push(node);
                    // SAFETY: chain nodes are live until freed below
                    node = unsafe { (*node).next };
                }
            }
            table.stats = Stats::new();
        });
        for node in nodes {
            // SAFETY: unlinked from every chain above
            if let Some(node) = unsafe { Raw::from_ptr(node) } {
                node.free_in(&self.allocator);
            }
        }
    }
}

impl<A> Drop for Registry<A>
where
    A: RealAlloc,
{
    fn drop(&mut self) {
        self.clear();
    }
}

#[cfg(test)]
mod tests {
    use rand::{rngs::StdRng, Rng, SeedableRng};

    use super::*;
    use crate::alloc::raw::Libc;

    fn registry() -> Box<Registry<Libc>> {
        Box::new(Registry::new(Libc))
    }

    fn insert(registry: &Registry<Libc>, address: usize, size: usize) -> Change {
        registry
            .insert(address, size, CapturedStack::empty(), 0)
            .unwrap()
    }

    #[test]
    fn insert_then_remove() {
        let registry = registry();
        insert(&registry, 0x1000, 64);
        assert!(registry.contains(0x1000));
        assert_eq!(
            registry.remove(0x1000),
            Some(Change {
                size: 64,
                current_usage: 0
            })
        );
        assert!(!registry.contains(0x1000));
        assert_eq!(registry.stats().current_usage, 0);
        assert!(registry.snapshot().is_empty());
    }

    #[test]
    fn free_one_of_two_leaves_one_leak() {
        let registry = registry();
        insert(&registry, 0xa0, 100);
        insert(&registry, 0xb0, 200);
        registry.remove(0xa0).unwrap();

        let leaks = registry.snapshot();
        assert_eq!(leaks.len(), 1);
        assert_eq!(leaks[0].address, 0xb0);
        assert_eq!(leaks[0].size, 200);

        let stats = registry.stats();
        assert_eq!(stats.total_allocated, 300);
        assert_eq!(stats.total_freed, 100);
        assert_eq!(stats.current_usage, 200);
        assert_eq!(stats.peak_usage, 300);
    }

    #[test]
    fn unknown_address_counts_as_untracked() {
        let registry = registry();
        insert(&registry, 0x10, 8);
        assert_eq!(registry.remove(0x20), None);
        registry.remove(0x10).unwrap();
        assert_eq!(registry.remove(0x10), None);

        let stats = registry.stats();
        assert_eq!(stats.untracked_frees, 2);
        assert_eq!(stats.allocation_count, 1);
        assert_eq!(stats.free_count, 1);
        assert_eq!(stats.current_usage, 0);
    }

    #[test]
    fn colliding_addresses_share_a_chain() {
        let registry = registry();
        let step = NR_BUCKETS << 3;
        for i in 0..4 {
            insert(&registry, 0x8 + i * step, i + 1);
        }
        assert_eq!(bucket_of(0x8), bucket_of(0x8 + 3 * step));
        // remove from the middle of the chain
        assert_eq!(registry.remove(0x8 + step).map(|c| c.size), Some(2));
        let mut sizes: Vec<usize> = registry.snapshot().iter().map(|r| r.size).collect();
        sizes.sort();
        assert_eq!(sizes, vec![1, 3, 4]);
    }

    #[test]
    fn reinserting_a_live_address_replaces_it() {
        let registry = registry();
        insert(&registry, 0x40, 10);
        insert(&registry, 0x40, 30);
        let leaks = registry.snapshot();
        assert_eq!(leaks.len(), 1);
        assert_eq!(leaks[0].size, 30);
        assert_eq!(registry.stats().current_usage, 30);
    }

    #[test]
    fn snapshot_is_in_bucket_order() {
        let registry = registry();
        for address in [0x30usize, 0x10, 0x20] {
            insert(&registry, address, 1);
        }
        let addresses: Vec<usize> = registry.snapshot().iter().map(|r| r.address).collect();
        assert_eq!(addresses, vec![0x10, 0x20, 0x30]);
    }

    #[test]
    fn records_keep_their_stack_and_timestamp() {
        let registry = registry();
        let stack = CapturedStack::from_frames(&[0xdead, 0xbeef]);
        registry.insert(0x100, 4, stack, 1_700_000_000).unwrap();
        let record = registry.snapshot()[0];
        assert_eq!(record.stack, stack);
        assert_eq!(record.timestamp, 1_700_000_000);
    }

    #[test]
    fn try_visit_gives_up_while_locked() {
        let registry = registry();
        let _guard = registry.lock.lock();
        assert!(registry.try_visit(|stats, _| *stats).is_none());
    }

    #[test]
    fn clear_empties_everything() {
        let registry = registry();
        for i in 1..100 {
            insert(&registry, i << 4, i);
        }
        registry.clear();
        assert!(registry.snapshot().is_empty());
        assert_eq!(registry.stats(), Stats::new());
    }

    #[test]
    fn usage_matches_live_records_and_peak_matches_history() {
        let registry = registry();
        let mut rng = StdRng::seed_from_u64(0x5eed);
        let mut live: Vec<(usize, usize)> = Vec::new();
        let mut next_address = 0x1000;
        let mut max_seen = 0;

        for _ in 0..2_000 {
            if live.is_empty() || rng.gen_bool(0.6) {
                let size = rng.gen_range(1..4096);
                insert(&registry, next_address, size);
                live.push((next_address, size));
                next_address += 16;
            } else {
                let (address, size) = live.swap_remove(rng.gen_range(0..live.len()));
                assert_eq!(registry.remove(address).map(|c| c.size), Some(size));
            }
            let current = registry.stats().current_usage;
            assert_eq!(current, live.iter().map(|&(_, size)| size).sum::<usize>());
            max_seen = max_seen.max(current);
            assert_eq!(registry.stats().peak_usage, max_seen);
        }

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.len(), live.len());
        assert_eq!(
            snapshot.iter().map(|r| r.size).sum::<usize>(),
            registry.stats().current_usage
        );

        for (address, _) in live.drain(..) {
            registry.remove(address).unwrap();
        }
        assert_eq!(registry.stats().current_usage, 0);
        assert!(registry.snapshot().is_empty());
    }
}

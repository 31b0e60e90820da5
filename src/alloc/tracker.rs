//! The instrumented allocation paths behind the exported C symbols.
//!
//! Every path has the same shape: decide whether this call may be tracked
//! (see [`Tracker::begin`]), call the real primitive, then record or forget
//! the block. A call that may not be tracked goes straight to the real
//! allocator and touches nothing else.

use std::{
    cell::Cell,
    ffi::c_void,
    marker::PhantomData,
    mem,
    ptr,
    sync::atomic::{AtomicBool, Ordering},
    time::{SystemTime, UNIX_EPOCH},
};

use super::{
    raw::RealAlloc,
    registry::Registry,
    stats::Change,
};
use crate::{
    putln,
    report::{self, Event},
    stack::CapturedStack,
    util::print::LineBuf,
};

thread_local! {
    static TRACKER_DEPTH: Cell<u32> = const { Cell::new(0) };
}

/// Marks the current thread as inside the tracker. While one is alive, any
/// allocation this thread makes (from the stack walker, the symbolizer, the
/// report writer...) passes straight through to the real allocator instead
/// of recursing into the registry.
pub struct ReentryGuard {
    // the depth counter is per thread
    _not_send: PhantomData<*const ()>,
}

impl ReentryGuard {
    /// `None` if this thread is already inside the tracker. Also `None` if
    /// thread-local storage is unusable (thread teardown), in which case the
    /// safe answer is to not track.
    pub fn enter() -> Option<Self> {
        TRACKER_DEPTH
            .try_with(|depth| {
                if depth.get() > 0 {
                    None
                } else {
                    depth.set(1);
                    Some(Self {
                        _not_send: PhantomData,
                    })
                }
            })
            .ok()
            .flatten()
    }

    pub fn is_held() -> bool {
        TRACKER_DEPTH.try_with(|depth| depth.get() > 0).unwrap_or(true)
    }
}

impl ReentryGuard {
    /// Hold the guard past the end of any scope. Returns whether it was
    /// taken; pair a `true` with [`ReentryGuard::leave`].
    fn hold() -> bool {
        Self::enter().map(mem::forget).is_some()
    }

    fn leave() {
        drop(Self {
            _not_send: PhantomData,
        });
    }
}

impl Drop for ReentryGuard {
    fn drop(&mut self) {
        _ = TRACKER_DEPTH.try_with(|depth| depth.set(depth.get().saturating_sub(1)));
    }
}

fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

pub struct Tracker<A>
where
    A: RealAlloc,
{
    registry: Registry<A>,
    enabled: AtomicBool,
    verbose: AtomicBool,
    /// Whether `before_fork()` took the forking thread's re-entry guard
    fork_guard: AtomicBool,
}

impl<A> Tracker<A>
where
    A: RealAlloc,
{
    /// A tracker that starts out disabled: everything passes through until
    /// [`Tracker::set_enabled`].
    pub const fn new(allocator: A) -> Self {
        Self {
            registry: Registry::new(allocator),
            enabled: AtomicBool::new(false),
            verbose: AtomicBool::new(false),
            fork_guard: AtomicBool::new(false),
        }
    }

    pub const fn registry(&self) -> &Registry<A> {
        &self.registry
    }

    fn real(&self) -> &A {
        self.registry.allocator()
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn set_verbose(&self, verbose: bool) {
        self.verbose.store(verbose, Ordering::Relaxed);
    }

    /// Stop tracking. Returns whether tracking was on.
    pub fn disable(&self) -> bool {
        self.enabled.swap(false, Ordering::AcqRel)
    }

    /// Run before `fork()`. Waits until no thread is in the middle of
    /// recording, then keeps the registry locked so the child inherits it in
    /// one piece. Until [`Tracker::after_fork`], anything the forking thread
    /// allocates passes through.
    pub fn before_fork(&self) {
        let held = ReentryGuard::hold();
        self.registry.before_fork();
        // only written and read with the registry lock held
        self.fork_guard.store(held, Ordering::Relaxed);
    }

    /// Run after `fork()` in both processes.
    pub fn after_fork(&self, child: bool) {
        let held = self.fork_guard.swap(false, Ordering::Relaxed);
        self.registry.after_fork(child);
        if held {
            ReentryGuard::leave();
        }
    }

    /// Whether this call gets tracked. Holding the returned guard is what
    /// makes our own allocations underneath pass through.
    fn begin(&self) -> Option<ReentryGuard> {
        if !self.is_enabled() {
            return None;
        }
        let guard = ReentryGuard::enter()?;
        self.real().ready().then_some(guard)
    }

    fn track(&self, ptr: *mut c_void, size: usize) {
        let stack = CapturedStack::capture();
        if let Some(change) = self.registry.insert(ptr as usize, size, stack, now()) {
            self.event(Event::Alloc, ptr, change);
        }
    }

    fn untrack(&self, ptr: *mut c_void) {
        match self.registry.remove(ptr as usize) {
            Some(change) => self.event(Event::Free, ptr, change),
            None => putln!(
                "Memory Tracker: WARNING - Free of untracked pointer {:#x}",
                ptr as usize
            ),
        }
    }

    fn event(&self, event: Event, ptr: *mut c_void, change: Change) {
        if self.verbose.load(Ordering::Relaxed) {
            _ = report::write_event(&mut LineBuf::<128>::stderr(), event, ptr as usize, change);
        }
    }

    pub fn allocate(&self, size: usize) -> *mut c_void {
        let Some(_guard) = self.begin() else {
            return self.real().malloc(size);
        };
        let ptr = self.real().malloc(size);
        if !ptr.is_null() {
            self.track(ptr, size);
        }
        ptr
    }

    pub fn zero_allocate(&self, count: usize, size: usize) -> *mut c_void {
        let Some(_guard) = self.begin() else {
            return self.real().calloc(count, size);
        };
        let ptr = self.real().calloc(count, size);
        if !ptr.is_null() {
            // can't overflow: calloc() fails if the product does
            self.track(ptr, count.saturating_mul(size));
        }
        ptr
    }

    /// `memalign()`-style allocation, tracked like [`Tracker::allocate`].
    /// `align` is passed through unchecked.
    pub fn aligned_allocate(&self, align: usize, size: usize) -> *mut c_void {
        let Some(_guard) = self.begin() else {
            return self.real().memalign(align, size);
        };
        let ptr = self.real().memalign(align, size);
        if !ptr.is_null() {
            self.track(ptr, size);
        }
        ptr
    }

    /// # Safety
    ///
    /// `ptr` is null or a live block from the real allocator.
    pub unsafe fn deallocate(&self, ptr: *mut c_void) {
        if ptr.is_null() {
            return;
        }
        if let Some(_guard) = self.begin() {
            // Forget it *before* the real free, otherwise another thread could
            // be handed the same address and record it first.
            self.untrack(ptr);
        }
        self.real().free(ptr);
    }

    /// # Safety
    ///
    /// `ptr` is null or a live block from the real allocator.
    pub unsafe fn reallocate(&self, ptr: *mut c_void, new_size: usize) -> *mut c_void {
        if ptr.is_null() {
            return self.allocate(new_size);
        }
        if new_size == 0 {
            self.deallocate(ptr);
            return ptr::null_mut();
        }
        let Some(_guard) = self.begin() else {
            return self.real().realloc(ptr, new_size);
        };
        // Same ordering concern as `deallocate()`. If the realloc then fails,
        // the old block is still live but no longer tracked.
        self.untrack(ptr);
        let new = self.real().realloc(ptr, new_size);
        if !new.is_null() {
            self.track(new, new_size);
        }
        new
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::raw::Libc;

    fn tracker() -> Box<Tracker<Libc>> {
        let tracker = Box::new(Tracker::new(Libc));
        tracker.set_enabled(true);
        tracker
    }

    fn usage(tracker: &Tracker<Libc>) -> usize {
        tracker.registry().stats().current_usage
    }

    #[test]
    fn allocate_and_free_everything() {
        let tracker = tracker();
        let ptrs: Vec<_> = (1..50).map(|i| tracker.allocate(i * 8)).collect();
        assert_eq!(usage(&tracker), (1..50).map(|i| i * 8).sum::<usize>());
        for ptr in ptrs {
            unsafe { tracker.deallocate(ptr) };
        }
        assert_eq!(usage(&tracker), 0);
        assert!(tracker.registry().snapshot().is_empty());
    }

    #[test]
    fn leak_report_scenario() {
        let tracker = tracker();
        let a = tracker.allocate(100);
        let b = tracker.allocate(200);
        unsafe { tracker.deallocate(a) };

        let leaks = tracker.registry().snapshot();
        assert_eq!(leaks.len(), 1);
        assert_eq!(leaks[0].address, b as usize);
        assert_eq!(leaks[0].size, 200);
        assert!(!leaks[0].stack.is_empty());
        let stats = tracker.registry().stats();
        assert_eq!((stats.total_allocated, stats.total_freed), (300, 100));
        assert_eq!(stats.peak_usage, 300);

        unsafe { tracker.deallocate(b) };
    }

    #[test]
    fn calloc_tracks_the_product() {
        let tracker = tracker();
        let ptr = tracker.zero_allocate(4, 25);
        assert!(!ptr.is_null());
        assert_eq!(usage(&tracker), 100);
        let bytes = unsafe { std::slice::from_raw_parts(ptr.cast::<u8>(), 100) };
        assert!(bytes.iter().all(|&b| b == 0));
        unsafe { tracker.deallocate(ptr) };
    }

    #[test]
    fn aligned_allocations_are_tracked() {
        let tracker = tracker();
        let ptr = tracker.aligned_allocate(256, 40);
        assert_eq!(ptr as usize % 256, 0);
        assert!(tracker.registry().contains(ptr as usize));
        unsafe { tracker.deallocate(ptr) };
        assert_eq!(usage(&tracker), 0);
    }

    #[test]
    fn zero_size_allocations_are_tracked() {
        let tracker = tracker();
        let ptr = tracker.allocate(0);
        if !ptr.is_null() {
            assert!(tracker.registry().contains(ptr as usize));
            unsafe { tracker.deallocate(ptr) };
            assert_eq!(tracker.registry().stats().untracked_frees, 0);
        }
    }

    #[test]
    fn realloc_moves_the_record() {
        let tracker = tracker();
        let ptr = tracker.allocate(50);
        let new = unsafe { tracker.reallocate(ptr, 150) };
        assert!(!new.is_null());

        let leaks = tracker.registry().snapshot();
        assert_eq!(leaks.len(), 1);
        assert_eq!(leaks[0].address, new as usize);
        assert_eq!(leaks[0].size, 150);
        let stats = tracker.registry().stats();
        assert_eq!(stats.current_usage, 150);
        assert_eq!(stats.total_allocated, 200);
        assert_eq!(stats.total_freed, 50);

        unsafe { tracker.deallocate(new) };
    }

    #[test]
    fn realloc_of_null_is_allocate() {
        let tracker = tracker();
        let ptr = unsafe { tracker.reallocate(ptr::null_mut(), 64) };
        assert!(!ptr.is_null());
        let stats = tracker.registry().stats();
        assert_eq!(stats.allocation_count, 1);
        assert_eq!(stats.free_count, 0);
        assert_eq!(stats.current_usage, 64);
        unsafe { tracker.deallocate(ptr) };
    }

    #[test]
    fn realloc_to_zero_is_free() {
        let tracker = tracker();
        let ptr = tracker.allocate(64);
        assert!(unsafe { tracker.reallocate(ptr, 0) }.is_null());
        let stats = tracker.registry().stats();
        assert_eq!(stats.free_count, 1);
        assert_eq!(stats.current_usage, 0);
        assert!(tracker.registry().snapshot().is_empty());
    }

    #[test]
    fn freeing_null_does_nothing() {
        let tracker = tracker();
        unsafe { tracker.deallocate(ptr::null_mut()) };
        assert_eq!(tracker.registry().stats().untracked_frees, 0);
    }

    #[test]
    fn untracked_free_is_counted_and_still_freed() {
        let tracker = tracker();
        // from before tracking was on, as far as the tracker is concerned
        let foreign = unsafe { libc::malloc(32) };
        unsafe { tracker.deallocate(foreign) };
        assert_eq!(tracker.registry().stats().untracked_frees, 1);
        assert_eq!(tracker.registry().stats().free_count, 0);
    }

    #[test]
    fn disabled_tracker_passes_through() {
        let tracker = tracker();
        assert!(tracker.disable());
        assert!(!tracker.disable());
        let ptr = tracker.allocate(10);
        assert!(!ptr.is_null());
        unsafe { tracker.deallocate(ptr) };
        assert_eq!(tracker.registry().stats(), Default::default());
    }

    #[test]
    fn nested_calls_pass_through() {
        let tracker = tracker();
        let guard = ReentryGuard::enter().unwrap();
        assert!(ReentryGuard::enter().is_none());
        let ptr = tracker.allocate(10);
        assert!(!tracker.registry().contains(ptr as usize));
        drop(guard);
        assert!(!ReentryGuard::is_held());
        unsafe { tracker.deallocate(ptr) };
        assert_eq!(tracker.registry().stats().untracked_frees, 1);
    }

    /// Runs `child` in a forked process under a two second alarm, and
    /// returns its wait status.
    fn in_child(tracker: &Tracker<Libc>, child: impl FnOnce()) -> libc::c_int {
        tracker.before_fork();
        let pid = unsafe { libc::fork() };
        assert!(pid >= 0, "fork failed");
        if pid == 0 {
            tracker.after_fork(true);
            unsafe { libc::alarm(2) };
            child();
            unsafe { libc::_exit(0) };
        }
        tracker.after_fork(false);
        let mut status = 0;
        assert_eq!(unsafe { libc::waitpid(pid, &mut status, 0) }, pid);
        status
    }

    #[test]
    fn fork_while_another_thread_records() {
        let tracker = tracker();
        let kept = tracker.allocate(24);
        let (locked_tx, locked_rx) = std::sync::mpsc::channel();

        crossbeam::scope(|s| {
            let tracker = &tracker;
            s.spawn(move |_| {
                tracker.registry().visit(|_, _| {
                    locked_tx.send(()).unwrap();
                    std::thread::sleep(std::time::Duration::from_millis(50));
                });
            });
            locked_rx.recv().unwrap();

            let status = in_child(tracker, || {
                let ptr = tracker.allocate(16);
                if !tracker.registry().contains(ptr as usize)
                    || !tracker.registry().contains(kept as usize)
                {
                    unsafe { libc::_exit(1) };
                }
                unsafe { tracker.deallocate(ptr) };
            });
            assert!(libc::WIFEXITED(status), "child hung or crashed: {status:#x}");
            assert_eq!(libc::WEXITSTATUS(status), 0);
        })
        .unwrap();

        // the parent is unlocked and tracking again
        assert!(!ReentryGuard::is_held());
        let ptr = tracker.allocate(8);
        assert!(tracker.registry().contains(ptr as usize));
        unsafe {
            tracker.deallocate(ptr);
            tracker.deallocate(kept);
        }
        assert_eq!(usage(&tracker), 0);
    }

    #[test]
    fn forking_thread_allocates_untracked_until_after_fork() {
        let tracker = tracker();
        tracker.before_fork();
        assert!(ReentryGuard::is_held());
        let ptr = tracker.allocate(8);
        tracker.after_fork(false);
        assert!(!ReentryGuard::is_held());
        assert!(!tracker.registry().contains(ptr as usize));
        unsafe { libc::free(ptr) };
    }

    #[test]
    fn concurrent_alloc_free_balances() {
        const THREADS: usize = 8;
        const ROUNDS: usize = 2_000;

        let tracker = tracker();
        crossbeam::scope(|s| {
            for t in 0..THREADS {
                let tracker = &tracker;
                s.spawn(move |_| {
                    let mut live = Vec::new();
                    for i in 0..ROUNDS {
                        live.push(tracker.allocate(1 + (t * ROUNDS + i) % 512));
                        if i % 3 == 0 {
                            let ptr = live.swap_remove(i % live.len());
                            unsafe { tracker.deallocate(ptr) };
                        }
                    }
                    for ptr in live {
                        unsafe { tracker.deallocate(ptr) };
                    }
                });
            }
        })
        .unwrap();

        let stats = tracker.registry().stats();
        assert_eq!(stats.allocation_count, (THREADS * ROUNDS) as u64);
        assert_eq!(stats.free_count, (THREADS * ROUNDS) as u64);
        assert_eq!(stats.current_usage, 0);
        assert_eq!(stats.untracked_frees, 0);
        assert_eq!(stats.total_allocated, stats.total_freed);
        assert!(tracker.registry().snapshot().is_empty());
    }
}

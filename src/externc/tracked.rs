//! Explicit tracking entry points, for programs that link the library and
//! route selected allocations through it instead of preloading it.
//!
//! These record into a fixed [`SlotTable`] rather than the registry, and
//! print every event.

use std::{
    cell::UnsafeCell,
    fmt::Write,
    ptr,
    time::{SystemTime, UNIX_EPOCH},
};

use libc::{c_void, size_t};

use crate::{
    alloc::{lock::RawLock, slots::SlotTable, RealAlloc},
    binding::NextAlloc,
    putln,
    report,
    util::print::LineBuf,
};

pub const MAX_SLOTS: usize = 10000;

fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// A [`SlotTable`] behind a lock, feeding blocks from `A`.
pub struct SlotLog<A, const N: usize> {
    lock: RawLock,
    table: UnsafeCell<SlotTable<N>>,
    allocator: A,
}

// SAFETY: `table` is only touched with `lock` held
unsafe impl<A: Sync, const N: usize> Sync for SlotLog<A, N> {}

impl<A, const N: usize> SlotLog<A, N>
where
    A: RealAlloc,
{
    pub const fn new(allocator: A) -> Self {
        Self {
            lock: RawLock::new(),
            table: UnsafeCell::new(SlotTable::new()),
            allocator,
        }
    }

    fn with_table<R>(&self, f: impl FnOnce(&mut SlotTable<N>) -> R) -> R {
        let _guard = self.lock.lock();
        // SAFETY: we hold the lock
        f(unsafe { &mut *self.table.get() })
    }

    fn record(&self, ptr: *mut c_void, size: usize) {
        if ptr.is_null() {
            return;
        }
        self.with_table(|table| match table.insert(ptr as usize, size, now()) {
            Ok(change) => putln!(
                "ALLOC: {:#x}, size={}, total_usage={}",
                ptr as usize,
                change.size,
                change.current_usage
            ),
            Err(_) => putln!("ERROR: Maximum allocations reached!"),
        });
    }

    fn forget(&self, ptr: *mut c_void) {
        self.with_table(|table| match table.remove(ptr as usize) {
            Some(change) => putln!(
                "FREE: {:#x}, size={}, total_usage={}",
                ptr as usize,
                change.size,
                change.current_usage
            ),
            None => putln!("WARNING: Free of untracked pointer {:#x}", ptr as usize),
        });
    }

    pub fn malloc(&self, size: usize) -> *mut c_void {
        let ptr = self.allocator.malloc(size);
        self.record(ptr, size);
        ptr
    }

    pub fn calloc(&self, count: usize, size: usize) -> *mut c_void {
        let ptr = self.allocator.calloc(count, size);
        self.record(ptr, count.saturating_mul(size));
        ptr
    }

    /// # Safety
    ///
    /// `ptr` is null or a live block from this log's allocator.
    pub unsafe fn realloc(&self, ptr: *mut c_void, size: usize) -> *mut c_void {
        if ptr.is_null() {
            return self.malloc(size);
        }
        if size == 0 {
            self.free(ptr);
            return ptr::null_mut();
        }
        self.forget(ptr);
        let new = self.allocator.realloc(ptr, size);
        self.record(new, size);
        new
    }

    /// # Safety
    ///
    /// `ptr` is null or a live block from this log's allocator.
    pub unsafe fn free(&self, ptr: *mut c_void) {
        if ptr.is_null() {
            return;
        }
        self.forget(ptr);
        self.allocator.free(ptr);
    }

    pub fn write_summary<W: Write>(&self, w: &mut W) -> std::fmt::Result {
        self.with_table(|table| report::write_slot_summary(w, table, now()))
    }

    /// Hold the lock across `fork()`, so the child gets a whole table.
    pub fn before_fork(&self) {
        self.lock.acquire();
    }

    pub fn after_fork(&self, child: bool) {
        if child {
            self.lock.reset();
        } else {
            // SAFETY: `before_fork()` took it on this thread
            unsafe { self.lock.release() };
        }
    }

    pub fn active(&self) -> usize {
        self.with_table(|table| table.active())
    }

    pub fn stats(&self) -> crate::alloc::Stats {
        self.with_table(|table| *table.stats())
    }
}

pub(crate) static SLOT_LOG: SlotLog<NextAlloc, MAX_SLOTS> = SlotLog::new(NextAlloc);

#[no_mangle]
pub extern "C" fn memtrack_tracked_malloc(size: size_t) -> *mut c_void {
    SLOT_LOG.malloc(size)
}

#[no_mangle]
pub extern "C" fn memtrack_tracked_calloc(nmemb: size_t, size: size_t) -> *mut c_void {
    SLOT_LOG.calloc(nmemb, size)
}

#[no_mangle]
pub unsafe extern "C" fn memtrack_tracked_realloc(ptr: *mut c_void, size: size_t) -> *mut c_void {
    SLOT_LOG.realloc(ptr, size)
}

#[no_mangle]
pub unsafe extern "C" fn memtrack_tracked_free(ptr: *mut c_void) {
    SLOT_LOG.free(ptr)
}

#[no_mangle]
pub extern "C" fn memtrack_print_summary() {
    let mut out = LineBuf::<1024>::stderr();
    _ = SLOT_LOG.write_summary(&mut out);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::Libc;

    #[test]
    fn events_land_in_the_table() {
        let log = Box::new(SlotLog::<Libc, 16>::new(Libc));
        let a = log.malloc(100);
        let b = log.calloc(2, 50);
        assert_eq!(log.active(), 2);
        unsafe { log.free(a) };
        assert_eq!(log.active(), 1);
        assert_eq!(log.stats().current_usage, 100);

        let mut out = String::new();
        log.write_summary(&mut out).unwrap();
        assert!(out.contains(&format!("  {:#x}: 100 bytes (age: ", b as usize)));
        unsafe { log.free(b) };
    }

    #[test]
    fn usable_after_fork_in_both_processes() {
        let log = Box::new(SlotLog::<Libc, 16>::new(Libc));
        let kept = log.malloc(10);
        log.before_fork();
        let pid = unsafe { libc::fork() };
        assert!(pid >= 0);
        if pid == 0 {
            log.after_fork(true);
            unsafe { libc::alarm(2) };
            let code = if log.active() == 1 { 0 } else { 1 };
            unsafe { libc::_exit(code) };
        }
        log.after_fork(false);
        let mut status = 0;
        assert_eq!(unsafe { libc::waitpid(pid, &mut status, 0) }, pid);
        assert!(libc::WIFEXITED(status));
        assert_eq!(libc::WEXITSTATUS(status), 0);

        assert_eq!(log.active(), 1);
        unsafe { log.free(kept) };
    }

    #[test]
    fn realloc_moves_the_slot() {
        let log = Box::new(SlotLog::<Libc, 16>::new(Libc));
        let ptr = log.malloc(50);
        let new = unsafe { log.realloc(ptr, 150) };
        assert!(!new.is_null());
        let stats = log.stats();
        assert_eq!(stats.current_usage, 150);
        assert_eq!(stats.allocation_count, 2);
        assert_eq!(stats.free_count, 1);
        assert!(unsafe { log.realloc(new, 0) }.is_null());
        assert_eq!(log.active(), 0);
    }

    #[test]
    fn overflow_keeps_the_block_but_not_the_record() {
        let log = Box::new(SlotLog::<Libc, 2>::new(Libc));
        let ptrs: Vec<_> = (0..3).map(|_| log.malloc(8)).collect();
        assert!(ptrs.iter().all(|ptr| !ptr.is_null()));
        assert_eq!(log.active(), 2);
        for ptr in ptrs {
            unsafe { log.free(ptr) };
        }
        assert_eq!(log.active(), 0);
        assert_eq!(log.stats().untracked_frees, 1);
    }

    #[test]
    fn summary_of_nothing() {
        let log = Box::new(SlotLog::<Libc, 4>::new(Libc));
        let mut out = String::new();
        log.write_summary(&mut out).unwrap();
        assert!(out.contains("No memory leaks detected!"));
    }
}

//! Binding to the allocator that was underneath us before we got preloaded.
//!
//! Resolving `malloc` with `dlsym()` is itself allowed to allocate (glibc's
//! `dlsym()` will `calloc()` an error buffer the first time around), and that
//! allocation lands right back in our own `calloc()`. So the binding is a tiny
//! state machine:
//!
//! ```plaintext
//! Unbound --(first caller wins CAS)--> Binding --+--> Bound
//!                                                +--> Failed
//! ```
//!
//! Anything that asks for the real allocator while we are still `Binding`
//! (the resolver re-entering us, or another thread racing the first caller)
//! is handed glibc's `__libc_*` entry points instead. Those are always there,
//! never recurse into us, and hand out blocks that the real `free()` accepts.

use std::{
    cell::UnsafeCell,
    ffi::{c_void, CStr},
    mem::{self, MaybeUninit},
    sync::atomic::{AtomicU8, Ordering},
};

use libc::size_t;
use thiserror::Error;

use crate::{alloc::raw::RealAlloc, putln, util::hint::cold};

pub type MallocFn = unsafe extern "C" fn(size_t) -> *mut c_void;
pub type FreeFn = unsafe extern "C" fn(*mut c_void);
pub type CallocFn = unsafe extern "C" fn(size_t, size_t) -> *mut c_void;
pub type ReallocFn = unsafe extern "C" fn(*mut c_void, size_t) -> *mut c_void;
pub type MemalignFn = unsafe extern "C" fn(size_t, size_t) -> *mut c_void;

extern "C" {
    fn __libc_malloc(size: size_t) -> *mut c_void;
    fn __libc_free(ptr: *mut c_void);
    fn __libc_calloc(nmemb: size_t, size: size_t) -> *mut c_void;
    fn __libc_realloc(ptr: *mut c_void, size: size_t) -> *mut c_void;
    fn __libc_memalign(align: size_t, size: size_t) -> *mut c_void;
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum BindError {
    #[error("could not resolve `{}` with dlsym(RTLD_NEXT)", symbol_name(.0))]
    MissingSymbol(&'static CStr),
}

fn symbol_name(name: &CStr) -> &str {
    name.to_str().unwrap_or("<non-utf8>")
}

/// The real allocation primitives.
#[derive(Clone, Copy)]
pub struct BindingTable {
    pub malloc: MallocFn,
    pub free: FreeFn,
    pub calloc: CallocFn,
    pub realloc: ReallocFn,
    pub memalign: MemalignFn,
}

impl BindingTable {
    /// glibc's own allocator entry points. Used while binding is in progress
    /// and after it failed.
    pub const LIBC: Self = Self {
        malloc: __libc_malloc,
        free: __libc_free,
        calloc: __libc_calloc,
        realloc: __libc_realloc,
        memalign: __libc_memalign,
    };

    /// Look up the next definition of every primitive in the dynamic linking
    /// search order.
    pub fn resolve_next() -> Result<Self, BindError> {
        // SAFETY: every symbol is looked up by its C name, and each of these
        // has exactly the signature of the fn pointer type it is cast to.
        unsafe {
            Ok(Self {
                malloc: mem::transmute::<*mut c_void, MallocFn>(next_symbol(c"malloc")?),
                free: mem::transmute::<*mut c_void, FreeFn>(next_symbol(c"free")?),
                calloc: mem::transmute::<*mut c_void, CallocFn>(next_symbol(c"calloc")?),
                realloc: mem::transmute::<*mut c_void, ReallocFn>(next_symbol(c"realloc")?),
                memalign: mem::transmute::<*mut c_void, MemalignFn>(next_symbol(c"memalign")?),
            })
        }
    }
}

fn next_symbol(name: &'static CStr) -> Result<*mut c_void, BindError> {
    // SAFETY: `name` is NUL-terminated and RTLD_NEXT is a valid pseudo-handle.
    let sym = unsafe { libc::dlsym(libc::RTLD_NEXT, name.as_ptr()) };
    if sym.is_null() {
        Err(BindError::MissingSymbol(name))
    } else {
        Ok(sym)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum BindingState {
    /// Nobody has tried to bind yet
    Unbound,
    /// Some thread is inside the resolver right now. This is the state that
    /// re-entrant calls from `dlsym()` observe.
    Binding,
    /// The table is populated and will never change again
    Bound,
    /// Resolution failed; tracking stays off for the life of the process
    Failed,
}

impl BindingState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Unbound,
            1 => Self::Binding,
            2 => Self::Bound,
            _ => Self::Failed,
        }
    }
}

/// A write-once [`BindingTable`] whose state can be polled mid-initialization.
pub struct BindingCell {
    state: AtomicU8,
    table: UnsafeCell<MaybeUninit<BindingTable>>,
}

// SAFETY: `table` is written exactly once, by the thread that won the
// Unbound -> Binding transition, and only read after `state` is Bound (with
// Release/Acquire pairing on `state`).
unsafe impl Sync for BindingCell {}

impl BindingCell {
    pub const fn new() -> Self {
        Self {
            state: AtomicU8::new(BindingState::Unbound as u8),
            table: UnsafeCell::new(MaybeUninit::uninit()),
        }
    }

    pub fn state(&self) -> BindingState {
        BindingState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Bind with `resolve` if nobody has yet. Returns the state as seen by
    /// this caller: `Binding` means someone (possibly us, further up the
    /// stack) is resolving right now and the caller should pass through.
    pub fn ensure_bound_with<F>(&self, resolve: F) -> BindingState
    where
        F: FnOnce() -> Result<BindingTable, BindError>,
    {
        let state = self.state();
        if state != BindingState::Unbound {
            return state;
        }
        if self
            .state
            .compare_exchange(
                BindingState::Unbound as u8,
                BindingState::Binding as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return self.state();
        }

        match resolve() {
            Ok(table) => {
                // SAFETY: we won the CAS, so nobody else writes, and nobody
                // reads until `Bound` is published below.
                unsafe { (*self.table.get()).write(table) };
                self.state
                    .store(BindingState::Bound as u8, Ordering::Release);
                BindingState::Bound
            }
            Err(err) => cold(|| {
                putln!("Memory Tracker: {err}; tracking disabled");
                self.state
                    .store(BindingState::Failed as u8, Ordering::Release);
                BindingState::Failed
            }),
        }
    }

    /// The bound table, or [`BindingTable::LIBC`] if we are not `Bound`.
    pub fn table(&self) -> &BindingTable {
        if self.state() == BindingState::Bound {
            // SAFETY: `Bound` is only published after the table is written.
            unsafe { (*self.table.get()).assume_init_ref() }
        } else {
            &BindingTable::LIBC
        }
    }
}

static BINDING: BindingCell = BindingCell::new();

/// Bind the process-wide table against `RTLD_NEXT`. Idempotent.
pub fn ensure_bound() -> BindingState {
    BINDING.ensure_bound_with(BindingTable::resolve_next)
}

pub fn state() -> BindingState {
    BINDING.state()
}

/// The real allocator for this process, right now.
pub fn real() -> &'static BindingTable {
    BINDING.table()
}

/// [`RealAlloc`] over the process-wide binding. Asking whether it is ready
/// is what triggers the one-time binding.
#[derive(Clone, Copy, Default)]
pub struct NextAlloc;

// SAFETY: every call goes to either the RTLD_NEXT allocator or glibc's own,
// both of which are general purpose C allocators.
unsafe impl RealAlloc for NextAlloc {
    fn ready(&self) -> bool {
        ensure_bound() == BindingState::Bound
    }

    fn malloc(&self, size: usize) -> *mut c_void {
        unsafe { (real().malloc)(size) }
    }

    fn calloc(&self, count: usize, size: usize) -> *mut c_void {
        unsafe { (real().calloc)(count, size) }
    }

    fn memalign(&self, align: usize, size: usize) -> *mut c_void {
        unsafe { (real().memalign)(align, size) }
    }

    unsafe fn realloc(&self, ptr: *mut c_void, size: usize) -> *mut c_void {
        (real().realloc)(ptr, size)
    }

    unsafe fn free(&self, ptr: *mut c_void) {
        (real().free)(ptr)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    fn same_malloc(a: &BindingTable, b: &BindingTable) -> bool {
        a.malloc as usize == b.malloc as usize
    }

    #[test]
    fn resolve_next_finds_every_primitive() {
        let table = BindingTable::resolve_next().unwrap();
        let ptr = unsafe { (table.malloc)(32) };
        assert!(!ptr.is_null());
        let ptr = unsafe { (table.realloc)(ptr, 64) };
        assert!(!ptr.is_null());
        unsafe { (table.free)(ptr) };
    }

    #[test]
    fn binding_is_idempotent() {
        let cell = BindingCell::new();
        let calls = AtomicUsize::new(0);
        let resolve = || {
            calls.fetch_add(1, Ordering::Relaxed);
            BindingTable::resolve_next()
        };
        assert_eq!(cell.ensure_bound_with(resolve), BindingState::Bound);
        for _ in 0..4 {
            assert_eq!(
                cell.ensure_bound_with(|| panic!("resolved twice")),
                BindingState::Bound
            );
        }
        assert_eq!(calls.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn reentrant_calls_during_binding_pass_through() {
        let cell = BindingCell::new();
        let state = cell.ensure_bound_with(|| {
            // This is what a `calloc()` from inside `dlsym()` would see
            assert_eq!(cell.state(), BindingState::Binding);
            assert_eq!(
                cell.ensure_bound_with(|| panic!("recursed into the resolver")),
                BindingState::Binding
            );
            assert!(same_malloc(cell.table(), &BindingTable::LIBC));
            Ok(BindingTable::LIBC)
        });
        assert_eq!(state, BindingState::Bound);
    }

    #[test]
    fn failed_binding_falls_back_to_libc() {
        let cell = BindingCell::new();
        let state = cell.ensure_bound_with(|| Err(BindError::MissingSymbol(c"malloc")));
        assert_eq!(state, BindingState::Failed);
        assert_eq!(cell.ensure_bound_with(BindingTable::resolve_next), BindingState::Failed);
        assert!(same_malloc(cell.table(), &BindingTable::LIBC));
    }

    #[test]
    fn concurrent_first_callers_resolve_once() {
        let cell = BindingCell::new();
        let calls = AtomicUsize::new(0);
        crossbeam::scope(|s| {
            for _ in 0..8 {
                s.spawn(|_| {
                    let state = cell.ensure_bound_with(|| {
                        calls.fetch_add(1, Ordering::Relaxed);
                        BindingTable::resolve_next()
                    });
                    assert!(matches!(state, BindingState::Bound | BindingState::Binding));
                });
            }
        })
        .unwrap();
        assert_eq!(calls.load(Ordering::Relaxed), 1);
        assert_eq!(cell.state(), BindingState::Bound);
    }

    #[test]
    fn bind_error_names_the_symbol() {
        let err = BindError::MissingSymbol(c"realloc");
        assert_eq!(
            err.to_string(),
            "could not resolve `realloc` with dlsym(RTLD_NEXT)"
        );
    }
}

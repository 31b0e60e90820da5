//! The C allocator entry points that `LD_PRELOAD` puts in front of libc's.
//!
//! They are compiled out of test builds so that the test harness keeps the
//! system allocator.

pub mod tracked;

use libc::{c_int, c_void};
#[cfg(not(test))]
use libc::size_t;

#[cfg(not(test))]
use crate::{lifecycle::CONTEXT, stack::EntryFrame};

/// `posix_memalign()` wants a power of two that is also a multiple of
/// `sizeof(void *)`.
fn is_posix_alignment(align: usize) -> bool {
    align.is_power_of_two() && align % std::mem::size_of::<*mut c_void>() == 0
}

/// Validate and run a `posix_memalign()`: `EINVAL` for a bad alignment,
/// `ENOMEM` when `alloc` returns null, `0` with `*out` set otherwise.
///
/// # Safety
///
/// `out` is valid for a pointer-sized write.
unsafe fn posix_memalign_with(
    out: *mut *mut c_void,
    align: usize,
    size: usize,
    alloc: impl FnOnce(usize, usize) -> *mut c_void,
) -> c_int {
    if !is_posix_alignment(align) {
        return libc::EINVAL;
    }
    let ptr = alloc(align, size);
    if ptr.is_null() {
        return libc::ENOMEM;
    }
    *out = ptr;
    0
}

fn set_errno(err: c_int) {
    // SAFETY: the thread's errno slot is always valid
    unsafe { *libc::__errno_location() = err };
}

#[cfg(not(test))]
#[no_mangle]
pub unsafe extern "C" fn malloc(size: size_t) -> *mut c_void {
    CONTEXT.init();
    let _entry = EntryFrame::enter();
    CONTEXT.tracker().allocate(size)
}

#[cfg(not(test))]
#[no_mangle]
pub unsafe extern "C" fn calloc(nmemb: size_t, size: size_t) -> *mut c_void {
    CONTEXT.init();
    let _entry = EntryFrame::enter();
    CONTEXT.tracker().zero_allocate(nmemb, size)
}

#[cfg(not(test))]
#[no_mangle]
pub unsafe extern "C" fn realloc(ptr: *mut c_void, size: size_t) -> *mut c_void {
    CONTEXT.init();
    let _entry = EntryFrame::enter();
    CONTEXT.tracker().reallocate(ptr, size)
}

#[cfg(not(test))]
#[no_mangle]
pub unsafe extern "C" fn free(ptr: *mut c_void) {
    CONTEXT.init();
    CONTEXT.tracker().deallocate(ptr)
}

#[cfg(not(test))]
#[no_mangle]
pub unsafe extern "C" fn memalign(align: size_t, size: size_t) -> *mut c_void {
    CONTEXT.init();
    let _entry = EntryFrame::enter();
    CONTEXT.tracker().aligned_allocate(align, size)
}

#[cfg(not(test))]
#[no_mangle]
pub unsafe extern "C" fn aligned_alloc(align: size_t, size: size_t) -> *mut c_void {
    CONTEXT.init();
    let _entry = EntryFrame::enter();
    if !align.is_power_of_two() {
        set_errno(libc::EINVAL);
        return std::ptr::null_mut();
    }
    CONTEXT.tracker().aligned_allocate(align, size)
}

#[cfg(not(test))]
#[no_mangle]
pub unsafe extern "C" fn posix_memalign(
    memptr: *mut *mut c_void,
    align: size_t,
    size: size_t,
) -> c_int {
    CONTEXT.init();
    let _entry = EntryFrame::enter();
    posix_memalign_with(memptr, align, size, |align, size| {
        CONTEXT.tracker().aligned_allocate(align, size)
    })
}

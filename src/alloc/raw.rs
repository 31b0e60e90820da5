use std::{
    ffi::c_void,
    mem::{align_of, size_of},
    ptr::{self, NonNull},
};

/// The allocator *underneath* the tracker. Anything the tracker needs for its
/// own bookkeeping comes from here, never from the (instrumented) global
/// `malloc()`, otherwise every metadata node would recurse back into us.
///
/// # Safety
///
/// Implementors must behave like the C allocator functions of the same name:
/// `malloc()` et al. return null or a block aligned to at least
/// `2 * size_of::<usize>()`, and `free()`/`realloc()` accept any block that
/// this same implementation returned.
pub unsafe trait RealAlloc {
    /// Whether the primitives are the *real* ones yet. When this returns
    /// `false` the caller must pass straight through without tracking.
    fn ready(&self) -> bool {
        true
    }

    fn malloc(&self, size: usize) -> *mut c_void;

    fn calloc(&self, count: usize, size: usize) -> *mut c_void;

    fn memalign(&self, align: usize, size: usize) -> *mut c_void;

    /// # Safety
    ///
    /// `ptr` is null or was returned by this allocator and not yet freed.
    unsafe fn realloc(&self, ptr: *mut c_void, size: usize) -> *mut c_void;

    /// # Safety
    ///
    /// `ptr` is null or was returned by this allocator and not yet freed.
    unsafe fn free(&self, ptr: *mut c_void);
}

/// Plain libc. Only correct in a process where `malloc` is *not* the
/// interposed one, e.g. a test binary or a statically linked user of
/// `memtrack_tracked_*`.
#[derive(Clone, Copy, Default)]
pub struct Libc;

// SAFETY: these are the C allocator functions themselves.
unsafe impl RealAlloc for Libc {
    fn malloc(&self, size: usize) -> *mut c_void {
        unsafe { libc::malloc(size) }
    }

    fn calloc(&self, count: usize, size: usize) -> *mut c_void {
        unsafe { libc::calloc(count, size) }
    }

    fn memalign(&self, align: usize, size: usize) -> *mut c_void {
        unsafe { libc::memalign(align, size) }
    }

    unsafe fn realloc(&self, ptr: *mut c_void, size: usize) -> *mut c_void {
        libc::realloc(ptr, size)
    }

    unsafe fn free(&self, ptr: *mut c_void) {
        libc::free(ptr)
    }
}

/// An initialized, owning pointer to a `T` that lives in a [`RealAlloc`]
/// block. There is no RAII -- you must hand it back with [`Raw::free_in`].
pub struct Raw<T> {
    data: NonNull<T>,
}

impl<T> Raw<T> {
    /// Move `val` into a fresh block from `alloc`. Returns `None` (dropping
    /// `val`) if the allocator is out of memory.
    pub fn new_in<A: RealAlloc>(val: T, alloc: &A) -> Option<Self> {
        debug_assert!(align_of::<T>() <= 2 * size_of::<usize>());
        let data = NonNull::new(alloc.malloc(size_of::<T>()).cast::<T>())?;
        // SAFETY:
        // - `data` is non-null and large enough for a `T`
        // - `RealAlloc` guarantees the block is suitably aligned
        // - nobody else has this pointer yet
        unsafe { ptr::write(data.as_ptr(), val) };
        Some(Self { data })
    }

    /// # Safety
    ///
    /// `ptr` must have come from [`Raw::into_ptr`] and not been freed since.
    pub unsafe fn from_ptr(ptr: *mut T) -> Option<Self> {
        NonNull::new(ptr).map(|data| Self { data })
    }

    /// Give up ownership, e.g. to link this into an intrusive list.
    pub fn into_ptr(self) -> *mut T {
        self.data.as_ptr()
    }

    /// Move the value back out and release the block to `alloc`, which must be
    /// the allocator this came from.
    pub fn free_in<A: RealAlloc>(self, alloc: &A) -> T {
        // SAFETY:
        // - This is a unique, initialized pointer, so reading it out is fine,
        //   by the same logic as `Box::into_inner`
        // - The block is never touched again after the read
        unsafe {
            let val = ptr::read(self.data.as_ptr());
            alloc.free(self.data.as_ptr().cast());
            val
        }
    }
}

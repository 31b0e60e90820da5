/// Run `f` out of line, on a path the optimizer should treat as unlikely.
#[cold]
#[inline(never)]
pub fn cold<R, F: FnOnce() -> R>(f: F) -> R {
    f()
}

//! Runtime switches, read from the environment when the library loads.

use std::ffi::CStr;

pub const ENABLE_VAR: &CStr = c"MEMTRACK_ENABLE";
pub const VERBOSE_VAR: &CStr = c"MEMTRACK_VERBOSE";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Config {
    /// Track allocations at all. On unless explicitly turned off.
    pub enabled: bool,
    /// Print a line for every tracked allocation and free
    pub verbose: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            enabled: true,
            verbose: false,
        }
    }
}

impl Config {
    /// Read the process environment. Uses `getenv()` directly so nothing is
    /// copied onto the heap.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| {
            // SAFETY: `name` is NUL-terminated, and a non-null result points
            // into the environment block, which we only read from here.
            let value = unsafe { libc::getenv(name.as_ptr()) };
            (!value.is_null()).then(|| unsafe { CStr::from_ptr(value) }.to_bytes())
        })
    }

    pub fn from_lookup<'a, F>(lookup: F) -> Self
    where
        F: Fn(&CStr) -> Option<&'a [u8]>,
    {
        let default = Self::default();
        Self {
            enabled: lookup(ENABLE_VAR).map_or(default.enabled, parse_flag),
            verbose: lookup(VERBOSE_VAR).map_or(default.verbose, parse_flag),
        }
    }
}

/// `0`, `false`, `no` and `off` (any case, surrounding whitespace ignored)
/// are false; anything else is true.
pub fn parse_flag(value: &[u8]) -> bool {
    let value = value.trim_ascii();
    const FALSY: [&[u8]; 4] = [b"0", b"false", b"no", b"off"];
    !FALSY.iter().any(|falsy| value.eq_ignore_ascii_case(falsy))
}

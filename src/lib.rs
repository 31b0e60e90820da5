//! A heap allocation tracker for `LD_PRELOAD`.
//!
//! Loaded in front of libc, this library takes over `malloc()`, `calloc()`,
//! `realloc()`, `free()` and the aligned variants, records every live block
//! with the call stack that allocated it, and prints a leak report when the
//! process exits (or is interrupted by SIGINT/SIGTERM).
//!
//! ```sh
//! LD_PRELOAD=./libmemtrack.so ./my_program
//! ```
//!
//! Everything the tracker needs for itself comes from the allocator it
//! displaced (see [`binding`]), never from the interposed entry points.

pub mod alloc;
pub mod binding;
pub mod config;
pub mod externc;
pub mod lifecycle;
pub mod report;
pub mod stack;
pub mod util;

pub mod lock;
pub mod raw;
pub mod registry;
pub mod slots;
pub mod stats;
pub mod tracker;

pub use raw::{Libc, RealAlloc};
pub use registry::{AllocationRecord, Registry};
pub use stats::{Change, Stats};
pub use tracker::{ReentryGuard, Tracker};

//! Cache entries: one process-wide record per path, one local view per worker.

pub mod global;
pub mod local;

pub use global::{CachedRecord, DEFAULT_AWAIT_TIMEOUT, GlobalCacheEntry, Lifecycle, Registration};
pub use local::{DEFAULT_MAX_AGE, LocalCacheEntry};

//! "Does this endpoint require auth?" probing with a TTL cache.

mod cache;
mod prober;

pub use cache::{DEFAULT_MAX_CACHE_ENTRIES, ProbeCache, ProbeCacheStats};
pub use prober::{AuthProbe, ProbeConfig};

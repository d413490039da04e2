//! Session-to-identity bindings.
//!
//! A [`SessionRegistry`] remembers which identity authenticated a transport
//! session so later requests on that session need no credentials. Bindings
//! expire after a TTL, are evicted least-recently-used when the registry is
//! full, and can be revoked.

mod binding;
mod registry;
mod sweeper;

pub use binding::{SessionBinding, SessionStatus};
pub use registry::{
    BindOptions, DEFAULT_CLEANUP_INTERVAL_SECONDS, DEFAULT_SESSION_TTL_SECONDS, EVICTION_BATCH,
    SessionRegistry, SessionRegistryConfig, SessionStats,
};
pub use sweeper::SweepReport;

//! Token directory storage
//!
//! Maps opaque tokens to service locations with a registry-wide time-to-live.
//! Expiry is computed on every lookup; the periodic sweep only reclaims memory.

pub mod record;
pub mod registry;
pub mod sweeper;

pub use record::ServiceRecord;
pub use registry::{Lookup, LookupError, Registry, RegistryError};
pub use sweeper::spawn_sweeper;

/// Default interval between two sweeps of expired records
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 10;

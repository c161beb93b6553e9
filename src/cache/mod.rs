//! Caching layer
//!
//! - `TtlCache`: generic store with per-entry expiry and lazy eviction
//! - `DashboardCache`: per-domain TTL caches filled by loaders and live updates

mod dashboard;
mod ttl;

pub use dashboard::{DashboardCache, DashboardConfig, Domain, DomainStatus, LiveUpdateSink};
pub use ttl::{CacheEntry, CacheStats, TtlCache};

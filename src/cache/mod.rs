//! Time-windowed cache for schedule fetches.
//!
//! This module provides:
//! - Normalized request keys, so logically identical requests share one entry
//! - A TTL store whose entries are replaced wholesale, never merged
//! - Staleness derived from entry age, for serve-then-refresh reads
//! - A background sweep that drops expired entries

mod key;
mod store;

pub use key::{normalize_date, RequestKey, ScheduleParams};
pub use store::{CacheEntry, CacheStats, CacheStore};

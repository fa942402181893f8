//! Backend discovery through DNS SRV records.
//!
//! This module provides:
//! - The `SrvResolver` interface with hickory and mock implementations
//! - The discovery cache with hit/miss resolution, refresh and idle eviction
//! - JSON persistence of the cache
//!
//! ## Lookup
//!
//! ```text
//! hostname -> cache hit? -> backend
//!                 | miss
//!                 v
//!   SRV _pdcache._tcp.<hostname> -> first record -> cache + persist -> backend
//! ```

mod cache;
mod mock;
mod persistence;
mod resolver;

use thiserror::Error;

pub use cache::{Backend, CacheEntry, CacheStats, DiscoveryCache, RefreshReport, DEFAULT_IDLE_TTL};
pub use mock::MockSrvResolver;
pub use persistence::{CacheFile, PersistedBackend, PersistedCache};
pub use resolver::{srv_name, HickorySrvResolver, SrvRecord, SrvResolver, SRV_SERVICE};

/// Discovery errors.
#[derive(Debug, Clone, Error)]
pub enum DiscoveryError {
    /// The SRV query failed (timeout, SERVFAIL, unreachable nameserver).
    #[error("DNS lookup failed for {name}: {reason}")]
    DnsLookupFailed { name: String, reason: String },

    /// The SRV query succeeded with no records.
    #[error("no SRV records found for {name}")]
    NoRecords { name: String },
}

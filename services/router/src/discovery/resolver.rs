//! DNS SRV lookups for backend discovery.

use std::net::SocketAddr;

use async_trait::async_trait;
use hickory_resolver::config::{NameServerConfigGroup, ResolverConfig, ResolverOpts};
use hickory_resolver::error::ResolveErrorKind;
use hickory_resolver::TokioAsyncResolver;
use tracing::debug;

use super::DiscoveryError;

/// Service label prepended to every hostname.
pub const SRV_SERVICE: &str = "_pdcache._tcp";

/// SRV query name for a routed hostname.
pub fn srv_name(hostname: &str) -> String {
    format!("{SRV_SERVICE}.{hostname}")
}

/// One SRV answer, reduced to what routing needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SrvRecord {
    /// Target host, without the trailing root dot.
    pub target: String,
    pub port: u16,
}

impl SrvRecord {
    pub fn new(target: impl Into<String>, port: u16) -> Self {
        Self {
            target: target.into(),
            port,
        }
    }
}

/// SRV lookup interface.
///
/// Records are returned in answer order; callers take the first one.
#[async_trait]
pub trait SrvResolver: Send + Sync {
    async fn lookup_srv(&self, name: &str) -> Result<Vec<SrvRecord>, DiscoveryError>;
}

/// SRV resolver backed by hickory.
pub struct HickorySrvResolver {
    resolver: TokioAsyncResolver,
}

impl HickorySrvResolver {
    /// Query a single nameserver over UDP/TCP.
    pub fn with_nameserver(addr: SocketAddr) -> Self {
        let group = NameServerConfigGroup::from_ips_clear(&[addr.ip()], addr.port(), true);
        let config = ResolverConfig::from_parts(None, Vec::new(), group);
        Self {
            resolver: TokioAsyncResolver::tokio(config, ResolverOpts::default()),
        }
    }

    /// Use the host's resolver configuration (`/etc/resolv.conf`).
    pub fn from_system_conf() -> Result<Self, DiscoveryError> {
        let resolver = TokioAsyncResolver::tokio_from_system_conf().map_err(|e| {
            DiscoveryError::DnsLookupFailed {
                name: "<system config>".to_string(),
                reason: e.to_string(),
            }
        })?;
        Ok(Self { resolver })
    }
}

#[async_trait]
impl SrvResolver for HickorySrvResolver {
    async fn lookup_srv(&self, name: &str) -> Result<Vec<SrvRecord>, DiscoveryError> {
        match self.resolver.srv_lookup(name).await {
            Ok(lookup) => {
                let records: Vec<SrvRecord> = lookup
                    .iter()
                    .map(|srv| {
                        let target = srv.target().to_utf8();
                        SrvRecord::new(target.trim_end_matches('.'), srv.port())
                    })
                    .collect();
                debug!(name, record_count = records.len(), "SRV lookup answered");
                Ok(records)
            }
            Err(e) => match e.kind() {
                ResolveErrorKind::NoRecordsFound { .. } => Ok(Vec::new()),
                _ => Err(DiscoveryError::DnsLookupFailed {
                    name: name.to_string(),
                    reason: e.to_string(),
                }),
            },
        }
    }
}

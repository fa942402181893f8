//! pdcache router library.
//!
//! Terminates TLS for many hostnames on one port, discovers each hostname's
//! backend through DNS SRV, and relays the decrypted stream to it.

pub mod config;
pub mod discovery;
pub mod error;
pub mod maintenance;
pub mod proxy;
pub mod redirect;
pub mod tls;

pub use config::{CertConfig, Config, ConfigError};
pub use discovery::{
    Backend, CacheFile, DiscoveryCache, DiscoveryError, HickorySrvResolver, MockSrvResolver,
    SrvRecord, SrvResolver,
};
pub use error::RouterError;
pub use proxy::{Listener, ListenerConfig, ListenerStats, StreamProxy};
pub use tls::{CertificateEntry, CertificateStore, CertificateTable};

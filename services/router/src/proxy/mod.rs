//! TLS-terminating SNI proxy.
//!
//! This module provides:
//! - TLS listener with per-handshake certificate selection
//! - Backend connection and bidirectional relay
//! - X-Forwarded-For injection on plaintext HTTP requests
//!
//! ## Architecture
//!
//! ```text
//! Client -> Listener -> CertificateStore (by SNI) -> DiscoveryCache -> Backend
//!                                                                        |
//!                                               X-Forwarded-For (HTTP requests only)
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! use pdcache_router::proxy::{Listener, ListenerConfig};
//!
//! let config = ListenerConfig::new("[::]:443".parse()?);
//! let listener = Listener::bind(config, certs, cache).await?;
//! Arc::new(listener).run().await?;
//! ```

mod listener;
mod relay;
mod sniff;

pub use listener::{
    Listener, ListenerConfig, ListenerStats, DEFAULT_HANDSHAKE_TIMEOUT, DEFAULT_MAX_CONNECTIONS,
};
pub use relay::{RelayStats, StreamProxy};
pub use sniff::{classify, client_ip, inject_forwarded_for, rewrite_chunk, ChunkKind};

//! Per-connection error types.

use std::io;

use thiserror::Error;

use crate::discovery::DiscoveryError;
use crate::tls::TlsError;

/// Reasons a routed connection ends early.
///
/// Every variant is terminal for its connection only; none is retried.
#[derive(Debug, Error)]
pub enum RouterError {
    /// TLS negotiation failed or the ClientHello was unreadable.
    #[error("handshake failed: {0}")]
    Handshake(#[source] io::Error),

    /// TLS negotiation did not finish in time.
    #[error("handshake timed out")]
    HandshakeTimeout,

    /// ClientHello carried no server name.
    #[error("client sent no SNI hostname")]
    NoSni,

    /// No configured pattern matches the SNI hostname.
    #[error("no certificate for {0}")]
    CertificateNotFound(String),

    /// Certificate or key file could not be loaded.
    #[error("certificate load failed: {0}")]
    CertificateLoad(#[from] TlsError),

    /// SRV discovery failed.
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),

    /// TCP connect to the resolved backend failed.
    #[error("backend connect to {backend} failed: {source}")]
    BackendConnect {
        backend: String,
        #[source]
        source: io::Error,
    },

    /// Read or write error mid-session.
    #[error("stream error: {0}")]
    Stream(#[source] io::Error),
}

impl RouterError {
    /// Stable reason code for logs.
    pub fn reason_code(&self) -> &'static str {
        match self {
            RouterError::Handshake(_) => "handshake_failed",
            RouterError::HandshakeTimeout => "handshake_timeout",
            RouterError::NoSni => "no_sni",
            RouterError::CertificateNotFound(_) => "certificate_not_found",
            RouterError::CertificateLoad(_) => "certificate_load_failed",
            RouterError::Discovery(DiscoveryError::DnsLookupFailed { .. }) => "dns_lookup_failed",
            RouterError::Discovery(DiscoveryError::NoRecords { .. }) => "no_records",
            RouterError::BackendConnect { .. } => "backend_connect_failed",
            RouterError::Stream(_) => "stream_error",
        }
    }
}

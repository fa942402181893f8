//! Swappable certificate table and per-handshake key material loading.

use std::path::Path;
use std::sync::Arc;

use arc_swap::ArcSwap;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::ServerConfig;
use thiserror::Error;
use tracing::{debug, info};

use super::table::{CertificateEntry, CertificateTable};
use crate::config::{CertConfig, ConfigError};

/// Errors turning a certificate entry into a TLS server configuration.
#[derive(Debug, Error)]
pub enum TlsError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid PEM in {path}: {source}")]
    Pem {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("no certificates in {0}")]
    NoCertificates(String),

    #[error("no private key in {0}")]
    NoPrivateKey(String),

    #[error("TLS configuration rejected: {0}")]
    Config(#[from] rustls::Error),
}

/// Process-wide certificate table.
///
/// Uses ArcSwap so a reload never blocks handshakes in progress; each
/// lookup sees one complete table.
pub struct CertificateStore {
    table: ArcSwap<CertificateTable>,
    provider: Arc<CryptoProvider>,
}

impl CertificateStore {
    /// Create a store serving `table`.
    pub fn new(table: CertificateTable) -> Self {
        Self {
            table: ArcSwap::from_pointee(table),
            provider: Arc::new(rustls::crypto::ring::default_provider()),
        }
    }

    /// Load the initial table from the certificate configuration file.
    pub async fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let table = CertConfig::load(path).await?.into_table();
        info!(
            path = %path.display(),
            pattern_count = table.pattern_count(),
            "Certificate configuration loaded"
        );
        Ok(Self::new(table))
    }

    /// Find the certificate entry serving `hostname`.
    pub fn lookup(&self, hostname: &str) -> Option<CertificateEntry> {
        let table = self.table.load();
        match table.lookup_with_origin(hostname) {
            Some((group, pattern, entry)) => {
                debug!(hostname, group, pattern, "Certificate matched");
                Some(entry.clone())
            }
            None => None,
        }
    }

    /// Replace the whole table atomically.
    pub fn replace(&self, table: CertificateTable) {
        let pattern_count = table.pattern_count();
        self.table.store(Arc::new(table));
        debug!(pattern_count, "Certificate table swapped");
    }

    /// Re-read the configuration file and swap the table in.
    ///
    /// On error the current table stays in place.
    pub async fn reload(&self, path: &Path) -> Result<usize, ConfigError> {
        let table = CertConfig::load(path).await?.into_table();
        let pattern_count = table.pattern_count();
        self.replace(table);
        Ok(pattern_count)
    }

    /// Number of patterns in the current table.
    pub fn pattern_count(&self) -> usize {
        self.table.load().pattern_count()
    }

    /// Read the entry's PEM files and build a server configuration for one
    /// handshake.
    pub async fn server_config(&self, entry: &CertificateEntry) -> Result<ServerConfig, TlsError> {
        let certs = load_certs(&entry.cert_path).await?;
        let key = load_private_key(&entry.key_path).await?;

        let config = ServerConfig::builder_with_provider(Arc::clone(&self.provider))
            .with_safe_default_protocol_versions()?
            .with_no_client_auth()
            .with_single_cert(certs, key)?;

        Ok(config)
    }
}

async fn read_file(path: &Path) -> Result<Vec<u8>, TlsError> {
    tokio::fs::read(path).await.map_err(|source| TlsError::Read {
        path: path.display().to_string(),
        source,
    })
}

/// Load a PEM certificate chain.
async fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let pem = read_file(path).await?;
    let certs = rustls_pemfile::certs(&mut pem.as_slice())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| TlsError::Pem {
            path: path.display().to_string(),
            source,
        })?;

    if certs.is_empty() {
        return Err(TlsError::NoCertificates(path.display().to_string()));
    }
    Ok(certs)
}

/// Load the first private key (PKCS#8, PKCS#1 or SEC1) from a PEM file.
async fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, TlsError> {
    let pem = read_file(path).await?;
    rustls_pemfile::private_key(&mut pem.as_slice())
        .map_err(|source| TlsError::Pem {
            path: path.display().to_string(),
            source,
        })?
        .ok_or_else(|| TlsError::NoPrivateKey(path.display().to_string()))
}

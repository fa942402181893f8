//! TLS termination support.
//!
//! This module provides:
//! - Wildcard hostname pattern matching
//! - The ordered certificate table consulted at handshake time
//! - An atomically reloadable store that loads PEM key material per handshake

mod store;
mod table;
pub mod wildcard;

pub use store::{CertificateStore, TlsError};
pub use table::{CertificateEntry, CertificateTable};

/// Normalize a hostname for matching.
///
/// - Convert to lowercase
/// - Trim trailing dot
pub fn normalize_hostname(hostname: &str) -> String {
    hostname.to_lowercase().trim_end_matches('.').to_string()
}

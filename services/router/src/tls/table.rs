//! Certificate table: hostname pattern -> certificate/key file references.

use std::path::PathBuf;

use super::{normalize_hostname, wildcard};

/// References to a PEM certificate chain and its private key.
///
/// The files are read at handshake time, so a renewed certificate on disk is
/// served without a reload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateEntry {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

impl CertificateEntry {
    pub fn new(cert_path: impl Into<PathBuf>, key_path: impl Into<PathBuf>) -> Self {
        Self {
            cert_path: cert_path.into(),
            key_path: key_path.into(),
        }
    }
}

#[derive(Debug, Clone)]
struct PatternGroup {
    name: String,
    patterns: Vec<(String, Vec<CertificateEntry>)>,
}

/// Ordered groups of `(pattern, entries)`.
///
/// Lookup scans groups, then patterns within a group, in insertion order and
/// returns the first entry of the first match. A more specific pattern listed
/// later never overrides an earlier broad one.
#[derive(Debug, Clone, Default)]
pub struct CertificateTable {
    groups: Vec<PatternGroup>,
}

impl CertificateTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a group of patterns.
    ///
    /// Patterns are normalized the same way SNI hostnames are, so a pattern
    /// written in mixed case still matches.
    pub fn push_group(
        &mut self,
        name: impl Into<String>,
        patterns: Vec<(String, Vec<CertificateEntry>)>,
    ) {
        let patterns = patterns
            .into_iter()
            .map(|(pattern, entries)| (normalize_hostname(&pattern), entries))
            .collect();
        self.groups.push(PatternGroup {
            name: name.into(),
            patterns,
        });
    }

    /// Find the certificate serving `hostname`.
    ///
    /// Patterns whose entry list is empty are skipped.
    pub fn lookup(&self, hostname: &str) -> Option<&CertificateEntry> {
        self.lookup_with_origin(hostname).map(|(_, _, entry)| entry)
    }

    /// Like [`lookup`](Self::lookup), also returning the group and pattern
    /// that matched.
    pub fn lookup_with_origin(&self, hostname: &str) -> Option<(&str, &str, &CertificateEntry)> {
        self.groups.iter().find_map(|g| {
            g.patterns.iter().find_map(|(pattern, entries)| {
                if !wildcard::matches(pattern, hostname) {
                    return None;
                }
                entries
                    .first()
                    .map(|e| (g.name.as_str(), pattern.as_str(), e))
            })
        })
    }

    /// Number of patterns across all groups.
    pub fn pattern_count(&self) -> usize {
        self.groups.iter().map(|g| g.patterns.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.pattern_count() == 0
    }
}

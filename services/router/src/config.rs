//! Router configuration.
//!
//! Process settings come from the environment. The certificate table comes
//! from a YAML file that is re-read by the refresh task.

use std::{fmt, marker::PhantomData, net::SocketAddr, path::Path, path::PathBuf, time::Duration};

use anyhow::{Context, Result};
use serde::de::{Deserializer, MapAccess, Visitor};
use serde::Deserialize;
use thiserror::Error;

use crate::tls::{CertificateEntry, CertificateTable};

/// Longest accepted sweep period (one year).
const MAX_INTERVAL_SECS: u64 = 365 * 24 * 60 * 60;

/// Router configuration (env-driven).
#[derive(Debug, Clone)]
pub struct Config {
    /// YAML file holding the `certs` table.
    pub config_file: PathBuf,

    /// JSON file the discovery cache is persisted to.
    pub cache_file: PathBuf,

    /// TLS listener address.
    pub tls_bind: SocketAddr,

    /// Plaintext redirect listener address.
    pub http_bind: SocketAddr,

    /// Run the port-80 redirect listener.
    pub redirect_enabled: bool,

    /// Nameserver for SRV lookups; `None` uses the system resolver config.
    pub dns_server: Option<SocketAddr>,

    /// Period of the refresh sweep (also reloads the certificate table).
    pub refresh_interval: Duration,

    /// Period of the idle eviction sweep.
    pub evict_interval: Duration,

    /// Entries idle for longer than this are evicted.
    pub idle_ttl: Duration,

    /// Clear the persisted cache right after loading it at startup.
    pub reset_cache_on_boot: bool,

    /// Maximum concurrent client connections.
    pub max_connections: usize,

    /// Backend connect timeout; `None` waits indefinitely.
    pub connect_timeout: Option<Duration>,

    /// TLS handshake timeout; `None` waits indefinitely.
    pub handshake_timeout: Option<Duration>,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            config_file: PathBuf::from("config.yml"),
            cache_file: PathBuf::from("cache.json"),
            tls_bind: SocketAddr::from(([0u16; 8], 443)),
            http_bind: SocketAddr::from(([0u16; 8], 80)),
            redirect_enabled: true,
            dns_server: Some(SocketAddr::from(([8u8, 8, 8, 8], 53))),
            refresh_interval: Duration::from_secs(60),
            evict_interval: Duration::from_secs(60),
            idle_ttl: Duration::from_secs(96 * 60 * 60),
            reset_cache_on_boot: true,
            max_connections: crate::proxy::DEFAULT_MAX_CONNECTIONS,
            connect_timeout: None,
            handshake_timeout: crate::proxy::DEFAULT_HANDSHAKE_TIMEOUT,
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let config_file = std::env::var("PDCACHE_CONFIG_FILE")
            .map(PathBuf::from)
            .unwrap_or(defaults.config_file);

        let cache_file = std::env::var("PDCACHE_CACHE_FILE")
            .map(PathBuf::from)
            .unwrap_or(defaults.cache_file);

        let tls_bind = parse_var("PDCACHE_TLS_BIND", "a socket address")?.unwrap_or(defaults.tls_bind);

        let http_bind =
            parse_var("PDCACHE_HTTP_BIND", "a socket address")?.unwrap_or(defaults.http_bind);

        let redirect_enabled = bool_var("PDCACHE_REDIRECT_ENABLED")?.unwrap_or(true);

        let dns_server = match std::env::var("PDCACHE_DNS_SERVER") {
            Ok(v) if v.eq_ignore_ascii_case("system") => None,
            Ok(v) => Some(parse_nameserver(&v)?),
            Err(_) => defaults.dns_server,
        };

        let refresh_interval = parse_var::<u64>("PDCACHE_REFRESH_INTERVAL_SECS", "an integer (seconds)")?
            .map(|s| interval_from_secs("PDCACHE_REFRESH_INTERVAL_SECS", s))
            .transpose()?
            .unwrap_or(defaults.refresh_interval);

        let evict_interval = parse_var::<u64>("PDCACHE_EVICT_INTERVAL_SECS", "an integer (seconds)")?
            .map(|s| interval_from_secs("PDCACHE_EVICT_INTERVAL_SECS", s))
            .transpose()?
            .unwrap_or(defaults.evict_interval);

        let idle_ttl = parse_var::<u64>("PDCACHE_IDLE_TTL_HOURS", "an integer (hours)")?
            .map(|h| ttl_from_hours("PDCACHE_IDLE_TTL_HOURS", h))
            .transpose()?
            .unwrap_or(defaults.idle_ttl);

        let reset_cache_on_boot = bool_var("PDCACHE_RESET_CACHE_ON_BOOT")?.unwrap_or(true);

        let max_connections = parse_var::<usize>("PDCACHE_MAX_CONNECTIONS", "an integer")?
            .unwrap_or(defaults.max_connections)
            .max(1);

        let connect_timeout = parse_var::<u64>("PDCACHE_CONNECT_TIMEOUT_MS", "an integer (milliseconds)")?
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis);

        let handshake_timeout =
            match parse_var::<u64>("PDCACHE_HANDSHAKE_TIMEOUT_MS", "an integer (milliseconds)")? {
                Some(0) => None,
                Some(ms) => Some(Duration::from_millis(ms)),
                None => defaults.handshake_timeout,
            };

        let log_level = std::env::var("PDCACHE_LOG_LEVEL").unwrap_or(defaults.log_level);

        Ok(Self {
            config_file,
            cache_file,
            tls_bind,
            http_bind,
            redirect_enabled,
            dns_server,
            refresh_interval,
            evict_interval,
            idle_ttl,
            reset_cache_on_boot,
            max_connections,
            connect_timeout,
            handshake_timeout,
            log_level,
        })
    }
}

fn parse_var<T: std::str::FromStr>(name: &str, expected: &str) -> Result<Option<T>>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    std::env::var(name)
        .ok()
        .map(|v| v.trim().parse::<T>())
        .transpose()
        .with_context(|| format!("{name} must be {expected}."))
}

fn bool_var(name: &str) -> Result<Option<bool>> {
    std::env::var(name)
        .ok()
        .map(|v| parse_bool(&v))
        .transpose()
        .with_context(|| format!("{name} must be a boolean (true/false, 1/0, yes/no, on/off)."))
}

fn parse_bool(raw: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => anyhow::bail!("unrecognized value '{other}'"),
    }
}

/// Sweep period in seconds, clamped below to one second.
fn interval_from_secs(name: &str, secs: u64) -> Result<Duration> {
    if secs > MAX_INTERVAL_SECS {
        anyhow::bail!("{name} must be at most {MAX_INTERVAL_SECS} seconds.");
    }
    Ok(Duration::from_secs(secs.max(1)))
}

fn ttl_from_hours(name: &str, hours: u64) -> Result<Duration> {
    hours
        .checked_mul(60 * 60)
        .map(Duration::from_secs)
        .with_context(|| format!("{name} is too large."))
}

/// Accepts `ip` or `ip:port`; the port defaults to 53.
fn parse_nameserver(raw: &str) -> Result<SocketAddr> {
    let raw = raw.trim();
    if let Ok(addr) = raw.parse::<SocketAddr>() {
        return Ok(addr);
    }
    let ip: std::net::IpAddr = raw
        .parse()
        .with_context(|| format!("PDCACHE_DNS_SERVER must be an IP address, got '{raw}'."))?;
    Ok(SocketAddr::new(ip, 53))
}

/// Errors loading the certificate configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
}

/// On-disk certificate configuration.
#[derive(Debug, Deserialize)]
pub struct CertConfig {
    /// group -> hostname pattern -> certificate/key pairs.
    #[serde(default)]
    pub certs: OrderedMap<OrderedMap<Vec<CertFileRef>>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CertFileRef {
    pub cert: PathBuf,
    pub key: PathBuf,
}

/// A string-keyed mapping that keeps document order.
#[derive(Debug)]
pub struct OrderedMap<V>(pub Vec<(String, V)>);

impl<V> Default for OrderedMap<V> {
    fn default() -> Self {
        Self(Vec::new())
    }
}

impl<'de, V: Deserialize<'de>> Deserialize<'de> for OrderedMap<V> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct OrderedVisitor<V>(PhantomData<V>);

        impl<'de, V: Deserialize<'de>> Visitor<'de> for OrderedVisitor<V> {
            type Value = OrderedMap<V>;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a mapping")
            }

            // `certs:` with nothing under it
            fn visit_unit<E: serde::de::Error>(self) -> Result<Self::Value, E> {
                Ok(OrderedMap::default())
            }

            fn visit_none<E: serde::de::Error>(self) -> Result<Self::Value, E> {
                Ok(OrderedMap::default())
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Self::Value, A::Error> {
                let mut out = Vec::with_capacity(map.size_hint().unwrap_or(0));
                while let Some((k, v)) = map.next_entry::<String, V>()? {
                    out.push((k, v));
                }
                Ok(OrderedMap(out))
            }
        }

        deserializer.deserialize_any(OrderedVisitor(PhantomData))
    }
}

impl CertConfig {
    /// Parse a certificate configuration document.
    pub fn from_yaml(raw: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(raw)
    }

    /// Read and parse the certificate configuration file.
    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Read {
                path: path.display().to_string(),
                source,
            })?;

        Self::from_yaml(&raw).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    /// Flatten into the lookup table, keeping document order.
    pub fn into_table(self) -> CertificateTable {
        let mut table = CertificateTable::new();
        for (group, patterns) in self.certs.0 {
            let patterns = patterns
                .0
                .into_iter()
                .map(|(pattern, refs)| {
                    let entries = refs
                        .into_iter()
                        .map(|r| CertificateEntry::new(r.cert, r.key))
                        .collect();
                    (pattern, entries)
                })
                .collect();
            table.push_group(group, patterns);
        }
        table
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
certs:
  zeta:
    "*.example.com":
      - cert: /etc/certs/wild.pem
        key: /etc/certs/wild.key
    "api.example.com":
      - cert: /etc/certs/api.pem
        key: /etc/certs/api.key
  alpha:
    "*.com":
      - cert: /etc/certs/com.pem
        key: /etc/certs/com.key
      - cert: /etc/certs/com2.pem
        key: /etc/certs/com2.key
"#;

    #[test]
    fn test_cert_config_preserves_document_order() {
        let config = CertConfig::from_yaml(SAMPLE).unwrap();

        let groups: Vec<&str> = config.certs.0.iter().map(|(g, _)| g.as_str()).collect();
        assert_eq!(groups, vec!["zeta", "alpha"]);

        let (_, zeta) = &config.certs.0[0];
        let patterns: Vec<&str> = zeta.0.iter().map(|(p, _)| p.as_str()).collect();
        assert_eq!(patterns, vec!["*.example.com", "api.example.com"]);

        let (_, alpha) = &config.certs.0[1];
        assert_eq!(alpha.0[0].1.len(), 2);
    }

    #[test]
    fn test_cert_config_into_table_first_match_wins() {
        let table = CertConfig::from_yaml(SAMPLE).unwrap().into_table();

        // The wildcard is listed before the exact name, so it wins.
        let entry = table.lookup("api.example.com").unwrap();
        assert_eq!(entry.cert_path, PathBuf::from("/etc/certs/wild.pem"));

        let entry = table.lookup("other.com").unwrap();
        assert_eq!(entry.cert_path, PathBuf::from("/etc/certs/com.pem"));
    }

    #[test]
    fn test_cert_config_rejects_garbage() {
        assert!(CertConfig::from_yaml("certs: [1, 2").is_err());
        assert!(CertConfig::from_yaml("certs:\n  g:\n    h: nope\n").is_err());
    }

    #[test]
    fn test_cert_config_empty_certs() {
        let config = CertConfig::from_yaml("certs:\n").unwrap();
        assert!(config.certs.0.is_empty());
    }

    #[tokio::test]
    async fn test_cert_config_load_missing_file() {
        let err = CertConfig::load(Path::new("/nonexistent/pdcache/config.yml"))
            .await
            .unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn test_parse_nameserver() {
        assert_eq!(
            parse_nameserver("8.8.8.8").unwrap(),
            "8.8.8.8:53".parse::<SocketAddr>().unwrap()
        );
        assert_eq!(
            parse_nameserver("[::1]:5353").unwrap(),
            "[::1]:5353".parse::<SocketAddr>().unwrap()
        );
        assert!(parse_nameserver("dns.google").is_err());
    }

    #[test]
    fn test_config_defaults() {
        let config = Config::default();
        assert_eq!(config.tls_bind.port(), 443);
        assert_eq!(config.http_bind.port(), 80);
        assert_eq!(config.idle_ttl, Duration::from_secs(96 * 3600));
        assert!(config.reset_cache_on_boot);
        assert!(config.connect_timeout.is_none());
    }

    #[test]
    fn test_cert_config_mixed_case_pattern_is_reachable() {
        let raw = r#"
certs:
  main:
    "App.Example.COM":
      - cert: /etc/certs/app.pem
        key: /etc/certs/app.key
"#;
        let table = CertConfig::from_yaml(raw).unwrap().into_table();

        let hostname = crate::tls::normalize_hostname("APP.example.com.");
        let entry = table.lookup(&hostname).unwrap();
        assert_eq!(entry.cert_path, PathBuf::from("/etc/certs/app.pem"));
    }

    #[test]
    fn test_parse_bool() {
        for raw in ["1", "true", "TRUE", "yes", "On", " true "] {
            assert!(parse_bool(raw).unwrap(), "{raw}");
        }
        for raw in ["0", "false", "False", "no", "off"] {
            assert!(!parse_bool(raw).unwrap(), "{raw}");
        }
        assert!(parse_bool("maybe").is_err());
        assert!(parse_bool("").is_err());
    }

    #[test]
    fn test_interval_bounds() {
        assert_eq!(interval_from_secs("X", 0).unwrap(), Duration::from_secs(1));
        assert_eq!(interval_from_secs("X", 60).unwrap(), Duration::from_secs(60));
        assert!(interval_from_secs("X", MAX_INTERVAL_SECS).is_ok());

        let err = interval_from_secs("PDCACHE_EVICT_INTERVAL_SECS", u64::MAX).unwrap_err();
        assert!(err.to_string().contains("PDCACHE_EVICT_INTERVAL_SECS"));
    }

    #[test]
    fn test_ttl_hours_overflow() {
        assert_eq!(ttl_from_hours("X", 96).unwrap(), Duration::from_secs(96 * 3600));

        let err = ttl_from_hours("PDCACHE_IDLE_TTL_HOURS", u64::MAX).unwrap_err();
        assert!(err.to_string().contains("too large"));
    }
}

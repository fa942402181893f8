//! pdcache router
//!
//! TLS terminator with SNI certificate selection and SRV-discovered backends.
//!
//! This service:
//! - Loads the hostname pattern to certificate table from YAML
//! - Accepts TLS on one port and picks the certificate by SNI
//! - Resolves backends from `_pdcache._tcp.<hostname>` SRV records
//! - Relays the plaintext stream, tagging HTTP requests with X-Forwarded-For
//! - Refreshes, evicts and persists the discovery cache in the background
//! - Optionally redirects plaintext HTTP to HTTPS

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use pdcache_router::maintenance::{spawn_eviction_task, spawn_refresh_task};
use pdcache_router::{
    redirect, CacheFile, CertificateStore, Config, DiscoveryCache, HickorySrvResolver, Listener,
    ListenerConfig, SrvResolver,
};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to PDCACHE_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting pdcache router");
    info!(
        config_file = %config.config_file.display(),
        cache_file = %config.cache_file.display(),
        tls_bind = %config.tls_bind,
        dns_server = ?config.dns_server,
        "Configuration loaded"
    );

    let certs = match CertificateStore::from_file(&config.config_file).await {
        Ok(certs) => Arc::new(certs),
        Err(e) => {
            error!(error = %e, "Failed to load certificate configuration");
            return Err(e.into());
        }
    };
    info!(patterns = certs.pattern_count(), "Certificate table loaded");

    let resolver: Arc<dyn SrvResolver> = match config.dns_server {
        Some(addr) => Arc::new(HickorySrvResolver::with_nameserver(addr)),
        None => Arc::new(
            HickorySrvResolver::from_system_conf().context("Failed to read system DNS config")?,
        ),
    };

    let cache = Arc::new(
        DiscoveryCache::new(resolver)
            .with_store(CacheFile::new(config.cache_file.clone()))
            .with_idle_ttl(config.idle_ttl),
    );
    let loaded = cache.load_persisted().await;
    info!(entries = loaded, "Discovery cache loaded");
    if config.reset_cache_on_boot {
        cache.reset().await;
    }

    spawn_refresh_task(
        Arc::clone(&cache),
        Arc::clone(&certs),
        config.config_file.clone(),
        config.refresh_interval,
    );
    spawn_eviction_task(Arc::clone(&cache), config.evict_interval);

    if config.redirect_enabled {
        let http_bind = config.http_bind;
        tokio::spawn(async move {
            if let Err(e) = redirect::serve(http_bind).await {
                error!(bind_addr = %http_bind, error = %e, "Redirect listener error");
            }
        });
    }

    let mut listener_config = ListenerConfig::new(config.tls_bind);
    listener_config.max_connections = config.max_connections;
    listener_config.connect_timeout = config.connect_timeout;
    listener_config.handshake_timeout = config.handshake_timeout;

    let listener = match Listener::bind(listener_config, certs, cache).await {
        Ok(listener) => Arc::new(listener),
        Err(e) => {
            error!(bind_addr = %config.tls_bind, error = %e, "Failed to bind listener");
            return Err(e.into());
        }
    };

    listener.run().await?;
    Ok(())
}

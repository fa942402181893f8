//! TLS listener and per-connection routing.
//!
//! Each accepted socket goes through the same pipeline:
//!
//! 1. Read the ClientHello and take its SNI hostname.
//! 2. Pick a certificate from the [`CertificateStore`] and finish the handshake.
//! 3. Resolve the hostname's backend through the [`DiscoveryCache`].
//! 4. Open a plaintext TCP connection and relay until either side closes.
//!
//! A failure at any step closes only that connection.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rustls::server::Acceptor;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio::time::timeout;
use tokio_rustls::server::TlsStream;
use tokio_rustls::LazyConfigAcceptor;
use tracing::{debug, error, info, warn, Instrument};

use super::relay::StreamProxy;
use super::sniff::client_ip;
use crate::discovery::DiscoveryCache;
use crate::error::RouterError;
use crate::tls::{normalize_hostname, CertificateStore};

/// Default maximum concurrent connections per listener.
pub const DEFAULT_MAX_CONNECTIONS: usize = 10000;

/// Default TLS handshake timeout.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Option<Duration> = Some(Duration::from_secs(10));

/// Configuration for a listener.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Backend connect timeout.
    pub connect_timeout: Option<Duration>,
    /// Limit on reading the ClientHello and completing the handshake.
    pub handshake_timeout: Option<Duration>,
}

impl ListenerConfig {
    /// Create a new listener configuration.
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            connect_timeout: None,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }
}

/// Statistics for a listener.
#[derive(Debug, Default)]
pub struct ListenerStats {
    /// Total connections accepted.
    pub connections_accepted: AtomicU64,
    /// Total connections currently active.
    pub connections_active: AtomicU64,
    /// Total connections closed.
    pub connections_closed: AtomicU64,
    /// Connections rejected due to max limit.
    pub connections_rejected: AtomicU64,
    /// Handshakes that failed, timed out, or carried no SNI.
    pub handshake_failures: AtomicU64,
    /// Hostnames with no matching certificate pattern.
    pub certificate_misses: AtomicU64,
    /// Hostnames whose SRV discovery failed.
    pub routes_failed: AtomicU64,
    /// Backend connection failures.
    pub backend_failed: AtomicU64,
    /// Sessions that reached the relay.
    pub sessions_relayed: AtomicU64,
    /// Bytes proxied to backend.
    pub bytes_to_backend: AtomicU64,
    /// Bytes proxied from backend.
    pub bytes_from_backend: AtomicU64,
}

impl ListenerStats {
    fn record_failure(&self, err: &RouterError) {
        let counter = match err {
            RouterError::Handshake(_) | RouterError::HandshakeTimeout | RouterError::NoSni => {
                &self.handshake_failures
            }
            RouterError::CertificateNotFound(_) | RouterError::CertificateLoad(_) => {
                &self.certificate_misses
            }
            RouterError::Discovery(_) => &self.routes_failed,
            RouterError::BackendConnect { .. } => &self.backend_failed,
            RouterError::Stream(_) => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// TLS-terminating listener that routes by SNI hostname.
pub struct Listener {
    /// Listener configuration.
    config: ListenerConfig,
    /// The TCP listener.
    listener: TcpListener,
    /// Certificate table for handshakes.
    certs: Arc<CertificateStore>,
    /// Hostname to backend resolution.
    cache: Arc<DiscoveryCache>,
    /// Backend connector and relay.
    proxy: StreamProxy,
    /// Connection semaphore for limiting concurrent connections.
    conn_semaphore: Arc<Semaphore>,
    /// Statistics.
    stats: Arc<ListenerStats>,
}

impl Listener {
    /// Bind a new listener.
    pub async fn bind(
        config: ListenerConfig,
        certs: Arc<CertificateStore>,
        cache: Arc<DiscoveryCache>,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(config.bind_addr).await?;
        let local_addr = listener.local_addr()?;

        info!(
            bind_addr = %local_addr,
            max_connections = config.max_connections,
            "Listener bound"
        );

        Ok(Self {
            conn_semaphore: Arc::new(Semaphore::new(config.max_connections)),
            proxy: StreamProxy::new(Arc::clone(&cache), config.connect_timeout),
            listener,
            config,
            certs,
            cache,
            stats: Arc::new(ListenerStats::default()),
        })
    }

    /// Get the local address this listener is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Get listener statistics.
    pub fn stats(&self) -> &ListenerStats {
        &self.stats
    }

    /// Run the listener, accepting and handling connections.
    pub async fn run(self: Arc<Self>) -> io::Result<()> {
        let local_addr = self.listener.local_addr()?;
        info!(bind_addr = %local_addr, "Listener started");

        loop {
            match self.listener.accept().await {
                Ok((stream, peer_addr)) => {
                    let permit = match self.conn_semaphore.clone().try_acquire_owned() {
                        Ok(permit) => permit,
                        Err(_) => {
                            self.stats
                                .connections_rejected
                                .fetch_add(1, Ordering::Relaxed);
                            warn!(peer_addr = %peer_addr, "Connection rejected: max connections reached");
                            continue;
                        }
                    };

                    self.stats
                        .connections_accepted
                        .fetch_add(1, Ordering::Relaxed);
                    self.stats
                        .connections_active
                        .fetch_add(1, Ordering::Relaxed);

                    let listener = Arc::clone(&self);
                    let stats = Arc::clone(&self.stats);

                    tokio::spawn(
                        async move {
                            if let Err(e) = listener.handle_connection(stream, peer_addr).await {
                                stats.record_failure(&e);
                                match &e {
                                    RouterError::Stream(_) => {
                                        debug!(error = %e, "Session ended with error")
                                    }
                                    _ => warn!(
                                        reason = e.reason_code(),
                                        error = %e,
                                        "Connection dropped"
                                    ),
                                }
                            }

                            stats.connections_active.fetch_sub(1, Ordering::Relaxed);
                            stats.connections_closed.fetch_add(1, Ordering::Relaxed);
                            drop(permit);
                        }
                        .instrument(tracing::info_span!("connection", peer = %peer_addr)),
                    );
                }
                Err(e) => {
                    error!(error = %e, "Accept error");
                    // Brief sleep to avoid tight loop on persistent errors
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    /// Handle a single connection.
    async fn handle_connection(
        &self,
        client: TcpStream,
        peer_addr: SocketAddr,
    ) -> Result<(), RouterError> {
        let (tls, hostname) = match self.config.handshake_timeout {
            Some(limit) => timeout(limit, self.accept_tls(client))
                .await
                .map_err(|_| RouterError::HandshakeTimeout)??,
            None => self.accept_tls(client).await?,
        };

        let backend = self.cache.resolve(&hostname).await?;

        let upstream =
            self.proxy
                .connect(&backend)
                .await
                .map_err(|source| RouterError::BackendConnect {
                    backend: backend.to_string(),
                    source,
                })?;

        debug!(hostname = %hostname, backend = %backend, "Connected to backend");
        self.stats.sessions_relayed.fetch_add(1, Ordering::Relaxed);

        let relayed = self
            .proxy
            .relay(tls, upstream, &hostname, &client_ip(peer_addr.ip()))
            .await
            .map_err(RouterError::Stream)?;

        self.stats
            .bytes_to_backend
            .fetch_add(relayed.bytes_to_backend, Ordering::Relaxed);
        self.stats
            .bytes_from_backend
            .fetch_add(relayed.bytes_from_backend, Ordering::Relaxed);

        debug!(
            hostname = %hostname,
            bytes_to_backend = relayed.bytes_to_backend,
            bytes_from_backend = relayed.bytes_from_backend,
            "Connection closed"
        );

        Ok(())
    }

    /// Read the ClientHello, choose a certificate by SNI, and complete the
    /// handshake.
    ///
    /// Returns the TLS stream and the normalized hostname.
    async fn accept_tls(
        &self,
        client: TcpStream,
    ) -> Result<(TlsStream<TcpStream>, String), RouterError> {
        let start = LazyConfigAcceptor::new(Acceptor::default(), client)
            .await
            .map_err(RouterError::Handshake)?;

        let hostname = start
            .client_hello()
            .server_name()
            .map(normalize_hostname)
            .ok_or(RouterError::NoSni)?;

        let entry = self
            .certs
            .lookup(&hostname)
            .ok_or_else(|| RouterError::CertificateNotFound(hostname.clone()))?;

        let server_config = self.certs.server_config(&entry).await?;

        let tls = start
            .into_stream(Arc::new(server_config))
            .await
            .map_err(RouterError::Handshake)?;

        debug!(hostname = %hostname, "TLS handshake complete");
        Ok((tls, hostname))
    }
}

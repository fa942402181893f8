//! Bidirectional relay between a terminated client stream and its backend.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, trace};

use super::sniff::{rewrite_chunk, ChunkKind};
use crate::discovery::{Backend, DiscoveryCache};

/// Read buffer size per direction.
const RELAY_BUFFER_SIZE: usize = 16 * 1024;

/// Bytes moved by one relay session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    /// Bytes written to the backend, including injected headers.
    pub bytes_to_backend: u64,
    /// Bytes written back to the client.
    pub bytes_from_backend: u64,
}

/// Opens backend connections and pumps bytes both ways.
///
/// Client chunks go through the HTTP sniffer; backend bytes are passed
/// through untouched. Every chunk refreshes the hostname's cache entry.
pub struct StreamProxy {
    cache: Arc<DiscoveryCache>,
    connect_timeout: Option<Duration>,
}

impl StreamProxy {
    pub fn new(cache: Arc<DiscoveryCache>, connect_timeout: Option<Duration>) -> Self {
        Self {
            cache,
            connect_timeout,
        }
    }

    /// Open a plain TCP connection to `backend`.
    pub async fn connect(&self, backend: &Backend) -> io::Result<TcpStream> {
        debug!(backend = %backend, "Connecting to backend");
        let connect = TcpStream::connect((backend.target.as_str(), backend.port));

        match self.connect_timeout {
            Some(limit) => match timeout(limit, connect).await {
                Ok(result) => result,
                Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "connect timeout")),
            },
            None => connect.await,
        }
    }

    /// Relay until both directions finish or either fails.
    ///
    /// End-of-stream on one side shuts down writes on the other. An error in
    /// either direction ends the session; both streams are dropped on return.
    pub async fn relay<C, B>(
        &self,
        client: C,
        backend: B,
        hostname: &str,
        client_ip: &str,
    ) -> io::Result<RelayStats>
    where
        C: AsyncRead + AsyncWrite + Unpin,
        B: AsyncRead + AsyncWrite + Unpin,
    {
        let (mut client_read, mut client_write) = tokio::io::split(client);
        let (mut backend_read, mut backend_write) = tokio::io::split(backend);

        let client_to_backend = async {
            let mut total = 0u64;
            let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
            loop {
                let n = client_read.read(&mut buf).await?;
                if n == 0 {
                    break;
                }

                let (kind, chunk) = rewrite_chunk(&buf[..n], client_ip);
                match kind {
                    ChunkKind::HttpRequest => trace!(hostname, client_ip, "X-Forwarded-For injected"),
                    ChunkKind::WebSocketUpgrade => {
                        debug!(hostname, client_ip, "WebSocket upgrade request")
                    }
                    ChunkKind::Opaque => {}
                }

                backend_write.write_all(&chunk).await?;
                total += chunk.len() as u64;
                self.cache.touch(hostname).await;
            }
            debug!(hostname, "Client closed");
            backend_write.shutdown().await?;
            Ok::<_, io::Error>(total)
        };

        let backend_to_client = async {
            let mut total = 0u64;
            let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
            loop {
                let n = backend_read.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                client_write.write_all(&buf[..n]).await?;
                total += n as u64;
                self.cache.touch(hostname).await;
            }
            debug!(hostname, "Backend closed");
            client_write.shutdown().await?;
            Ok::<_, io::Error>(total)
        };

        let (bytes_to_backend, bytes_from_backend) =
            tokio::try_join!(client_to_backend, backend_to_client)?;

        Ok(RelayStats {
            bytes_to_backend,
            bytes_from_backend,
        })
    }
}

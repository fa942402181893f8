//! Per-chunk protocol sniffing for the client -> backend direction.
//!
//! Each chunk read from the client is classified on its own; no request
//! boundaries are tracked across reads. A chunk that starts with an HTTP
//! method token gets an `X-Forwarded-For` line after its first line.

use std::borrow::Cow;
use std::net::IpAddr;

/// Marker of a WebSocket upgrade request; such chunks pass through untouched.
pub const WEBSOCKET_MARKER: &[u8] = b"Upgrade: websocket";

/// Method tokens that mark the start of an HTTP request.
pub const HTTP_METHODS: [&[u8]; 9] = [
    b"GET", b"POST", b"PUT", b"DELETE", b"HEAD", b"OPTIONS", b"PATCH", b"CONNECT", b"TRACE",
];

const FORWARDED_FOR: &[u8] = b"X-Forwarded-For: ";
const CRLF: &[u8] = b"\r\n";

/// Classification of one client chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkKind {
    /// Contains the WebSocket upgrade marker.
    WebSocketUpgrade,
    /// Starts with an HTTP method token.
    HttpRequest,
    /// Anything else: body fragments, TLS, binary protocols.
    Opaque,
}

/// Classify a chunk. The WebSocket check takes precedence.
pub fn classify(chunk: &[u8]) -> ChunkKind {
    if contains(chunk, WEBSOCKET_MARKER) {
        ChunkKind::WebSocketUpgrade
    } else if HTTP_METHODS.iter().any(|m| chunk.starts_with(m)) {
        ChunkKind::HttpRequest
    } else {
        ChunkKind::Opaque
    }
}

/// Classify `chunk` and return the bytes to forward for it.
///
/// Only HTTP request chunks are rewritten; everything else is borrowed as is.
pub fn rewrite_chunk<'a>(chunk: &'a [u8], client_ip: &str) -> (ChunkKind, Cow<'a, [u8]>) {
    let kind = classify(chunk);
    let out = match kind {
        ChunkKind::HttpRequest => Cow::Owned(inject_forwarded_for(chunk, client_ip)),
        ChunkKind::WebSocketUpgrade | ChunkKind::Opaque => Cow::Borrowed(chunk),
    };
    (kind, out)
}

/// Insert `X-Forwarded-For: <client_ip>` as the second line of `chunk`.
///
/// Lines are `\r\n`-separated. A chunk without a line break gets the header
/// appended after a new `\r\n`.
pub fn inject_forwarded_for(chunk: &[u8], client_ip: &str) -> Vec<u8> {
    let header_len = FORWARDED_FOR.len() + client_ip.len() + CRLF.len();
    let mut out = Vec::with_capacity(chunk.len() + header_len);

    match find(chunk, CRLF) {
        Some(pos) => {
            let split = pos + CRLF.len();
            out.extend_from_slice(&chunk[..split]);
            out.extend_from_slice(FORWARDED_FOR);
            out.extend_from_slice(client_ip.as_bytes());
            out.extend_from_slice(CRLF);
            out.extend_from_slice(&chunk[split..]);
        }
        None => {
            out.extend_from_slice(chunk);
            out.extend_from_slice(CRLF);
            out.extend_from_slice(FORWARDED_FOR);
            out.extend_from_slice(client_ip.as_bytes());
        }
    }

    out
}

/// Client address as written into `X-Forwarded-For`.
///
/// IPv4 clients accepted on a dual-stack socket show up as `::ffff:a.b.c.d`;
/// those are reported as plain IPv4.
pub fn client_ip(addr: IpAddr) -> String {
    match addr {
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => v4.to_string(),
            None => v6.to_string(),
        },
        IpAddr::V4(v4) => v4.to_string(),
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    find(haystack, needle).is_some()
}

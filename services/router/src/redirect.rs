//! Plaintext HTTP listener that sends every request to its HTTPS URL.

use std::io;
use std::net::SocketAddr;

use axum::http::{header, HeaderMap, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Router;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Build the redirect application. Every path and method is handled.
pub fn app() -> Router {
    Router::new()
        .fallback(redirect_to_https)
        .layer(TraceLayer::new_for_http())
}

/// Bind `addr` and serve redirects until the listener fails.
pub async fn serve(addr: SocketAddr) -> io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(bind_addr = %listener.local_addr()?, "Redirect listener started");
    axum::serve(listener, app()).await
}

/// 301 to `https://<Host><path and query>`.
async fn redirect_to_https(headers: HeaderMap, uri: Uri) -> Response {
    let Some(host) = headers
        .get(header::HOST)
        .and_then(|h| h.to_str().ok())
        .filter(|h| !h.is_empty())
    else {
        return (StatusCode::BAD_REQUEST, "missing Host header").into_response();
    };

    let path = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    let location = format!("https://{host}{path}");

    (StatusCode::MOVED_PERMANENTLY, [(header::LOCATION, location)]).into_response()
}

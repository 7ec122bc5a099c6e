//! WebSocket endpoint for viewers.
//!
//! Viewers connect to `/v1/pty` with two optional query parameters:
//! - `container_id`: the session to join
//! - `source_url`: base64-encoded location of the source archive to build
//!   when a new session has to be started
//!
//! Any other path is rejected during the handshake with `404 Not Found`.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use base64::engine::general_purpose::{STANDARD, URL_SAFE};
use base64::Engine;
use protocol::Stream;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_util::sync::CancellationToken;

use super::viewer::WsViewer;
use crate::session::{OpenRequest, SessionManager};

/// Path of the viewer endpoint.
pub const PTY_PATH: &str = "/v1/pty";

/// Reasons a handshake request is refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestError {
    /// The path is not the viewer endpoint.
    NotFound(String),
    /// A query parameter could not be decoded.
    BadRequest(String),
}

impl RequestError {
    fn into_response(self) -> ErrorResponse {
        let (status, body) = match self {
            RequestError::NotFound(path) => (StatusCode::NOT_FOUND, format!("no such endpoint: {path}")),
            RequestError::BadRequest(reason) => (StatusCode::BAD_REQUEST, reason),
        };
        let mut response = ErrorResponse::new(Some(body));
        *response.status_mut() = status;
        response
    }
}

/// Decodes a base64 `source_url` parameter. Both alphabets are accepted.
fn decode_source_url(encoded: &str) -> Result<String, RequestError> {
    let bytes = STANDARD
        .decode(encoded)
        .or_else(|_| URL_SAFE.decode(encoded))
        .map_err(|e| RequestError::BadRequest(format!("source_url is not base64: {e}")))?;
    String::from_utf8(bytes)
        .map_err(|_| RequestError::BadRequest("source_url is not valid UTF-8".to_string()))
}

/// Builds an [`OpenRequest`] from the handshake path and query string.
pub fn parse_request(path: &str, query: Option<&str>) -> Result<OpenRequest, RequestError> {
    if path != PTY_PATH {
        return Err(RequestError::NotFound(path.to_string()));
    }

    let mut request = OpenRequest::default();
    for (key, value) in url::form_urlencoded::parse(query.unwrap_or("").as_bytes()) {
        if value.is_empty() {
            continue;
        }
        match key.as_ref() {
            "container_id" => request.session_id = Some(value.into_owned()),
            "source_url" => request.source_url = Some(decode_source_url(&value)?),
            _ => {}
        }
    }
    Ok(request)
}

/// Accepts viewer connections and hands them to the session manager.
pub struct Server {
    listener: TcpListener,
    manager: Arc<SessionManager>,
}

impl Server {
    /// Binds the viewer endpoint to `addr`.
    pub async fn bind(addr: SocketAddr, manager: Arc<SessionManager>) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind {addr}"))?;
        Ok(Self { listener, manager })
    }

    /// Returns the address actually bound.
    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accepts connections until `shutdown` is cancelled.
    pub async fn run(self, shutdown: CancellationToken) -> anyhow::Result<()> {
        tracing::info!(addr = %self.local_addr()?, path = PTY_PATH, "Viewer endpoint listening");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("Viewer endpoint stopping");
                    return Ok(());
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((tcp, peer)) => {
                        let manager = Arc::clone(&self.manager);
                        tokio::spawn(handle_connection(tcp, peer, manager));
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Failed to accept connection");
                    }
                },
            }
        }
    }
}

/// Runs the handshake for one connection and opens its session.
async fn handle_connection(tcp: TcpStream, peer: SocketAddr, manager: Arc<SessionManager>) {
    let mut parsed = None;
    let callback = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        let uri = request.uri();
        match parse_request(uri.path(), uri.query()) {
            Ok(open) => {
                parsed = Some(open);
                Ok(response)
            }
            Err(e) => {
                tracing::debug!(peer = %peer, error = ?e, "Rejected handshake");
                Err(e.into_response())
            }
        }
    };

    let socket = match tokio_tungstenite::accept_hdr_async(tcp, callback).await {
        Ok(socket) => socket,
        Err(e) => {
            tracing::debug!(peer = %peer, error = %e, "WebSocket handshake failed");
            return;
        }
    };
    let Some(request) = parsed else {
        return;
    };

    tracing::info!(
        peer = %peer,
        session_id = ?request.session_id,
        "Viewer connected"
    );

    let viewer = Arc::new(WsViewer::new(peer.to_string(), socket));
    match manager.open(request, Arc::clone(&viewer) as Arc<dyn Stream>).await {
        Ok(opened) => {
            tracing::info!(
                peer = %peer,
                session_id = %opened.session_id,
                joined = opened.joined,
                "Viewer attached to session"
            );
        }
        Err(e) => {
            tracing::warn!(peer = %peer, error = %e, "Failed to open session");
            if let Err(send_err) = viewer.send_error(&e.to_string()).await {
                tracing::debug!(peer = %peer, error = %send_err, "Could not report error to viewer");
            }
            if let Err(close_err) = viewer.close().await {
                tracing::debug!(peer = %peer, error = %close_err, "Error closing viewer");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encoded(url: &str) -> String {
        STANDARD.encode(url)
    }

    #[test]
    fn test_parse_request_join() {
        let request = parse_request(PTY_PATH, Some("container_id=abc")).unwrap();
        assert_eq!(request.session_id.as_deref(), Some("abc"));
        assert_eq!(request.source_url, None);
    }

    #[test]
    fn test_parse_request_start() {
        let query = format!(
            "source_url={}",
            url::form_urlencoded::byte_serialize(encoded("https://example.com/r.tgz").as_bytes())
                .collect::<String>()
        );
        let request = parse_request(PTY_PATH, Some(&query)).unwrap();
        assert_eq!(request.session_id, None);
        assert_eq!(request.source_url.as_deref(), Some("https://example.com/r.tgz"));
    }

    #[test]
    fn test_parse_request_accepts_url_safe_base64() {
        let url = "https://example.com/a?b=c>d";
        let query = format!("source_url={}", URL_SAFE.encode(url));
        let request = parse_request(PTY_PATH, Some(&query)).unwrap();
        assert_eq!(request.source_url.as_deref(), Some(url));
    }

    #[test]
    fn test_parse_request_empty_values_are_absent() {
        let request = parse_request(PTY_PATH, Some("container_id=&source_url=")).unwrap();
        assert_eq!(request, OpenRequest::default());

        let request = parse_request(PTY_PATH, None).unwrap();
        assert_eq!(request, OpenRequest::default());
    }

    #[test]
    fn test_parse_request_wrong_path() {
        let err = parse_request("/v1/other", None).unwrap_err();
        assert_eq!(err, RequestError::NotFound("/v1/other".to_string()));
    }

    #[test]
    fn test_parse_request_bad_source_url() {
        let err = parse_request(PTY_PATH, Some("source_url=***")).unwrap_err();
        assert!(matches!(err, RequestError::BadRequest(_)));
    }

    #[test]
    fn test_error_response_status() {
        let response = RequestError::NotFound("/x".to_string()).into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = RequestError::BadRequest("bad".to_string()).into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}

//! Outbound HTTP to the CMS origins
//!
//! Everything that talks to an origin goes through [`HttpClient`], so the
//! router and the health poller can be exercised against scripted fakes.

mod http;

pub use self::http::ReqwestClient;

use std::time::Duration;

use async_trait::async_trait;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, header};
use bytes::Bytes;

use crate::{Error, Result};

/// A fully buffered request to an origin
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    /// HTTP method
    pub method: Method,
    /// Absolute URL (`{origin}{path}{query}`)
    pub url: String,
    /// Headers to send
    pub headers: HeaderMap,
    /// Request body (ignored for GET/HEAD)
    pub body: Bytes,
}

impl OutboundRequest {
    /// Bodyless GET, used for health probes
    #[must_use]
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: Method::GET,
            url: url.into(),
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }
}

/// A fully buffered origin response
#[derive(Debug, Clone)]
pub struct OriginResponse {
    /// Status code
    pub status: StatusCode,
    /// Response headers (hop-by-hop headers already removed)
    pub headers: HeaderMap,
    /// Response body
    pub body: Bytes,
}

impl OriginResponse {
    /// Build a response from its parts
    #[must_use]
    pub fn new(status: StatusCode, headers: HeaderMap, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers,
            body: body.into(),
        }
    }

    /// 2xx
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// Set (or replace) a header, ignoring names or values that are not valid HTTP
    pub fn set_header(&mut self, name: &str, value: &str) {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            self.headers.insert(name, value);
        }
    }
}

impl axum::response::IntoResponse for OriginResponse {
    fn into_response(self) -> axum::response::Response {
        let mut response = axum::response::Response::new(axum::body::Body::from(self.body));
        *response.status_mut() = self.status;
        *response.headers_mut() = self.headers;
        response
    }
}

/// Client capable of issuing one origin request
#[async_trait]
pub trait HttpClient: Send + Sync {
    /// Send the request and buffer the full response
    async fn send(&self, request: OutboundRequest) -> Result<OriginResponse>;
}

/// Issue a single request, aborting it once `timeout` elapses.
///
/// # Errors
///
/// Returns [`Error::Timeout`] carrying `timeout` when the deadline passes,
/// otherwise whatever transport error the client produced.
pub async fn fetch_with_timeout(
    client: &dyn HttpClient,
    request: OutboundRequest,
    timeout: Duration,
) -> Result<OriginResponse> {
    match tokio::time::timeout(timeout, client.send(request)).await {
        Ok(result) => result,
        Err(_) => Err(Error::Timeout(timeout)),
    }
}

/// Headers that describe a single connection and must not be relayed
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Copy inbound headers for an origin request.
///
/// Drops hop-by-hop headers, `host` and `content-length` (recomputed by the
/// client) and `accept-encoding` (negotiated and decoded by the client), then
/// adds the `X-Forwarded-By` marker.
#[must_use]
pub fn forward_headers(inbound: &HeaderMap, forwarded_by: &str) -> HeaderMap {
    let mut headers = HeaderMap::with_capacity(inbound.len() + 1);
    for (name, value) in inbound {
        let lower = name.as_str();
        if HOP_BY_HOP.contains(&lower)
            || *name == header::HOST
            || *name == header::CONTENT_LENGTH
            || *name == header::ACCEPT_ENCODING
        {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }
    if let Ok(value) = HeaderValue::from_str(forwarded_by) {
        headers.insert(HeaderName::from_static("x-forwarded-by"), value);
    }
    headers
}

/// Remove headers that no longer describe a buffered response
pub fn strip_response_headers(headers: &mut HeaderMap) {
    for name in HOP_BY_HOP {
        headers.remove(*name);
    }
    headers.remove(header::CONTENT_LENGTH);
}

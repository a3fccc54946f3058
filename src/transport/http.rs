//! reqwest-backed origin client

use std::time::Duration;

use async_trait::async_trait;
use axum::http::Method;
use reqwest::Client;
use tracing::trace;

use super::{HttpClient, OriginResponse, OutboundRequest, strip_response_headers};
use crate::{Error, Result};

/// Origin client over a pooled reqwest [`Client`].
///
/// The per-attempt deadline is enforced by
/// [`fetch_with_timeout`](super::fetch_with_timeout), so the client itself
/// carries no request timeout.
#[derive(Clone)]
pub struct ReqwestClient {
    client: Client,
}

impl ReqwestClient {
    /// Create a client with connection pooling and redirect following
    ///
    /// # Errors
    ///
    /// Returns an error if the TLS backend cannot be initialised.
    pub fn new() -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Duration::from_secs(30))
            .tcp_nodelay(true)
            .redirect(reqwest::redirect::Policy::limited(5))
            .user_agent(concat!("cms-failover/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::Transport(e.to_string()))?;

        Ok(Self { client })
    }

    /// Underlying reqwest client, shared with the webhook sink
    #[must_use]
    pub fn inner(&self) -> &Client {
        &self.client
    }
}

#[async_trait]
impl HttpClient for ReqwestClient {
    async fn send(&self, request: OutboundRequest) -> Result<OriginResponse> {
        trace!(method = %request.method, url = %request.url, "Sending origin request");

        let has_body = request.method != Method::GET && request.method != Method::HEAD;
        let mut builder = self
            .client
            .request(request.method, &request.url)
            .headers(request.headers);
        if has_body {
            builder = builder.body(request.body);
        }

        let response = builder.send().await.map_err(map_send_error)?;

        let status = response.status();
        let mut headers = response.headers().clone();
        strip_response_headers(&mut headers);
        let body = response
            .bytes()
            .await
            .map_err(|e| Error::Transport(format!("Failed to read body: {e}")))?;

        Ok(OriginResponse {
            status,
            headers,
            body,
        })
    }
}

fn map_send_error(e: reqwest::Error) -> Error {
    if e.is_connect() {
        Error::Transport(format!("Connection failed: {e}"))
    } else {
        Error::Transport(format!("Request failed: {e}"))
    }
}

//! HTTP router and handlers

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{ConnectInfo, Request, State},
    http::{HeaderValue, Method, StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use serde_json::json;
use tower_http::{
    catch_panic::CatchPanicLayer,
    compression::CompressionLayer,
    cors::{AllowOrigin, Any, CorsLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};
use tracing::{Instrument, debug, info_span, warn};

use super::failover::{FailoverRouter, InboundRequest};
use super::poller::{HealthPoller, health_json};
use crate::cache::MemoryCacheStore;
use crate::config::{Config, CorsConfig};

/// Shared application state
pub struct AppState {
    /// Effective configuration
    pub config: Arc<Config>,
    /// Failover router for proxied paths
    pub router: Arc<FailoverRouter>,
    /// Poller backing the health endpoint
    pub poller: Arc<HealthPoller>,
    /// Response store, reported on the health endpoint
    pub store: Arc<MemoryCacheStore>,
}

/// Create the router
pub fn create_router(state: Arc<AppState>) -> Router {
    let config = Arc::clone(&state.config);

    let mut app = Router::new()
        .route(&config.health_check.path, get(health_handler))
        .fallback(proxy_handler)
        .layer(CatchPanicLayer::new())
        .layer(CompressionLayer::new())
        .layer(TimeoutLayer::with_status_code(
            StatusCode::GATEWAY_TIMEOUT,
            config.server.request_timeout,
        ))
        .layer(TraceLayer::new_for_http());

    if config.cors.enabled {
        app = app.layer(cors_layer(&config.cors, &config.routing.allowed_methods));
    }

    app.with_state(state)
}

fn cors_layer(cors: &CorsConfig, allowed_methods: &[String]) -> CorsLayer {
    let origin = if cors.allow_origin == "*" {
        AllowOrigin::any()
    } else {
        match HeaderValue::from_str(&cors.allow_origin) {
            Ok(value) => AllowOrigin::exact(value),
            Err(_) => {
                warn!(origin = %cors.allow_origin, "Invalid CORS origin, allowing any");
                AllowOrigin::any()
            }
        }
    };

    let methods: Vec<Method> = allowed_methods
        .iter()
        .filter_map(|m| m.parse().ok())
        .collect();

    CorsLayer::new()
        .allow_origin(origin)
        .allow_methods(methods)
        .allow_headers(Any)
        .max_age(cors.max_age)
}

/// GET {health path}: live probe of both origins
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let report = state.poller.check().await;
    (
        StatusCode::OK,
        [(header::CACHE_CONTROL, "no-store")],
        Json(health_json(&report, &state.config, &state.store.stats())),
    )
}

/// Everything else: proxy through the failover router
async fn proxy_handler(State(state): State<Arc<AppState>>, request: Request) -> Response {
    let request_id = uuid::Uuid::new_v4();
    let span = info_span!(
        "request",
        request_id = %request_id,
        method = %request.method(),
        path = %request.uri().path(),
    );

    async move {
        let peer = request
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip());
        let client = client_key(&state.config, request.headers(), peer);

        let (parts, body) = request.into_parts();
        let body = match axum::body::to_bytes(body, state.config.server.max_body_size).await {
            Ok(bytes) => bytes,
            Err(e) => {
                debug!(error = %e, "Request body rejected");
                return (
                    StatusCode::PAYLOAD_TOO_LARGE,
                    Json(json!({
                        "error": true,
                        "message": "Request body too large",
                    })),
                )
                    .into_response();
            }
        };

        let inbound = InboundRequest {
            method: parts.method,
            uri: parts.uri,
            headers: parts.headers,
            body,
            client,
        };

        match state.router.handle(inbound).await {
            Ok(response) => response.into_response(),
            Err(rejection) => {
                debug!(kind = rejection.kind(), status = rejection.status().as_u16(), "Request rejected");
                rejection.into_response()
            }
        }
    }
    .instrument(span)
    .await
}

/// Identity for rate limiting: configured header, then peer address, then `unknown`
fn client_key(
    config: &Config,
    headers: &axum::http::HeaderMap,
    peer: Option<std::net::IpAddr>,
) -> String {
    headers
        .get(config.rate_limit.client_ip_header.as_str())
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(String::from)
        .or_else(|| peer.map(|ip| ip.to_string()))
        .unwrap_or_else(|| "unknown".to_string())
}

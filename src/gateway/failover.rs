//! Primary/backup failover for proxied CMS requests
//!
//! Per request: rate limit, method check, route classification, cache, then
//! the primary (with retry) and, only after the primary has definitively
//! failed, a single backup attempt. Origin health is recorded after every
//! attempt and transitions are announced through the notification gate.

use std::sync::Arc;

use axum::http::{HeaderMap, Method, Uri};
use bytes::Bytes;
use tracing::{debug, info, warn};

use super::rejection::Rejection;
use crate::cache::ResponseCache;
use crate::clock::Clock;
use crate::config::Config;
use crate::failsafe::{
    HealthTracker, Observation, OriginRole, RateDecision, RateLimiter, RetryPolicy, Transition,
    fetch_with_retry,
};
use crate::notify::{NotificationGate, Severity};
use crate::transport::{
    HttpClient, OriginResponse, OutboundRequest, fetch_with_timeout, forward_headers,
};
use crate::{Error, Result};

/// A buffered inbound request
#[derive(Debug, Clone)]
pub struct InboundRequest {
    /// HTTP method
    pub method: Method,
    /// Path and query as received
    pub uri: Uri,
    /// Inbound headers
    pub headers: HeaderMap,
    /// Request body
    pub body: Bytes,
    /// Client identity used for rate limiting
    pub client: String,
}

impl InboundRequest {
    fn path_and_query(&self) -> &str {
        self.uri.path_and_query().map_or("/", |pq| pq.as_str())
    }
}

/// Routes requests across the primary and backup origins
pub struct FailoverRouter {
    config: Arc<Config>,
    client: Arc<dyn HttpClient>,
    cache: ResponseCache,
    health: Arc<HealthTracker>,
    notifier: Arc<NotificationGate>,
    limiter: RateLimiter,
    retry: RetryPolicy,
}

impl FailoverRouter {
    /// Wire the router to its collaborators
    #[must_use]
    pub fn new(
        config: Arc<Config>,
        client: Arc<dyn HttpClient>,
        cache: ResponseCache,
        health: Arc<HealthTracker>,
        notifier: Arc<NotificationGate>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let limiter = RateLimiter::new(&config.rate_limit, clock);
        let retry = RetryPolicy::new(&config.retry);
        Self {
            config,
            client,
            cache,
            health,
            notifier,
            limiter,
            retry,
        }
    }

    /// Rate limiter, exposed for housekeeping
    #[must_use]
    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// Retry policy in effect for the primary
    #[must_use]
    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Serve one request.
    ///
    /// # Errors
    ///
    /// Returns a [`Rejection`] when the request is refused before reaching an
    /// origin, or when no origin may or can serve it.
    pub async fn handle(&self, request: InboundRequest) -> std::result::Result<OriginResponse, Rejection> {
        let path = request.uri.path();
        let routing = &self.config.routing;

        self.check_rate_limit(&request.client, path)?;

        if !routing.is_allowed_method(request.method.as_str()) {
            debug!(method = %request.method, "Rejecting unsupported method");
            return Err(Rejection::InvalidMethod {
                allowed: routing.allowed_methods.clone(),
            });
        }

        if routing.is_admin_only(path) {
            debug!(path = %path, "Admin-only route, primary only");
            return self.primary_only(&request).await;
        }

        let cache_key = self.cache_key(&request);
        if let Some(key) = cache_key.as_deref()
            && !self.cache.is_bypass(&request.uri)
            && let Some(hit) = self.cache.lookup(key).await
        {
            return Ok(hit);
        }

        let primary_error = match self.try_primary(&request).await {
            Ok(response) => {
                let ttl = self.cache.config().primary_ttl;
                return Ok(self.finish(response, cache_key.as_deref(), ttl).await);
            }
            Err(e) => e,
        };

        self.try_backup(&request, cache_key.as_deref(), &primary_error)
            .await
    }

    fn check_rate_limit(&self, client: &str, path: &str) -> std::result::Result<(), Rejection> {
        if path == self.config.health_check.path || self.limiter.is_exempt(path) {
            return Ok(());
        }
        match self.limiter.check(client) {
            RateDecision::Allowed => Ok(()),
            RateDecision::Limited { retry_after_secs } => {
                info!(client = %client, path = %path, "Rate limited");
                Err(Rejection::RateLimited { retry_after_secs })
            }
        }
    }

    /// Key for GETs on cacheable paths, `None` for everything else
    fn cache_key(&self, request: &InboundRequest) -> Option<String> {
        let cacheable = self.cache.enabled()
            && request.method == Method::GET
            && self.config.routing.is_cacheable_path(request.uri.path());
        cacheable.then(|| {
            self.cache
                .compute_key(&request.method, &request.uri, &request.headers)
        })
    }

    fn outbound(&self, origin: OriginRole, request: &InboundRequest) -> OutboundRequest {
        let origins = &self.config.origins;
        let (base, target) = match origin {
            OriginRole::Primary => (&origins.primary, request.path_and_query().to_string()),
            OriginRole::Backup => (
                &origins.backup,
                backup_target(request, origins.backup_root_path.as_deref()),
            ),
        };
        OutboundRequest {
            method: request.method.clone(),
            url: format!("{}{target}", base.trim_end_matches('/')),
            headers: forward_headers(&request.headers, &self.config.origins.forwarded_by),
            body: request.body.clone(),
        }
    }

    async fn primary_only(&self, request: &InboundRequest) -> std::result::Result<OriginResponse, Rejection> {
        let outbound = self.outbound(OriginRole::Primary, request);
        let outcome = fetch_with_timeout(&*self.client, outbound, self.config.origins.timeout).await;

        self.observe(OriginRole::Primary, outcome).map_err(|e| {
            warn!(
                path = %request.uri.path(),
                error = %e,
                "Admin route failed, primary unavailable"
            );
            Rejection::AdminUnavailable {
                primary_url: self.config.origins.primary.clone(),
                request_path: request.path_and_query().to_string(),
                retry_after_secs: self.config.routing.retry_after.as_secs(),
            }
        })
    }

    async fn try_primary(&self, request: &InboundRequest) -> Result<OriginResponse> {
        let outbound = self.outbound(OriginRole::Primary, request);
        let outcome = fetch_with_retry(
            &*self.client,
            &outbound,
            self.config.origins.timeout,
            &self.retry,
        )
        .await;

        let observed = self.observe(OriginRole::Primary, outcome);
        match &observed {
            Ok(response) => debug!(
                origin = "primary",
                status = response.status.as_u16(),
                path = %request.uri.path(),
                "Primary responded"
            ),
            Err(e) => warn!(
                origin = "primary",
                path = %request.uri.path(),
                error = %e,
                "Primary failed, falling back to backup"
            ),
        }
        observed
    }

    async fn try_backup(
        &self,
        request: &InboundRequest,
        cache_key: Option<&str>,
        primary_error: &Error,
    ) -> std::result::Result<OriginResponse, Rejection> {
        let routing = &self.config.routing;
        let path = request.uri.path();

        if routing.is_write_method(request.method.as_str())
            && !routing.is_auth_exception(path)
            && !self.force_write(&request.headers)
        {
            warn!(method = %request.method, path = %path, "Write rejected, primary is down");
            return Err(Rejection::WriteRejectedOnBackup {
                request_path: request.path_and_query().to_string(),
                retry_after_secs: routing.retry_after.as_secs(),
            });
        }

        let outbound = self.outbound(OriginRole::Backup, request);
        let outcome = fetch_with_timeout(&*self.client, outbound, self.config.origins.timeout).await;

        match self.observe(OriginRole::Backup, outcome) {
            Ok(mut response) => {
                info!(
                    origin = "backup",
                    status = response.status.as_u16(),
                    path = %path,
                    "Served from backup"
                );
                response.set_header(&routing.served_by_header, OriginRole::Backup.as_str());
                let ttl = self.cache.config().backup_ttl;
                Ok(self.finish(response, cache_key, ttl).await)
            }
            Err(backup_error) => {
                warn!(
                    path = %path,
                    primary_error = %primary_error,
                    backup_error = %backup_error,
                    "Both origins unavailable"
                );
                Err(Rejection::BothOriginsUnavailable {
                    primary_url: self.config.origins.primary.clone(),
                    backup_url: self.config.origins.backup.clone(),
                    request_path: request.path_and_query().to_string(),
                    details: format!(
                        "primary: {}; backup: {}",
                        primary_error.public_detail(),
                        backup_error.public_detail()
                    ),
                    retry_after_secs: routing.retry_after.as_secs(),
                })
            }
        }
    }

    fn force_write(&self, headers: &HeaderMap) -> bool {
        headers
            .get(self.config.routing.force_write_header.as_str())
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v == "true")
    }

    /// Record what an attempt produced and classify it.
    ///
    /// 5xx becomes [`Error::OriginServer`]. A 4xx is the caller's problem, so
    /// it is passed through without touching health state.
    fn observe(&self, origin: OriginRole, outcome: Result<OriginResponse>) -> Result<OriginResponse> {
        match outcome {
            Ok(response) if response.status.is_server_error() => {
                let code = response.status.as_u16();
                self.record(origin, Observation::Status(code), &format!("HTTP {code}"));
                Err(Error::OriginServer(code))
            }
            Ok(response) => {
                if !response.status.is_client_error() {
                    self.record(origin, Observation::Status(response.status.as_u16()), "");
                }
                Ok(response)
            }
            Err(e) => {
                self.record(origin, Observation::TransportFailure, &e.public_detail());
                Err(e)
            }
        }
    }

    fn record(&self, origin: OriginRole, observation: Observation, detail: &str) {
        if let Some(transition) = self.health.record_attempt(origin, observation) {
            announce(&self.notifier, &self.health, origin, transition, detail);
        }
    }

    /// Cache an eligible response and hand it back
    async fn finish(
        &self,
        mut response: OriginResponse,
        cache_key: Option<&str>,
        success_ttl: std::time::Duration,
    ) -> OriginResponse {
        let Some(key) = cache_key else {
            return response;
        };
        if response.is_success() {
            self.cache.store(key, &mut response, success_ttl).await;
        } else if response.status.is_client_error() && self.cache.config().cache_client_errors {
            let ttl = self.cache.config().error_ttl;
            self.cache.store(key, &mut response, ttl).await;
        }
        response
    }
}

/// Path and query to request from the backup; a bare root is redirected
/// to `root_path` with the query kept
fn backup_target(request: &InboundRequest, root_path: Option<&str>) -> String {
    match root_path {
        Some(root) if request.uri.path() == "/" => match request.uri.query() {
            Some(query) => format!("{root}?{query}"),
            None => root.to_string(),
        },
        _ => request.path_and_query().to_string(),
    }
}

/// Queue the alert for a health transition.
///
/// Going down while the other origin is already down raises the single
/// critical both-down alert instead of a per-origin one.
pub(crate) fn announce(
    notifier: &NotificationGate,
    health: &HealthTracker,
    origin: OriginRole,
    transition: Transition,
    detail: &str,
) {
    match transition {
        Transition::Recovered => notifier.notify(
            format!(
                "{} origin has recovered and is responding normally.",
                origin.title()
            ),
            Severity::Info,
        ),
        Transition::WentDown if health.both_down() => {
            notifier.notify(both_down_message(health), Severity::Critical)
        }
        Transition::WentDown => notifier.notify(
            format!("{} origin is down: {detail}", origin.title()),
            Severity::Info,
        ),
    };
}

/// Text of the critical both-down alert
pub(crate) fn both_down_message(health: &HealthTracker) -> String {
    let describe = |origin| match health.read(origin).last_status_code {
        0 => "unreachable".to_string(),
        code => format!("HTTP {code}"),
    };
    format!(
        "CRITICAL: both origins are down (primary: {}, backup: {})",
        describe(OriginRole::Primary),
        describe(OriginRole::Backup)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    #[test]
    fn test_both_down_message_describes_each_origin() {
        let clock = Arc::new(ManualClock::at_secs(0));
        let health = HealthTracker::new(clock);
        health.record_attempt(OriginRole::Primary, Observation::Status(503));
        health.record_attempt(OriginRole::Backup, Observation::TransportFailure);

        assert_eq!(
            both_down_message(&health),
            "CRITICAL: both origins are down (primary: HTTP 503, backup: unreachable)"
        );
    }

    #[test]
    fn test_outbound_url_keeps_query() {
        let request = InboundRequest {
            method: Method::GET,
            uri: "/api/photography?page=3&sort=desc".parse().unwrap(),
            headers: HeaderMap::new(),
            body: Bytes::new(),
            client: "unknown".into(),
        };
        assert_eq!(request.path_and_query(), "/api/photography?page=3&sort=desc");
    }

    #[test]
    fn test_backup_root_is_redirected() {
        let request = |uri: &str| InboundRequest {
            method: Method::GET,
            uri: uri.parse().unwrap(),
            headers: HeaderMap::new(),
            body: Bytes::new(),
            client: "unknown".into(),
        };

        assert_eq!(backup_target(&request("/"), Some("/api")), "/api");
        assert_eq!(backup_target(&request("/?locale=fi"), Some("/api")), "/api?locale=fi");
        assert_eq!(backup_target(&request("/api/certificates"), Some("/api")), "/api/certificates");
        assert_eq!(backup_target(&request("/"), None), "/");
    }
}

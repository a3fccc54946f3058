//! Scheduled origin probing and the live health report

use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use serde_json::{Value, json};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

use super::failover::{announce, both_down_message};
use crate::cache::CacheStatsSnapshot;
use crate::clock::Clock;
use crate::config::Config;
use crate::failsafe::{HealthTracker, Observation, OriginRole, OriginStatus, Transition};
use crate::notify::{NotificationGate, Severity};
use crate::transport::{HttpClient, OutboundRequest, fetch_with_timeout};

/// Result of one probe
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProbeResult {
    /// HTTP status, `0` when no response arrived
    pub status: u16,
    /// Wall time of the probe in milliseconds
    pub response_time: u64,
    /// `OK`, `Error: HTTP <code>` or `Error: <reason>`
    pub message: String,
}

/// Probe outcome plus tracked state for one origin
#[derive(Debug, Clone)]
pub struct OriginReport {
    /// Origin base URL
    pub url: String,
    /// What this probe observed
    pub probe: ProbeResult,
    /// Tracker state after recording the probe
    pub status: OriginStatus,
}

/// One full health check
#[derive(Debug, Clone)]
pub struct HealthReport {
    /// When the check completed
    pub timestamp: DateTime<Utc>,
    /// Primary origin
    pub primary: OriginReport,
    /// Backup origin
    pub backup: OriginReport,
}

/// Probes both origins and feeds the shared health tracker
pub struct HealthPoller {
    config: Arc<Config>,
    client: Arc<dyn HttpClient>,
    health: Arc<HealthTracker>,
    notifier: Arc<NotificationGate>,
    clock: Arc<dyn Clock>,
}

impl HealthPoller {
    /// Create a poller sharing the router's tracker and gate
    #[must_use]
    pub fn new(
        config: Arc<Config>,
        client: Arc<dyn HttpClient>,
        health: Arc<HealthTracker>,
        notifier: Arc<NotificationGate>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            client,
            health,
            notifier,
            clock,
        }
    }

    fn origin_url(&self, origin: OriginRole) -> &str {
        match origin {
            OriginRole::Primary => &self.config.origins.primary,
            OriginRole::Backup => &self.config.origins.backup,
        }
    }

    /// Probe target: configured path, else the first cacheable prefix, else `/api`
    #[must_use]
    pub fn probe_path(&self) -> &str {
        self.config
            .health_check
            .probe_path
            .as_deref()
            .or_else(|| self.config.routing.cacheable_prefixes.first().map(String::as_str))
            .unwrap_or("/api")
    }

    /// GET the probe path on one origin.
    ///
    /// A real data-fetching GET rather than HEAD, so an origin that sleeps
    /// when idle is woken up. The timestamp parameter defeats any cache in
    /// between.
    pub async fn probe(&self, origin: OriginRole) -> ProbeResult {
        let url = format!(
            "{}{}?keepWarm=true&t={}",
            self.origin_url(origin).trim_end_matches('/'),
            self.probe_path(),
            self.clock.now().timestamp_millis()
        );

        let started = Instant::now();
        let outcome = fetch_with_timeout(
            &*self.client,
            OutboundRequest::get(url),
            self.config.origins.timeout,
        )
        .await;
        let response_time = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        match outcome {
            Ok(response) => {
                let status = response.status.as_u16();
                let message = if response.is_success() {
                    "OK".to_string()
                } else {
                    format!("Error: HTTP {status}")
                };
                ProbeResult {
                    status,
                    response_time,
                    message,
                }
            }
            Err(e) => ProbeResult {
                status: 0,
                response_time,
                message: format!("Error: {}", e.public_detail()),
            },
        }
    }

    /// Probe both origins, record the results and announce transitions.
    ///
    /// Entering the both-down state raises one critical alert in place of
    /// the per-origin alerts for this tick.
    pub async fn check(&self) -> HealthReport {
        let primary = self.probe(OriginRole::Primary).await;
        let backup = self.probe(OriginRole::Backup).await;

        debug!(
            primary = primary.status,
            backup = backup.status,
            "Health check complete"
        );

        let transitions = [
            (OriginRole::Primary, &primary),
            (OriginRole::Backup, &backup),
        ]
        .map(|(origin, probe)| {
            let observation = match probe.status {
                0 => Observation::TransportFailure,
                code => Observation::Status(code),
            };
            (origin, probe, self.health.record_attempt(origin, observation))
        });

        let entered_both_down = self.health.both_down()
            && transitions
                .iter()
                .any(|(_, _, t)| *t == Some(Transition::WentDown));

        if entered_both_down {
            self.notifier
                .notify(both_down_message(&self.health), Severity::Critical);
        } else {
            for (origin, probe, transition) in &transitions {
                if let Some(transition) = transition {
                    let detail = probe.message.trim_start_matches("Error: ");
                    announce(&self.notifier, &self.health, *origin, *transition, detail);
                }
            }
        }

        HealthReport {
            timestamp: self.clock.now(),
            primary: OriginReport {
                url: self.config.origins.primary.clone(),
                status: self.health.read(OriginRole::Primary),
                probe: primary,
            },
            backup: OriginReport {
                url: self.config.origins.backup.clone(),
                status: self.health.read(OriginRole::Backup),
                probe: backup,
            },
        }
    }

    /// Run [`check`](Self::check) every `health_check.interval` until shutdown
    pub fn spawn(self: Arc<Self>, mut shutdown_rx: broadcast::Receiver<()>) -> JoinHandle<()> {
        tokio::spawn(async move {
            if !self.config.health_check.enabled {
                return;
            }

            let mut interval = tokio::time::interval(self.config.health_check.interval);
            // the first tick fires immediately; let the server settle first
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let report = self.check().await;
                        info!(
                            primary = report.primary.probe.status,
                            backup = report.backup.probe.status,
                            "Scheduled health check"
                        );
                    }
                    _ = shutdown_rx.recv() => {
                        debug!("Health poller stopping");
                        break;
                    }
                }
            }
        })
    }
}

fn origin_json(report: &OriginReport, now: DateTime<Utc>) -> Value {
    let since_success = now
        .signed_duration_since(report.status.last_success_at)
        .num_seconds()
        .max(0);
    json!({
        "url": report.url,
        "status": report.probe.status,
        "responseTime": report.probe.response_time,
        "message": report.probe.message,
        "downSince": report
            .status
            .down_since
            .map(|t| t.to_rfc3339_opts(SecondsFormat::Millis, true)),
        "lastSuccessfulRequest": report
            .status
            .last_success_at
            .to_rfc3339_opts(SecondsFormat::Millis, true),
        "timeSinceLastSuccess": format!("{since_success}s"),
    })
}

/// Health endpoint body
#[must_use]
pub fn health_json(report: &HealthReport, config: &Config, cache: &CacheStatsSnapshot) -> Value {
    json!({
        "timestamp": report.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
        "primary": origin_json(&report.primary, report.timestamp),
        "backup": origin_json(&report.backup, report.timestamp),
        "worker": {
            "version": env!("CARGO_PKG_VERSION"),
            "cacheableEndpoints": config.routing.cacheable_prefixes,
            "adminOnlyEndpoints": config.routing.admin_only_prefixes,
            "rateLimit": {
                "enabled": config.rate_limit.enabled,
                "limit": config.rate_limit.max_requests,
                "window": format!("{}s", config.rate_limit.window.as_secs()),
            },
            "retry": {
                "enabled": config.retry.enabled,
                "maxRetries": config.retry.max_retries,
            },
            "cache": {
                "primaryTtl": config.cache.primary_ttl.as_secs(),
                "backupTtl": config.cache.backup_ttl.as_secs(),
                "invalidationToken": config.cache.invalidation_token,
                "stats": cache,
            },
        },
    })
}

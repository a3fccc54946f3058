//! Best-effort operator alerts on origin health transitions
//!
//! [`NotificationGate::notify`] is synchronous and never blocks: it applies
//! the cooldown, then hands the message to a bounded queue. A detached
//! dispatcher task drains the queue into a [`NotificationSink`], logging and
//! swallowing every failure.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::NotificationConfig;
use crate::{Error, Result};

/// Embed color for critical alerts (red)
const CRITICAL_COLOR: u32 = 16_711_680;
/// Embed color for everything else (blue)
const INFO_COLOR: u32 = 39_423;

/// Alert severity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Single-origin transitions
    Info,
    /// Both origins unavailable
    Critical,
}

/// A message accepted for dispatch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    /// Human-readable text
    pub message: String,
    /// Severity, drives the embed color
    pub severity: Severity,
    /// When the gate accepted it
    pub at: DateTime<Utc>,
}

/// Cooldown-limited entry point for alerts
pub struct NotificationGate {
    enabled: bool,
    cooldown: Duration,
    last_sent: Mutex<Option<DateTime<Utc>>>,
    queue: mpsc::Sender<Notification>,
    clock: Arc<dyn Clock>,
}

impl NotificationGate {
    /// Create the gate and the receiving end of its dispatch queue
    #[must_use]
    pub fn new(
        config: &NotificationConfig,
        clock: Arc<dyn Clock>,
    ) -> (Self, mpsc::Receiver<Notification>) {
        let (queue, rx) = mpsc::channel(config.queue_capacity.max(1));
        let gate = Self {
            enabled: config.enabled,
            cooldown: config.cooldown,
            last_sent: Mutex::new(None),
            queue,
            clock,
        };
        (gate, rx)
    }

    /// Offer a message for dispatch.
    ///
    /// Returns `true` when the message was queued. Calls inside the cooldown
    /// window are dropped, not deferred, unless they are
    /// [`Severity::Critical`]. The cooldown slot is claimed in the same
    /// critical section that checks it.
    pub fn notify(&self, message: impl Into<String>, severity: Severity) -> bool {
        let message = message.into();
        if !self.enabled {
            debug!(message = %message, "Notifications disabled, dropping");
            return false;
        }

        let now = self.clock.now();
        let cooldown = chrono::Duration::from_std(self.cooldown).unwrap_or(chrono::Duration::MAX);
        let mut last_sent = self.last_sent.lock();
        if severity != Severity::Critical
            && let Some(previous) = *last_sent
            && now.signed_duration_since(previous) < cooldown
        {
            debug!(message = %message, "Notification inside cooldown, dropping");
            return false;
        }

        let notification = Notification {
            message,
            severity,
            at: now,
        };
        match self.queue.try_send(notification) {
            Ok(()) => {
                *last_sent = Some(now);
                true
            }
            Err(TrySendError::Full(n)) => {
                warn!(message = %n.message, "Notification queue full, dropping");
                false
            }
            Err(TrySendError::Closed(n)) => {
                debug!(message = %n.message, "Notification dispatcher stopped, dropping");
                false
            }
        }
    }

    /// Time of the last accepted notification
    #[must_use]
    pub fn last_sent(&self) -> Option<DateTime<Utc>> {
        *self.last_sent.lock()
    }
}

/// Destination for alerts
#[async_trait]
pub trait NotificationSink: Send + Sync {
    /// Deliver one notification
    async fn dispatch(&self, notification: &Notification) -> Result<()>;
}

/// Chat-style webhook (`{content, username, embeds}`)
pub struct WebhookSink {
    client: reqwest::Client,
    url: String,
    username: String,
}

impl WebhookSink {
    /// Create a sink posting to `url`
    #[must_use]
    pub fn new(client: reqwest::Client, url: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
            username: username.into(),
        }
    }
}

/// JSON body posted to the webhook
#[must_use]
pub fn webhook_payload(notification: &Notification, username: &str) -> Value {
    let color = match notification.severity {
        Severity::Critical => CRITICAL_COLOR,
        Severity::Info => INFO_COLOR,
    };
    json!({
        "content": notification.message,
        "username": username,
        "embeds": [{
            "color": color,
            "footer": {
                "text": format!(
                    "Server time: {}",
                    notification.at.to_rfc3339_opts(SecondsFormat::Millis, true)
                ),
            },
        }],
    })
}

#[async_trait]
impl NotificationSink for WebhookSink {
    async fn dispatch(&self, notification: &Notification) -> Result<()> {
        let response = self
            .client
            .post(&self.url)
            .timeout(Duration::from_secs(10))
            .json(&webhook_payload(notification, &self.username))
            .send()
            .await
            .map_err(|e| Error::Notification(e.to_string()))?;

        if !response.status().is_success() {
            return Err(Error::Notification(format!(
                "webhook returned HTTP {}",
                response.status().as_u16()
            )));
        }
        Ok(())
    }
}

/// Drain the queue into `sink` until every gate handle is dropped
pub fn spawn_dispatcher(
    mut rx: mpsc::Receiver<Notification>,
    sink: Arc<dyn NotificationSink>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(notification) = rx.recv().await {
            match sink.dispatch(&notification).await {
                Ok(()) => info!(message = %notification.message, "Notification sent"),
                Err(e) => warn!(error = %e, message = %notification.message, "Notification dispatch failed"),
            }
        }
        debug!("Notification dispatcher stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn config() -> NotificationConfig {
        NotificationConfig {
            enabled: true,
            webhook_url: Some("https://hooks.example.com/abc".to_string()),
            cooldown: Duration::from_secs(300),
            queue_capacity: 4,
            ..NotificationConfig::default()
        }
    }

    #[test]
    fn test_cooldown_drops_second_event() {
        let clock = Arc::new(ManualClock::at_secs(1_700_000_000));
        let (gate, mut rx) = NotificationGate::new(&config(), clock.clone());

        assert!(gate.notify("Primary origin is down: HTTP 503", Severity::Info));
        clock.advance(Duration::from_secs(299));
        assert!(!gate.notify("Primary origin has recovered", Severity::Info));

        assert_eq!(rx.try_recv().unwrap().message, "Primary origin is down: HTTP 503");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_cooldown_expires() {
        let clock = Arc::new(ManualClock::at_secs(1_700_000_000));
        let (gate, mut rx) = NotificationGate::new(&config(), clock.clone());

        assert!(gate.notify("first", Severity::Info));
        clock.advance(Duration::from_secs(300));
        assert!(gate.notify("second", Severity::Info));

        assert_eq!(rx.try_recv().unwrap().message, "first");
        assert_eq!(rx.try_recv().unwrap().message, "second");
        assert_eq!(gate.last_sent(), Some(clock.now()));
    }

    #[test]
    fn test_critical_ignores_cooldown_and_claims_it() {
        let clock = Arc::new(ManualClock::at_secs(1_700_000_000));
        let (gate, mut rx) = NotificationGate::new(&config(), clock.clone());

        assert!(gate.notify("Primary origin is down: HTTP 503", Severity::Info));
        clock.advance(Duration::from_secs(1));
        assert!(gate.notify("CRITICAL: both origins are down", Severity::Critical));
        assert_eq!(gate.last_sent(), Some(clock.now()));

        // the window restarts from the critical alert
        clock.advance(Duration::from_secs(299));
        assert!(!gate.notify("Backup origin has recovered", Severity::Info));

        assert_eq!(rx.try_recv().unwrap().severity, Severity::Info);
        assert_eq!(rx.try_recv().unwrap().severity, Severity::Critical);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_disabled_gate_never_queues() {
        let clock = Arc::new(ManualClock::at_secs(0));
        let config = NotificationConfig {
            enabled: false,
            ..config()
        };
        let (gate, mut rx) = NotificationGate::new(&config, clock);
        assert!(!gate.notify("ignored", Severity::Critical));
        assert!(rx.try_recv().is_err());
        assert!(gate.last_sent().is_none());
    }

    #[test]
    fn test_full_queue_does_not_claim_cooldown() {
        let clock = Arc::new(ManualClock::at_secs(0));
        let config = NotificationConfig {
            cooldown: Duration::ZERO,
            queue_capacity: 1,
            ..config()
        };
        let (gate, _rx) = NotificationGate::new(&config, clock);

        assert!(gate.notify("fits", Severity::Info));
        let claimed = gate.last_sent();
        assert!(!gate.notify("overflow", Severity::Info));
        assert_eq!(gate.last_sent(), claimed);
    }

    #[test]
    fn test_webhook_payload_shape() {
        let notification = Notification {
            message: "CRITICAL: both origins are down (primary: HTTP 503, backup: connection failed)"
                .to_string(),
            severity: Severity::Critical,
            at: DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
        };
        let payload = webhook_payload(&notification, "CMS Monitor");

        pretty_assertions::assert_eq!(
            payload,
            json!({
                "content": "CRITICAL: both origins are down (primary: HTTP 503, backup: connection failed)",
                "username": "CMS Monitor",
                "embeds": [{
                    "color": 16_711_680,
                    "footer": {"text": "Server time: 2023-11-14T22:13:20.000Z"}
                }]
            })
        );

        let info = Notification {
            severity: Severity::Info,
            ..notification
        };
        assert_eq!(webhook_payload(&info, "x")["embeds"][0]["color"], 39_423);
    }

    struct FailingSink {
        calls: AtomicU32,
    }

    #[async_trait]
    impl NotificationSink for FailingSink {
        async fn dispatch(&self, _notification: &Notification) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(Error::Notification("webhook returned HTTP 500".into()))
        }
    }

    #[tokio::test]
    async fn test_dispatcher_swallows_failures() {
        let clock = Arc::new(ManualClock::at_secs(0));
        let config = NotificationConfig {
            cooldown: Duration::ZERO,
            ..config()
        };
        let (gate, rx) = NotificationGate::new(&config, clock);
        let sink = Arc::new(FailingSink {
            calls: AtomicU32::new(0),
        });
        let handle = spawn_dispatcher(rx, sink.clone());

        assert!(gate.notify("one", Severity::Info));
        assert!(gate.notify("two", Severity::Info));
        drop(gate);

        handle.await.unwrap();
        assert_eq!(sink.calls.load(Ordering::SeqCst), 2);
    }
}

//! Shared fixtures: scripted origins and a fully wired router

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode, Uri};
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use cms_failover::cache::{MemoryCacheStore, ResponseCache};
use cms_failover::clock::ManualClock;
use cms_failover::config::Config;
use cms_failover::failsafe::HealthTracker;
use cms_failover::gateway::{FailoverRouter, HealthPoller, InboundRequest};
use cms_failover::notify::{Notification, NotificationGate};
use cms_failover::transport::{HttpClient, OriginResponse, OutboundRequest};
use cms_failover::{Error, Result};

pub const PRIMARY: &str = "http://primary.test";
pub const BACKUP: &str = "http://backup.test";

/// What a scripted origin does on one call
#[derive(Debug, Clone, Copy)]
pub enum Reply {
    /// Respond with this status and body
    Status(u16, &'static str),
    /// Fail without a response
    Refused,
}

/// One origin's script; the last reply repeats forever
pub struct Script {
    replies: Mutex<VecDeque<Reply>>,
    calls: AtomicU32,
}

impl Script {
    fn new(replies: Vec<Reply>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            calls: AtomicU32::new(0),
        }
    }

    fn next(&self) -> Reply {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut replies = self.replies.lock();
        if replies.len() > 1 {
            replies.pop_front().unwrap()
        } else {
            *replies.front().expect("script must not be empty")
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn set(&self, replies: Vec<Reply>) {
        *self.replies.lock() = replies.into();
    }
}

/// Fake primary and backup behind one [`HttpClient`]
pub struct FakeOrigins {
    pub primary: Script,
    pub backup: Script,
    pub requests: Mutex<Vec<OutboundRequest>>,
}

impl FakeOrigins {
    pub fn new(primary: Vec<Reply>, backup: Vec<Reply>) -> Arc<Self> {
        Arc::new(Self {
            primary: Script::new(primary),
            backup: Script::new(backup),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn last_request(&self) -> OutboundRequest {
        self.requests.lock().last().cloned().expect("no request sent")
    }

    pub fn urls(&self) -> Vec<String> {
        self.requests.lock().iter().map(|r| r.url.clone()).collect()
    }
}

#[async_trait]
impl HttpClient for FakeOrigins {
    async fn send(&self, request: OutboundRequest) -> Result<OriginResponse> {
        let script = if request.url.starts_with(PRIMARY) {
            &self.primary
        } else if request.url.starts_with(BACKUP) {
            &self.backup
        } else {
            panic!("request to unknown origin: {}", request.url);
        };
        self.requests.lock().push(request);

        match script.next() {
            Reply::Status(status, body) => {
                let mut headers = HeaderMap::new();
                headers.insert("content-type", HeaderValue::from_static("application/json"));
                Ok(OriginResponse::new(
                    StatusCode::from_u16(status).unwrap(),
                    headers,
                    body,
                ))
            }
            Reply::Refused => Err(Error::Transport(
                "tcp connect error: Connection refused (os error 111)".into(),
            )),
        }
    }
}

/// Config pointing at the fake origins, tuned for fast deterministic tests
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.origins.primary = PRIMARY.to_string();
    config.origins.backup = BACKUP.to_string();
    config.origins.timeout = Duration::from_secs(5);
    config.retry.max_retries = 2;
    config.notifications.enabled = true;
    config.notifications.webhook_url = Some("https://hooks.example.com/test".to_string());
    config.notifications.cooldown = Duration::ZERO;
    config
}

/// Everything a test may want to poke at
pub struct Harness {
    pub config: Arc<Config>,
    pub router: Arc<FailoverRouter>,
    pub poller: Arc<HealthPoller>,
    pub origins: Arc<FakeOrigins>,
    pub health: Arc<HealthTracker>,
    pub store: Arc<MemoryCacheStore>,
    pub clock: Arc<ManualClock>,
    pub notifications: mpsc::Receiver<Notification>,
}

impl Harness {
    pub fn new(origins: Arc<FakeOrigins>) -> Self {
        Self::with_config(origins, test_config())
    }

    pub fn with_config(origins: Arc<FakeOrigins>, config: Config) -> Self {
        let config = Arc::new(config);
        let clock = Arc::new(ManualClock::at_secs(1_700_000_000));
        let health = Arc::new(HealthTracker::new(clock.clone()));
        let (gate, notifications) = NotificationGate::new(&config.notifications, clock.clone());
        let gate = Arc::new(gate);
        let store = Arc::new(MemoryCacheStore::new(config.cache.max_entries, clock.clone()));
        let cache = ResponseCache::new(&config.cache, store.clone(), clock.clone());
        let client: Arc<dyn HttpClient> = origins.clone();

        let router = Arc::new(FailoverRouter::new(
            Arc::clone(&config),
            Arc::clone(&client),
            cache,
            Arc::clone(&health),
            Arc::clone(&gate),
            clock.clone(),
        ));
        let poller = Arc::new(HealthPoller::new(
            Arc::clone(&config),
            client,
            Arc::clone(&health),
            gate,
            clock.clone(),
        ));

        Self {
            config,
            router,
            poller,
            origins,
            health,
            store,
            clock,
            notifications,
        }
    }

    /// Drain every queued notification message
    pub fn drain_notifications(&mut self) -> Vec<Notification> {
        let mut out = Vec::new();
        while let Ok(n) = self.notifications.try_recv() {
            out.push(n);
        }
        out
    }
}

/// Build an inbound request from a fixed client
pub fn request(method: Method, uri: &str) -> InboundRequest {
    InboundRequest {
        method,
        uri: uri.parse::<Uri>().unwrap(),
        headers: HeaderMap::new(),
        body: Bytes::new(),
        client: "203.0.113.10".to_string(),
    }
}

pub fn get(uri: &str) -> InboundRequest {
    request(Method::GET, uri)
}

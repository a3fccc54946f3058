//! Gateway server

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::failover::FailoverRouter;
use super::poller::HealthPoller;
use super::router::{AppState, create_router};
use crate::cache::{CacheStatsSnapshot, MemoryCacheStore, ResponseCache};
use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::failsafe::HealthTracker;
use crate::notify::{NotificationGate, NotificationSink, WebhookSink, spawn_dispatcher};
use crate::transport::{HttpClient, ReqwestClient};
use crate::{Error, Result};

/// Housekeeping cadence for cache and rate-limit pruning
const HOUSEKEEPING_INTERVAL: Duration = Duration::from_secs(60);

/// CMS failover gateway
pub struct Gateway {
    config: Arc<Config>,
    router: Arc<FailoverRouter>,
    poller: Arc<HealthPoller>,
    store: Arc<MemoryCacheStore>,
    dispatcher: Option<JoinHandle<()>>,
}

impl Gateway {
    /// Wire up every component from `config`.
    ///
    /// Must be called inside a tokio runtime: the notification dispatcher is
    /// spawned here.
    pub fn new(config: Config) -> Result<Self> {
        let config = Arc::new(config);
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let reqwest_client = ReqwestClient::new()?;
        let webhook_client = reqwest_client.inner().clone();
        let client: Arc<dyn HttpClient> = Arc::new(reqwest_client);

        let (gate, queue) = NotificationGate::new(&config.notifications, Arc::clone(&clock));
        let dispatcher = match (&config.notifications.webhook_url, config.notifications.enabled) {
            (Some(url), true) => {
                let sink: Arc<dyn NotificationSink> = Arc::new(WebhookSink::new(
                    webhook_client,
                    url.clone(),
                    config.notifications.username.clone(),
                ));
                Some(spawn_dispatcher(queue, sink))
            }
            _ => None,
        };
        let notifier = Arc::new(gate);

        let health = Arc::new(HealthTracker::new(Arc::clone(&clock)));
        let store = Arc::new(MemoryCacheStore::new(
            config.cache.max_entries,
            Arc::clone(&clock),
        ));
        let cache = ResponseCache::new(&config.cache, store.clone(), Arc::clone(&clock));

        let router = Arc::new(FailoverRouter::new(
            Arc::clone(&config),
            Arc::clone(&client),
            cache,
            Arc::clone(&health),
            Arc::clone(&notifier),
            Arc::clone(&clock),
        ));
        let poller = Arc::new(HealthPoller::new(
            Arc::clone(&config),
            client,
            health,
            notifier,
            clock,
        ));

        Ok(Self {
            config,
            router,
            poller,
            store,
            dispatcher,
        })
    }

    /// Poller sharing this gateway's tracker, used by the `probe` command
    #[must_use]
    pub fn poller(&self) -> Arc<HealthPoller> {
        Arc::clone(&self.poller)
    }

    /// Current response cache statistics
    #[must_use]
    pub fn cache_stats(&self) -> CacheStatsSnapshot {
        self.store.stats()
    }

    /// Warn when a fully failing request can outlive the server deadline
    fn check_latency_budget(&self) {
        let retry = self.router.retry_policy();
        let timeout = self.config.origins.timeout;
        let worst_case = retry.worst_case_latency(timeout) + timeout;
        if worst_case > self.config.server.request_timeout {
            warn!(
                worst_case_ms = worst_case.as_millis(),
                request_timeout_ms = self.config.server.request_timeout.as_millis(),
                "Worst-case failover latency exceeds the request timeout; \
                 slow outages will surface as gateway timeouts"
            );
        } else {
            debug!(worst_case_ms = worst_case.as_millis(), "Failover latency budget ok");
        }
    }

    fn spawn_housekeeping(&self, mut shutdown_rx: broadcast::Receiver<()>) -> JoinHandle<()> {
        let store = Arc::clone(&self.store);
        let router = Arc::clone(&self.router);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(HOUSEKEEPING_INTERVAL);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let evicted = store.evict_expired();
                        let pruned = router.limiter().prune();
                        if evicted > 0 || pruned > 0 {
                            debug!(evicted, pruned, "Housekeeping");
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        break;
                    }
                }
            }
        })
    }

    /// Run the gateway until Ctrl-C or SIGTERM
    pub async fn run(self) -> Result<()> {
        let addr = SocketAddr::new(
            self.config
                .server
                .host
                .parse()
                .map_err(|e| Error::Config(format!("Invalid host: {e}")))?,
            self.config.server.port,
        );

        let (shutdown_tx, _) = broadcast::channel(1);

        let state = Arc::new(AppState {
            config: Arc::clone(&self.config),
            router: Arc::clone(&self.router),
            poller: Arc::clone(&self.poller),
            store: Arc::clone(&self.store),
        });
        let app = create_router(state);

        let listener = TcpListener::bind(addr).await?;

        info!("============================================================");
        info!("CMS FAILOVER v{}", env!("CARGO_PKG_VERSION"));
        info!("============================================================");
        info!(host = %self.config.server.host, port = %self.config.server.port, "Listening");
        info!(primary = %self.config.origins.primary, backup = %self.config.origins.backup, "Origins");
        info!(path = %self.config.health_check.path, "Health endpoint");
        if self.config.notifications.enabled {
            info!(cooldown_secs = self.config.notifications.cooldown.as_secs(), "Notifications enabled");
        } else {
            info!("Notifications disabled");
        }
        info!("============================================================");

        self.check_latency_budget();

        let poller = Arc::clone(&self.poller).spawn(shutdown_tx.subscribe());
        let housekeeping = self.spawn_housekeeping(shutdown_tx.subscribe());

        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown_signal(shutdown_tx))
        .await
        .map_err(|e| Error::Internal(e.to_string()))?;

        info!("Stopping background tasks...");
        let grace = self.config.server.shutdown_timeout;
        if tokio::time::timeout(grace, futures::future::join(poller, housekeeping))
            .await
            .is_err()
        {
            warn!(grace_secs = grace.as_secs(), "Background tasks did not stop in time");
        }
        if let Some(dispatcher) = self.dispatcher {
            dispatcher.abort();
        }

        Ok(())
    }
}

/// Shutdown signal handler
async fn shutdown_signal(shutdown_tx: broadcast::Sender<()>) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received");
    let _ = shutdown_tx.send(());
}

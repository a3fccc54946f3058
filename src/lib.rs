//! CMS Failover Library
//!
//! Request router that sits in front of a primary and a backup headless-CMS
//! origin sharing one database.
//!
//! # Features
//!
//! - **Failover**: primary first with bounded exponential-backoff retry, then a
//!   single backup attempt; writes are never silently sent to the backup
//! - **Admin routes**: primary only, with a distinct 503 when it is down
//! - **Response cache**: token-invalidated keys that honor `Vary`, longer TTLs
//!   for backup-served data
//! - **Health tracking**: one tracker fed by live traffic and a scheduled
//!   poller, with cooldown-limited webhook alerts on transitions
//! - **Rate limiting**: fixed-window counter per client

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cache;
pub mod cli;
pub mod clock;
pub mod config;
pub mod error;
pub mod failsafe;
pub mod gateway;
pub mod notify;
pub mod transport;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
///
/// `RUST_LOG` takes precedence over `level`.
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => subscriber
            .with(fmt::layer().json())
            .try_init()
            .map_err(|e| Error::Internal(e.to_string())),
        _ => subscriber
            .with(fmt::layer())
            .try_init()
            .map_err(|e| Error::Internal(e.to_string())),
    }
}

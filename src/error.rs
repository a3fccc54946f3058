//! Error types for the CMS failover gateway

use std::io;
use std::time::Duration;

use thiserror::Error;

/// Result type alias for the failover gateway
pub type Result<T> = std::result::Result<T, Error>;

/// Failover gateway errors
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// A single origin attempt exceeded its deadline
    #[error("Origin request timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    /// DNS, connect, TLS or body read failure talking to an origin
    #[error("Transport error: {0}")]
    Transport(String),

    /// Origin answered with a 5xx status
    #[error("Origin returned HTTP {0}")]
    OriginServer(u16),

    /// Webhook dispatch failed (logged, never surfaced to callers)
    #[error("Notification dispatch failed: {0}")]
    Notification(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether a failed origin attempt is worth repeating
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout(_) | Self::Transport(_) | Self::OriginServer(_) | Self::Io(_)
        )
    }

    /// Description that is safe to expose to API callers.
    ///
    /// Transport failures carry resolver and socket detail that must not
    /// leak into responses, so they collapse to a generic phrase.
    #[must_use]
    pub fn public_detail(&self) -> String {
        match self {
            Self::Timeout(d) => format!("timed out after {}ms", d.as_millis()),
            Self::OriginServer(status) => format!("HTTP {status}"),
            Self::Transport(_) | Self::Io(_) => "connection failed".to_string(),
            _ => "internal error".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(Error::Timeout(Duration::from_secs(5)).is_retryable());
        assert!(Error::Transport("refused".into()).is_retryable());
        assert!(Error::OriginServer(503).is_retryable());
        assert!(!Error::Config("bad".into()).is_retryable());
        assert!(!Error::Notification("hook down".into()).is_retryable());
    }

    #[test]
    fn test_public_detail_hides_transport_text() {
        let err = Error::Transport("dns error: no record for cms.internal.example".into());
        assert_eq!(err.public_detail(), "connection failed");
        assert_eq!(
            Error::Timeout(Duration::from_millis(5000)).public_detail(),
            "timed out after 5000ms"
        );
        assert_eq!(Error::OriginServer(502).public_detail(), "HTTP 502");
    }

    #[test]
    fn test_timeout_display_carries_duration() {
        let err = Error::Timeout(Duration::from_millis(250));
        assert_eq!(err.to_string(), "Origin request timed out after 250ms");
    }
}

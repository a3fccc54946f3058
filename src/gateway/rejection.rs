//! Structured rejections returned by the failover router

use axum::Json;
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde_json::{Value, json};
use thiserror::Error;

/// A request the router refused, or could not serve from either origin.
///
/// Every variant renders as JSON with `error: true` so callers can branch on
/// the status code alone.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Rejection {
    /// Client exceeded its request ceiling for the current window
    #[error("Rate limit exceeded. Please try again later.")]
    RateLimited {
        /// Seconds until the window resets
        retry_after_secs: u64,
    },

    /// Method outside the accepted list
    #[error("Invalid HTTP method")]
    InvalidMethod {
        /// Methods the gateway accepts, sent as `Allow`
        allowed: Vec<String>,
    },

    /// Admin-only path while the primary is unreachable
    #[error("This functionality is only available when the primary server is online.")]
    AdminUnavailable {
        /// Primary origin URL
        primary_url: String,
        /// Path as requested
        request_path: String,
        /// Client back-off hint
        retry_after_secs: u64,
    },

    /// Write that would have landed on the backup
    #[error("Write operations are not allowed when the primary server is down.")]
    WriteRejectedOnBackup {
        /// Path as requested
        request_path: String,
        /// Client back-off hint
        retry_after_secs: u64,
    },

    /// Neither origin produced a usable response
    #[error("Both CMS origins are unavailable. Please try again later.")]
    BothOriginsUnavailable {
        /// Primary origin URL
        primary_url: String,
        /// Backup origin URL
        backup_url: String,
        /// Path as requested
        request_path: String,
        /// Sanitized failure description
        details: String,
        /// Client back-off hint
        retry_after_secs: u64,
    },
}

impl Rejection {
    /// HTTP status for this rejection
    #[must_use]
    pub fn status(&self) -> StatusCode {
        match self {
            Self::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::InvalidMethod { .. } => StatusCode::METHOD_NOT_ALLOWED,
            Self::WriteRejectedOnBackup { .. } => StatusCode::FORBIDDEN,
            Self::AdminUnavailable { .. } | Self::BothOriginsUnavailable { .. } => {
                StatusCode::SERVICE_UNAVAILABLE
            }
        }
    }

    /// Short machine name, used in logs
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::RateLimited { .. } => "rate_limited",
            Self::InvalidMethod { .. } => "invalid_method",
            Self::AdminUnavailable { .. } => "admin_unavailable",
            Self::WriteRejectedOnBackup { .. } => "write_rejected_on_backup",
            Self::BothOriginsUnavailable { .. } => "both_origins_unavailable",
        }
    }

    /// Value for the `Retry-After` header, when one applies
    #[must_use]
    pub fn retry_after(&self) -> Option<u64> {
        match self {
            Self::InvalidMethod { .. } => None,
            Self::RateLimited { retry_after_secs }
            | Self::AdminUnavailable {
                retry_after_secs, ..
            }
            | Self::WriteRejectedOnBackup {
                retry_after_secs, ..
            }
            | Self::BothOriginsUnavailable {
                retry_after_secs, ..
            } => Some(*retry_after_secs),
        }
    }

    /// JSON envelope
    #[must_use]
    pub fn body(&self) -> Value {
        let message = self.to_string();
        match self {
            Self::RateLimited { retry_after_secs } => json!({
                "error": true,
                "message": message,
                "retryAfter": retry_after_secs,
            }),
            Self::InvalidMethod { .. } => json!({
                "error": true,
                "message": message,
            }),
            Self::AdminUnavailable {
                primary_url,
                request_path,
                retry_after_secs,
            } => json!({
                "error": true,
                "message": message,
                "details": "Admin operations are restricted to the primary server.",
                "primaryUrl": primary_url,
                "requestPath": request_path,
                "retryAfter": retry_after_secs,
            }),
            Self::WriteRejectedOnBackup {
                request_path,
                retry_after_secs,
            } => json!({
                "error": true,
                "message": message,
                "serverRole": "backup",
                "retryEstimate": "Unknown - primary server is currently unavailable",
                "requestPath": request_path,
                "retryAfter": retry_after_secs,
            }),
            Self::BothOriginsUnavailable {
                primary_url,
                backup_url,
                request_path,
                details,
                retry_after_secs,
            } => json!({
                "error": true,
                "message": message,
                "primaryUrl": primary_url,
                "backupUrl": backup_url,
                "requestPath": request_path,
                "details": details,
                "retryAfter": retry_after_secs,
            }),
        }
    }
}

impl IntoResponse for Rejection {
    fn into_response(self) -> Response {
        let mut response = (self.status(), Json(self.body())).into_response();
        let headers = response.headers_mut();
        headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
        if let Some(secs) = self.retry_after() {
            headers.insert(header::RETRY_AFTER, HeaderValue::from(secs));
        }
        if let Self::InvalidMethod { allowed } = &self
            && let Ok(value) = HeaderValue::from_str(&allowed.join(", "))
        {
            headers.insert(header::ALLOW, value);
        }
        response
    }
}

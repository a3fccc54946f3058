//! Configuration management

use std::{env, path::Path, time::Duration};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use regex::Regex;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::{Error, Result};

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Environment files to load before processing config.
    /// Paths support ~ expansion. Loaded in order, later files override earlier.
    /// Variables are set into the process environment for `${VAR}` resolution.
    pub env_files: Vec<String>,
    /// Inbound server configuration
    pub server: ServerConfig,
    /// Primary and backup origins
    pub origins: OriginsConfig,
    /// Route classification
    pub routing: RoutingConfig,
    /// Response cache
    pub cache: CacheConfig,
    /// Retry policy for primary attempts
    pub retry: RetryConfig,
    /// Per-client rate limiting
    pub rate_limit: RateLimitConfig,
    /// Health-check poller and status endpoint
    pub health_check: HealthCheckConfig,
    /// Webhook notifications on origin state transitions
    pub notifications: NotificationConfig,
    /// CORS policy
    pub cors: CorsConfig,
}

impl Config {
    /// Load configuration from file and environment
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist, cannot be parsed,
    /// or fails validation.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        // CMS_FAILOVER_ORIGINS__PRIMARY=https://... etc.
        figment = figment.merge(Env::prefixed("CMS_FAILOVER_").split("__"));

        let mut config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        config.load_env_files();
        config.expand_env_vars();
        config.validate()?;

        Ok(config)
    }

    /// Load environment files into the process environment.
    /// Files that don't exist are silently skipped.
    fn load_env_files(&self) {
        for path_str in &self.env_files {
            let expanded = if path_str.starts_with('~') {
                if let Some(home) = dirs::home_dir() {
                    path_str.replacen('~', &home.display().to_string(), 1)
                } else {
                    path_str.clone()
                }
            } else {
                path_str.clone()
            };

            let path = Path::new(&expanded);
            if path.exists() {
                match dotenvy::from_path(path) {
                    Ok(()) => tracing::info!("Loaded env file: {expanded}"),
                    Err(e) => tracing::warn!("Failed to load env file {expanded}: {e}"),
                }
            } else {
                tracing::debug!("Env file not found (skipped): {expanded}");
            }
        }
    }

    /// Expand `${VAR}` and `${VAR:-default}` in origin and webhook URLs
    fn expand_env_vars(&mut self) {
        let re = Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)(?::-([^}]*))?\}")
            .expect("static env var pattern is valid");

        self.origins.primary = Self::expand_string(&re, &self.origins.primary);
        self.origins.backup = Self::expand_string(&re, &self.origins.backup);
        if let Some(url) = self.notifications.webhook_url.as_mut() {
            *url = Self::expand_string(&re, url);
        }
    }

    fn expand_string(re: &Regex, value: &str) -> String {
        re.replace_all(value, |caps: &regex::Captures| {
            let var_name = &caps[1];
            let default = caps.get(2).map_or("", |m| m.as_str());
            env::var(var_name).unwrap_or_else(|_| default.to_string())
        })
        .into_owned()
    }

    /// Check cross-field constraints that serde defaults cannot express
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` describing the first violated constraint.
    pub fn validate(&self) -> Result<()> {
        validate_origin_url("origins.primary", &self.origins.primary)?;
        validate_origin_url("origins.backup", &self.origins.backup)?;

        if self.rate_limit.enabled && self.rate_limit.max_requests == 0 {
            return Err(Error::Config(
                "rate_limit.max_requests must be greater than zero".to_string(),
            ));
        }
        if self.rate_limit.window.is_zero() {
            return Err(Error::Config("rate_limit.window must be non-zero".to_string()));
        }
        if self.retry.backoff_factor < 1.0 {
            return Err(Error::Config(format!(
                "retry.backoff_factor must be >= 1.0, got {}",
                self.retry.backoff_factor
            )));
        }
        if self.retry.max_delay < self.retry.initial_delay {
            return Err(Error::Config(
                "retry.max_delay must not be smaller than retry.initial_delay".to_string(),
            ));
        }
        if self.notifications.enabled && self.notifications.webhook_url.is_none() {
            return Err(Error::Config(
                "notifications.webhook_url is required when notifications are enabled"
                    .to_string(),
            ));
        }
        if !self.health_check.path.starts_with('/') {
            return Err(Error::Config(format!(
                "health_check.path must start with '/', got {}",
                self.health_check.path
            )));
        }
        Ok(())
    }
}

fn validate_origin_url(field: &str, value: &str) -> Result<()> {
    let url = Url::parse(value).map_err(|e| Error::Config(format!("{field}: {e}")))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(Error::Config(format!(
            "{field}: unsupported scheme {}",
            url.scheme()
        )));
    }
    Ok(())
}

/// Inbound server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Outer deadline for a whole inbound request, including retries and failover
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    /// Graceful shutdown timeout
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
    /// Maximum request body size (bytes)
    pub max_body_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8787,
            request_timeout: Duration::from_secs(60),
            shutdown_timeout: Duration::from_secs(30),
            max_body_size: 10 * 1024 * 1024,
        }
    }
}

/// Origin endpoints
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OriginsConfig {
    /// Primary origin base URL (source of truth for writes)
    pub primary: String,
    /// Backup origin base URL
    pub backup: String,
    /// Deadline for a single origin attempt
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Value of the `X-Forwarded-By` marker added to proxied requests
    pub forwarded_by: String,
    /// Path sent to the backup in place of a bare `/`
    ///
    /// The backup serves no site root, so root requests are pointed at its
    /// API base instead. `None` forwards `/` unchanged.
    pub backup_root_path: Option<String>,
}

impl Default for OriginsConfig {
    fn default() -> Self {
        Self {
            primary: "http://127.0.0.1:1337".to_string(),
            backup: "http://127.0.0.1:1338".to_string(),
            timeout: Duration::from_secs(5),
            forwarded_by: "cms-failover".to_string(),
            backup_root_path: Some("/api".to_string()),
        }
    }
}

/// Route classification
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    /// Methods accepted at all; anything else is a 405
    pub allowed_methods: Vec<String>,
    /// Methods presumed to mutate origin state
    pub write_methods: Vec<String>,
    /// Prefixes served by the primary only, never cached
    pub admin_only_prefixes: Vec<String>,
    /// Prefixes whose GET responses may be cached
    pub cacheable_prefixes: Vec<String>,
    /// Prefixes whose writes may still go to the backup
    pub auth_exception_prefixes: Vec<String>,
    /// Header that, when set to `true`, lets a write through to the backup
    pub force_write_header: String,
    /// Provenance header set on backup responses
    pub served_by_header: String,
    /// `Retry-After` hint for infrastructure failures
    #[serde(with = "humantime_serde")]
    pub retry_after: Duration,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        let strings = |items: &[&str]| items.iter().map(ToString::to_string).collect();
        Self {
            allowed_methods: strings(&["GET", "POST", "PUT", "PATCH", "DELETE", "HEAD", "OPTIONS"]),
            write_methods: strings(&["POST", "PUT", "PATCH", "DELETE"]),
            admin_only_prefixes: strings(&["/admin", "/api/upload", "/api/admin"]),
            cacheable_prefixes: strings(&[
                "/api/business-plans",
                "/api/marketing-plans",
                "/api/certificates",
                "/api/photography",
            ]),
            auth_exception_prefixes: strings(&["/api/auth/"]),
            force_write_header: "x-force-write".to_string(),
            served_by_header: "X-Served-By".to_string(),
            retry_after: Duration::from_secs(300),
        }
    }
}

impl RoutingConfig {
    /// Whether `method` is in the allow-list
    #[must_use]
    pub fn is_allowed_method(&self, method: &str) -> bool {
        self.allowed_methods.iter().any(|m| m.eq_ignore_ascii_case(method))
    }

    /// Whether `method` mutates origin state
    #[must_use]
    pub fn is_write_method(&self, method: &str) -> bool {
        self.write_methods.iter().any(|m| m.eq_ignore_ascii_case(method))
    }

    /// Whether `path` must only ever reach the primary
    #[must_use]
    pub fn is_admin_only(&self, path: &str) -> bool {
        self.admin_only_prefixes.iter().any(|p| path.starts_with(p.as_str()))
    }

    /// Whether `path` is on the cacheable allow-list
    #[must_use]
    pub fn is_cacheable_path(&self, path: &str) -> bool {
        self.cacheable_prefixes.iter().any(|p| path.starts_with(p.as_str()))
    }

    /// Whether writes to `path` are tolerated on the backup
    #[must_use]
    pub fn is_auth_exception(&self, path: &str) -> bool {
        self.auth_exception_prefixes
            .iter()
            .any(|p| path.starts_with(p.as_str()))
    }
}

/// Response cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Enable response caching
    pub enabled: bool,
    /// TTL for primary responses
    #[serde(with = "humantime_serde")]
    pub primary_ttl: Duration,
    /// TTL for backup responses
    #[serde(with = "humantime_serde")]
    pub backup_ttl: Duration,
    /// TTL for client-error responses when `cache_client_errors` is on
    #[serde(with = "humantime_serde")]
    pub error_ttl: Duration,
    /// Cache 4xx pass-through responses on cacheable paths for `error_ttl`
    pub cache_client_errors: bool,
    /// Embedded in every key; changing it orphans all existing entries
    pub invalidation_token: String,
    /// Entries larger than this (bytes) are dropped instead of served
    pub max_entry_size: usize,
    /// Maximum number of entries held in memory
    pub max_entries: usize,
    /// Query parameters that skip the cache lookup
    pub bypass_params: Vec<String>,
    /// Request headers the origin varies on; they are part of the key
    pub vary_headers: Vec<String>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            primary_ttl: Duration::from_secs(60 * 60),
            backup_ttl: Duration::from_secs(2 * 60 * 60),
            error_ttl: Duration::from_secs(5 * 60),
            cache_client_errors: false,
            invalidation_token: "v1".to_string(),
            max_entry_size: 50 * 1024 * 1024,
            max_entries: 10_000,
            bypass_params: vec!["nocache".to_string(), "refresh".to_string()],
            vary_headers: vec!["Accept".to_string(), "Accept-Language".to_string()],
        }
    }
}

/// Retry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Enable retries
    pub enabled: bool,
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Delay before the first retry
    #[serde(with = "humantime_serde")]
    pub initial_delay: Duration,
    /// Upper bound for any single delay
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,
    /// Multiplier applied per retry
    pub backoff_factor: f32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_retries: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            backoff_factor: 1.5,
        }
    }
}

/// Rate limiting configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Enable rate limiting
    pub enabled: bool,
    /// Requests allowed per client per window
    pub max_requests: u32,
    /// Fixed window length
    #[serde(with = "humantime_serde")]
    pub window: Duration,
    /// Paths never limited (the health path is always exempt)
    pub exempt_paths: Vec<String>,
    /// Header carrying the real client address
    pub client_ip_header: String,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_requests: 60,
            window: Duration::from_secs(60),
            exempt_paths: Vec::new(),
            client_ip_header: "cf-connecting-ip".to_string(),
        }
    }
}

/// Health check configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthCheckConfig {
    /// Enable the background poller
    pub enabled: bool,
    /// Inbound path serving the live status report
    pub path: String,
    /// Poll interval
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    /// Origin path probed with GET; defaults to the first cacheable prefix
    pub probe_path: Option<String>,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: "/api/health".to_string(),
            interval: Duration::from_secs(60),
            probe_path: None,
        }
    }
}

/// Webhook notification configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
    /// Enable webhook notifications
    pub enabled: bool,
    /// Webhook URL (Discord-compatible payload)
    pub webhook_url: Option<String>,
    /// Display name for the webhook message
    pub username: String,
    /// Minimum time between two dispatched notifications
    #[serde(with = "humantime_serde")]
    pub cooldown: Duration,
    /// Pending notifications buffered for the dispatcher
    pub queue_capacity: usize,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            webhook_url: None,
            username: "CMS Monitor".to_string(),
            cooldown: Duration::from_secs(5 * 60),
            queue_capacity: 32,
        }
    }
}

/// CORS configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CorsConfig {
    /// Enable CORS headers
    pub enabled: bool,
    /// Allowed origin (`*` for any)
    pub allow_origin: String,
    /// Preflight cache lifetime
    #[serde(with = "humantime_serde")]
    pub max_age: Duration,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            allow_origin: "*".to_string(),
            max_age: Duration::from_secs(86_400),
        }
    }
}

/// Custom humantime serde module for Duration
pub mod humantime_serde {
    use std::time::Duration;

    use serde::{self, Deserialize, Deserializer, Serializer};

    /// Serialize Duration to a human-readable string (e.g., "30s", "250ms")
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the serializer fails.
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if duration.subsec_millis() == 0 {
            serializer.serialize_str(&format!("{}s", duration.as_secs()))
        } else {
            serializer.serialize_str(&format!("{}ms", duration.as_millis()))
        }
    }

    /// Deserialize a human-readable duration ("100ms", "30s", "5m", "2h", or bare seconds)
    ///
    /// # Errors
    ///
    /// Returns a deserialization error if the string cannot be parsed as a duration.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse(&s).map_err(serde::de::Error::custom)
    }

    /// Parse a duration string
    ///
    /// # Errors
    ///
    /// Returns a message for malformed or out-of-range input.
    pub fn parse(s: &str) -> Result<Duration, String> {
        let s = s.trim();
        // "ms" must be checked before the single-letter suffixes
        if let Some(ms) = s.strip_suffix("ms") {
            number(ms).map(Duration::from_millis)
        } else if let Some(h) = s.strip_suffix('h') {
            scaled(h, 3600, s)
        } else if let Some(m) = s.strip_suffix('m') {
            scaled(m, 60, s)
        } else if let Some(secs) = s.strip_suffix('s') {
            number(secs).map(Duration::from_secs)
        } else {
            number(s).map(Duration::from_secs)
        }
    }

    fn number(s: &str) -> Result<u64, String> {
        s.trim()
            .parse::<u64>()
            .map_err(|e| format!("invalid duration {s:?}: {e}"))
    }

    fn scaled(value: &str, unit_secs: u64, original: &str) -> Result<Duration, String> {
        number(value)?
            .checked_mul(unit_secs)
            .map(Duration::from_secs)
            .ok_or_else(|| format!("duration {original:?} is out of range"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_match_worker_settings() {
        let config = Config::default();
        assert_eq!(config.origins.timeout, Duration::from_secs(5));
        assert_eq!(config.cache.primary_ttl, Duration::from_secs(3600));
        assert_eq!(config.cache.backup_ttl, Duration::from_secs(7200));
        assert_eq!(config.retry.max_retries, 3);
        assert!((config.retry.backoff_factor - 1.5).abs() < f32::EPSILON);
        assert_eq!(config.rate_limit.max_requests, 60);
        assert_eq!(config.health_check.path, "/api/health");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_humantime_parse() {
        use humantime_serde::parse;
        assert_eq!(parse("100ms").unwrap(), Duration::from_millis(100));
        assert_eq!(parse("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse("2h").unwrap(), Duration::from_secs(7200));
        assert_eq!(parse("45").unwrap(), Duration::from_secs(45));
        assert!(parse("soon").is_err());
    }

    #[test]
    fn test_humantime_parse_rejects_overflow() {
        use humantime_serde::parse;
        let err = parse("18446744073709551615h").unwrap_err();
        assert!(err.contains("out of range"), "{err}");
        assert!(parse("18446744073709551615m").is_err());
        assert_eq!(
            parse("18446744073709551615s").unwrap(),
            Duration::from_secs(u64::MAX)
        );
    }

    #[test]
    fn test_routing_classification() {
        let routing = RoutingConfig::default();
        assert!(routing.is_admin_only("/admin/content-manager"));
        assert!(routing.is_admin_only("/api/upload/files"));
        assert!(!routing.is_admin_only("/api/certificates"));
        assert!(routing.is_cacheable_path("/api/photography/12"));
        assert!(!routing.is_cacheable_path("/api/users"));
        assert!(routing.is_write_method("post"));
        assert!(!routing.is_write_method("GET"));
        assert!(routing.is_allowed_method("OPTIONS"));
        assert!(!routing.is_allowed_method("TRACE"));
        assert!(routing.is_auth_exception("/api/auth/local"));
    }

    #[test]
    fn test_load_from_yaml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("failover.yaml");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(
            f,
            r#"
origins:
  primary: "https://cms.example.com"
  backup: "https://cms-backup.example.com"
  timeout: "2500ms"
retry:
  max_retries: 2
cache:
  invalidation_token: "v7"
"#
        )
        .unwrap();
        drop(f);

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.origins.primary, "https://cms.example.com");
        assert_eq!(config.origins.timeout, Duration::from_millis(2500));
        assert_eq!(config.retry.max_retries, 2);
        assert_eq!(config.cache.invalidation_token, "v7");
        // untouched sections keep defaults
        assert_eq!(config.rate_limit.window, Duration::from_secs(60));
    }

    #[test]
    fn test_load_missing_file_fails() {
        let err = Config::load(Some(Path::new("/nonexistent/failover.yaml"))).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_validate_rejects_bad_origin() {
        let mut config = Config::default();
        config.origins.backup = "ftp://cms-backup.example.com".to_string();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("origins.backup"));
    }

    #[test]
    fn test_validate_rejects_shrinking_backoff() {
        let mut config = Config::default();
        config.retry.backoff_factor = 0.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_requires_webhook_url() {
        let mut config = Config::default();
        config.notifications.enabled = true;
        assert!(config.validate().is_err());
        config.notifications.webhook_url = Some("https://hooks.example.com/x".to_string());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_expand_env_vars_default_fallback() {
        let mut config = Config::default();
        config.origins.backup = "${CMS_FO_TEST_UNSET_BACKUP:-https://fallback.example.com}".to_string();
        config.expand_env_vars();
        assert_eq!(config.origins.backup, "https://fallback.example.com");
    }

    #[test]
    fn test_load_env_files_sets_env_vars() {
        let dir = tempfile::tempdir().unwrap();
        let env_path = dir.path().join("test.env");
        let mut f = std::fs::File::create(&env_path).unwrap();
        writeln!(f, "CMS_FO_TEST_PRIMARY=https://from-env-file.example.com").unwrap();
        drop(f);

        let mut config = Config {
            env_files: vec![env_path.to_string_lossy().to_string()],
            ..Default::default()
        };
        config.origins.primary = "${CMS_FO_TEST_PRIMARY}".to_string();
        config.load_env_files();
        config.expand_env_vars();

        assert_eq!(config.origins.primary, "https://from-env-file.example.com");
    }

    #[test]
    fn test_load_env_files_skips_missing() {
        let config = Config {
            env_files: vec!["/nonexistent/path/.env".to_string()],
            ..Default::default()
        };
        config.load_env_files();
    }

    #[test]
    fn test_durations_round_trip_through_yaml() {
        let config = Config::default();
        let yaml = serde_yaml::to_string(&config).unwrap();
        assert!(yaml.contains("5s"));
        let parsed: Config = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed.cache.error_ttl, Duration::from_secs(300));
    }
}

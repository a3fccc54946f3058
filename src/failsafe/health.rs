//! Origin health tracking
//!
//! One [`OriginStatus`] per origin, mutated by the failover router on every
//! attempt and by the health poller on every tick. Both go through
//! [`HealthTracker::record_attempt`], which applies the transition rule and
//! reports whether the state flipped inside the same critical section, so a
//! concurrent writer can never make two callers both see the same transition.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{info, warn};

use crate::clock::Clock;

/// Which origin an observation belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OriginRole {
    /// Source of truth, tried first
    Primary,
    /// Read-mostly fallback
    Backup,
}

impl OriginRole {
    /// Lowercase name used in logs and headers
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::Backup => "backup",
        }
    }

    /// Capitalized name used in notification text
    #[must_use]
    pub fn title(self) -> &'static str {
        match self {
            Self::Primary => "Primary",
            Self::Backup => "Backup",
        }
    }
}

impl fmt::Display for OriginRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What an origin attempt produced
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation {
    /// The origin answered with this status
    Status(u16),
    /// No HTTP response at all (timeout, connect or DNS failure)
    TransportFailure,
}

impl Observation {
    /// Status code as stored, `0` for transport failures
    #[must_use]
    pub fn code(self) -> u16 {
        match self {
            Self::Status(code) => code,
            Self::TransportFailure => 0,
        }
    }
}

/// Healthy means an HTTP status below 400; `0` marks a transport failure
#[must_use]
pub fn is_healthy_code(code: u16) -> bool {
    (1..400).contains(&code)
}

/// Direction of a health state change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Healthy -> unhealthy
    WentDown,
    /// Unhealthy -> healthy
    Recovered,
}

/// Last known state of one origin
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OriginStatus {
    /// Most recent status observed; `0` for a transport failure
    pub last_status_code: u16,
    /// Set on the healthy -> unhealthy edge, cleared on recovery
    pub down_since: Option<DateTime<Utc>>,
    /// Last confirmed 2xx
    pub last_success_at: DateTime<Utc>,
}

impl OriginStatus {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            last_status_code: 200,
            down_since: None,
            last_success_at: now,
        }
    }

    /// Whether the last observation was healthy
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        is_healthy_code(self.last_status_code)
    }

    fn apply(&mut self, observation: Observation, now: DateTime<Utc>) -> Option<Transition> {
        let code = observation.code();
        let was_healthy = self.is_healthy();
        let healthy = is_healthy_code(code);

        self.last_status_code = code;
        if (200..300).contains(&code) {
            self.last_success_at = now;
        }

        match (was_healthy, healthy) {
            (true, false) => {
                self.down_since = Some(now);
                Some(Transition::WentDown)
            }
            (false, true) => {
                self.down_since = None;
                Some(Transition::Recovered)
            }
            _ => None,
        }
    }
}

/// Health state for both origins
pub struct HealthTracker {
    primary: Mutex<OriginStatus>,
    backup: Mutex<OriginStatus>,
    clock: Arc<dyn Clock>,
}

impl HealthTracker {
    /// Both origins start healthy, last success "now"
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        let now = clock.now();
        Self {
            primary: Mutex::new(OriginStatus::new(now)),
            backup: Mutex::new(OriginStatus::new(now)),
            clock,
        }
    }

    fn slot(&self, origin: OriginRole) -> &Mutex<OriginStatus> {
        match origin {
            OriginRole::Primary => &self.primary,
            OriginRole::Backup => &self.backup,
        }
    }

    /// Record an attempt and report the state change, if any.
    ///
    /// The read-compare-write happens under one lock; nothing here awaits.
    pub fn record_attempt(&self, origin: OriginRole, observation: Observation) -> Option<Transition> {
        let now = self.clock.now();
        let transition = self.slot(origin).lock().apply(observation, now);

        match transition {
            Some(Transition::WentDown) => warn!(
                origin = %origin,
                status = observation.code(),
                "Origin marked unhealthy"
            ),
            Some(Transition::Recovered) => info!(origin = %origin, "Origin recovered"),
            None => {}
        }
        transition
    }

    /// Snapshot of one origin's state
    #[must_use]
    pub fn read(&self, origin: OriginRole) -> OriginStatus {
        self.slot(origin).lock().clone()
    }

    /// Whether both origins were last seen unhealthy
    #[must_use]
    pub fn both_down(&self) -> bool {
        !self.read(OriginRole::Primary).is_healthy() && !self.read(OriginRole::Backup).is_healthy()
    }
}

//! Lifecycle state for managed services.
//!
//! `Status` is the service state machine; `ServiceState` is the mutable
//! run-time record the orchestrator owns for each registered service.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{Error, Result};

/// Current lifecycle status of a service.
///
/// ```text
/// Stopped ──► Starting ──► Running ──► Stopping ──► Stopped
///                 │            │           │
///                 └────────────┴───────────┴──► Failed
/// ```
///
/// `Starting` and `Stopping` are transient: a service in a transient state
/// rejects new operations instead of queueing them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    /// Service is not running
    Stopped,
    /// Service is in the process of starting
    Starting,
    /// Service container is running
    Running,
    /// Service is in the process of stopping
    Stopping,
    /// Service hit an unrecoverable error
    Failed,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Stopped => write!(f, "stopped"),
            Status::Starting => write!(f, "starting"),
            Status::Running => write!(f, "running"),
            Status::Stopping => write!(f, "stopping"),
            Status::Failed => write!(f, "failed"),
        }
    }
}

impl Status {
    /// Check if a status transition is valid according to the state machine.
    ///
    /// Any state may transition to `Failed` on an unrecoverable error, and
    /// same-state transitions are treated as no-ops.
    pub fn is_valid_transition(&self, to: Status) -> bool {
        use Status::*;
        match (self, to) {
            (Stopped, Starting) => true,
            (Starting, Running) => true,
            (Running, Stopping) => true,
            (Stopping, Stopped) => true,
            // Failed services are restartable and stoppable (cleanup)
            (Failed, Starting) => true,
            (Failed, Stopping) => true,
            // Idempotent stop: a stopped service may be "stopped" again
            (Stopped, Stopping) => true,
            (_, Failed) => true,
            (s1, s2) if *s1 == s2 => true,
            _ => false,
        }
    }

    /// Transient states reject new operations rather than queueing them,
    /// which prevents double-provisioning the same service.
    pub fn is_transient(&self) -> bool {
        matches!(self, Status::Starting | Status::Stopping)
    }
}

/// Health as reported by the health checker, independent of lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    #[default]
    Unknown,
    Healthy,
    Unhealthy,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthStatus::Unknown => write!(f, "unknown"),
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

/// Mutable run-time record for a single registered service.
///
/// Exactly one `ServiceState` exists per registered descriptor. The
/// orchestrator owns the map; each worker writes only its own slot, once per
/// phase transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceState {
    /// Canonical service name
    pub name: String,

    /// Current lifecycle status
    pub status: Status,

    /// Port actually bound (may differ from the preferred port)
    pub port: Option<u16>,

    /// Container identity, when a container exists
    pub container_id: Option<String>,

    /// Health as of the last check
    #[serde(default)]
    pub health: HealthStatus,

    /// When the service was last started
    pub started_at: Option<DateTime<Utc>>,

    /// Last error observed for this service
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl ServiceState {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: Status::Stopped,
            port: None,
            container_id: None,
            health: HealthStatus::Unknown,
            started_at: None,
            last_error: None,
        }
    }

    /// Apply a status transition, validating it against the state machine.
    pub fn transition(&mut self, to: Status) -> Result<()> {
        if !self.status.is_valid_transition(to) {
            return Err(Error::Config(format!(
                "invalid state transition for '{}': {} -> {}",
                self.name, self.status, to
            )));
        }
        self.status = to;
        match to {
            Status::Starting => {
                self.last_error = None;
            }
            Status::Running => {
                self.started_at = Some(Utc::now());
            }
            Status::Stopped => {
                self.port = None;
                self.container_id = None;
                self.health = HealthStatus::Unknown;
                self.started_at = None;
            }
            _ => {}
        }
        Ok(())
    }

    /// Mark the service failed, recording the cause.
    pub fn fail(&mut self, error: impl Into<String>) {
        self.status = Status::Failed;
        self.last_error = Some(error.into());
    }
}

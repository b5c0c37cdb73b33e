//! Container engine seam.
//!
//! The orchestrator consumes a container engine through the narrow
//! [`ContainerEngine`] trait; it never implements container isolation itself.
//! [`DockerEngine`] is the production implementation, shelling out to the
//! `docker` CLI. Tests substitute their own deterministic implementation.

mod docker;
mod error;

pub use docker::DockerEngine;
pub use error::EngineError;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Launch recipe handed to the engine for one container.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    /// Container name (unique per project/service)
    pub name: String,
    /// Image reference, e.g. `pgvector/pgvector:pg16`
    pub image: String,
    /// Environment variables (ordered, unique keys)
    pub env: BTreeMap<String, String>,
    /// Volume specs, `source:target[:ro]`
    pub volumes: Vec<String>,
    /// Host port published to the same container port
    pub port: u16,
    /// Container port to publish (defaults to `port` when None)
    pub container_port: Option<u16>,
    /// Labels for later discovery via [`ContainerEngine::list_by_label`]
    pub labels: BTreeMap<String, String>,
    /// Optional command override
    pub command: Vec<String>,
}

/// Point-in-time view of one container, as reported by the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerInfo {
    pub id: String,
    pub name: String,
    /// Engine-native state string ("running", "exited", ...)
    pub state: String,
    /// Engine-native health string if the image defines a healthcheck
    pub health: Option<String>,
    pub resources: Option<ResourceUsage>,
}

impl ContainerInfo {
    pub fn is_running(&self) -> bool {
        self.state == "running"
    }
}

/// Resource usage snapshot for a running container.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceUsage {
    /// CPU percentage, 0.0-100.0 * cores
    pub cpu_percent: f64,
    /// Memory in bytes
    pub memory_bytes: u64,
}

/// Narrow interface to the container engine.
///
/// All methods are fallible; [`EngineError::is_daemon_unavailable`] separates
/// whole-operation failures from per-container ones.
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// Verify the engine daemon is reachable. Called once before any
    /// service-level work so daemon outages fail the operation up front.
    async fn ping(&self) -> Result<(), EngineError>;

    /// Create and start a container, returning its id.
    async fn create_and_start(&self, spec: &ContainerSpec) -> Result<String, EngineError>;

    /// Stop a container gracefully. Stopping an already-stopped or missing
    /// container is not an error.
    async fn stop(&self, container_id: &str) -> Result<(), EngineError>;

    /// Remove a container. Removing a missing container is not an error.
    async fn remove(&self, container_id: &str) -> Result<(), EngineError>;

    /// Inspect a container's state, health, and resource usage.
    async fn inspect(&self, container_id: &str) -> Result<ContainerInfo, EngineError>;

    /// List containers carrying the given label selector (`key=value`).
    async fn list_by_label(&self, selector: &str) -> Result<Vec<ContainerInfo>, EngineError>;
}

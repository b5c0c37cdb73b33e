//! Shared test support: a deterministic in-memory container engine.
#![allow(dead_code)] // each test binary uses a subset of the helpers

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use homeport::{ContainerEngine, ContainerInfo, ContainerSpec, EngineError};

#[derive(Debug, Clone)]
pub struct MockContainer {
    pub name: String,
    pub service: String,
    pub running: bool,
}

/// In-memory engine with scriptable failures.
#[derive(Default)]
pub struct MockEngine {
    /// Services whose create call fails (simulates bad images)
    fail_create: HashSet<String>,
    /// Whether ping succeeds
    daemon_down: bool,
    /// Artificial latency for create calls
    create_delay: Option<Duration>,
    counter: AtomicU64,
    pub containers: Mutex<HashMap<String, MockContainer>>,
}

impl MockEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn unavailable() -> Self {
        Self {
            daemon_down: true,
            ..Self::default()
        }
    }

    pub fn failing_for(services: &[&str]) -> Self {
        Self {
            fail_create: services.iter().map(|s| s.to_string()).collect(),
            ..Self::default()
        }
    }

    pub fn with_create_delay(mut self, delay: Duration) -> Self {
        self.create_delay = Some(delay);
        self
    }

    pub fn running_count(&self) -> usize {
        self.containers
            .lock()
            .unwrap()
            .values()
            .filter(|c| c.running)
            .count()
    }
}

#[async_trait]
impl ContainerEngine for MockEngine {
    async fn ping(&self) -> Result<(), EngineError> {
        if self.daemon_down {
            Err(EngineError::DaemonUnavailable)
        } else {
            Ok(())
        }
    }

    async fn create_and_start(&self, spec: &ContainerSpec) -> Result<String, EngineError> {
        if let Some(delay) = self.create_delay {
            tokio::time::sleep(delay).await;
        }
        let service = spec
            .labels
            .get("homeport.service")
            .cloned()
            .unwrap_or_default();
        if self.fail_create.contains(&service) {
            return Err(EngineError::CommandFailed {
                command: format!("docker run {}", spec.image),
                stderr: format!("Unable to find image '{}' locally", spec.image),
                exit_code: Some(125),
            });
        }
        let id = format!("mock-{}", self.counter.fetch_add(1, Ordering::SeqCst));
        self.containers.lock().unwrap().insert(
            id.clone(),
            MockContainer {
                name: spec.name.clone(),
                service,
                running: true,
            },
        );
        Ok(id)
    }

    async fn stop(&self, container_id: &str) -> Result<(), EngineError> {
        if let Some(container) = self.containers.lock().unwrap().get_mut(container_id) {
            container.running = false;
        }
        Ok(())
    }

    async fn remove(&self, container_id: &str) -> Result<(), EngineError> {
        self.containers.lock().unwrap().remove(container_id);
        Ok(())
    }

    async fn inspect(&self, container_id: &str) -> Result<ContainerInfo, EngineError> {
        let containers = self.containers.lock().unwrap();
        match containers.get(container_id) {
            Some(container) => Ok(ContainerInfo {
                id: container_id.to_string(),
                name: container.name.clone(),
                state: if container.running {
                    "running".to_string()
                } else {
                    "exited".to_string()
                },
                health: Some("healthy".to_string()),
                resources: None,
            }),
            None => Err(EngineError::ContainerNotFound {
                container: container_id.to_string(),
            }),
        }
    }

    async fn list_by_label(&self, selector: &str) -> Result<Vec<ContainerInfo>, EngineError> {
        let service_filter = selector.strip_prefix("homeport.service=");
        let containers = self.containers.lock().unwrap();
        Ok(containers
            .iter()
            .filter(|(_, c)| service_filter.map_or(true, |s| c.service == s))
            .map(|(id, c)| ContainerInfo {
                id: id.clone(),
                name: c.name.clone(),
                state: if c.running {
                    "running".to_string()
                } else {
                    "exited".to_string()
                },
                health: None,
                resources: None,
            })
            .collect())
    }
}

/// Descriptor builder for tests: no healthcheck, throwaway image.
pub fn descriptor(name: &str, preferred_port: u16) -> homeport::ServiceDescriptor {
    homeport::ServiceDescriptor {
        name: name.to_string(),
        aliases: Vec::new(),
        image: format!("test/{}:latest", name),
        preferred_port,
        container_port: None,
        env: Default::default(),
        volumes: Vec::new(),
        command: Vec::new(),
        healthcheck: None,
    }
}

/// A registry of plain services on OS-assigned base ports.
pub fn registry_of(names: &[&str]) -> homeport::ServiceRegistry {
    // Base on an ephemeral port so tests don't collide with real services.
    let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let base = probe.local_addr().unwrap().port();
    drop(probe);

    let mut registry = homeport::ServiceRegistry::new();
    for (i, name) in names.iter().enumerate() {
        registry
            .register(descriptor(name, base + (i as u16) * 20))
            .unwrap();
    }
    registry
}

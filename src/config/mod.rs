//! Project configuration.
//!
//! Loaded from `homeport.yaml`, discovered by walking up from the working
//! directory. The config supplies the project name, overrides or additions to
//! the built-in service catalog, connectivity settings, and the tunables the
//! orchestrator treats as constants.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::orchestrator::HealthPoller;
use crate::port::{PortAllocator, DEFAULT_FALLBACK_RANGE};
use crate::registry::{HealthCheck, ServiceDescriptor, ServiceRegistry};

pub const CONFIG_FILE: &str = "homeport.yaml";
pub const STATE_DIR: &str = ".homeport";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Project name, used for container names, labels, and the discovery name
    #[serde(default = "default_project")]
    pub project: String,

    /// Extra services, or overrides of built-in catalog entries by name
    #[serde(default)]
    pub services: BTreeMap<String, ServiceConfig>,

    #[serde(default)]
    pub connectivity: ConnectivityConfig,

    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            project: default_project(),
            services: BTreeMap::new(),
            connectivity: ConnectivityConfig::default(),
            orchestrator: OrchestratorConfig::default(),
        }
    }
}

fn default_project() -> String {
    "homeport".to_string()
}

/// Per-service configuration; mirrors [`ServiceDescriptor`] minus the name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub image: String,
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_port: Option<u16>,
    #[serde(default)]
    pub aliases: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub volumes: Vec<String>,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub healthcheck: Option<HealthCheck>,
}

impl ServiceConfig {
    fn into_descriptor(self, name: &str) -> ServiceDescriptor {
        ServiceDescriptor {
            name: name.to_string(),
            aliases: self.aliases,
            image: self.image,
            preferred_port: self.port,
            container_port: self.container_port,
            env: self.env,
            volumes: self.volumes,
            command: self.command,
            healthcheck: self.healthcheck,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectivityConfig {
    /// Whether public exposure (proxy + tunnel) is enabled
    #[serde(default)]
    pub enabled: bool,

    /// Advertise the project on the local network
    #[serde(default = "default_true")]
    pub mdns: bool,

    #[serde(default)]
    pub tunnel: TunnelConfig,
}

impl Default for ConnectivityConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            mdns: true,
            tunnel: TunnelConfig::default(),
        }
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelConfig {
    /// `cloudflare` or `ngrok`
    #[serde(default = "default_provider")]
    pub provider: String,

    /// Custom domain for persistent tunnels
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,

    /// Services to expose through the tunnel; empty means all running
    #[serde(default)]
    pub services: Vec<String>,

    /// Local port for the multi-service reverse proxy
    #[serde(default = "default_proxy_port")]
    pub proxy_port: u16,

    /// Seconds to let in-flight proxied requests drain on stop
    #[serde(default = "default_drain_grace")]
    pub drain_grace_secs: u64,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            domain: None,
            services: Vec::new(),
            proxy_port: default_proxy_port(),
            drain_grace_secs: default_drain_grace(),
        }
    }
}

fn default_provider() -> String {
    "cloudflare".to_string()
}

fn default_proxy_port() -> u16 {
    crate::proxy::DEFAULT_PROXY_PORT
}

fn default_drain_grace() -> u64 {
    5
}

/// Orchestration tunables with documented defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Seconds between health probe attempts
    #[serde(default = "default_health_interval")]
    pub health_interval_secs: u64,

    /// Probe attempts before a starting service is marked failed
    #[serde(default = "default_health_retries")]
    pub health_retries: u32,

    /// Fallback ports probed above an occupied preferred port
    #[serde(default = "default_fallback_range")]
    pub port_fallback_range: u16,

    /// Overall deadline for start/stop operations; absent means none
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation_timeout_secs: Option<u64>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            health_interval_secs: default_health_interval(),
            health_retries: default_health_retries(),
            port_fallback_range: default_fallback_range(),
            operation_timeout_secs: None,
        }
    }
}

fn default_health_interval() -> u64 {
    2
}

fn default_health_retries() -> u32 {
    15
}

fn default_fallback_range() -> u16 {
    DEFAULT_FALLBACK_RANGE
}

impl Config {
    /// Find `homeport.yaml` by walking up from `start`.
    pub fn find_config_file(start: &Path) -> Result<PathBuf> {
        let mut dir = start.to_path_buf();
        loop {
            let candidate = dir.join(CONFIG_FILE);
            if candidate.is_file() {
                return Ok(candidate);
            }
            if !dir.pop() {
                return Err(Error::Config(format!(
                    "could not find {} in {} or any parent directory",
                    CONFIG_FILE,
                    start.display()
                )));
            }
        }
    }

    /// Load and validate a config file.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        let config: Config = serde_yaml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.project.is_empty() {
            return Err(Error::Config("project name must not be empty".to_string()));
        }
        if !self
            .project
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(Error::Config(format!(
                "project name '{}' may only contain alphanumerics, '-' and '_'",
                self.project
            )));
        }
        for (name, service) in &self.services {
            if service.image.is_empty() {
                return Err(Error::Config(format!(
                    "service '{}' has an empty image",
                    name
                )));
            }
            if service.port == 0 {
                return Err(Error::Config(format!(
                    "service '{}' has no preferred port",
                    name
                )));
            }
        }
        Ok(())
    }

    /// Build the service registry: the built-in catalog with config entries
    /// replacing same-named catalog services, plus any extra services.
    pub fn registry(&self) -> Result<ServiceRegistry> {
        let mut registry = ServiceRegistry::new();
        for descriptor in crate::registry::catalog::builtin_services() {
            if self.services.contains_key(&descriptor.name) {
                continue; // overridden below
            }
            registry.register(descriptor)?;
        }
        for (name, service) in &self.services {
            registry.register(service.clone().into_descriptor(name))?;
        }
        Ok(registry)
    }

    pub fn health_poller(&self) -> HealthPoller {
        HealthPoller::new(
            Duration::from_secs(self.orchestrator.health_interval_secs),
            self.orchestrator.health_retries,
        )
    }

    pub fn port_allocator(&self) -> PortAllocator {
        PortAllocator::with_fallback_range(self.orchestrator.port_fallback_range)
    }

    pub fn operation_deadline(&self) -> Option<Duration> {
        self.orchestrator
            .operation_timeout_secs
            .map(Duration::from_secs)
    }

    pub fn proxy_drain_grace(&self) -> Duration {
        Duration::from_secs(self.connectivity.tunnel.drain_grace_secs)
    }

    /// Project-scoped state directory (`.homeport/` beside the config).
    pub fn state_dir(&self, work_dir: &Path) -> PathBuf {
        work_dir.join(STATE_DIR)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_yaml_gets_defaults() {
        let config: Config = serde_yaml::from_str("project: demo").unwrap();
        assert_eq!(config.project, "demo");
        assert!(!config.connectivity.enabled);
        assert_eq!(config.connectivity.tunnel.provider, "cloudflare");
        assert_eq!(config.orchestrator.health_retries, 15);
        assert_eq!(config.orchestrator.port_fallback_range, 10);
    }

    #[test]
    fn custom_service_joins_the_registry() {
        let yaml = r#"
project: demo
services:
  api:
    image: demo/api:latest
    port: 3000
    aliases: [backend]
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        let registry = config.registry().unwrap();
        assert_eq!(registry.resolve("backend").unwrap().name, "api");
        // Catalog entries still present
        assert!(registry.resolve("redis").is_ok());
    }

    #[test]
    fn config_service_overrides_catalog_entry() {
        let yaml = r#"
project: demo
services:
  redis:
    image: redis:6
    port: 7000
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        let registry = config.registry().unwrap();
        let redis = registry.resolve("redis").unwrap();
        assert_eq!(redis.image, "redis:6");
        assert_eq!(redis.preferred_port, 7000);
    }

    #[test]
    fn invalid_project_name_is_rejected() {
        let config: Config = serde_yaml::from_str("project: 'bad name'").unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn empty_image_is_rejected() {
        let yaml = r#"
project: demo
services:
  api:
    image: ""
    port: 3000
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn find_config_walks_up() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a/b/c");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE), "project: demo").unwrap();

        let found = Config::find_config_file(&nested).unwrap();
        assert_eq!(found, dir.path().join(CONFIG_FILE));
    }

    #[test]
    fn missing_config_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        // tempdirs live under / somewhere without homeport.yaml in ancestors;
        // this could false-positive if a parent actually has one, so only
        // assert the error message shape when it errors.
        if let Err(e) = Config::find_config_file(dir.path()) {
            assert!(e.to_string().contains(CONFIG_FILE));
        }
    }
}

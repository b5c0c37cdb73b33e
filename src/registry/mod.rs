//! Service registry: descriptors, alias resolution, and the built-in catalog.
//!
//! The registry is the authoritative table of known services. It is a plain
//! owned structure passed to the orchestrator, proxy builder, and
//! connectivity aggregator at construction time, so independent orchestration
//! sessions can coexist in tests.

pub mod catalog;

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

use crate::error::{Error, Result};

/// Health probe definition for a service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase", tag = "type")]
pub enum HealthCheck {
    /// HTTP GET against the service's bound port; 2xx means healthy.
    Http { path: String },
    /// TCP connect against the service's bound port.
    Tcp,
    /// Trust the health the container engine reports for the container.
    Container,
}

/// Identity and launch recipe for one service.
///
/// Immutable once registered for a session; created from configuration or the
/// built-in catalog.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceDescriptor {
    /// Canonical, unique service name
    pub name: String,

    /// Additional names this service resolves from
    #[serde(default)]
    pub aliases: Vec<String>,

    /// Container image reference
    pub image: String,

    /// Port the service prefers; the allocator may assign another
    pub preferred_port: u16,

    /// Port the process listens on inside the container, when it differs
    /// from the published port
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_port: Option<u16>,

    /// Environment variables (unique keys, stable order)
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// Volume specs, `source:target[:ro]`
    #[serde(default)]
    pub volumes: Vec<String>,

    /// Command override for the container
    #[serde(default)]
    pub command: Vec<String>,

    /// Health probe, if the service defines one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub healthcheck: Option<HealthCheck>,
}

/// Authoritative table of known services with alias resolution.
///
/// The alias lookup table is built at registration time; `resolve` is a pure
/// lookup, not string matching at call sites.
#[derive(Debug, Clone, Default)]
pub struct ServiceRegistry {
    services: BTreeMap<String, ServiceDescriptor>,
    /// alias or canonical name (normalized) -> canonical name
    lookup: HashMap<String, String>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-populated with the built-in service catalog.
    pub fn with_catalog() -> Self {
        let mut registry = Self::new();
        for descriptor in catalog::builtin_services() {
            // Catalog entries are internally consistent; duplicates there are
            // a programming error, not a user error.
            registry
                .register(descriptor)
                .expect("built-in catalog must not contain duplicate names");
        }
        registry
    }

    /// Register a service descriptor, wiring its name and aliases into the
    /// lookup table. Duplicate names or aliases are rejected.
    pub fn register(&mut self, descriptor: ServiceDescriptor) -> Result<()> {
        let canonical = normalize(&descriptor.name);
        let mut keys = vec![canonical.clone()];
        keys.extend(descriptor.aliases.iter().map(|a| normalize(a)));

        for key in &keys {
            if let Some(existing) = self.lookup.get(key) {
                return Err(Error::DuplicateService {
                    service: descriptor.name.clone(),
                    conflict: format!("{} (already owned by '{}')", key, existing),
                });
            }
        }

        for key in keys {
            self.lookup.insert(key, canonical.clone());
        }
        self.services.insert(canonical, descriptor);
        Ok(())
    }

    /// Resolve a requested name (canonical or alias) to its descriptor.
    ///
    /// Unknown names fail fast with the list of valid names.
    pub fn resolve(&self, requested: &str) -> Result<&ServiceDescriptor> {
        let key = normalize(requested);
        match self.lookup.get(&key) {
            Some(canonical) => Ok(&self.services[canonical]),
            None => Err(Error::UnknownService {
                requested: requested.to_string(),
                valid: self.valid_names(),
            }),
        }
    }

    /// Resolve a set of requested names to descriptors, deduplicating
    /// aliases that map to the same canonical service.
    pub fn resolve_all(&self, requested: &[String]) -> Result<Vec<&ServiceDescriptor>> {
        let mut seen = std::collections::HashSet::new();
        let mut descriptors = Vec::new();
        for name in requested {
            let descriptor = self.resolve(name)?;
            if seen.insert(descriptor.name.clone()) {
                descriptors.push(descriptor);
            }
        }
        Ok(descriptors)
    }

    /// Canonical names of all registered services, sorted.
    pub fn names(&self) -> Vec<String> {
        self.services.keys().cloned().collect()
    }

    /// All names a caller may use, canonical names first, then aliases.
    pub fn valid_names(&self) -> Vec<String> {
        let mut names = self.names();
        let mut aliases: Vec<String> = self
            .lookup
            .keys()
            .filter(|k| !self.services.contains_key(*k))
            .cloned()
            .collect();
        aliases.sort();
        names.extend(aliases);
        names
    }

    pub fn iter(&self) -> impl Iterator<Item = &ServiceDescriptor> {
        self.services.values()
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}

fn normalize(name: &str) -> String {
    name.trim().to_ascii_lowercase()
}

//! # homeport
//!
//! Orchestrates locally-running backend services (databases, caches, object
//! storage, AI runtimes) through a container engine, and exposes a subset of
//! them to the public internet through a single outbound tunnel, multiplexed
//! by a local reverse proxy.
//!
//! ## Quick start
//!
//! ```no_run
//! use homeport::{DockerEngine, Orchestrator, ServiceRegistry};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), homeport::Error> {
//! let registry = ServiceRegistry::with_catalog();
//! let orchestrator = Orchestrator::new("demo", registry, Arc::new(DockerEngine::new()));
//!
//! // Start two services concurrently; aliases resolve to catalog entries
//! orchestrator
//!     .start(&["postgres".to_string(), "cache".to_string()])
//!     .await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Concurrency model
//!
//! Multi-service operations run one worker task per service. Progress events
//! flow through a bounded channel to a single consumer; events for one
//! service are strictly ordered, events across services interleave. Failures
//! are isolated per service and aggregated into the operation result.

pub mod config;
pub mod connectivity;
pub mod engine;
pub mod error;
pub mod orchestrator;
pub mod port;
pub mod proxy;
pub mod registry;
pub mod state;
pub mod tunnel;

// Re-export commonly used types
pub use config::Config;
pub use connectivity::{ConnectivityAggregator, ConnectivityRecord, Discovery, LocalNameDiscovery};
pub use engine::{ContainerEngine, ContainerInfo, ContainerSpec, DockerEngine, EngineError};
pub use error::{Error, Result};
pub use orchestrator::{
    HealthPoller, OperationOutcome, Orchestrator, Phase, ProgressEvent, ProgressReceiver,
    ServiceStatus,
};
pub use port::PortAllocator;
pub use proxy::{MultiServiceProxy, ProxyBuilder};
pub use registry::{HealthCheck, ServiceDescriptor, ServiceRegistry};
pub use state::{HealthStatus, ServiceState, Status};
pub use tunnel::{TunnelManager, TunnelProvider, TunnelRecord, TunnelStatus};

use miette::Diagnostic;
use std::io;
use thiserror::Error;

use crate::engine::EngineError;

#[derive(Error, Diagnostic, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Container engine is not available: {0}")]
    #[diagnostic(
        code(homeport::engine::unavailable),
        help("Check that Docker is running with `docker info`")
    )]
    EngineUnavailable(String),

    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("Unknown service '{requested}'. Valid services: {}", .valid.join(", "))]
    #[diagnostic(
        code(homeport::service::unknown),
        help("Check available services with `homeport status` or declare the service in homeport.yaml")
    )]
    UnknownService {
        requested: String,
        valid: Vec<String>,
    },

    #[error("Service '{service}' already registered under the name or alias '{conflict}'")]
    DuplicateService { service: String, conflict: String },

    #[error("Service '{0}' is not running")]
    #[diagnostic(
        code(homeport::service::not_running),
        help("Start the service with: homeport start {0}")
    )]
    ServiceNotRunning(String),

    #[error("Service '{service}' is {status} and cannot accept a new operation")]
    #[diagnostic(
        code(homeport::service::busy),
        help("Wait for the in-flight operation to finish, then retry")
    )]
    ServiceBusy { service: String, status: String },

    #[error("Port {port} is in use and no fallback port was free for service '{service}'")]
    #[diagnostic(
        code(homeport::port::conflict),
        help("Find what's using the port with: lsof -i :{port}\nFree the port or change the preferred port in homeport.yaml")
    )]
    PortConflict { service: String, port: u16 },

    #[error("Port allocation failed: {0}")]
    PortAllocation(String),

    #[error("Service '{service}' did not become healthy within {waited_secs}s")]
    #[diagnostic(
        code(homeport::service::health_timeout),
        help("Check the container logs with `docker logs` and verify the health-check endpoint")
    )]
    HealthTimeout { service: String, waited_secs: u64 },

    #[error("No route registered for '{0}'")]
    RouteNotFound(String),

    #[error("Tunnel setup failed: {0}")]
    #[diagnostic(
        code(homeport::tunnel::setup_failed),
        help("Verify the tunnel provider binary (cloudflared or ngrok) is installed and on PATH")
    )]
    TunnelSetupFailed(String),

    #[error("Operation completed with {} failure(s): {}", .failed.len(), .failed.join(", "))]
    #[diagnostic(
        code(homeport::operation::partial_failure),
        help("Run `homeport status` to see per-service errors; successfully started services are still running")
    )]
    PartialFailure { failed: Vec<String> },

    #[error("Operation timed out waiting for service '{0}'")]
    Timeout(String),

    #[error("Operation cancelled for service '{0}'")]
    Cancelled(String),

    #[error("Proxy error: {0}")]
    Proxy(String),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Returns a helpful suggestion for resolving this error, if available.
    pub fn suggestion(&self) -> Option<String> {
        match self {
            Error::EngineUnavailable(_) => {
                Some("Check that Docker is running: docker info".to_string())
            }
            Error::UnknownService { valid, .. } => Some(format!(
                "Valid service names and aliases: {}",
                valid.join(", ")
            )),
            Error::PortConflict { port, .. } => Some(format!(
                "Port {} is already in use. Free it or pick a different preferred port in homeport.yaml.",
                port
            )),
            Error::HealthTimeout { service, .. } => Some(format!(
                "Inspect the container with: docker logs $(docker ps -aqf label=homeport.service={})",
                service
            )),
            Error::PartialFailure { failed } => Some(format!(
                "Failed services: {}. Services that started successfully are still running; fix the failures and re-run start for them.",
                failed.join(", ")
            )),
            Error::TunnelSetupFailed(_) => Some(
                "Verify the provider binary is installed (cloudflared or ngrok) and reachable on PATH."
                    .to_string(),
            ),
            Error::Config(_) => Some("Validate your homeport.yaml syntax".to_string()),
            _ => None,
        }
    }

    /// Formats the error with its suggestion (if any) for user-friendly display.
    pub fn with_suggestion(&self) -> String {
        match self.suggestion() {
            Some(suggestion) => format!("{}\n\nHint: {}", self, suggestion),
            None => self.to_string(),
        }
    }
}

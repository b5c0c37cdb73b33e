//! Health polling for starting services.
//!
//! Polls a service's health probe with bounded retries at a fixed interval.
//! Exhausting the retry budget marks the service failed with a timeout; a
//! service that never becomes healthy is never reported `running`.

use reqwest::Client;
use std::sync::OnceLock;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::engine::ContainerEngine;
use crate::error::{Error, Result};
use crate::registry::HealthCheck;

/// Shared HTTP client for health probes.
///
/// A single pooled client prevents file descriptor exhaustion when many
/// services run HTTP health checks at once.
static SHARED_HTTP_CLIENT: OnceLock<Client> = OnceLock::new();

fn shared_client() -> &'static Client {
    SHARED_HTTP_CLIENT.get_or_init(|| {
        Client::builder()
            .timeout(Duration::from_secs(30))
            .pool_max_idle_per_host(4)
            .build()
            .expect("failed to build shared HTTP client")
    })
}

/// Fixed-interval, bounded-retry health poller.
#[derive(Debug, Clone, Copy)]
pub struct HealthPoller {
    /// Interval between probe attempts
    pub interval: Duration,
    /// Probe attempts before giving up
    pub retries: u32,
    /// Per-probe timeout
    pub probe_timeout: Duration,
}

impl Default for HealthPoller {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(2),
            retries: 15,
            probe_timeout: Duration::from_secs(5),
        }
    }
}

impl HealthPoller {
    pub fn new(interval: Duration, retries: u32) -> Self {
        Self {
            interval,
            retries,
            probe_timeout: Duration::from_secs(5),
        }
    }

    /// Total wall-clock budget before a service is declared failed.
    pub fn budget(&self) -> Duration {
        self.interval * self.retries
    }

    /// Poll until the service is healthy, the retry budget is exhausted, or
    /// the operation is cancelled.
    ///
    /// Each attempt also verifies the container is still running, so an early
    /// crash surfaces immediately instead of after the full timeout.
    pub async fn await_healthy(
        &self,
        engine: &dyn ContainerEngine,
        service: &str,
        container_id: &str,
        port: u16,
        check: &HealthCheck,
    ) -> Result<()> {
        self.await_healthy_with_cancel(
            engine,
            service,
            container_id,
            port,
            check,
            &CancellationToken::new(),
        )
        .await
    }

    pub async fn await_healthy_with_cancel(
        &self,
        engine: &dyn ContainerEngine,
        service: &str,
        container_id: &str,
        port: u16,
        check: &HealthCheck,
        cancel: &CancellationToken,
    ) -> Result<()> {
        tracing::info!(
            "Waiting for '{}' to become healthy (budget {:?})",
            service,
            self.budget()
        );

        for attempt in 1..=self.retries {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled(service.to_string()));
            }

            // Detect containers that died while we were waiting
            let info = engine.inspect(container_id).await?;
            if !info.is_running() {
                return Err(Error::Engine(crate::engine::EngineError::CommandFailed {
                    command: format!("health wait for '{}'", service),
                    stderr: format!("container exited during startup (state: {})", info.state),
                    exit_code: None,
                }));
            }

            let healthy = match check {
                HealthCheck::Http { path } => self.probe_http(port, path).await,
                HealthCheck::Tcp => self.probe_tcp(port).await,
                HealthCheck::Container => info.health.as_deref() == Some("healthy"),
            };

            if healthy {
                tracing::info!("Service '{}' is healthy", service);
                return Ok(());
            }

            tracing::debug!(
                "Service '{}' not healthy yet (attempt {}/{})",
                service,
                attempt,
                self.retries
            );
            tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled(service.to_string())),
                _ = tokio::time::sleep(self.interval) => {}
            }
        }

        Err(Error::HealthTimeout {
            service: service.to_string(),
            waited_secs: self.budget().as_secs(),
        })
    }

    async fn probe_http(&self, port: u16, path: &str) -> bool {
        let url = format!("http://127.0.0.1:{}{}", port, path);
        match shared_client()
            .get(&url)
            .timeout(self.probe_timeout)
            .send()
            .await
        {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }

    async fn probe_tcp(&self, port: u16) -> bool {
        tokio::time::timeout(
            self.probe_timeout,
            tokio::net::TcpStream::connect(("127.0.0.1", port)),
        )
        .await
        .map(|r| r.is_ok())
        .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn tcp_probe_fails_on_closed_port() {
        let poller = HealthPoller::default();
        assert!(!poller.probe_tcp(1).await);
    }

    #[tokio::test]
    async fn tcp_probe_succeeds_on_open_port() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let poller = HealthPoller::default();
        assert!(poller.probe_tcp(port).await);
    }

    #[tokio::test]
    async fn http_probe_fails_on_closed_port() {
        let poller = HealthPoller {
            probe_timeout: Duration::from_millis(500),
            ..HealthPoller::default()
        };
        assert!(!poller.probe_http(1, "/health").await);
    }

    #[test]
    fn budget_is_interval_times_retries() {
        let poller = HealthPoller::new(Duration::from_secs(2), 15);
        assert_eq!(poller.budget(), Duration::from_secs(30));
    }
}

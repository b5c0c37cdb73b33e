//! Tunnel session management.
//!
//! Opens and closes the one outbound tunnel connection per orchestration run,
//! pointed either at a single service or at the reverse proxy's listener.
//! Session metadata is persisted so `tunnel status` works across process
//! restarts; a persisted record describes the *last known* tunnel, and is
//! only reported active after a lightweight connectivity probe.

mod cloudflare;
mod ngrok;

pub use cloudflare::CloudflareTunnel;
pub use ngrok::NgrokTunnel;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

const RECORD_FILE: &str = "tunnel.json";
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Outbound tunnel provider seam. Implementations wrap an external tunnel
/// client; this crate never implements the tunneling protocol itself.
#[async_trait]
pub trait TunnelProvider: Send + Sync {
    /// Provider identifier persisted into the tunnel record.
    fn name(&self) -> &'static str;

    /// Establish the tunnel to `local_addr` (`host:port`) and return the
    /// public URLs. Must respect `cancel`: when cancelled before the
    /// provider confirms connectivity, implementations abort setup and
    /// release any partially-acquired resources.
    async fn connect(&mut self, cancel: &CancellationToken, local_addr: &str)
        -> Result<Vec<String>>;

    /// Tear the tunnel down. Safe to call when `connect` never succeeded.
    async fn disconnect(&mut self) -> Result<()>;
}

/// Construct a provider by its configured name.
pub fn provider_from_name(name: &str) -> Result<Box<dyn TunnelProvider>> {
    match name {
        "cloudflare" => Ok(Box::new(CloudflareTunnel::new())),
        "ngrok" => Ok(Box::new(NgrokTunnel::new())),
        other => Err(Error::Config(format!(
            "unknown tunnel provider '{}' (expected cloudflare or ngrok)",
            other
        ))),
    }
}

/// Persisted tunnel session record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelRecord {
    pub provider: String,
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_started_at: DateTime<Utc>,
}

impl TunnelRecord {
    fn path(state_dir: &Path) -> PathBuf {
        state_dir.join(RECORD_FILE)
    }

    /// Load the last persisted record, if any.
    pub fn load(state_dir: &Path) -> Result<Option<Self>> {
        let path = Self::path(state_dir);
        if !path.exists() {
            return Ok(None);
        }
        let contents = std::fs::read_to_string(&path)?;
        Ok(Some(serde_json::from_str(&contents)?))
    }

    /// Delete the persisted record. Returns whether one existed.
    pub fn forget(state_dir: &Path) -> Result<bool> {
        let path = Self::path(state_dir);
        if path.exists() {
            std::fs::remove_file(&path)?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Persist atomically: write a sibling temp file, then rename over.
    pub fn save(&self, state_dir: &Path) -> Result<()> {
        std::fs::create_dir_all(state_dir)?;
        let path = Self::path(state_dir);
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_string_pretty(self)?)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }
}

/// Last-known tunnel plus the result of the liveness probe.
#[derive(Debug, Clone, Serialize)]
pub struct TunnelStatus {
    #[serde(flatten)]
    pub record: TunnelRecord,
    /// True only when the probe confirmed the tunnel answers right now.
    pub active: bool,
}

/// Manages the single tunnel session for an orchestration run.
pub struct TunnelManager {
    provider: Box<dyn TunnelProvider>,
    state_dir: PathBuf,
    domain: Option<String>,
    urls: Vec<String>,
    connected: bool,
}

impl TunnelManager {
    pub fn new(provider: Box<dyn TunnelProvider>, state_dir: impl Into<PathBuf>) -> Self {
        Self {
            provider,
            state_dir: state_dir.into(),
            domain: None,
            urls: Vec::new(),
            connected: false,
        }
    }

    pub fn with_domain(mut self, domain: Option<String>) -> Self {
        self.domain = domain;
        self
    }

    /// Establish the tunnel to `local_addr` and persist the session record.
    ///
    /// Cancellation before the provider confirms connectivity aborts setup
    /// and releases partially-acquired resources.
    pub async fn start(
        &mut self,
        cancel: &CancellationToken,
        local_addr: &str,
    ) -> Result<Vec<String>> {
        if self.connected {
            return Ok(self.urls.clone());
        }

        let urls = match self.provider.connect(cancel, local_addr).await {
            Ok(urls) => urls,
            Err(e) => {
                // Release whatever the provider half-acquired.
                let _ = self.provider.disconnect().await;
                return Err(e);
            }
        };
        if urls.is_empty() {
            let _ = self.provider.disconnect().await;
            return Err(Error::TunnelSetupFailed(
                "provider reported no public URLs".to_string(),
            ));
        }

        let created_at = TunnelRecord::load(&self.state_dir)
            .ok()
            .flatten()
            .filter(|record| record.provider == self.provider.name())
            .map(|record| record.created_at)
            .unwrap_or_else(Utc::now);
        let record = TunnelRecord {
            provider: self.provider.name().to_string(),
            urls: urls.clone(),
            domain: self.domain.clone(),
            created_at,
            last_started_at: Utc::now(),
        };
        if let Err(e) = record.save(&self.state_dir) {
            tracing::warn!("Failed to persist tunnel record: {}", e);
        }

        tracing::info!(
            "Tunnel established via {}: {}",
            self.provider.name(),
            urls.join(", ")
        );
        self.urls = urls.clone();
        self.connected = true;
        Ok(urls)
    }

    /// Close the tunnel. Always safe, even when `start` never succeeded.
    pub async fn stop(&mut self) -> Result<()> {
        self.connected = false;
        self.urls.clear();
        self.provider.disconnect().await
    }

    /// Public URLs of the live session (empty when not connected).
    pub fn urls(&self) -> &[String] {
        &self.urls
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Last-known session with liveness re-verified by a lightweight probe.
    pub async fn status(&self) -> Result<Option<TunnelStatus>> {
        Self::status_from_dir(&self.state_dir).await
    }

    /// Status query that works without a live manager (fresh process).
    pub async fn status_from_dir(state_dir: &Path) -> Result<Option<TunnelStatus>> {
        let Some(record) = TunnelRecord::load(state_dir)? else {
            return Ok(None);
        };
        let active = match record.urls.first() {
            Some(url) => probe_url(url).await,
            None => false,
        };
        Ok(Some(TunnelStatus { record, active }))
    }
}

/// HEAD the URL with a short timeout; any HTTP response counts as alive.
async fn probe_url(url: &str) -> bool {
    let client = match reqwest::Client::builder().timeout(PROBE_TIMEOUT).build() {
        Ok(client) => client,
        Err(_) => return false,
    };
    client.head(url).send().await.is_ok()
}

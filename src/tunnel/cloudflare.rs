//! Cloudflare quick-tunnel provider.
//!
//! Spawns `cloudflared tunnel --url <target>` and scrapes the ephemeral
//! `*.trycloudflare.com` URL from its log output. No account or credentials
//! required, which makes it the default provider for development use.

use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

use super::TunnelProvider;

const URL_WAIT: Duration = Duration::from_secs(30);

pub struct CloudflareTunnel {
    binary: String,
    child: Option<Child>,
}

impl CloudflareTunnel {
    pub fn new() -> Self {
        Self {
            binary: "cloudflared".to_string(),
            child: None,
        }
    }

    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }

    async fn kill_child(&mut self) {
        if let Some(mut child) = self.child.take() {
            if let Err(e) = child.start_kill() {
                tracing::debug!("cloudflared already exited: {}", e);
            }
            let _ = child.wait().await;
        }
    }
}

impl Default for CloudflareTunnel {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TunnelProvider for CloudflareTunnel {
    fn name(&self) -> &'static str {
        "cloudflare"
    }

    async fn connect(
        &mut self,
        cancel: &CancellationToken,
        local_addr: &str,
    ) -> Result<Vec<String>> {
        let target = format!("http://{}", local_addr);
        let mut child = Command::new(&self.binary)
            .args(["tunnel", "--url", &target])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            // cloudflared logs to stderr
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                Error::TunnelSetupFailed(format!("failed to spawn {}: {}", self.binary, e))
            })?;

        let stderr = child.stderr.take().ok_or_else(|| {
            Error::TunnelSetupFailed("cloudflared stderr not captured".to_string())
        })?;

        let url = tokio::select! {
            found = scrape_url(stderr) => found,
            _ = cancel.cancelled() => {
                let _ = child.start_kill();
                let _ = child.wait().await;
                return Err(Error::TunnelSetupFailed(
                    "cancelled before tunnel was established".to_string(),
                ));
            }
            _ = tokio::time::sleep(URL_WAIT) => {
                let _ = child.start_kill();
                let _ = child.wait().await;
                return Err(Error::TunnelSetupFailed(format!(
                    "no public URL within {}s of starting cloudflared",
                    URL_WAIT.as_secs()
                )));
            }
        };

        match url {
            Some(url) => {
                self.child = Some(child);
                Ok(vec![url])
            }
            None => {
                let _ = child.start_kill();
                let _ = child.wait().await;
                Err(Error::TunnelSetupFailed(
                    "cloudflared exited without reporting a public URL".to_string(),
                ))
            }
        }
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.kill_child().await;
        Ok(())
    }
}

/// Read log lines until a trycloudflare URL appears, then keep draining the
/// pipe in the background so cloudflared never blocks on a full buffer.
async fn scrape_url<R>(reader: R) -> Option<String>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if let Some(url) = extract_quick_tunnel_url(&line) {
            tokio::spawn(async move {
                while let Ok(Some(_)) = lines.next_line().await {}
            });
            return Some(url);
        }
    }
    None
}

/// Pull the first `https://*.trycloudflare.com` token out of a log line.
fn extract_quick_tunnel_url(line: &str) -> Option<String> {
    let start = line.find("https://")?;
    let tail = &line[start..];
    let end = tail
        .find(|ch: char| ch.is_whitespace() || ch == '"' || ch == '|')
        .unwrap_or(tail.len());
    let candidate = tail[..end].trim_end_matches(['.', ',', ')']);
    if candidate.contains(".trycloudflare.com") {
        Some(candidate.to_string())
    } else {
        None
    }
}

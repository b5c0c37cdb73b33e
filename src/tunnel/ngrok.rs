//! ngrok tunnel provider.
//!
//! Spawns the `ngrok` binary with `--log stdout` and scrapes the public URL
//! from its log output. When log scraping comes up empty, falls back to the
//! agent's local API at `127.0.0.1:4040/api/tunnels`.

use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

use super::TunnelProvider;

const URL_WAIT: Duration = Duration::from_secs(15);
const API_TIMEOUT: Duration = Duration::from_secs(3);

pub struct NgrokTunnel {
    binary: String,
    api_base: String,
    child: Option<Child>,
}

impl NgrokTunnel {
    pub fn new() -> Self {
        Self {
            binary: "ngrok".to_string(),
            api_base: "http://127.0.0.1:4040".to_string(),
            child: None,
        }
    }

    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }

    /// Ask the local agent API for the first https tunnel URL.
    async fn query_agent_api(&self) -> Option<String> {
        let client = reqwest::Client::builder()
            .timeout(API_TIMEOUT)
            .build()
            .ok()?;
        let body: serde_json::Value = client
            .get(format!("{}/api/tunnels", self.api_base))
            .send()
            .await
            .ok()?
            .json()
            .await
            .ok()?;
        body["tunnels"]
            .as_array()?
            .iter()
            .filter_map(|tunnel| tunnel["public_url"].as_str())
            .find(|url| url.starts_with("https://"))
            .map(str::to_string)
    }

    async fn kill_child(&mut self) {
        if let Some(mut child) = self.child.take() {
            if let Err(e) = child.start_kill() {
                tracing::debug!("ngrok already exited: {}", e);
            }
            let _ = child.wait().await;
        }
    }
}

impl Default for NgrokTunnel {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TunnelProvider for NgrokTunnel {
    fn name(&self) -> &'static str {
        "ngrok"
    }

    async fn connect(
        &mut self,
        cancel: &CancellationToken,
        local_addr: &str,
    ) -> Result<Vec<String>> {
        let mut child = Command::new(&self.binary)
            .args(["http", local_addr, "--log", "stdout", "--log-format", "term"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                Error::TunnelSetupFailed(format!("failed to spawn {}: {}", self.binary, e))
            })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::TunnelSetupFailed("ngrok stdout not captured".to_string()))?;

        let scraped = tokio::select! {
            found = scrape_url(stdout) => found,
            _ = cancel.cancelled() => {
                let _ = child.start_kill();
                let _ = child.wait().await;
                return Err(Error::TunnelSetupFailed(
                    "cancelled before tunnel was established".to_string(),
                ));
            }
            _ = tokio::time::sleep(URL_WAIT) => None,
        };

        // The log format occasionally changes between agent versions; the
        // local API is the stable fallback.
        let url = match scraped {
            Some(url) => Some(url),
            None => self.query_agent_api().await,
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
                    "ngrok did not report a public URL".to_string(),
                ))
            }
        }
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.kill_child().await;
        Ok(())
    }
}

async fn scrape_url(stdout: tokio::process::ChildStdout) -> Option<String> {
    let mut lines = BufReader::new(stdout).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if let Some(url) = find_url_in_text(&line) {
            tokio::spawn(async move {
                while let Ok(Some(_)) = lines.next_line().await {}
            });
            return Some(url);
        }
    }
    None
}

/// Find an ngrok public URL in log output.
///
/// Matches both the term format (`url=https://xxx.ngrok-free.app`) and plain
/// `https://` tokens pointing at an ngrok domain.
fn find_url_in_text(contents: &str) -> Option<String> {
    let mut offset = 0;
    while let Some(pos) = contents[offset..].find("https://") {
        let start = offset + pos;
        let tail = &contents[start..];
        let end = tail
            .find(|ch: char| ch.is_whitespace() || ch == '"')
            .unwrap_or(tail.len());
        let candidate = tail[..end].trim_end_matches([')', ',', '|', '\'', ']', '>', '<']);
        if is_ngrok_url(candidate) {
            return Some(candidate.to_string());
        }
        offset = start + "https://".len();
    }
    None
}

fn is_ngrok_url(value: &str) -> bool {
    value.starts_with("https://")
        && !value.contains(char::is_whitespace)
        && (value.contains(".ngrok-free.app")
            || value.contains(".ngrok.app")
            || value.contains(".ngrok.io"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_url_in_term_log_line() {
        let log = "t=2026-03-01T10:00:00+0000 lvl=info msg=\"started tunnel\" addr=//localhost:8080 url=https://abc123-1-2-3.ngrok-free.app";
        assert_eq!(
            find_url_in_text(log),
            Some("https://abc123-1-2-3.ngrok-free.app".to_string())
        );
    }

    #[test]
    fn finds_url_in_forwarding_line() {
        let log = "Forwarding https://abc123.ngrok.app -> http://localhost:8080";
        assert_eq!(
            find_url_in_text(log),
            Some("https://abc123.ngrok.app".to_string())
        );
    }

    #[test]
    fn skips_non_ngrok_urls() {
        let log = "see https://dashboard.example.com then url=https://xyz.ngrok.io done";
        assert_eq!(find_url_in_text(log), Some("https://xyz.ngrok.io".to_string()));
    }

    #[test]
    fn ngrok_url_variants() {
        assert!(is_ngrok_url("https://abc.ngrok-free.app"));
        assert!(is_ngrok_url("https://abc.ngrok.app"));
        assert!(is_ngrok_url("https://abc.ngrok.io"));
        assert!(!is_ngrok_url("https://abc.trycloudflare.com"));
        assert!(!is_ngrok_url("http://abc.ngrok-free.app"));
    }

    #[tokio::test]
    async fn missing_binary_fails_to_spawn() {
        let mut provider = NgrokTunnel::new().with_binary("definitely-not-ngrok");
        let err = provider
            .connect(&CancellationToken::new(), "127.0.0.1:8080")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::TunnelSetupFailed(_)));
    }
}

//! Docker CLI engine implementation.
//!
//! All Docker interactions go through [`DockerEngine`], which provides
//! consistent timeout handling, error mapping to [`EngineError`], and a single
//! point where `Command::new("docker")` is constructed.

use async_trait::async_trait;
use std::process::Output;
use std::time::Duration;

use super::error::EngineError;
use super::{ContainerEngine, ContainerInfo, ContainerSpec, ResourceUsage};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const PING_TIMEOUT: Duration = Duration::from_secs(5);
/// Image pulls can be slow on first start; give them room.
const CREATE_TIMEOUT: Duration = Duration::from_secs(300);

/// Container engine backed by the `docker` CLI.
///
/// Construct once and share; the struct is cheap (zero-sized today).
#[derive(Debug, Clone, Default)]
pub struct DockerEngine;

impl DockerEngine {
    pub fn new() -> Self {
        DockerEngine
    }

    /// Run a docker command with a timeout, returning raw Output.
    async fn run(&self, args: &[&str], timeout: Duration) -> Result<Output, EngineError> {
        let result = tokio::time::timeout(
            timeout,
            tokio::process::Command::new("docker").args(args).output(),
        )
        .await;

        let cmd_str = format!("docker {}", args.join(" "));

        match result {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(e)) => Err(EngineError::exec_failed(cmd_str, e)),
            Err(_) => Err(EngineError::timeout(cmd_str, timeout)),
        }
    }

    /// Run a docker command with a timeout, returning Output only if exit 0.
    async fn run_success(&self, args: &[&str], timeout: Duration) -> Result<Output, EngineError> {
        let output = self.run(args, timeout).await?;
        if output.status.success() {
            Ok(output)
        } else {
            let cmd_str = format!("docker {}", args.join(" "));
            Err(EngineError::failed(&cmd_str, &output))
        }
    }
}

#[async_trait]
impl ContainerEngine for DockerEngine {
    async fn ping(&self) -> Result<(), EngineError> {
        match self.run(&["info", "--format", "{{.ServerVersion}}"], PING_TIMEOUT)
            .await
        {
            Ok(output) if output.status.success() => Ok(()),
            Ok(_) => Err(EngineError::DaemonUnavailable),
            Err(EngineError::Timeout { .. }) => Err(EngineError::DaemonUnavailable),
            Err(e) => Err(e),
        }
    }

    async fn create_and_start(&self, spec: &ContainerSpec) -> Result<String, EngineError> {
        let container_port = spec.container_port.unwrap_or(spec.port);
        let publish = format!("{}:{}", spec.port, container_port);

        let mut args: Vec<String> = vec![
            "run".into(),
            "-d".into(),
            "--name".into(),
            spec.name.clone(),
            "-p".into(),
            publish,
            "--restart".into(),
            "unless-stopped".into(),
        ];
        for (key, value) in &spec.labels {
            args.push("--label".into());
            args.push(format!("{}={}", key, value));
        }
        for (key, value) in &spec.env {
            args.push("-e".into());
            args.push(format!("{}={}", key, value));
        }
        for volume in &spec.volumes {
            args.push("-v".into());
            args.push(volume.clone());
        }
        args.push(spec.image.clone());
        args.extend(spec.command.iter().cloned());

        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let output = self.run_success(&arg_refs, CREATE_TIMEOUT).await?;
        let id = String::from_utf8_lossy(&output.stdout).trim().to_string();
        tracing::debug!("Started container {} for image {}", id, spec.image);
        Ok(id)
    }

    async fn stop(&self, container_id: &str) -> Result<(), EngineError> {
        let output = self.run(&["stop", container_id], DEFAULT_TIMEOUT).await?;
        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.contains("No such container") {
            return Ok(());
        }
        Err(EngineError::failed("docker stop", &output))
    }

    async fn remove(&self, container_id: &str) -> Result<(), EngineError> {
        let output = self
            .run(&["rm", "-f", container_id], DEFAULT_TIMEOUT)
            .await?;
        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.contains("No such container") {
            return Ok(());
        }
        Err(EngineError::failed("docker rm -f", &output))
    }

    async fn inspect(&self, container_id: &str) -> Result<ContainerInfo, EngineError> {
        let output = self
            .run(
                &[
                    "inspect",
                    "--format",
                    // Health may be absent; {{with}} guards the nil pointer
                    r#"{"name":{{json .Name}},"state":{{json .State.Status}},"health":{{with .State.Health}}{{json .Status}}{{else}}null{{end}}}"#,
                    container_id,
                ],
                DEFAULT_TIMEOUT,
            )
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.contains("No such object") || stderr.contains("No such container") {
                return Err(EngineError::ContainerNotFound {
                    container: container_id.to_string(),
                });
            }
            return Err(EngineError::failed("docker inspect", &output));
        }

        let raw = String::from_utf8_lossy(&output.stdout);
        let parsed: serde_json::Value = serde_json::from_str(raw.trim()).map_err(|e| {
            EngineError::CommandFailed {
                command: "docker inspect".to_string(),
                stderr: format!("unparseable inspect output: {}", e),
                exit_code: None,
            }
        })?;

        let state = parsed["state"].as_str().unwrap_or("unknown").to_string();
        let health = parsed["health"].as_str().map(str::to_string);
        let name = parsed["name"]
            .as_str()
            .unwrap_or("")
            .trim_start_matches('/')
            .to_string();

        let resources = if state == "running" {
            self.stats(container_id).await
        } else {
            None
        };

        Ok(ContainerInfo {
            id: container_id.to_string(),
            name,
            state,
            health,
            resources,
        })
    }

    async fn list_by_label(&self, selector: &str) -> Result<Vec<ContainerInfo>, EngineError> {
        let filter = format!("label={}", selector);
        let output = self
            .run_success(
                &[
                    "ps",
                    "-a",
                    "--filter",
                    &filter,
                    "--format",
                    r#"{"id":{{json .ID}},"name":{{json .Names}},"state":{{json .State}}}"#,
                ],
                DEFAULT_TIMEOUT,
            )
            .await?;

        let raw = String::from_utf8_lossy(&output.stdout);
        let mut containers = Vec::new();
        for line in raw.lines().filter(|l| !l.trim().is_empty()) {
            match serde_json::from_str::<serde_json::Value>(line) {
                Ok(v) => containers.push(ContainerInfo {
                    id: v["id"].as_str().unwrap_or("").to_string(),
                    name: v["name"].as_str().unwrap_or("").to_string(),
                    state: v["state"].as_str().unwrap_or("unknown").to_string(),
                    health: None,
                    resources: None,
                }),
                Err(e) => {
                    tracing::warn!("Skipping unparseable docker ps line: {}", e);
                }
            }
        }
        Ok(containers)
    }
}

impl DockerEngine {
    /// Best-effort resource snapshot via `docker stats --no-stream`.
    /// Returns None rather than failing status queries on slow engines.
    async fn stats(&self, container_id: &str) -> Option<ResourceUsage> {
        let output = self
            .run(
                &[
                    "stats",
                    "--no-stream",
                    "--format",
                    "{{.CPUPerc}} {{.MemUsage}}",
                    container_id,
                ],
                Duration::from_secs(10),
            )
            .await
            .ok()?;
        if !output.status.success() {
            return None;
        }
        let raw = String::from_utf8_lossy(&output.stdout);
        parse_stats_line(raw.trim())
    }
}

/// Parse a `docker stats` line like `1.25% 42.5MiB / 7.6GiB`.
fn parse_stats_line(line: &str) -> Option<ResourceUsage> {
    let mut parts = line.split_whitespace();
    let cpu = parts.next()?.trim_end_matches('%').parse::<f64>().ok()?;
    let mem = parts.next()?;
    let memory_bytes = parse_mem_value(mem)?;
    Some(ResourceUsage {
        cpu_percent: cpu,
        memory_bytes,
    })
}

fn parse_mem_value(value: &str) -> Option<u64> {
    let suffixes: [(&str, f64); 5] = [
        ("KiB", 1024.0),
        ("MiB", 1024.0 * 1024.0),
        ("GiB", 1024.0 * 1024.0 * 1024.0),
        ("kB", 1000.0),
        ("B", 1.0),
    ];
    for (suffix, multiplier) in suffixes {
        if let Some(num) = value.strip_suffix(suffix) {
            let parsed = num.parse::<f64>().ok()?;
            return Some((parsed * multiplier) as u64);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_stats_line() {
        let usage = parse_stats_line("1.25% 42.5MiB / 7.6GiB").unwrap();
        assert!((usage.cpu_percent - 1.25).abs() < f64::EPSILON);
        assert_eq!(usage.memory_bytes, (42.5 * 1024.0 * 1024.0) as u64);
    }

    #[test]
    fn parses_gib_memory() {
        let usage = parse_stats_line("0.00% 1.2GiB / 16GiB").unwrap();
        assert_eq!(usage.memory_bytes, (1.2 * 1024.0 * 1024.0 * 1024.0) as u64);
    }

    #[test]
    fn rejects_garbage_stats() {
        assert!(parse_stats_line("").is_none());
        assert!(parse_stats_line("not-a-number").is_none());
    }
}

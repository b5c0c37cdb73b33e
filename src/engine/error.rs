use std::fmt;
use std::time::Duration;

/// Structured error type for container-engine CLI operations.
///
/// Machine-actionable variants rather than a single string, so callers can
/// distinguish "daemon down" (fatal for the whole operation) from
/// "this container failed" (isolated per service).
#[derive(Debug)]
pub enum EngineError {
    /// Engine command timed out.
    Timeout { command: String, timeout: Duration },

    /// Engine command ran but returned non-zero exit.
    CommandFailed {
        command: String,
        stderr: String,
        exit_code: Option<i32>,
    },

    /// Engine binary couldn't be executed (not in PATH, permission denied).
    ExecFailed {
        command: String,
        source: std::io::Error,
    },

    /// Container doesn't exist (parsed from "No such container" stderr).
    ContainerNotFound { container: String },

    /// Engine daemon not responding.
    DaemonUnavailable,
}

impl EngineError {
    /// Create a timeout error.
    pub fn timeout(cmd: impl Into<String>, dur: Duration) -> Self {
        EngineError::Timeout {
            command: cmd.into(),
            timeout: dur,
        }
    }

    /// Create a command-failed error from an `std::process::Output`.
    pub fn failed(cmd: impl Into<String>, output: &std::process::Output) -> Self {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        EngineError::CommandFailed {
            command: cmd.into(),
            stderr,
            exit_code: output.status.code(),
        }
    }

    /// Create an exec-failed error (binary not found / permission denied).
    pub fn exec_failed(cmd: impl Into<String>, err: std::io::Error) -> Self {
        EngineError::ExecFailed {
            command: cmd.into(),
            source: err,
        }
    }

    /// Whether this error means the daemon itself is unreachable, which is
    /// fatal for the whole operation rather than one service.
    pub fn is_daemon_unavailable(&self) -> bool {
        match self {
            EngineError::DaemonUnavailable => true,
            EngineError::CommandFailed { stderr, .. } => {
                stderr.contains("Cannot connect to the Docker daemon")
                    || stderr.contains("Is the docker daemon running")
            }
            EngineError::ExecFailed { .. } => true,
            _ => false,
        }
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::Timeout { command, timeout } => {
                write!(
                    f,
                    "Timed out running '{}' (exceeded {} seconds)",
                    command,
                    timeout.as_secs()
                )
            }
            EngineError::CommandFailed {
                command,
                stderr,
                exit_code,
            } => {
                if let Some(code) = exit_code {
                    write!(f, "'{}' failed (exit code {}): {}", command, code, stderr)
                } else {
                    write!(f, "'{}' failed: {}", command, stderr)
                }
            }
            EngineError::ExecFailed { command, source } => {
                write!(f, "Failed to execute '{}': {}", command, source)
            }
            EngineError::ContainerNotFound { container } => {
                write!(f, "No such container: {}", container)
            }
            EngineError::DaemonUnavailable => {
                write!(f, "Container engine daemon is not responding")
            }
        }
    }
}

impl std::error::Error for EngineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            EngineError::ExecFailed { source, .. } => Some(source),
            _ => None,
        }
    }
}

//! Lifecycle orchestration: state transitions, per-service workers, and the
//! progress stream.

mod core;
mod health;
mod progress;

pub use self::core::{OperationOutcome, Orchestrator, ServiceStatus};
pub use health::HealthPoller;
pub use progress::{progress_channel, Phase, ProgressEvent, ProgressReceiver, ProgressSender};

//! Progress event streaming for lifecycle operations.
//!
//! A single-producer-per-worker, single-consumer bounded queue. Capacity is
//! sized to the number of services in flight, so a stalled consumer
//! back-pressures workers instead of buffering without bound. Events for one
//! service are strictly ordered; events from different services interleave
//! arbitrarily, so consumers must render by service name.

use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::mpsc;

/// Phase of a lifecycle operation, as reported per service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Starting,
    Started,
    Stopping,
    Stopped,
    Failed,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Starting => write!(f, "starting"),
            Phase::Started => write!(f, "started"),
            Phase::Stopping => write!(f, "stopping"),
            Phase::Stopped => write!(f, "stopped"),
            Phase::Failed => write!(f, "failed"),
        }
    }
}

/// One progress event: which service, which phase, and the error when the
/// phase is [`Phase::Failed`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub service: String,
    pub phase: Phase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ProgressEvent {
    pub fn new(service: impl Into<String>, phase: Phase) -> Self {
        Self {
            service: service.into(),
            phase,
            error: None,
        }
    }

    pub fn failed(service: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            phase: Phase::Failed,
            error: Some(error.into()),
        }
    }
}

/// Producer half, cloned into each per-service worker.
#[derive(Clone)]
pub struct ProgressSender {
    tx: mpsc::Sender<ProgressEvent>,
}

impl ProgressSender {
    /// Emit an event, waiting if the consumer is behind by a full buffer.
    pub async fn emit(&self, event: ProgressEvent) {
        // A dropped receiver means the caller abandoned the stream; losing
        // events then is acceptable, failing the worker is not.
        if self.tx.send(event).await.is_err() {
            tracing::debug!("Progress receiver dropped, event discarded");
        }
    }
}

/// Consumer half. Not cloneable: at most one subscriber per in-flight
/// operation.
pub struct ProgressReceiver {
    rx: mpsc::Receiver<ProgressEvent>,
}

impl ProgressReceiver {
    /// Receive the next event; `None` once all workers have finished.
    pub async fn recv(&mut self) -> Option<ProgressEvent> {
        self.rx.recv().await
    }

    /// Drain everything that remains, blocking until the producers are done.
    pub async fn collect(mut self) -> Vec<ProgressEvent> {
        let mut events = Vec::new();
        while let Some(event) = self.recv().await {
            events.push(event);
        }
        events
    }
}

/// Create a progress channel bounded to the number of services in flight.
pub fn progress_channel(services_in_flight: usize) -> (ProgressSender, ProgressReceiver) {
    let (tx, rx) = mpsc::channel(services_in_flight.max(1));
    (ProgressSender { tx }, ProgressReceiver { rx })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn events_for_one_service_arrive_in_order() {
        let (tx, mut rx) = progress_channel(2);
        tx.emit(ProgressEvent::new("db", Phase::Starting)).await;
        tx.emit(ProgressEvent::new("db", Phase::Started)).await;
        drop(tx);

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.phase, Phase::Starting);
        assert_eq!(second.phase, Phase::Started);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn dropped_receiver_does_not_block_workers() {
        let (tx, rx) = progress_channel(1);
        drop(rx);
        // Must return promptly instead of erroring or hanging
        tx.emit(ProgressEvent::new("db", Phase::Starting)).await;
    }

    #[tokio::test]
    async fn failed_event_carries_the_error() {
        let (tx, rx) = progress_channel(1);
        tx.emit(ProgressEvent::failed("minio", "image pull failed"))
            .await;
        drop(tx);

        let events = rx.collect().await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].phase, Phase::Failed);
        assert_eq!(events[0].error.as_deref(), Some("image pull failed"));
    }
}

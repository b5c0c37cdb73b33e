//! The lifecycle orchestrator.
//!
//! Drives state transitions for one or many services against the container
//! engine, one worker task per service, streaming progress events to a single
//! consumer. Failures are isolated per service; only engine unavailability
//! and caller errors (unknown names, busy services) abort an operation before
//! any worker starts.

use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::engine::{ContainerEngine, ContainerSpec, ResourceUsage};
use crate::error::{Error, Result};
use crate::port::PortAllocator;
use crate::registry::{ServiceDescriptor, ServiceRegistry};
use crate::state::{HealthStatus, ServiceState, Status};

use super::health::HealthPoller;
use super::progress::{progress_channel, Phase, ProgressEvent, ProgressReceiver, ProgressSender};

type SharedStates = Arc<RwLock<HashMap<String, ServiceState>>>;

/// Aggregate result of a multi-service operation.
///
/// Per-service failures land here instead of short-circuiting sibling work;
/// [`OperationOutcome::into_result`] converts a partial failure into the
/// aggregate error that names the failed services.
#[derive(Debug, Default, Clone)]
pub struct OperationOutcome {
    pub succeeded: Vec<String>,
    /// (service name, error message)
    pub failed: Vec<(String, String)>,
}

impl OperationOutcome {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }

    /// Convert into a `Result`: `Err(PartialFailure)` naming the failed
    /// services when any worker failed, `Ok` otherwise.
    pub fn into_result(self) -> Result<Self> {
        if self.failed.is_empty() {
            Ok(self)
        } else {
            Err(Error::PartialFailure {
                failed: self.failed.iter().map(|(name, _)| name.clone()).collect(),
            })
        }
    }
}

/// Status snapshot for one service, suitable for JSON serialization.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatus {
    #[serde(flatten)]
    pub state: ServiceState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceUsage>,
}

/// Orchestrates service lifecycle against a container engine.
///
/// Owns the per-service [`ServiceState`] map; other components read snapshots
/// of it but never the orchestrator itself.
pub struct Orchestrator {
    project: String,
    registry: ServiceRegistry,
    engine: Arc<dyn ContainerEngine>,
    ports: Arc<PortAllocator>,
    states: SharedStates,
    poller: HealthPoller,
    cancel: CancellationToken,
}

impl Orchestrator {
    pub fn new(
        project: impl Into<String>,
        registry: ServiceRegistry,
        engine: Arc<dyn ContainerEngine>,
    ) -> Self {
        let states: HashMap<String, ServiceState> = registry
            .iter()
            .map(|d| (d.name.clone(), ServiceState::new(&d.name)))
            .collect();
        Self {
            project: project.into(),
            registry,
            engine,
            ports: Arc::new(PortAllocator::new()),
            states: Arc::new(RwLock::new(states)),
            poller: HealthPoller::default(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_poller(mut self, poller: HealthPoller) -> Self {
        self.poller = poller;
        self
    }

    pub fn with_port_allocator(mut self, ports: PortAllocator) -> Self {
        self.ports = Arc::new(ports);
        self
    }

    pub fn registry(&self) -> &ServiceRegistry {
        &self.registry
    }

    /// Cancel in-flight operations. Workers notice at their next suspension
    /// point; blocked engine calls are not force-killed.
    pub fn cancel_operations(&self) {
        self.cancel.cancel();
    }

    // ========================================================================
    // Start
    // ========================================================================

    /// Start services, rendering progress through tracing.
    ///
    /// Returns `Err(PartialFailure)` naming failed services when some (but
    /// not all) work succeeded; successfully started services stay running.
    pub async fn start(&self, names: &[String]) -> Result<OperationOutcome> {
        let (rx, handle) = self.start_streaming(names, None).await?;
        Self::drain_logging(rx).await;
        Self::join_outcome(handle).await?.into_result()
    }

    /// Start services, handing the caller the progress stream.
    ///
    /// Fatal errors (engine unavailable, unknown or busy services) are
    /// returned before any worker is spawned. The join handle resolves only
    /// after every worker has finished; the receiver closes once all events
    /// are emitted.
    pub async fn start_streaming(
        &self,
        names: &[String],
        deadline: Option<Duration>,
    ) -> Result<(ProgressReceiver, JoinHandle<OperationOutcome>)> {
        let descriptors = self.resolve_for_operation(names)?;
        self.ensure_engine_available().await?;
        self.ensure_not_transient(&descriptors).await?;

        // Allocate every port up front, then release the reservation
        // listeners in one step just before containers bind. Per-service
        // conflicts are carried into the worker so siblings keep going.
        let allocations: Vec<(ServiceDescriptor, Result<u16>)> = descriptors
            .into_iter()
            .map(|desc| {
                let allocation = self.ports.allocate(&desc.name, desc.preferred_port);
                (desc, allocation)
            })
            .collect();
        self.ports.release_listeners();

        let (tx, rx) = progress_channel(allocations.len());
        let handle = self.spawn_start_workers(allocations, tx, deadline);
        Ok((rx, handle))
    }

    fn spawn_start_workers(
        &self,
        allocations: Vec<(ServiceDescriptor, Result<u16>)>,
        tx: ProgressSender,
        deadline: Option<Duration>,
    ) -> JoinHandle<OperationOutcome> {
        let engine = Arc::clone(&self.engine);
        let states = Arc::clone(&self.states);
        let poller = self.poller;
        let project = self.project.clone();
        let cancel = self.cancel.clone();

        tokio::spawn(async move {
            let deadline = deadline.map(|d| tokio::time::Instant::now() + d);
            let mut set = JoinSet::new();
            for (desc, allocation) in allocations {
                let engine = Arc::clone(&engine);
                let states = Arc::clone(&states);
                let project = project.clone();
                let tx = tx.clone();
                let cancel = cancel.clone();
                set.spawn(async move {
                    let name = desc.name.clone();
                    let work = start_one(
                        engine,
                        states.clone(),
                        poller,
                        project,
                        desc,
                        allocation,
                        tx.clone(),
                        cancel,
                    );
                    let result = run_with_deadline(work, deadline, &states, &name, &tx).await;
                    (name, result)
                });
            }
            drop(tx);
            collect_outcome(set).await
        })
    }

    // ========================================================================
    // Stop
    // ========================================================================

    /// Stop services, rendering progress through tracing. Idempotent:
    /// stopping an already-stopped service is a no-op that still reports a
    /// `stopped` event.
    pub async fn stop(&self, names: &[String]) -> Result<OperationOutcome> {
        let (rx, handle) = self.stop_streaming(names, None).await?;
        Self::drain_logging(rx).await;
        Self::join_outcome(handle).await?.into_result()
    }

    /// Stop services, handing the caller the progress stream.
    pub async fn stop_streaming(
        &self,
        names: &[String],
        deadline: Option<Duration>,
    ) -> Result<(ProgressReceiver, JoinHandle<OperationOutcome>)> {
        let descriptors = self.resolve_for_operation(names)?;
        self.ensure_engine_available().await?;
        self.ensure_not_transient(&descriptors).await?;

        let (tx, rx) = progress_channel(descriptors.len());
        let handle = self.spawn_stop_workers(descriptors, tx, deadline);
        Ok((rx, handle))
    }

    fn spawn_stop_workers(
        &self,
        descriptors: Vec<ServiceDescriptor>,
        tx: ProgressSender,
        deadline: Option<Duration>,
    ) -> JoinHandle<OperationOutcome> {
        let engine = Arc::clone(&self.engine);
        let states = Arc::clone(&self.states);

        tokio::spawn(async move {
            let deadline = deadline.map(|d| tokio::time::Instant::now() + d);
            let mut set = JoinSet::new();
            for desc in descriptors {
                let engine = Arc::clone(&engine);
                let states = Arc::clone(&states);
                let tx = tx.clone();
                set.spawn(async move {
                    let name = desc.name.clone();
                    let work = stop_one(engine, states.clone(), name.clone(), tx.clone());
                    let result = run_with_deadline(work, deadline, &states, &name, &tx).await;
                    (name, result)
                });
            }
            drop(tx);
            collect_outcome(set).await
        })
    }

    // ========================================================================
    // Restart
    // ========================================================================

    /// Restart services: a stop phase followed by a start phase, both visible
    /// on the progress stream (`stopping, stopped, starting, started`).
    pub async fn restart(&self, names: &[String]) -> Result<OperationOutcome> {
        let (rx, handle) = self.restart_streaming(names, None).await?;
        Self::drain_logging(rx).await;
        Self::join_outcome(handle).await?.into_result()
    }

    /// Restart with the caller consuming progress. The stop phase completes
    /// for all services before the start phase begins, so `stopped` strictly
    /// precedes `starting` for every service.
    pub async fn restart_streaming(
        &self,
        names: &[String],
        deadline: Option<Duration>,
    ) -> Result<(ProgressReceiver, JoinHandle<OperationOutcome>)> {
        let descriptors = self.resolve_for_operation(names)?;
        self.ensure_engine_available().await?;
        self.ensure_not_transient(&descriptors).await?;

        let engine = Arc::clone(&self.engine);
        let states = Arc::clone(&self.states);
        let ports = Arc::clone(&self.ports);
        let poller = self.poller;
        let project = self.project.clone();
        let cancel = self.cancel.clone();

        let (tx, rx) = progress_channel(descriptors.len());
        let handle = tokio::spawn(async move {
            let deadline = deadline.map(|d| tokio::time::Instant::now() + d);

            // Phase 1: stop everything.
            let mut stop_set = JoinSet::new();
            for desc in &descriptors {
                let engine = Arc::clone(&engine);
                let states = Arc::clone(&states);
                let tx = tx.clone();
                let name = desc.name.clone();
                stop_set.spawn(async move {
                    let work = stop_one(engine, states.clone(), name.clone(), tx.clone());
                    let result = run_with_deadline(work, deadline, &states, &name, &tx).await;
                    (name, result)
                });
            }
            let stop_outcome = collect_outcome(stop_set).await;

            // Phase 2: start everything that stopped cleanly. Port
            // allocations from the session are reused, so restarted services
            // keep their ports.
            let stopped_ok: Vec<ServiceDescriptor> = descriptors
                .into_iter()
                .filter(|d| stop_outcome.succeeded.contains(&d.name))
                .collect();
            let allocations: Vec<(ServiceDescriptor, Result<u16>)> = stopped_ok
                .into_iter()
                .map(|desc| {
                    let allocation = ports.allocate(&desc.name, desc.preferred_port);
                    (desc, allocation)
                })
                .collect();
            ports.release_listeners();

            let mut start_set = JoinSet::new();
            for (desc, allocation) in allocations {
                let engine = Arc::clone(&engine);
                let states = Arc::clone(&states);
                let project = project.clone();
                let tx = tx.clone();
                let cancel = cancel.clone();
                let name = desc.name.clone();
                start_set.spawn(async move {
                    let work = start_one(
                        engine,
                        states.clone(),
                        poller,
                        project,
                        desc,
                        allocation,
                        tx.clone(),
                        cancel,
                    );
                    let result = run_with_deadline(work, deadline, &states, &name, &tx).await;
                    (name, result)
                });
            }
            drop(tx);
            let start_outcome = collect_outcome(start_set).await;

            let mut failed = stop_outcome.failed;
            failed.extend(start_outcome.failed);
            OperationOutcome {
                succeeded: start_outcome.succeeded,
                failed,
            }
        });
        Ok((rx, handle))
    }

    // ========================================================================
    // Status
    // ========================================================================

    /// Synchronous snapshot of service state, refreshed against the engine
    /// when a container exists. Does not mutate lifecycle state beyond
    /// reconciling containers that disappeared underneath us.
    pub async fn status(&self, names: Option<&[String]>) -> Result<Vec<ServiceStatus>> {
        let descriptors = match names {
            Some(requested) if !requested.is_empty() => self
                .registry
                .resolve_all(requested)?
                .into_iter()
                .cloned()
                .collect::<Vec<_>>(),
            _ => self.registry.iter().cloned().collect(),
        };

        let mut reports = Vec::with_capacity(descriptors.len());
        for desc in descriptors {
            let state = {
                let states = self.states.read().await;
                states
                    .get(&desc.name)
                    .cloned()
                    .unwrap_or_else(|| ServiceState::new(&desc.name))
            };

            let mut report = ServiceStatus {
                state,
                resources: None,
            };

            if let Some(container_id) = report.state.container_id.clone() {
                match self.engine.inspect(&container_id).await {
                    Ok(info) => {
                        report.resources = info.resources.clone();
                        if !info.is_running() && report.state.status == Status::Running {
                            // Container died behind our back; reconcile.
                            let mut states = self.states.write().await;
                            if let Some(s) = states.get_mut(&desc.name) {
                                s.fail(format!("container exited (state: {})", info.state));
                                report.state = s.clone();
                            }
                        }
                    }
                    Err(e) => {
                        tracing::debug!("Inspect failed for '{}': {}", desc.name, e);
                    }
                }
            }
            reports.push(report);
        }
        Ok(reports)
    }

    /// Read-only snapshot of running services and their ports.
    ///
    /// This is the hand-off that breaks the orchestrator/proxy cycle: the
    /// proxy is built from this snapshot and never references the
    /// orchestrator.
    pub async fn running_services(&self) -> Vec<(String, u16)> {
        let states = self.states.read().await;
        let mut running: Vec<(String, u16)> = states
            .values()
            .filter(|s| s.status == Status::Running)
            .filter_map(|s| s.port.map(|p| (s.name.clone(), p)))
            .collect();
        running.sort();
        running
    }

    /// Adopt containers left over from a previous run, keyed by the project
    /// label. Reconciles state and re-commits their ports so a restart in a
    /// new process doesn't double-allocate.
    pub async fn adopt_running_containers(&self) -> Result<usize> {
        let selector = format!("homeport.project={}", self.project);
        let containers = self.engine.list_by_label(&selector).await?;
        let mut adopted = 0;

        for info in containers.iter().filter(|c| c.is_running()) {
            // Container names follow homeport-{project}-{service}
            let prefix = format!("homeport-{}-", self.project);
            let Some(service) = info.name.strip_prefix(&prefix) else {
                continue;
            };
            let Ok(desc) = self.registry.resolve(service) else {
                continue;
            };

            let mut states = self.states.write().await;
            if let Some(state) = states.get_mut(&desc.name) {
                if state.status == Status::Stopped {
                    state.status = Status::Running;
                    state.container_id = Some(info.id.clone());
                    state.port = Some(desc.preferred_port);
                    state.health = HealthStatus::Unknown;
                    self.ports.mark_allocated(&desc.name, desc.preferred_port);
                    adopted += 1;
                }
            }
        }
        if adopted > 0 {
            tracing::info!("Adopted {} running container(s) from a previous run", adopted);
        }
        Ok(adopted)
    }

    // ========================================================================
    // Internals
    // ========================================================================

    fn resolve_for_operation(&self, names: &[String]) -> Result<Vec<ServiceDescriptor>> {
        let descriptors = if names.is_empty() {
            self.registry.iter().cloned().collect()
        } else {
            self.registry
                .resolve_all(names)?
                .into_iter()
                .cloned()
                .collect::<Vec<_>>()
        };
        Ok(descriptors)
    }

    /// Engine outages abort the operation before any service-level work.
    async fn ensure_engine_available(&self) -> Result<()> {
        self.engine
            .ping()
            .await
            .map_err(|e| Error::EngineUnavailable(e.to_string()))
    }

    /// Re-entrant operations on a service in a transient state are rejected,
    /// not queued, to avoid double-provisioning.
    async fn ensure_not_transient(&self, descriptors: &[ServiceDescriptor]) -> Result<()> {
        let states = self.states.read().await;
        for desc in descriptors {
            if let Some(state) = states.get(&desc.name) {
                if state.status.is_transient() {
                    return Err(Error::ServiceBusy {
                        service: desc.name.clone(),
                        status: state.status.to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    async fn drain_logging(mut rx: ProgressReceiver) {
        while let Some(event) = rx.recv().await {
            match event.phase {
                Phase::Failed => tracing::warn!(
                    "[{}] {}: {}",
                    event.service,
                    event.phase,
                    event.error.as_deref().unwrap_or("unknown error")
                ),
                _ => tracing::info!("[{}] {}", event.service, event.phase),
            }
        }
    }

    async fn join_outcome(handle: JoinHandle<OperationOutcome>) -> Result<OperationOutcome> {
        handle
            .await
            .map_err(|e| Error::Config(format!("operation worker panicked: {}", e)))
    }
}

/// Wrap a worker future with the operation deadline; on expiry the worker
/// stops being awaited and the service is reported timed out.
async fn run_with_deadline<F>(
    work: F,
    deadline: Option<tokio::time::Instant>,
    states: &SharedStates,
    name: &str,
    tx: &ProgressSender,
) -> Result<()>
where
    F: std::future::Future<Output = Result<()>>,
{
    match deadline {
        Some(at) => match tokio::time::timeout_at(at, work).await {
            Ok(result) => result,
            Err(_) => {
                timeout_service(states, name, tx).await;
                Err(Error::Timeout(name.to_string()))
            }
        },
        None => work.await,
    }
}

async fn timeout_service(states: &SharedStates, name: &str, tx: &ProgressSender) {
    {
        let mut states = states.write().await;
        if let Some(state) = states.get_mut(name) {
            state.fail("operation deadline exceeded");
        }
    }
    tx.emit(ProgressEvent::failed(name, "operation deadline exceeded"))
        .await;
}

async fn collect_outcome(mut set: JoinSet<(String, Result<()>)>) -> OperationOutcome {
    let mut outcome = OperationOutcome::default();
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok((name, Ok(()))) => outcome.succeeded.push(name),
            Ok((name, Err(e))) => outcome.failed.push((name, e.to_string())),
            Err(e) => outcome
                .failed
                .push(("<worker>".to_string(), format!("worker panicked: {}", e))),
        }
    }
    outcome.succeeded.sort();
    outcome.failed.sort();
    outcome
}

/// Start worker for one service. Emits `starting` then `started`/`failed`;
/// writes only this service's state slot.
#[allow(clippy::too_many_arguments)]
async fn start_one(
    engine: Arc<dyn ContainerEngine>,
    states: SharedStates,
    poller: HealthPoller,
    project: String,
    desc: ServiceDescriptor,
    allocation: Result<u16>,
    tx: ProgressSender,
    cancel: CancellationToken,
) -> Result<()> {
    let name = desc.name.clone();

    // Starting a running service is a no-op reported as started, symmetric
    // with idempotent stop.
    {
        let states = states.read().await;
        if let Some(state) = states.get(&name) {
            if state.status == Status::Running {
                tx.emit(ProgressEvent::new(&name, Phase::Started)).await;
                return Ok(());
            }
        }
    }

    {
        let mut states = states.write().await;
        let state = states
            .entry(name.clone())
            .or_insert_with(|| ServiceState::new(&name));
        state.transition(Status::Starting)?;
    }
    tx.emit(ProgressEvent::new(&name, Phase::Starting)).await;

    let port = match allocation {
        Ok(port) => port,
        Err(e) => {
            fail_service(&states, &name, &e).await;
            tx.emit(ProgressEvent::failed(&name, e.to_string())).await;
            return Err(e);
        }
    };
    {
        let mut states = states.write().await;
        if let Some(state) = states.get_mut(&name) {
            state.port = Some(port);
        }
    }

    let spec = container_spec(&project, &desc, port);
    // Remove any stale container left by a crashed previous run; docker
    // refuses to reuse a name otherwise.
    let _ = engine.remove(&spec.name).await;

    let container_id = match engine.create_and_start(&spec).await {
        Ok(id) => id,
        Err(e) => {
            let err = Error::Engine(e);
            fail_service(&states, &name, &err).await;
            tx.emit(ProgressEvent::failed(&name, err.to_string())).await;
            return Err(err);
        }
    };
    {
        let mut states = states.write().await;
        if let Some(state) = states.get_mut(&name) {
            state.container_id = Some(container_id.clone());
        }
    }

    if let Some(check) = &desc.healthcheck {
        if let Err(e) = poller
            .await_healthy_with_cancel(engine.as_ref(), &name, &container_id, port, check, &cancel)
            .await
        {
            fail_service(&states, &name, &e).await;
            tx.emit(ProgressEvent::failed(&name, e.to_string())).await;
            return Err(e);
        }
        let mut states = states.write().await;
        if let Some(state) = states.get_mut(&name) {
            state.health = HealthStatus::Healthy;
        }
    }

    {
        let mut states = states.write().await;
        if let Some(state) = states.get_mut(&name) {
            state.transition(Status::Running)?;
        }
    }
    tx.emit(ProgressEvent::new(&name, Phase::Started)).await;
    tracing::info!("Service '{}' running on port {}", name, port);
    Ok(())
}

/// Stop worker for one service. Stopping a stopped service emits `stopped`
/// without touching the engine.
async fn stop_one(
    engine: Arc<dyn ContainerEngine>,
    states: SharedStates,
    name: String,
    tx: ProgressSender,
) -> Result<()> {
    let (status, container_id) = {
        let states = states.read().await;
        match states.get(&name) {
            Some(state) => (state.status, state.container_id.clone()),
            None => (Status::Stopped, None),
        }
    };

    if status == Status::Stopped {
        tx.emit(ProgressEvent::new(&name, Phase::Stopped)).await;
        return Ok(());
    }

    {
        let mut states = states.write().await;
        if let Some(state) = states.get_mut(&name) {
            state.transition(Status::Stopping)?;
        }
    }
    tx.emit(ProgressEvent::new(&name, Phase::Stopping)).await;

    if let Some(ref container_id) = container_id {
        if let Err(e) = engine.stop(container_id).await {
            let err = Error::Engine(e);
            fail_service(&states, &name, &err).await;
            tx.emit(ProgressEvent::failed(&name, err.to_string())).await;
            return Err(err);
        }
        if let Err(e) = engine.remove(container_id).await {
            tracing::warn!("Failed to remove container for '{}': {}", name, e);
        }
    }

    {
        let mut states = states.write().await;
        if let Some(state) = states.get_mut(&name) {
            state.transition(Status::Stopped)?;
        }
    }
    tx.emit(ProgressEvent::new(&name, Phase::Stopped)).await;
    Ok(())
}

async fn fail_service(states: &SharedStates, name: &str, error: &Error) {
    let mut states = states.write().await;
    if let Some(state) = states.get_mut(name) {
        state.fail(error.to_string());
    }
}

fn container_spec(project: &str, desc: &ServiceDescriptor, port: u16) -> ContainerSpec {
    let mut labels = BTreeMap::new();
    labels.insert("homeport.project".to_string(), project.to_string());
    labels.insert("homeport.service".to_string(), desc.name.clone());

    ContainerSpec {
        name: format!("homeport-{}-{}", project, desc.name),
        image: desc.image.clone(),
        env: desc.env.clone(),
        volumes: desc.volumes.clone(),
        port,
        container_port: desc.container_port,
        labels,
        command: desc.command.clone(),
    }
}

mod support;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use homeport::{Error, Orchestrator, Phase, ProgressEvent, Status};
use support::{registry_of, MockEngine};

fn orchestrator_with(engine: MockEngine, services: &[&str]) -> Orchestrator {
    Orchestrator::new("test", registry_of(services), Arc::new(engine))
}

/// Index events by service, preserving per-service order.
fn events_by_service(events: &[ProgressEvent]) -> HashMap<String, Vec<Phase>> {
    let mut by_service: HashMap<String, Vec<Phase>> = HashMap::new();
    for event in events {
        by_service
            .entry(event.service.clone())
            .or_default()
            .push(event.phase);
    }
    by_service
}

#[tokio::test]
async fn start_brings_services_to_running() {
    let orchestrator = orchestrator_with(MockEngine::new(), &["db", "cache"]);
    let outcome = orchestrator
        .start(&["db".to_string(), "cache".to_string()])
        .await
        .unwrap();

    assert_eq!(outcome.succeeded, vec!["cache", "db"]);
    assert!(outcome.failed.is_empty());

    let statuses = orchestrator.status(None).await.unwrap();
    for status in statuses {
        assert_eq!(status.state.status, Status::Running);
        assert!(status.state.port.is_some());
        assert!(status.state.container_id.is_some());
    }
}

#[tokio::test]
async fn partial_failure_isolates_the_failing_service() {
    let orchestrator = orchestrator_with(MockEngine::failing_for(&["b"]), &["a", "b", "c"]);
    let (rx, handle) = orchestrator
        .start_streaming(&["a".to_string(), "b".to_string(), "c".to_string()], None)
        .await
        .unwrap();
    let events = rx.collect().await;
    let outcome = handle.await.unwrap();

    assert_eq!(outcome.succeeded, vec!["a", "c"]);
    assert_eq!(outcome.failed.len(), 1);
    assert_eq!(outcome.failed[0].0, "b");

    // The aggregate error names the failing service.
    let err = outcome.into_result().unwrap_err();
    assert!(err.to_string().contains('b'));

    // Siblings are running, b is failed with its cause recorded.
    let statuses = orchestrator.status(None).await.unwrap();
    for status in statuses {
        match status.state.name.as_str() {
            "b" => {
                assert_eq!(status.state.status, Status::Failed);
                assert!(status.state.last_error.as_deref().unwrap().contains("image"));
            }
            _ => assert_eq!(status.state.status, Status::Running),
        }
    }

    // b still emitted starting before failed.
    let by_service = events_by_service(&events);
    assert_eq!(by_service["b"], vec![Phase::Starting, Phase::Failed]);
}

#[tokio::test]
async fn per_service_events_are_ordered() {
    let orchestrator = orchestrator_with(MockEngine::new(), &["a", "b", "c"]);
    let (rx, handle) = orchestrator
        .start_streaming(&["a".to_string(), "b".to_string(), "c".to_string()], None)
        .await
        .unwrap();
    let events = rx.collect().await;
    handle.await.unwrap();

    for (service, phases) in events_by_service(&events) {
        assert_eq!(
            phases,
            vec![Phase::Starting, Phase::Started],
            "unexpected sequence for {}",
            service
        );
    }
}

#[tokio::test]
async fn unknown_service_fails_fast_with_valid_names() {
    let orchestrator = orchestrator_with(MockEngine::new(), &["db"]);
    let err = orchestrator
        .start(&["dc".to_string()])
        .await
        .unwrap_err();

    match err {
        Error::UnknownService { requested, valid } => {
            assert_eq!(requested, "dc");
            assert!(valid.contains(&"db".to_string()));
        }
        other => panic!("expected UnknownService, got {:?}", other),
    }
}

#[tokio::test]
async fn engine_unavailability_aborts_before_any_worker() {
    let orchestrator = orchestrator_with(MockEngine::unavailable(), &["db"]);
    let err = orchestrator.start(&["db".to_string()]).await.unwrap_err();
    assert!(matches!(err, Error::EngineUnavailable(_)));

    // No state was touched.
    let statuses = orchestrator.status(None).await.unwrap();
    assert_eq!(statuses[0].state.status, Status::Stopped);
}

#[tokio::test]
async fn stop_is_idempotent_and_still_reports() {
    let orchestrator = orchestrator_with(MockEngine::new(), &["db"]);
    orchestrator.start(&["db".to_string()]).await.unwrap();
    orchestrator.stop(&["db".to_string()]).await.unwrap();

    // Second stop: no-op, no error, still emits a stopped event.
    let (rx, handle) = orchestrator
        .stop_streaming(&["db".to_string()], None)
        .await
        .unwrap();
    let events = rx.collect().await;
    let outcome = handle.await.unwrap();

    assert!(outcome.is_success());
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].phase, Phase::Stopped);
    assert_eq!(events[0].service, "db");
}

#[tokio::test]
async fn restart_produces_the_full_event_sequence() {
    let orchestrator = orchestrator_with(MockEngine::new(), &["x"]);
    orchestrator.start(&["x".to_string()]).await.unwrap();

    let (rx, handle) = orchestrator
        .restart_streaming(&["x".to_string()], None)
        .await
        .unwrap();
    let events = rx.collect().await;
    let outcome = handle.await.unwrap();

    assert!(outcome.is_success());
    let phases: Vec<Phase> = events.iter().map(|e| e.phase).collect();
    assert_eq!(
        phases,
        vec![
            Phase::Stopping,
            Phase::Stopped,
            Phase::Starting,
            Phase::Started
        ]
    );
}

#[tokio::test]
async fn restart_keeps_the_same_port() {
    let orchestrator = orchestrator_with(MockEngine::new(), &["db"]);
    orchestrator.start(&["db".to_string()]).await.unwrap();
    let before = orchestrator.status(None).await.unwrap()[0].state.port;

    orchestrator.restart(&["db".to_string()]).await.unwrap();
    let after = orchestrator.status(None).await.unwrap()[0].state.port;

    assert_eq!(before, after);
    assert!(before.is_some());
}

#[tokio::test]
async fn allocated_ports_are_pairwise_distinct() {
    // All three descriptors share the same preferred port.
    let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let base = probe.local_addr().unwrap().port();
    drop(probe);

    let mut registry = homeport::ServiceRegistry::new();
    for name in ["a", "b", "c"] {
        registry.register(support::descriptor(name, base)).unwrap();
    }
    let orchestrator = Orchestrator::new("test", registry, Arc::new(MockEngine::new()));
    orchestrator
        .start(&["a".to_string(), "b".to_string(), "c".to_string()])
        .await
        .unwrap();

    let statuses = orchestrator.status(None).await.unwrap();
    let mut ports: Vec<u16> = statuses.iter().filter_map(|s| s.state.port).collect();
    assert_eq!(ports.len(), 3);
    ports.sort_unstable();
    ports.dedup();
    assert_eq!(ports.len(), 3, "duplicate ports were allocated");
}

#[tokio::test]
async fn starting_a_running_service_is_a_noop() {
    let engine = Arc::new(MockEngine::new());
    let orchestrator = Orchestrator::new("test", registry_of(&["db"]), engine.clone());
    orchestrator.start(&["db".to_string()]).await.unwrap();
    assert_eq!(engine.running_count(), 1);

    orchestrator.start(&["db".to_string()]).await.unwrap();
    // No second container was provisioned.
    assert_eq!(engine.running_count(), 1);
}

#[tokio::test]
async fn transient_service_rejects_new_operations() {
    let engine = MockEngine::new().with_create_delay(Duration::from_millis(500));
    let orchestrator = Arc::new(orchestrator_with(engine, &["db"]));

    let background = {
        let orchestrator = Arc::clone(&orchestrator);
        tokio::spawn(async move { orchestrator.start(&["db".to_string()]).await })
    };
    // Let the first operation reach the engine call.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let err = orchestrator.start(&["db".to_string()]).await.unwrap_err();
    assert!(matches!(err, Error::ServiceBusy { .. }));

    background.await.unwrap().unwrap();
}

#[tokio::test]
async fn deadline_reports_timeouts_for_pending_services() {
    let engine = MockEngine::new().with_create_delay(Duration::from_secs(10));
    let orchestrator = orchestrator_with(engine, &["slow"]);

    let (rx, handle) = orchestrator
        .start_streaming(&["slow".to_string()], Some(Duration::from_millis(200)))
        .await
        .unwrap();
    let events = rx.collect().await;
    let outcome = handle.await.unwrap();

    assert_eq!(outcome.failed.len(), 1);
    assert!(outcome.failed[0].1.contains("deadline")
        || outcome.failed[0].1.contains("timed out"));

    let last = events.last().unwrap();
    assert_eq!(last.phase, Phase::Failed);

    let statuses = orchestrator.status(None).await.unwrap();
    assert_eq!(statuses[0].state.status, Status::Failed);
}

#[tokio::test]
async fn aliases_resolve_to_the_same_service() {
    let mut registry = homeport::ServiceRegistry::new();
    let mut desc = support::descriptor("redis", 56379);
    desc.aliases = vec!["cache".to_string()];
    registry.register(desc).unwrap();

    let engine = Arc::new(MockEngine::new());
    let orchestrator = Orchestrator::new("test", registry, engine.clone());

    // Both names refer to one service; only one container starts.
    orchestrator
        .start(&["redis".to_string(), "cache".to_string()])
        .await
        .unwrap();
    assert_eq!(engine.running_count(), 1);
}

#[tokio::test]
async fn running_snapshot_lists_only_running_services() {
    let orchestrator = orchestrator_with(MockEngine::failing_for(&["bad"]), &["ok", "bad"]);
    let _ = orchestrator
        .start(&["ok".to_string(), "bad".to_string()])
        .await;

    let running = orchestrator.running_services().await;
    assert_eq!(running.len(), 1);
    assert_eq!(running[0].0, "ok");
}

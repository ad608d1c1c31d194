//! Registry behavior: validation, lookup, cancellation, replay, eviction

use std::time::Duration;

use futures::StreamExt;

use deployd::deploy::fsm::DeploymentState;
use deployd::errors::EngineError;
use deployd::models::request::ServiceType;

use crate::support::{collect_events, registry, request, statuses, wait_final, wait_state};

#[tokio::test]
async fn test_invalid_request_allocates_nothing() {
    let tmp = tempfile::tempdir().unwrap();
    let root = tmp.path().join("workspaces");
    let registry = registry(&root);

    let mut req = request(ServiceType::Static);
    req.branch = "  ".to_string();

    let result = registry.create(req);
    assert!(matches!(result, Err(EngineError::ValidationError(_))));
    assert!(registry.is_empty());
    assert!(!root.exists());
}

#[tokio::test]
async fn test_unknown_ids_are_not_found() {
    let tmp = tempfile::tempdir().unwrap();
    let registry = registry(tmp.path());

    assert!(matches!(registry.get("nope"), Err(EngineError::NotFound(_))));
    assert!(matches!(registry.cancel("nope"), Err(EngineError::NotFound(_))));
    assert!(matches!(
        registry.subscribe("nope", None),
        Err(EngineError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_cancel_after_finish_is_a_noop() {
    let tmp = tempfile::tempdir().unwrap();
    let registry = registry(tmp.path());

    let deployment = registry.create(request(ServiceType::Static)).unwrap();
    assert_eq!(wait_final(&deployment).await, DeploymentState::Succeeded);
    let last = deployment.events().last_sequence();

    registry.cancel(deployment.id()).unwrap();
    registry.cancel(deployment.id()).unwrap();

    assert_eq!(deployment.state(), DeploymentState::Succeeded);
    assert_eq!(deployment.events().last_sequence(), last);
}

#[tokio::test]
async fn test_repeated_cancel_emits_one_final_status() {
    let tmp = tempfile::tempdir().unwrap();
    let registry = registry(tmp.path());

    let mut req = request(ServiceType::Static);
    req.build_command = "sleep 30".to_string();
    let deployment = registry.create(req).unwrap();
    wait_state(&deployment, DeploymentState::Building).await;

    for _ in 0..3 {
        registry.cancel(deployment.id()).unwrap();
    }
    assert_eq!(wait_final(&deployment).await, DeploymentState::Cancelled);

    let events = collect_events(&deployment).await;
    let cancelled = statuses(&events)
        .into_iter()
        .filter(|s| s == "cancelled")
        .count();
    assert_eq!(cancelled, 1);
}

#[tokio::test]
async fn test_subscribers_see_the_same_sequence() {
    let tmp = tempfile::tempdir().unwrap();
    let registry = registry(tmp.path());

    let mut req = request(ServiceType::Static);
    req.build_command = "for i in 1 2 3 4 5; do echo line $i; done".to_string();
    let deployment = registry.create(req).unwrap();

    // One attaches immediately, one mid-way, one after the end
    let early = registry.subscribe(deployment.id(), None).unwrap();
    let early = tokio::spawn(early.into_stream().collect::<Vec<_>>());
    wait_state(&deployment, DeploymentState::Building).await;
    let middle = registry.subscribe(deployment.id(), None).unwrap();
    let middle = tokio::spawn(middle.into_stream().collect::<Vec<_>>());

    assert_eq!(wait_final(&deployment).await, DeploymentState::Succeeded);
    let late = collect_events(&deployment).await;

    let early = early.await.unwrap();
    let middle = middle.await.unwrap();
    assert_eq!(early, late);
    assert_eq!(middle, late);
    assert!(late.iter().any(|e| e.text == "line 5"));
}

#[tokio::test]
async fn test_resume_after_last_seen_event() {
    let tmp = tempfile::tempdir().unwrap();
    let registry = registry(tmp.path());

    let deployment = registry.create(request(ServiceType::Static)).unwrap();
    wait_final(&deployment).await;
    let all = collect_events(&deployment).await;
    assert!(all.len() > 3);

    let resumed: Vec<_> = registry
        .subscribe(deployment.id(), Some(2))
        .unwrap()
        .into_stream()
        .collect()
        .await;
    assert_eq!(resumed, all[3..].to_vec());
}

#[tokio::test]
async fn test_disconnect_does_not_cancel() {
    let tmp = tempfile::tempdir().unwrap();
    let registry = registry(tmp.path());

    let mut req = request(ServiceType::WebService);
    req.start_command = "echo ready; sleep 1000".to_string();
    let deployment = registry.create(req).unwrap();

    let subscription = registry.subscribe(deployment.id(), None).unwrap();
    assert_eq!(deployment.events().subscriber_count(), 1);
    drop(subscription);
    assert_eq!(deployment.events().subscriber_count(), 0);

    assert_eq!(
        wait_state(&deployment, DeploymentState::Running).await,
        DeploymentState::Running
    );
    assert!(!deployment.cancel_token().is_cancelled());

    registry.cancel(deployment.id()).unwrap();
    assert_eq!(wait_final(&deployment).await, DeploymentState::Cancelled);
}

#[tokio::test]
async fn test_list_is_newest_first() {
    let tmp = tempfile::tempdir().unwrap();
    let registry = registry(tmp.path());

    let first = registry.create(request(ServiceType::Static)).unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    let second = registry.create(request(ServiceType::Static)).unwrap();

    let ids: Vec<_> = registry.list().iter().map(|d| d.id().to_string()).collect();
    assert_eq!(ids, vec![second.id().to_string(), first.id().to_string()]);

    // Same repository and branch, still independent
    assert_ne!(first.id(), second.id());
    wait_final(&first).await;
    wait_final(&second).await;
}

#[tokio::test]
async fn test_evict_only_expired_final_deployments() {
    let tmp = tempfile::tempdir().unwrap();
    let registry = registry(tmp.path());
    let retention = Duration::from_secs(3600);

    let finished = registry.create(request(ServiceType::Static)).unwrap();
    wait_final(&finished).await;

    let mut req = request(ServiceType::WebService);
    req.start_command = "echo ready; sleep 1000".to_string();
    let running = registry.create(req).unwrap();
    wait_state(&running, DeploymentState::Running).await;

    let finished_at = finished.finished_at().unwrap();
    assert_eq!(registry.evict_expired(retention, finished_at), 0);
    assert_eq!(
        registry.evict_expired(retention, finished_at + chrono::Duration::hours(2)),
        1
    );
    assert!(registry.get(finished.id()).is_err());
    assert!(registry.get(running.id()).is_ok());

    registry.shutdown(Duration::from_secs(10)).await;
    assert_eq!(running.state(), DeploymentState::Cancelled);
}

#[tokio::test]
async fn test_shutdown_cancels_live_deployments() {
    let tmp = tempfile::tempdir().unwrap();
    let root = tmp.path().join("workspaces");
    let registry = registry(&root);

    let mut building = request(ServiceType::Static);
    building.build_command = "sleep 30".to_string();
    let building = registry.create(building).unwrap();

    let mut service = request(ServiceType::WebService);
    service.start_command = "echo ready; sleep 1000".to_string();
    let service = registry.create(service).unwrap();

    wait_state(&building, DeploymentState::Building).await;
    wait_state(&service, DeploymentState::Running).await;

    registry.shutdown(Duration::from_secs(10)).await;
    assert_eq!(building.state(), DeploymentState::Cancelled);
    assert_eq!(service.state(), DeploymentState::Cancelled);
    assert_eq!(std::fs::read_dir(&root).unwrap().count(), 0);
}

//! HTTP gateway, driven through the router without a socket

use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::response::Response;
use axum::Router;
use serde_json::{json, Value};
use tower::ServiceExt;

use deployd::deploy::fsm::DeploymentState;
use deployd::deploy::registry::Registry;
use deployd::models::request::ServiceType;
use deployd::server::serve::router;
use deployd::server::state::ServerState;

use crate::support::{registry, request, wait_final, SCENARIO_TIMEOUT};

fn app(registry: Arc<Registry>) -> Router {
    router(Arc::new(ServerState::new(registry)), &[])
}

async fn body_text(response: Response) -> String {
    let bytes = tokio::time::timeout(
        SCENARIO_TIMEOUT,
        axum::body::to_bytes(response.into_body(), usize::MAX),
    )
    .await
    .expect("body did not end in time")
    .unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

async fn body_json(response: Response) -> Value {
    serde_json::from_str(&body_text(response).await).unwrap()
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

/// Messages of an SSE body, without keep-alive comments
fn frames(body: &str) -> Vec<&str> {
    body.split("\n\n")
        .map(str::trim)
        .filter(|frame| !frame.is_empty() && !frame.starts_with(':'))
        .collect()
}

/// `id:` fields of an SSE body
fn event_ids(body: &str) -> Vec<u64> {
    body.lines()
        .filter_map(|line| line.strip_prefix("id: "))
        .map(|id| id.parse().unwrap())
        .collect()
}

#[tokio::test]
async fn test_health() {
    let tmp = tempfile::tempdir().unwrap();
    let response = app(registry(tmp.path())).oneshot(get("/health")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["deployments"], 0);
}

#[tokio::test]
async fn test_create_rejects_bad_requests() {
    let tmp = tempfile::tempdir().unwrap();
    let registry = registry(tmp.path());

    // Missing branch
    let response = app(registry.clone())
        .oneshot(post_json(
            "/deploy",
            json!({"repository": "acme/widgets", "runtime": "python", "serviceType": "static"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    // Unknown region
    let response = app(registry.clone())
        .oneshot(post_json(
            "/deploy",
            json!({
                "repository": "acme/widgets",
                "branch": "main",
                "runtime": "python",
                "serviceType": "static",
                "region": "mars-north1"
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(body_json(response).await["error"]
        .as_str()
        .unwrap()
        .contains("region"));

    assert!(registry.is_empty());
}

#[tokio::test]
async fn test_create_then_stream_events() {
    let tmp = tempfile::tempdir().unwrap();
    let registry = registry(tmp.path());

    let response = app(registry.clone())
        .oneshot(post_json(
            "/deploy",
            json!({
                "repo": "acme/widgets",
                "branch": "main",
                "runtime": "python",
                "serviceType": "static",
                "environment": {"MODE": "prod"}
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let created = body_json(response).await;
    let id = created["id"].as_str().unwrap().to_string();
    assert_eq!(created["eventsUrl"], format!("/deployments/{}/events", id));

    let deployment = registry.get(&id).unwrap();
    assert_eq!(wait_final(&deployment).await, DeploymentState::Succeeded);

    let response = app(registry.clone())
        .oneshot(get(&format!("/deployments/{}/events", id)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()[header::CONTENT_TYPE],
        "text/event-stream"
    );
    let body = body_text(response).await;
    assert!(body.contains("id: 0\ndata: status: queued\n"));
    assert!(body.contains("data: status: succeeded\n"));
    assert!(!body.contains("event:"));
    let ids = event_ids(&body);
    assert_eq!(ids.first(), Some(&0));
    assert!(ids.windows(2).all(|w| w[1] == w[0] + 1));

    let response = app(registry.clone())
        .oneshot(get(&format!("/deployments/{}", id)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let summary = body_json(response).await;
    assert_eq!(summary["state"], "succeeded");
    assert_eq!(summary["serviceType"], "static");
    assert_eq!(summary["environment"], json!(["MODE"]));
}

#[tokio::test]
async fn test_typed_frames_are_opt_in() {
    let tmp = tempfile::tempdir().unwrap();
    let registry = registry(tmp.path());

    let deployment = registry.create(request(ServiceType::Static)).unwrap();
    wait_final(&deployment).await;

    let uri = format!("/deployments/{}/events?typed=1", deployment.id());
    let body = body_text(app(registry.clone()).oneshot(get(&uri)).await.unwrap()).await;
    assert!(body.contains("id: 0\nevent: status\ndata: status: queued\n"));
    assert!(frames(&body).iter().all(|frame| frame.contains("\nevent: ")));

    let uri = format!("/deployments/{}/events?typed=0", deployment.id());
    let body = body_text(app(registry.clone()).oneshot(get(&uri)).await.unwrap()).await;
    assert!(!body.contains("event:"));
}

#[tokio::test]
async fn test_last_event_id_skips_seen_events() {
    let tmp = tempfile::tempdir().unwrap();
    let registry = registry(tmp.path());

    let mut req = request(ServiceType::Static);
    req.build_command = "echo a; echo b; echo c".to_string();
    let deployment = registry.create(req).unwrap();
    wait_final(&deployment).await;

    let resume = Request::builder()
        .uri(format!("/deployments/{}/events", deployment.id()))
        .header("Last-Event-ID", "4")
        .body(Body::empty())
        .unwrap();
    let body = body_text(app(registry.clone()).oneshot(resume).await.unwrap()).await;
    let ids = event_ids(&body);
    assert_eq!(ids.first(), Some(&5));
    assert_eq!(ids.last().copied(), deployment.events().last_sequence());
}

#[tokio::test]
async fn test_query_deploy_streams_immediately() {
    let tmp = tempfile::tempdir().unwrap();
    let registry = registry(tmp.path());

    let response = app(registry.clone())
        .oneshot(get(
            "/deploy?repo=acme/widgets&branch=main&runtime=python&serviceType=static",
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let id = response.headers()["x-deployment-id"]
        .to_str()
        .unwrap()
        .to_string();

    let body = body_text(response).await;
    assert!(body.contains("data: status: queued\n"));
    assert!(body.trim_end().ends_with("data: status: succeeded"));

    // Every frame reaches a plain `onmessage` listener
    let frames = frames(&body);
    assert!(!frames.is_empty());
    for frame in &frames {
        assert!(frame.lines().all(|line| !line.starts_with("event:")), "{frame}");
        assert!(frame.lines().any(|line| line.starts_with("data: ")), "{frame}");
    }
    assert_eq!(
        registry.get(&id).unwrap().state(),
        DeploymentState::Succeeded
    );

    let response = app(registry.clone()).oneshot(get("/deployments")).await.unwrap();
    let list = body_json(response).await;
    assert_eq!(list.as_array().unwrap().len(), 1);
    assert_eq!(list[0]["id"], id.as_str());
}

#[tokio::test]
async fn test_query_deploy_passes_environment() {
    let tmp = tempfile::tempdir().unwrap();
    let registry = registry(tmp.path());

    let response = app(registry.clone())
        .oneshot(get(
            "/deploy?repo=acme/widgets&branch=main&runtime=python&serviceType=static\
             &buildCommand=echo%20%24GREETING-%24TARGET&env=GREETING%3Dhello&env=TARGET=world",
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let id = response.headers()["x-deployment-id"]
        .to_str()
        .unwrap()
        .to_string();

    let body = body_text(response).await;
    assert!(body.contains("data: hello-world\n"), "{body}");
    assert!(body.trim_end().ends_with("data: status: succeeded"));
    let summary = registry.get(&id).unwrap().summary();
    assert_eq!(summary.environment, vec!["GREETING", "TARGET"]);
}

#[tokio::test]
async fn test_query_deploy_rejects_bad_environment() {
    let tmp = tempfile::tempdir().unwrap();
    let registry = registry(tmp.path());

    for uri in [
        "/deploy?repo=acme/widgets&branch=main&env=NOVALUE",
        "/deploy?repo=acme/widgets&branch=main&env=A=1&env=A=2",
        "/deploy?repo=acme/widgets&branch=main&env=%3Dvalue",
    ] {
        let response = app(registry.clone()).oneshot(get(uri)).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{uri}");
    }
    assert!(registry.is_empty());
}

#[tokio::test]
async fn test_cancel_endpoint() {
    let tmp = tempfile::tempdir().unwrap();
    let registry = registry(tmp.path());

    let response = app(registry.clone())
        .oneshot(post_json(
            "/deploy",
            json!({
                "repository": "acme/widgets",
                "branch": "main",
                "runtime": "python",
                "serviceType": "web_service",
                "startCommand": "echo ready; sleep 1000"
            }),
        ))
        .await
        .unwrap();
    let id = body_json(response).await["id"].as_str().unwrap().to_string();

    let cancel = || {
        Request::builder()
            .method("POST")
            .uri(format!("/deployments/{}/cancel", id))
            .body(Body::empty())
            .unwrap()
    };
    let response = app(registry.clone()).oneshot(cancel()).await.unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);

    let deployment = registry.get(&id).unwrap();
    assert_eq!(wait_final(&deployment).await, DeploymentState::Cancelled);

    // Cancelling again is accepted and changes nothing
    let response = app(registry.clone()).oneshot(cancel()).await.unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    assert_eq!(body_json(response).await["state"], "cancelled");
}

#[tokio::test]
async fn test_unknown_deployment_is_404() {
    let tmp = tempfile::tempdir().unwrap();
    let registry = registry(tmp.path());

    for missing in [
        get("/deployments/missing"),
        get("/deployments/missing/events"),
        Request::builder()
            .method("POST")
            .uri("/deployments/missing/cancel")
            .body(Body::empty())
            .unwrap(),
    ] {
        let response = app(registry.clone()).oneshot(missing).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}

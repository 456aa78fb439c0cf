use std::sync::Arc;

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use serde_json::json;
use tower::ServiceExt;

use sp_api::state::ApiState;
use sp_common::clock::ManualClock;
use sp_common::{ControlPlaneConfig, EventBus};
use sp_connections::ConnectionTracker;
use sp_dispatcher::CommandDispatcher;
use sp_reconciler::Reconciler;
use sp_registry::AgentRegistry;
use sp_sessions::SessionStateMachine;
use sp_store::SqliteStore;

fn build_state() -> ApiState {
    let store = Arc::new(SqliteStore::open_memory().unwrap());
    let events = Arc::new(EventBus::new());
    let clock = ManualClock::new(chrono::Utc::now());
    let config = Arc::new(ControlPlaneConfig::default());
    let registry = Arc::new(AgentRegistry::new(store.clone(), events.clone(), clock.clone()));
    let sessions = Arc::new(SessionStateMachine::new(store.clone(), registry.clone(), clock.clone()));
    let dispatcher = Arc::new(CommandDispatcher::new(
        store.clone(),
        registry.clone(),
        sessions.clone(),
        events.clone(),
        clock.clone(),
        config.clone(),
    ));
    let connections = Arc::new(ConnectionTracker::new(store.clone(), sessions.clone(), clock.clone()));
    let reconciler = Arc::new(Reconciler::new(
        store.clone(),
        sessions.clone(),
        dispatcher.clone(),
        connections.clone(),
        events.clone(),
        clock.clone(),
        config.clone(),
    ));
    ApiState { store, registry, sessions, dispatcher, connections, reconciler, events, clock, config }
}

async fn json_request(
    router: axum::Router,
    method: &str,
    uri: &str,
    body: serde_json::Value,
) -> (StatusCode, serde_json::Value) {
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap();
    let response = router.oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), 1024 * 1024).await.unwrap();
    let value: serde_json::Value = if bytes.is_empty() { json!(null) } else { serde_json::from_slice(&bytes).unwrap() };
    (status, value)
}

#[tokio::test]
async fn register_agent_then_create_and_fetch_session() {
    let state = build_state();
    let router = sp_api::build_router(state);

    let (status, body) = json_request(
        router.clone(),
        "POST",
        "/agents",
        json!({
            "agent_id": "k8s-a",
            "platform": "kubernetes",
            "capacity": {"max_sessions": 10},
        }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["agent_id"], "k8s-a");
    assert!(body["api_key"].as_str().unwrap().len() > 0);

    // No online agent yet (no live websocket) — session creation must fail.
    let (status, _) = json_request(
        router.clone(),
        "POST",
        "/sessions",
        json!({
            "user_id": "alice",
            "template_id": "firefox",
            "platform": "kubernetes",
            "idle_timeout": "60s",
            "manifest": {"image": "firefox:latest", "vnc_port": 5900},
        }),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn create_session_with_online_agent_then_fetch_and_list() {
    let state = build_state();
    state
        .registry
        .register_agent(
            "k8s-a",
            sp_store::model::Platform::Kubernetes,
            None,
            sp_protocol::Capacity { max_sessions: 10, cpu: None, memory: None },
        )
        .unwrap();
    state.store.bind_agent_websocket("k8s-a", "ws-1", state.clock.now()).unwrap();
    let router = sp_api::build_router(state);

    let (status, body) = json_request(
        router.clone(),
        "POST",
        "/sessions",
        json!({
            "user_id": "alice",
            "template_id": "firefox",
            "platform": "kubernetes",
            "idle_timeout": "60s",
            "manifest": {"image": "firefox:latest", "vnc_port": 5900},
        }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let session_id = body["id"].as_str().unwrap().to_string();
    assert_eq!(body["observed_state"], "pending");
    assert_eq!(body["assigned_agent_id"], "k8s-a");

    let (status, body) =
        json_request(router.clone(), "GET", &format!("/sessions/{session_id}"), json!(null)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["id"], session_id);

    let (status, body) =
        json_request(router.clone(), "GET", "/sessions?user_id=alice", json!(null)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn set_desired_state_terminated_emits_stop_session_after_running() {
    let state = build_state();
    state
        .registry
        .register_agent(
            "k8s-a",
            sp_store::model::Platform::Kubernetes,
            None,
            sp_protocol::Capacity { max_sessions: 10, cpu: None, memory: None },
        )
        .unwrap();
    state.store.bind_agent_websocket("k8s-a", "ws-1", state.clock.now()).unwrap();
    let sessions = state.sessions.clone();
    let router = sp_api::build_router(state);

    let (_, body) = json_request(
        router.clone(),
        "POST",
        "/sessions",
        json!({
            "user_id": "alice",
            "template_id": "firefox",
            "platform": "kubernetes",
            "idle_timeout": "60s",
            "manifest": {"image": "firefox:latest", "vnc_port": 5900},
        }),
    )
    .await;
    let session_id = body["id"].as_str().unwrap().to_string();
    sessions.on_command_sent(&session_id).unwrap();
    sessions
        .apply_agent_observed_state(&session_id, sp_protocol::AgentObservedState::Running)
        .unwrap();

    let (status, body) = json_request(
        router.clone(),
        "PATCH",
        &format!("/sessions/{session_id}/desired-state"),
        json!({"state": "terminated"}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["observed_state"], "terminating");
}

#[tokio::test]
async fn connection_lifecycle_through_the_rest_boundary() {
    let state = build_state();
    state
        .registry
        .register_agent(
            "k8s-a",
            sp_store::model::Platform::Kubernetes,
            None,
            sp_protocol::Capacity { max_sessions: 10, cpu: None, memory: None },
        )
        .unwrap();
    state.store.bind_agent_websocket("k8s-a", "ws-1", state.clock.now()).unwrap();
    let router = sp_api::build_router(state);

    let (_, body) = json_request(
        router.clone(),
        "POST",
        "/sessions",
        json!({
            "user_id": "alice",
            "template_id": "firefox",
            "platform": "kubernetes",
            "idle_timeout": "60s",
            "manifest": {"image": "firefox:latest", "vnc_port": 5900},
        }),
    )
    .await;
    let session_id = body["id"].as_str().unwrap().to_string();

    let (status, body) = json_request(
        router.clone(),
        "POST",
        &format!("/sessions/{session_id}/connections"),
        json!({"user_id": "alice", "client_fingerprint": "fp-1"}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let connection_id = body["connection_id"].as_str().unwrap().to_string();

    let (status, _) = json_request(
        router.clone(),
        "POST",
        &format!("/connections/{connection_id}/heartbeat"),
        json!(null),
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, _) =
        json_request(router.clone(), "DELETE", &format!("/connections/{connection_id}"), json!(null)).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn healthz_reports_ok() {
    let state = build_state();
    let router = sp_api::build_router(state);
    let (status, body) = json_request(router, "GET", "/healthz", json!(null)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

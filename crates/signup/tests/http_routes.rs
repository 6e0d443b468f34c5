//! Router tests against in-memory backends.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use futures::future::join_all;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use signup::coordinator::Coordinator;
use signup::identity::MemoryIdentityStore;
use signup::lock::{DistributedLock, LocalLockTable, MemoryLeaseStore, NoGuard};
use signup::server::{build_router, AppState, RegisterResponse};
use tower::ServiceExt;

fn app_with(store: Arc<MemoryIdentityStore>) -> Router {
    let coordinator = Coordinator::new(store, Arc::new(LocalLockTable::new()));
    build_router(AppState::new(Arc::new(coordinator)))
}

fn register_request(openid: &str) -> Request<Body> {
    let body = json!({ "openid": openid, "username": "alice", "password": "pw" });
    Request::builder()
        .method("POST")
        .uri("/register")
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn read_json<T: serde::de::DeserializeOwned>(response: axum::response::Response) -> T {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn test_register_then_duplicate() {
    let app = app_with(Arc::new(MemoryIdentityStore::new()));

    let response = app.clone().oneshot(register_request("u1")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body: RegisterResponse = read_json(response).await;
    assert_eq!(body.outcome, "Registered");
    assert_eq!(body.code, 0);
    assert!(body.id.is_some());

    let response = app.oneshot(register_request("u1")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body: RegisterResponse = read_json(response).await;
    assert_eq!(body.outcome, "AlreadyRegistered");
    assert_eq!(body.code, -1);
}

#[tokio::test]
async fn test_concurrent_duplicate_posts_register_once() {
    let store = Arc::new(MemoryIdentityStore::with_latency(Duration::from_millis(5)));
    let app = app_with(store.clone());

    let responses = join_all((0..3).map(|_| app.clone().oneshot(register_request("u1")))).await;
    let mut outcomes = Vec::new();
    for response in responses {
        let body: RegisterResponse = read_json(response.unwrap()).await;
        outcomes.push(body.outcome);
    }
    outcomes.sort();

    assert_eq!(
        outcomes,
        vec!["AlreadyRegistered", "AlreadyRegistered", "Registered"]
    );
    assert_eq!(store.create_calls("u1").await, 1);
}

#[tokio::test]
async fn test_malformed_body_is_rejected() {
    let app = app_with(Arc::new(MemoryIdentityStore::new()));
    let request = Request::builder()
        .method("POST")
        .uri("/register")
        .header("content-type", "application/json")
        .body(Body::from(r#"{"username":"no-openid"}"#))
        .unwrap();

    let response = app.oneshot(request).await.unwrap();
    assert!(response.status().is_client_error());
}

#[tokio::test]
async fn test_batch_endpoint_reports_no_violations() {
    let store = Arc::new(MemoryIdentityStore::with_latency(Duration::from_millis(1)));
    let app = app_with(store.clone());

    let request = Request::builder()
        .method("POST")
        .uri("/batch/mock_register_user/5?duplicates=3")
        .body(Body::empty())
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body: Value = read_json(response).await;
    assert_eq!(body["code"], 0);
    assert_eq!(body["totals"]["registered"], 5);
    assert_eq!(body["totals"]["already_registered"], 10);
    assert_eq!(body["violations"].as_array().unwrap().len(), 0);
    assert_eq!(store.len().await, 5);

    let stats = app
        .oneshot(Request::builder().uri("/stats").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let stats: Value = read_json(stats).await;
    assert_eq!(stats["registered"], 5);
    assert_eq!(stats["already_registered"], 10);
}

#[tokio::test]
async fn test_batch_endpoint_flags_unguarded_duplicates() {
    let store = Arc::new(MemoryIdentityStore::with_latency(Duration::from_millis(5)));
    let coordinator = Coordinator::new(store.clone(), Arc::new(NoGuard));
    let app = build_router(AppState::new(Arc::new(coordinator)));

    let request = Request::builder()
        .method("POST")
        .uri("/batch/mock_register_user/2")
        .body(Body::empty())
        .unwrap();
    let body: Value = read_json(app.oneshot(request).await.unwrap()).await;

    assert_eq!(body["code"], -1);
    assert_eq!(body["violations"].as_array().unwrap().len(), 2);
    assert!(store.len().await > 2);
}

#[tokio::test]
async fn test_batch_endpoint_rejects_zero() {
    let app = app_with(Arc::new(MemoryIdentityStore::new()));
    let request = Request::builder()
        .method("POST")
        .uri("/batch/mock_register_user/0")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

fn batch_request(uri: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

#[tokio::test]
async fn test_batch_endpoint_bounds_total_attempts() {
    let store = Arc::new(MemoryIdentityStore::new());
    let app = app_with(store.clone());

    for uri in [
        "/batch/mock_register_user/20000",
        "/batch/mock_register_user/1?duplicates=30001",
        "/batch/mock_register_user/10000?duplicates=1000000000",
        "/batch/mock_register_user/2?duplicates=18446744073709551615",
        "/batch/mock_register_user/1?duplicates=0",
    ] {
        let response = app.clone().oneshot(batch_request(uri)).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{uri}");
    }
    assert!(store.is_empty().await);

    let response = app
        .oneshot(batch_request("/batch/mock_register_user/2?duplicates=4"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body: Value = read_json(response).await;
    assert_eq!(body["totals"]["registered"], 2);
    assert_eq!(body["totals"]["already_registered"], 6);
}

#[tokio::test(start_paused = true)]
async fn test_batch_run_survives_client_disconnect() {
    let store = Arc::new(MemoryIdentityStore::with_latency(Duration::from_millis(5)));
    let leases = Arc::new(MemoryLeaseStore::new());
    let lock = DistributedLock::new(leases.clone(), Duration::from_secs(30))
        .with_retry_interval(Duration::from_millis(2));
    let coordinator =
        Coordinator::new(store.clone(), Arc::new(lock)).with_acquire_timeout(Duration::from_secs(2));
    let app = build_router(AppState::new(Arc::new(coordinator)));

    // The client gives up while the first attempts are inside their guards.
    let abandoned = tokio::time::timeout(
        Duration::from_millis(7),
        app.oneshot(batch_request("/batch/mock_register_user/4")),
    )
    .await;
    assert!(abandoned.is_err());

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(store.len().await, 4);
    assert_eq!(leases.live_count(), 0);
}

#[tokio::test]
async fn test_health_reports_guard() {
    let app = app_with(Arc::new(MemoryIdentityStore::new()));
    let response = app
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let body: Value = read_json(response).await;
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["guard"], "local");
}

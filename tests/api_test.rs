//! Integration tests for the HTTP surface, driving the router directly as a
//! `tower::Service` rather than binding a real listener.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use clusterd::config::ClusterConfig;
use clusterd::store::{InMemoryStore, Store};
use clusterd::{ClusterRuntime, VERSION};
use serde_json::{json, Value};
use tower::ServiceExt;

fn test_config(auth_token: &str, storage_dir: &std::path::Path) -> ClusterConfig {
    let mut cfg = ClusterConfig::default();
    cfg.cluster_auth_token = auth_token.to_string();
    cfg.migration_storage_dir = storage_dir.to_string_lossy().into_owned();
    cfg
}

async fn body_json(resp: axum::response::Response) -> (StatusCode, Value) {
    let status = resp.status();
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

#[tokio::test]
async fn cluster_health_requires_token() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config("secret-token", dir.path());
    let store: Arc<dyn clusterd::store::Store> = Arc::new(InMemoryStore::new());
    let runtime = ClusterRuntime::new(config, store).unwrap();
    let router = clusterd::api::build_router(runtime.handle());

    let resp = router
        .clone()
        .oneshot(
            Request::builder()
                .uri("/cluster/health")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

    let resp = router
        .oneshot(
            Request::builder()
                .uri("/cluster/health")
                .header("x-cluster-token", "secret-token")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let (status, body) = body_json(resp).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total_nodes"], 0);
}

#[tokio::test]
async fn register_then_list_nodes() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config("secret-token", dir.path());
    let store: Arc<dyn clusterd::store::Store> = Arc::new(InMemoryStore::new());
    let runtime = ClusterRuntime::new(config, store).unwrap();
    let router = clusterd::api::build_router(runtime.handle());

    let register_body = json!({
        "hostname": "replica-1.internal",
        "port": 7891,
        "role": "replica",
        "owner_user_id": "tenant-a",
        "cluster_token": "secret-token",
    });
    let resp = router
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/cluster/register")
                .header("content-type", "application/json")
                .header("x-cluster-token", "secret-token")
                .body(Body::from(register_body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    let (status, body) = body_json(resp).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["node_id"].is_string());

    let resp = router
        .oneshot(
            Request::builder()
                .uri("/cluster/nodes")
                .header("x-cluster-token", "secret-token")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let (status, body) = body_json(resp).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn migration_endpoints_require_owner_header() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config("secret-token", dir.path());
    let store: Arc<dyn clusterd::store::Store> = Arc::new(InMemoryStore::new());
    let runtime = ClusterRuntime::new(config, store).unwrap();
    let router = clusterd::api::build_router(runtime.handle());

    let resp = router
        .oneshot(
            Request::builder()
                .uri("/migration/collections")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn export_upload_import_validate_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config("secret-token", dir.path());
    let store: Arc<dyn clusterd::store::Store> = Arc::new(InMemoryStore::new());
    store
        .insert("widgets", "w1", json!({"name": "left-handed smoke shifter"}))
        .await
        .unwrap();
    let runtime = ClusterRuntime::new(config, store).unwrap();
    let router = clusterd::api::build_router(runtime.handle());

    let export_body = json!({
        "collections": ["widgets"],
        "compression": "gzip",
    });
    let resp = router
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/migration/export")
                .header("content-type", "application/json")
                .header("x-user-id", "tenant-a")
                .body(Body::from(export_body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    let (status, record) = body_json(resp).await;
    assert_eq!(status, StatusCode::OK);
    let migration_id = record["migration_id"].as_str().unwrap().to_string();

    let resp = router
        .clone()
        .oneshot(
            Request::builder()
                .uri(format!("/migration/export/{migration_id}/download"))
                .header("x-user-id", "tenant-a")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let package_bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();

    let upload_body = json!({"data_hex": hex::encode(&package_bytes)});
    let resp = router
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/migration/upload")
                .header("content-type", "application/json")
                .header("x-user-id", "tenant-a")
                .body(Body::from(upload_body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    let (status, upload_resp) = body_json(resp).await;
    assert_eq!(status, StatusCode::OK);
    let migration_package_id = upload_resp["migration_package_id"].as_str().unwrap();

    let validate_body = json!({
        "migration_package_id": migration_package_id,
        "compression": "gzip",
    });
    let resp = router
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/migration/import/validate")
                .header("content-type", "application/json")
                .header("x-user-id", "tenant-a")
                .body(Body::from(validate_body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    let (status, report) = body_json(resp).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(report["valid"], true);
    assert_eq!(report["total_documents"], 1);
}

#[tokio::test]
async fn unmatched_path_with_no_cluster_peers_404s_instead_of_forwarding() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config("secret-token", dir.path());
    let store: Arc<dyn clusterd::store::Store> = Arc::new(InMemoryStore::new());
    let runtime = ClusterRuntime::new(config, store).unwrap();
    let router = clusterd::api::build_router(runtime.handle());

    let resp = router
        .oneshot(
            Request::builder()
                .uri("/widgets/w1")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[test]
fn version_is_exposed() {
    assert!(!VERSION.is_empty());
}

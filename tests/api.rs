//! HTTP-level tests: the router is driven in-process, one request at a time.

use std::sync::Arc;

use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::{Method, Request, StatusCode, header};
use chrono::Utc;
use serde_json::{Value, json};
use tower::ServiceExt;
use uuid::Uuid;

use zoekt_coordinator::auth::TokenHasher;
use zoekt_coordinator::config::Settings;
use zoekt_coordinator::coordinator::{Clock, Context, Maintenance, MaintenanceReport, ManualClock};
use zoekt_coordinator::server::{AppState, create_router};
use zoekt_coordinator::store::{SqliteStore, Store};

const GIB: i64 = 1024 * 1024 * 1024;

struct TestApp {
    router: Router,
    store: Arc<SqliteStore>,
    clock: Arc<ManualClock>,
    admin_token: String,
    node_token: String,
}

impl TestApp {
    fn new() -> Self {
        let store = Arc::new(SqliteStore::in_memory().expect("open store"));
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let hasher = TokenHasher::new();

        let admin_token = hasher
            .issue(store.as_ref(), true, None, None, clock.now())
            .expect("issue admin token")
            .raw;
        let node_token = hasher
            .issue(store.as_ref(), false, Some("nodes".into()), None, clock.now())
            .expect("issue node token")
            .raw;

        let state = AppState::new(store.clone(), clock.clone());
        Self {
            router: create_router(Arc::new(state)),
            store,
            clock,
            admin_token,
            node_token,
        }
    }

    async fn call(
        &self,
        method: Method,
        uri: &str,
        token: Option<&str>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut request = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            request = request.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }
        let request = match body {
            Some(body) => request
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string())),
            None => request.body(Body::empty()),
        }
        .expect("build request");

        let response = self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("router call");
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("read body");
        let json = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, json)
    }

    async fn admin(&self, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let token = self.admin_token.clone();
        self.call(method, &format!("/api/v1/admin{uri}"), Some(&token), body)
            .await
    }

    async fn heartbeat(&self, uuid: Uuid) -> (StatusCode, Value) {
        let token = self.node_token.clone();
        self.call(
            Method::POST,
            &format!("/internal/search/zoekt/{uuid}/heartbeat"),
            Some(&token),
            Some(json!({
                "node": { "url": "http://zoekt-1:6060", "name": "zoekt-1", "concurrency": 4 },
                "disk": { "all": 100 * GIB, "used": 0, "free": 100 * GIB }
            })),
        )
        .await
    }

    async fn mirror_root(&self, namespace_id: i64, projects: &[i64]) {
        let (status, _) = self
            .admin(
                Method::PUT,
                &format!("/namespaces/{namespace_id}"),
                Some(json!({ "name": format!("group-{namespace_id}") })),
            )
            .await;
        assert_eq!(status, StatusCode::OK);

        for project in projects {
            let (status, _) = self
                .admin(
                    Method::PUT,
                    &format!("/projects/{project}"),
                    Some(json!({ "namespace_id": namespace_id, "root_namespace_id": namespace_id })),
                )
                .await;
            assert_eq!(status, StatusCode::OK);
        }
    }

    fn maintain(&self) -> MaintenanceReport {
        let settings = Settings::load(self.store.as_ref()).expect("load settings");
        let ctx = Context::new(self.store.as_ref(), &settings, self.clock.as_ref());
        Maintenance::new(ctx, 100).run_once().expect("maintenance pass")
    }
}

#[tokio::test]
async fn test_health() {
    let app = TestApp::new();
    let (status, _) = app.call(Method::GET, "/health", None, None).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_admin_routes_require_admin_token() {
    let app = TestApp::new();

    let response = app
        .router
        .clone()
        .oneshot(
            Request::builder()
                .uri("/api/v1/admin/nodes")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert!(response.headers().contains_key(header::WWW_AUTHENTICATE));

    let node_token = app.node_token.clone();
    let (status, body) = app
        .call(Method::GET, "/api/v1/admin/nodes", Some(&node_token), None)
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert!(body["data"].is_null());

    let (status, _) = app
        .call(Method::GET, "/api/v1/admin/nodes", Some("zoekt_nope"), None)
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_node_routes_reject_admin_token() {
    let app = TestApp::new();
    let admin_token = app.admin_token.clone();
    let (status, _) = app
        .call(
            Method::POST,
            &format!("/internal/search/zoekt/{}/heartbeat", Uuid::new_v4()),
            Some(&admin_token),
            Some(json!({ "node.url": "http://n:6060" })),
        )
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_heartbeat_registers_node() {
    let app = TestApp::new();
    let uuid = Uuid::new_v4();

    let (status, body) = app.heartbeat(uuid).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["pull_frequency_secs"], 10);
    assert_eq!(body["data"]["tasks"], json!([]));
    let node_id = body["data"]["node_id"].as_i64().unwrap();

    // A second heartbeat updates the same row.
    let (_, again) = app.heartbeat(uuid).await;
    assert_eq!(again["data"]["node_id"].as_i64(), Some(node_id));

    let (status, nodes) = app.admin(Method::GET, "/nodes", None).await;
    assert_eq!(status, StatusCode::OK);
    let nodes = nodes["data"].as_array().unwrap();
    assert_eq!(nodes.len(), 1);
    assert_eq!(nodes[0]["uuid"], uuid.to_string());
    assert_eq!(nodes[0]["online"], true);
    assert_eq!(nodes[0]["lost"], false);
    assert_eq!(nodes[0]["concurrency_limit"], 4);
    assert_eq!(nodes[0]["unclaimed_storage_bytes"], 100 * GIB);
}

#[tokio::test]
async fn test_heartbeat_without_url_is_rejected() {
    let app = TestApp::new();
    let node_token = app.node_token.clone();
    let (status, body) = app
        .call(
            Method::POST,
            &format!("/internal/search/zoekt/{}/heartbeat", Uuid::new_v4()),
            Some(&node_token),
            Some(json!({ "node": { "name": "no-url" } })),
        )
        .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert!(body["error"].as_str().unwrap().contains("node.url"));
}

#[tokio::test]
async fn test_index_lifecycle_over_http() {
    let app = TestApp::new();
    let uuid = Uuid::new_v4();
    app.mirror_root(1, &[10]).await;
    app.heartbeat(uuid).await;

    let (status, body) = app
        .admin(
            Method::POST,
            "/enabled-namespaces",
            Some(json!({ "root_namespace_id": 1 })),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["data"]["search"], false);
    let replicas = body["data"]["replicas"].as_array().unwrap();
    assert_eq!(replicas.len(), 1);
    assert_eq!(replicas[0]["indices"][0]["state"], "pending");

    // The namespace job expands into one task per project.
    assert_eq!(app.maintain().index_jobs_processed, 1);

    let (_, body) = app.heartbeat(uuid).await;
    let tasks = body["data"]["tasks"].as_array().unwrap();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0]["task_type"], "index_repo");
    assert_eq!(tasks[0]["project_id"], 10);
    assert_eq!(tasks[0]["namespace_id"], 1);
    let task_id = tasks[0]["id"].as_i64().unwrap();

    // Claimed tasks are not handed out twice.
    let (_, body) = app.heartbeat(uuid).await;
    assert_eq!(body["data"]["tasks"], json!([]));

    let (_, body) = app.admin(Method::GET, "/projects/10/nodes", None).await;
    assert_eq!(body["data"], json!([]));

    let node_token = app.node_token.clone();
    let (status, body) = app
        .call(
            Method::POST,
            &format!("/internal/search/zoekt/{uuid}/callback"),
            Some(&node_token),
            Some(json!({
                "name": "index",
                "success": true,
                "payload": { "task_id": task_id, "repo_stats": { "size_in_bytes": 2048, "index_file_count": 1 } }
            })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["state"], "done");

    app.maintain();

    let (_, body) = app.admin(Method::GET, "/enabled-namespaces/1", None).await;
    assert_eq!(body["data"]["search"], true);
    let index = &body["data"]["replicas"][0]["indices"][0];
    assert_eq!(index["state"], "ready");
    assert_eq!(index["used_storage_bytes"], 2048);

    let (_, body) = app.admin(Method::GET, "/projects/10/nodes", None).await;
    let nodes = body["data"].as_array().unwrap();
    assert_eq!(nodes.len(), 1);
    assert_eq!(nodes[0]["uuid"], uuid.to_string());
}

#[tokio::test]
async fn test_callback_for_unknown_task() {
    let app = TestApp::new();
    let uuid = Uuid::new_v4();
    app.heartbeat(uuid).await;

    let node_token = app.node_token.clone();
    let (status, _) = app
        .call(
            Method::POST,
            &format!("/internal/search/zoekt/{uuid}/callback"),
            Some(&node_token),
            Some(json!({ "name": "index", "success": true, "payload": { "task_id": 999 } })),
        )
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_enable_namespace_errors() {
    let app = TestApp::new();
    app.mirror_root(1, &[]).await;
    let (status, _) = app
        .admin(
            Method::PUT,
            "/namespaces/2",
            Some(json!({ "parent_id": 1, "name": "subgroup" })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);

    // No nodes yet.
    let (status, _) = app
        .admin(
            Method::POST,
            "/enabled-namespaces",
            Some(json!({ "root_namespace_id": 1 })),
        )
        .await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

    app.heartbeat(Uuid::new_v4()).await;

    let (status, body) = app
        .admin(
            Method::POST,
            "/enabled-namespaces",
            Some(json!({ "root_namespace_id": 2 })),
        )
        .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert!(body["error"].as_str().unwrap().contains("root"));

    let enable = json!({ "root_namespace_id": 1 });
    let (status, _) = app
        .admin(Method::POST, "/enabled-namespaces", Some(enable.clone()))
        .await;
    assert_eq!(status, StatusCode::CREATED);
    let (status, _) = app
        .admin(Method::POST, "/enabled-namespaces", Some(enable))
        .await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, _) = app
        .admin(Method::DELETE, "/enabled-namespaces/1", None)
        .await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, _) = app
        .admin(Method::DELETE, "/enabled-namespaces/1", None)
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_settings_round_trip() {
    let app = TestApp::new();

    let (status, body) = app.admin(Method::GET, "/settings", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["zoekt_indexing_paused"], "false");
    assert_eq!(body["data"]["zoekt_lost_node_threshold"], "12h");

    let (status, body) = app
        .admin(
            Method::PUT,
            "/settings",
            Some(json!({ "zoekt_indexing_paused": "true", "zoekt_lost_node_threshold": "0" })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["zoekt_indexing_paused"], "true");
    assert_eq!(body["data"]["zoekt_lost_node_threshold"], "0");

    // One bad key rejects the whole update.
    let (status, _) = app
        .admin(
            Method::PUT,
            "/settings",
            Some(json!({ "zoekt_indexing_paused": "false", "zoekt_bogus": "1" })),
        )
        .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    let settings = Settings::load(app.store.as_ref()).unwrap();
    assert!(settings.indexing_paused);
}

#[tokio::test]
async fn test_paused_indexing_hands_out_no_tasks() {
    let app = TestApp::new();
    let uuid = Uuid::new_v4();
    app.mirror_root(1, &[10]).await;
    app.heartbeat(uuid).await;
    app.admin(
        Method::POST,
        "/enabled-namespaces",
        Some(json!({ "root_namespace_id": 1 })),
    )
    .await;
    app.maintain();

    app.admin(
        Method::PUT,
        "/settings",
        Some(json!({ "zoekt_indexing_paused": "true" })),
    )
    .await;
    let (_, body) = app.heartbeat(uuid).await;
    assert_eq!(body["data"]["tasks"], json!([]));

    app.admin(
        Method::PUT,
        "/settings",
        Some(json!({ "zoekt_indexing_paused": "false" })),
    )
    .await;
    let (_, body) = app.heartbeat(uuid).await;
    assert_eq!(body["data"]["tasks"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_node_token_lifecycle() {
    let app = TestApp::new();

    let (status, body) = app
        .admin(
            Method::POST,
            "/tokens",
            Some(json!({ "description": "zoekt-2" })),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);
    let raw = body["data"]["token"].as_str().unwrap().to_string();
    let id = body["data"]["metadata"]["id"].as_str().unwrap().to_string();
    assert!(raw.starts_with("zoekt_"));
    assert_eq!(body["data"]["metadata"]["is_admin"], false);

    let heartbeat_uri = format!("/internal/search/zoekt/{}/heartbeat", Uuid::new_v4());
    let heartbeat = json!({ "node.url": "http://zoekt-2:6060" });
    let (status, _) = app
        .call(Method::POST, &heartbeat_uri, Some(&raw), Some(heartbeat.clone()))
        .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = app.admin(Method::GET, "/tokens", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"].as_array().unwrap().len(), 3);

    let (status, _) = app
        .admin(Method::DELETE, &format!("/tokens/{id}"), None)
        .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, _) = app
        .call(Method::POST, &heartbeat_uri, Some(&raw), Some(heartbeat))
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_expired_node_token_is_rejected() {
    let app = TestApp::new();
    let (_, body) = app
        .admin(
            Method::POST,
            "/tokens",
            Some(json!({ "expires_in_seconds": 60 })),
        )
        .await;
    let raw = body["data"]["token"].as_str().unwrap().to_string();

    app.clock.advance(chrono::TimeDelta::minutes(2));
    let (status, body) = app
        .call(
            Method::POST,
            &format!("/internal/search/zoekt/{}/heartbeat", Uuid::new_v4()),
            Some(&raw),
            Some(json!({ "node.url": "http://n:6060" })),
        )
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "Token expired");
}

#[tokio::test]
async fn test_retire_index_and_list() {
    let app = TestApp::new();
    app.mirror_root(1, &[]).await;
    app.heartbeat(Uuid::new_v4()).await;
    app.admin(
        Method::POST,
        "/enabled-namespaces",
        Some(json!({ "root_namespace_id": 1 })),
    )
    .await;

    let (status, body) = app.admin(Method::GET, "/indices", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["has_more"], false);
    let id = body["data"][0]["id"].as_i64().unwrap();
    assert_eq!(body["data"][0]["free_storage_bytes"], 10 * GIB);
    assert_eq!(body["data"][0]["current_watermark"], "healthy");

    let (status, _) = app
        .admin(Method::POST, &format!("/indices/{id}/retire"), None)
        .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (_, body) = app.admin(Method::GET, &format!("/indices/{id}"), None).await;
    assert_eq!(body["data"]["state"], "pending_deletion");

    // No repositories were ever created, so the index goes on the next pass.
    assert_eq!(app.maintain().indices_deleted, 1);
    let (status, _) = app.admin(Method::GET, &format!("/indices/{id}"), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = app
        .admin(Method::GET, "/indices?cursor=abc", None)
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

use axum::middleware;
use axum::routing::{get, post};
use axum::Router;
use tower_http::trace::TraceLayer;

use crate::auth::require_bearer_token;
use crate::handlers;
use crate::state::AppState;

/// Assemble the HTTP surface: `/health` is public, everything under `/v1`
/// sits behind the bearer-token middleware.
pub fn build_app(state: AppState) -> Router {
    let v1 = Router::new()
        // Sandboxes
        .route(
            "/sandboxes",
            post(handlers::create_sandbox).get(handlers::list_sandboxes),
        )
        .route(
            "/sandboxes/:id",
            get(handlers::get_sandbox).delete(handlers::delete_sandbox),
        )
        .route("/sandboxes/:id/stop", post(handlers::stop_sandbox))
        .route("/sandboxes/:id/keepalive", post(handlers::keepalive_sandbox))
        .route("/sandboxes/:id/extend_ttl", post(handlers::extend_ttl))
        // Capability dispatch (e.g. /python/exec, /filesystem/read)
        .route(
            "/sandboxes/:id/:capability/:operation",
            post(handlers::invoke_capability),
        )
        // Cargos
        .route(
            "/cargos",
            post(handlers::create_cargo).get(handlers::list_cargos),
        )
        .route(
            "/cargos/:id",
            get(handlers::get_cargo).delete(handlers::delete_cargo),
        )
        // Profiles
        .route("/profiles", get(handlers::list_profiles))
        // Admin
        .route("/admin/gc/status", get(handlers::gc_status))
        .route("/admin/gc/run", post(handlers::gc_run))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            require_bearer_token,
        ))
        .with_state(state);

    Router::new()
        .route("/health", get(handlers::health))
        .nest("/v1", v1)
        .layer(TraceLayer::new_for_http())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::{Method, Request, StatusCode};
    use bay_config::default_profiles;
    use bay_domain::RuntimeType;
    use bay_driver::{Driver, LocalDriver};
    use bay_gc::{GcConfig, GcScheduler};
    use bay_orchestrator::{
        CapabilityRouter, CargoManager, LockTable, ProfileRegistry, SandboxManager,
        SessionManager,
    };
    use bay_runtime::{
        CapabilityCall, CapabilityInfo, RuntimeApi, RuntimeConnector, RuntimeDescription,
        RuntimeError, RuntimeInfo, WorkspaceInfo,
    };
    use bay_store::{InMemoryStore, MetadataStore};
    use serde_json::{json, Value};
    use tower::util::ServiceExt;

    const TEST_TOKEN: &str = "test-token";

    struct EchoRuntime {
        runtime_type: RuntimeType,
    }

    #[async_trait]
    impl RuntimeApi for EchoRuntime {
        async fn health(&self) -> Result<(), RuntimeError> {
            Ok(())
        }

        async fn meta(&self) -> Result<RuntimeDescription, RuntimeError> {
            let names: &[&str] = match self.runtime_type {
                RuntimeType::CodeRuntime => &["python", "shell", "filesystem"],
                RuntimeType::BrowserRuntime => &["browser"],
            };
            let capabilities: HashMap<String, CapabilityInfo> = names
                .iter()
                .map(|n| {
                    (
                        n.to_string(),
                        CapabilityInfo { operations: vec!["exec".into()] },
                    )
                })
                .collect();
            Ok(RuntimeDescription {
                runtime: RuntimeInfo {
                    name: "echo".into(),
                    version: "0.0.0".into(),
                    api_version: "1.0".into(),
                },
                workspace: WorkspaceInfo { mount_path: "/workspace".into() },
                capabilities,
            })
        }

        async fn invoke(&self, call: &CapabilityCall) -> Result<Value, RuntimeError> {
            Ok(json!({ "echo": call.payload, "operation": call.operation }))
        }
    }

    struct EchoConnector;

    impl RuntimeConnector for EchoConnector {
        fn connect(&self, _endpoint: &str, runtime_type: RuntimeType) -> Arc<dyn RuntimeApi> {
            Arc::new(EchoRuntime { runtime_type })
        }
    }

    fn test_app() -> Router {
        let store: Arc<dyn MetadataStore> = Arc::new(InMemoryStore::new());
        let driver: Arc<dyn Driver> = Arc::new(LocalDriver::new());
        let connector: Arc<dyn RuntimeConnector> = Arc::new(EchoConnector);
        let locks = LockTable::new();
        let registry = Arc::new(ProfileRegistry::new(default_profiles()));

        let sessions = Arc::new(
            SessionManager::new(
                store.clone(),
                driver.clone(),
                connector.clone(),
                Duration::from_secs(5),
            )
            .with_poll_interval(Duration::from_millis(10)),
        );
        let cargos = Arc::new(CargoManager::new(store.clone(), driver.clone()));
        let sandboxes = Arc::new(SandboxManager::new(
            store.clone(),
            locks.clone(),
            sessions.clone(),
            cargos.clone(),
            registry.clone(),
            None,
        ));
        let router = Arc::new(CapabilityRouter::new(
            store.clone(),
            sessions.clone(),
            locks.clone(),
            connector,
            registry.clone(),
            Duration::from_secs(30),
            Duration::from_secs(300),
        ));
        let gc = Arc::new(GcScheduler::new(
            store.clone(),
            driver,
            locks,
            sandboxes.clone(),
            sessions,
            cargos.clone(),
            GcConfig::default(),
        ));

        build_app(AppState {
            store,
            sandboxes,
            cargos,
            router,
            gc,
            registry,
            auth_token: Arc::new(TEST_TOKEN.to_string()),
            idempotency_retention: Duration::from_secs(86_400),
        })
    }

    fn authed(req: axum::http::request::Builder) -> axum::http::request::Builder {
        req.header("Authorization", format!("Bearer {TEST_TOKEN}"))
            .header("content-type", "application/json")
    }

    async fn send(app: &Router, req: Request<Body>) -> (StatusCode, Value) {
        let resp = app.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, value)
    }

    async fn create_sandbox(app: &Router, body: Value) -> Value {
        let (status, value) = send(
            app,
            authed(Request::builder().method(Method::POST).uri("/v1/sandboxes"))
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        value
    }

    #[tokio::test]
    async fn health_is_public() {
        let app = test_app();
        let (status, body) = send(
            &app,
            Request::builder().uri("/health").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn v1_requires_bearer_token() {
        let app = test_app();
        let (status, body) = send(
            &app,
            Request::builder().uri("/v1/profiles").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["code"], "unauthorized");

        let (status, _) = send(
            &app,
            Request::builder()
                .uri("/v1/profiles")
                .header("Authorization", "Bearer wrong-token")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn profiles_lists_builtin_set() {
        let app = test_app();
        let (status, body) = send(
            &app,
            authed(Request::builder().uri("/v1/profiles")).body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let profiles = body["profiles"].as_array().unwrap();
        assert!(profiles.iter().any(|p| p["id"] == "python-default"));
        assert!(profiles.iter().any(|p| p["id"] == "browser-python"));
    }

    #[tokio::test]
    async fn sandbox_crud_flow() {
        let app = test_app();
        let created = create_sandbox(&app, json!({ "profile_id": "python-default" })).await;
        let id = created["id"].as_str().unwrap().to_string();
        assert_eq!(created["status"], "idle");
        assert!(created["cargo_id"].is_string(), "managed cargo attached");

        let (status, fetched) = send(
            &app,
            authed(Request::builder().uri(format!("/v1/sandboxes/{id}")))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(fetched["id"], id.as_str());

        let (status, listed) = send(
            &app,
            authed(Request::builder().uri("/v1/sandboxes")).body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(listed["sandboxes"].as_array().unwrap().len(), 1);

        let (status, _) = send(
            &app,
            authed(
                Request::builder()
                    .method(Method::DELETE)
                    .uri(format!("/v1/sandboxes/{id}")),
            )
            .body(Body::empty())
            .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = send(
            &app,
            authed(Request::builder().uri(format!("/v1/sandboxes/{id}")))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], "not_found");
    }

    #[tokio::test]
    async fn idempotent_create_replays_byte_identical() {
        let app = test_app();
        let body = json!({ "profile_id": "python-default", "ttl_seconds": 600 }).to_string();

        let mut responses = Vec::new();
        for _ in 0..2 {
            let resp = app
                .clone()
                .oneshot(
                    authed(Request::builder().method(Method::POST).uri("/v1/sandboxes"))
                        .header("Idempotency-Key", "k1")
                        .body(Body::from(body.clone()))
                        .unwrap(),
                )
                .await
                .unwrap();
            assert_eq!(resp.status(), StatusCode::CREATED);
            let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
            responses.push(bytes);
        }
        assert_eq!(responses[0], responses[1], "replay must be byte-identical");

        // Same key, different request → conflict.
        let (status, body) = send(
            &app,
            authed(Request::builder().method(Method::POST).uri("/v1/sandboxes"))
                .header("Idempotency-Key", "k1")
                .body(Body::from(
                    json!({ "profile_id": "python-default", "ttl_seconds": 900 }).to_string(),
                ))
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["code"], "conflict");
    }

    #[tokio::test]
    async fn extend_ttl_is_idempotent_per_key() {
        let app = test_app();
        let created =
            create_sandbox(&app, json!({ "profile_id": "python-default", "ttl_seconds": 600 }))
                .await;
        let id = created["id"].as_str().unwrap();
        let base = created["expires_at"].as_str().unwrap().to_string();

        let extend = |key: &'static str| {
            let app = app.clone();
            let uri = format!("/v1/sandboxes/{id}/extend_ttl");
            async move {
                let (status, body) = send(
                    &app,
                    authed(Request::builder().method(Method::POST).uri(uri))
                        .header("Idempotency-Key", key)
                        .body(Body::from(json!({ "seconds": 300 }).to_string()))
                        .unwrap(),
                )
                .await;
                assert_eq!(status, StatusCode::OK);
                body["expires_at"].as_str().unwrap().to_string()
            }
        };

        let first = extend("k1").await;
        let replay = extend("k1").await;
        assert_eq!(first, replay, "same key must not extend twice");
        assert_ne!(first, base);

        let second = extend("k2").await;
        assert_ne!(second, first, "a fresh key extends again");

        let t0: chrono::DateTime<chrono::Utc> = base.parse().unwrap();
        let t2: chrono::DateTime<chrono::Utc> = second.parse().unwrap();
        assert_eq!((t2 - t0).num_seconds(), 600, "net extension is 300 + 300");
    }

    #[tokio::test]
    async fn python_exec_starts_session_and_routes() {
        let app = test_app();
        let created = create_sandbox(&app, json!({ "profile_id": "python-default" })).await;
        let id = created["id"].as_str().unwrap();

        let (status, body) = send(
            &app,
            authed(
                Request::builder()
                    .method(Method::POST)
                    .uri(format!("/v1/sandboxes/{id}/python/exec")),
            )
            .body(Body::from(json!({ "code": "print(1+1)" }).to_string()))
            .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["echo"]["code"], "print(1+1)");

        let (_, fetched) = send(
            &app,
            authed(Request::builder().uri(format!("/v1/sandboxes/{id}")))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(fetched["status"], "running");
        assert!(fetched["session_generation"].is_string());
    }

    #[tokio::test]
    async fn filesystem_traversal_rejected() {
        let app = test_app();
        let created = create_sandbox(&app, json!({ "profile_id": "python-default" })).await;
        let id = created["id"].as_str().unwrap();

        let (status, body) = send(
            &app,
            authed(
                Request::builder()
                    .method(Method::POST)
                    .uri(format!("/v1/sandboxes/{id}/filesystem/read")),
            )
            .body(Body::from(json!({ "path": "../etc/shadow" }).to_string()))
            .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "invalid_path");
    }

    #[tokio::test]
    async fn unknown_capability_segment_rejected() {
        let app = test_app();
        let created = create_sandbox(&app, json!({ "profile_id": "python-default" })).await;
        let id = created["id"].as_str().unwrap();

        let (status, body) = send(
            &app,
            authed(
                Request::builder()
                    .method(Method::POST)
                    .uri(format!("/v1/sandboxes/{id}/ftp/exec")),
            )
            .body(Body::from("{}".to_string()))
            .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "validation");
    }

    #[tokio::test]
    async fn browser_on_code_only_profile_is_client_error() {
        let app = test_app();
        let created = create_sandbox(&app, json!({ "profile_id": "python-default" })).await;
        let id = created["id"].as_str().unwrap();

        let (status, body) = send(
            &app,
            authed(
                Request::builder()
                    .method(Method::POST)
                    .uri(format!("/v1/sandboxes/{id}/browser/exec")),
            )
            .body(Body::from(json!({ "cmd": "screenshot p.png" }).to_string()))
            .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "capability_not_supported");
    }

    #[tokio::test]
    async fn cargo_lifecycle_over_http() {
        let app = test_app();

        let (status, cargo) = send(
            &app,
            authed(Request::builder().method(Method::POST).uri("/v1/cargos"))
                .body(Body::from(json!({ "size_limit_mb": 256 }).to_string()))
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let cargo_id = cargo["id"].as_str().unwrap().to_string();
        assert_eq!(cargo["managed"], false);

        // Attach it; deletion now conflicts.
        let sandbox = create_sandbox(
            &app,
            json!({ "profile_id": "python-default", "cargo_id": cargo_id }),
        )
        .await;
        let (status, body) = send(
            &app,
            authed(
                Request::builder()
                    .method(Method::DELETE)
                    .uri(format!("/v1/cargos/{cargo_id}")),
            )
            .body(Body::empty())
            .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["code"], "conflict");

        // Delete the sandbox; the external cargo becomes deletable.
        let sb_id = sandbox["id"].as_str().unwrap();
        send(
            &app,
            authed(
                Request::builder()
                    .method(Method::DELETE)
                    .uri(format!("/v1/sandboxes/{sb_id}")),
            )
            .body(Body::empty())
            .unwrap(),
        )
        .await;
        let (status, _) = send(
            &app,
            authed(
                Request::builder()
                    .method(Method::DELETE)
                    .uri(format!("/v1/cargos/{cargo_id}")),
            )
            .body(Body::empty())
            .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn admin_gc_endpoints() {
        let app = test_app();

        let (status, _) = send(
            &app,
            authed(
                Request::builder()
                    .method(Method::POST)
                    .uri("/v1/admin/gc/run"),
            )
            .body(Body::from(json!({ "task": "expired_sandboxes" }).to_string()))
            .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = send(
            &app,
            authed(
                Request::builder()
                    .method(Method::POST)
                    .uri("/v1/admin/gc/run"),
            )
            .body(Body::empty())
            .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["last_reports"].as_array().unwrap().len(), 4);

        let (status, body) = send(
            &app,
            authed(Request::builder().uri("/v1/admin/gc/status"))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["cycles_completed"].as_u64().unwrap() >= 1);
    }

    #[tokio::test]
    async fn expired_sandbox_returns_gone() {
        let app = test_app();
        let created =
            create_sandbox(&app, json!({ "profile_id": "python-default", "ttl_seconds": 1 }))
                .await;
        let id = created["id"].as_str().unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(1100)).await;

        let (status, body) = send(
            &app,
            authed(
                Request::builder()
                    .method(Method::POST)
                    .uri(format!("/v1/sandboxes/{id}/python/exec")),
            )
            .body(Body::from(json!({ "code": "1" }).to_string()))
            .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::GONE);
        assert_eq!(body["code"], "sandbox_expired");
    }
}

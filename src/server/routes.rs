//! Axum route handlers for the caphub HTTP server.
//!
//! # Routes
//!
//! - `GET  /health`                                  - Returns `{"status": "ok", "version": ...}`
//! - `GET  /capabilities`                            - Catalog of registered capabilities
//! - `ANY  /root/:name`                              - Tenant-less request served by the builder
//! - `GET  /c/:name/:install/:space/actions`         - List the instance's actions
//! - `POST /c/:name/:install/:space/actions/:action` - Execute an action (JSON params body)
//! - `POST /c/:name/:install/:space/reload`          - Rebuild the instance from its stored model
//! - `ANY  /c/:name/:install/:space/h[/*rest]`       - Instance HTTP handler (websocket, relay)
//!
//! When a [`TokenVerifier`] is configured, every `/c/...` route requires
//! `Authorization: Bearer <token>` whose claims match the addressed tenant.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, Request, State},
    http::{header, HeaderMap},
    response::{IntoResponse, Response},
    routing::{any, get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::auth::TokenVerifier;
use crate::capabilities::{ActionParams, CapabilityHub};
use crate::error::{HubError, HubResult};

/// Shared application state for the HTTP server.
#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<CapabilityHub>,
    /// Capability token verifier. Auth is off when `None`.
    pub verifier: Option<Arc<dyn TokenVerifier>>,
}

impl AppState {
    pub fn new(hub: Arc<CapabilityHub>) -> Self {
        Self {
            hub,
            verifier: None,
        }
    }

    pub fn with_verifier(mut self, verifier: Arc<dyn TokenVerifier>) -> Self {
        self.verifier = Some(verifier);
        self
    }

    /// Check the bearer token against the addressed tenant.
    fn authorize(&self, headers: &HeaderMap, tenant: &TenantPath) -> HubResult<()> {
        let Some(verifier) = &self.verifier else {
            return Ok(());
        };
        let token = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .ok_or_else(|| HubError::Unauthorized("missing bearer token".into()))?;
        let claims = verifier.parse_capability_token(token.trim())?;
        claims.authorize(&tenant.name, &tenant.install, &tenant.space)
    }
}

/// `(capability, install, space)` path segments.
#[derive(Debug, Deserialize)]
struct TenantPath {
    name: String,
    install: String,
    space: String,
}

#[derive(Debug, Deserialize)]
struct ActionPath {
    name: String,
    install: String,
    space: String,
    action: String,
}

/// Build the axum router with all routes.
pub fn app_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/capabilities", get(catalog_handler))
        .route("/root/:name", any(root_handler))
        .route("/c/:name/:install/:space/actions", get(list_actions_handler))
        .route("/c/:name/:install/:space/actions/:action", post(execute_handler))
        .route("/c/:name/:install/:space/reload", post(reload_handler))
        .route("/c/:name/:install/:space/h", any(handle_handler))
        .route("/c/:name/:install/:space/h/*rest", any(handle_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// GET /health - liveness probe.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "version": crate::VERSION,
        "service": "caphub",
        "instances": state.hub.cached_count(),
    }))
}

/// GET /capabilities - `[ {name, icon, options} ]`.
async fn catalog_handler(State(state): State<AppState>) -> Json<Value> {
    let catalog: Vec<Value> = state
        .hub
        .catalog()
        .iter()
        .map(|factory| {
            json!({
                "name": factory.name,
                "icon": factory.icon,
                "options": factory.options,
            })
        })
        .collect();
    Json(Value::Array(catalog))
}

/// ANY /root/:name - delegated to the builder, no tenant resolution.
async fn root_handler(
    State(state): State<AppState>,
    Path(name): Path<String>,
    request: Request,
) -> Result<Response, HubError> {
    state.hub.handle_root(&name, request).await
}

/// GET /c/:name/:install/:space/actions
async fn list_actions_handler(
    State(state): State<AppState>,
    Path(tenant): Path<TenantPath>,
    headers: HeaderMap,
) -> Result<Json<Value>, HubError> {
    state.authorize(&headers, &tenant)?;
    let actions = state
        .hub
        .list_actions(&tenant.install, &tenant.space, &tenant.name)
        .await?;
    Ok(Json(json!({ "actions": actions })))
}

/// POST /c/:name/:install/:space/actions/:action
///
/// The body is the action's JSON params; an empty body is `null`.
async fn execute_handler(
    State(state): State<AppState>,
    Path(path): Path<ActionPath>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, HubError> {
    let tenant = TenantPath {
        name: path.name,
        install: path.install,
        space: path.space,
    };
    state.authorize(&headers, &tenant)?;
    let params = ActionParams::from_slice(&body)?;
    tracing::debug!(
        capability = %tenant.name,
        install = %tenant.install,
        space = %tenant.space,
        action = %path.action,
        "executing action"
    );
    let result = state
        .hub
        .execute(&tenant.install, &tenant.space, &tenant.name, &path.action, params)
        .await?;
    Ok(Json(result))
}

/// POST /c/:name/:install/:space/reload
async fn reload_handler(
    State(state): State<AppState>,
    Path(tenant): Path<TenantPath>,
    headers: HeaderMap,
) -> Result<Json<Value>, HubError> {
    state.authorize(&headers, &tenant)?;
    state
        .hub
        .reload(&tenant.install, &tenant.space, &tenant.name)
        .await?;
    tracing::info!(capability = %tenant.name, install = %tenant.install, space = %tenant.space, "reloaded");
    Ok(Json(json!({
        "status": "reloaded",
        "capability": tenant.name,
        "install_id": tenant.install,
        "space_id": tenant.space,
    })))
}

/// ANY /c/:name/:install/:space/h[/*rest] - the instance's own HTTP handler.
async fn handle_handler(
    State(state): State<AppState>,
    Path(tenant): Path<TenantPath>,
    request: Request,
) -> Result<Response, HubError> {
    state.authorize(request.headers(), &tenant)?;
    state
        .hub
        .handle(&tenant.install, &tenant.space, &tenant.name, request)
        .await
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http;
    use crate::auth::{CapabilityClaims, HmacTokenVerifier};
    use crate::capabilities::builtin::register_builtins;
    use crate::capabilities::{CapabilityModel, CapabilityRegistry, HostContext};
    use crate::config::HubConfig;
    use crate::store::MemoryStore;
    use axum::body::Body;
    use axum::http::StatusCode;
    use futures::StreamExt;
    use tower::ServiceExt;

    fn test_state() -> AppState {
        let store = Arc::new(MemoryStore::new());
        store.put(CapabilityModel::new("m1", "acme", "main", "pubsub"));
        store.put(CapabilityModel::new("m2", "acme", "main", "relay"));

        let mut registry = CapabilityRegistry::new();
        register_builtins(&mut registry);
        let hub = CapabilityHub::init(&registry, HostContext::new(HubConfig::default(), store))
            .unwrap();
        AppState::new(Arc::new(hub))
    }

    fn post_json(uri: &str, body: Value) -> Request {
        http::Request::builder()
            .method("POST")
            .uri(uri)
            .header("Content-Type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get(uri: &str) -> Request {
        http::Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    async fn json_body(response: Response) -> Value {
        let body = axum::body::to_bytes(response.into_body(), 1 << 20)
            .await
            .unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let app = app_router(test_state());
        let response = app.oneshot(get("/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let json = json_body(response).await;
        assert_eq!(json["status"], "ok");
        assert_eq!(json["version"], crate::VERSION);
        assert_eq!(json["service"], "caphub");
    }

    #[tokio::test]
    async fn test_catalog() {
        let app = app_router(test_state());
        let json = json_body(app.oneshot(get("/capabilities")).await.unwrap()).await;
        let names: Vec<&str> = json
            .as_array()
            .unwrap()
            .iter()
            .map(|c| c["name"].as_str().unwrap())
            .collect();
        assert_eq!(names, vec!["pubsub", "relay"]);
        assert_eq!(json[1]["options"][0]["name"], "queue_capacity");
    }

    #[tokio::test]
    async fn test_unknown_capability_and_tenant() {
        let app = app_router(test_state());
        let response = app
            .clone()
            .oneshot(get("/c/nope/acme/main/actions"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert!(json_body(response).await["error"]
            .as_str()
            .unwrap()
            .contains("builder not found"));

        let response = app.oneshot(get("/c/pubsub/globex/main/actions")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_list_and_execute_actions() {
        let state = test_state();
        let app = app_router(state.clone());

        let json = json_body(
            app.clone()
                .oneshot(get("/c/pubsub/acme/main/actions"))
                .await
                .unwrap(),
        )
        .await;
        assert!(json["actions"]
            .as_array()
            .unwrap()
            .contains(&json!("publish")));

        let response = app
            .clone()
            .oneshot(post_json(
                "/c/pubsub/acme/main/actions/publish",
                json!({"data": "hi"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(response).await["error"], "topic is required");

        let response = app
            .clone()
            .oneshot(post_json(
                "/c/pubsub/acme/main/actions/publish",
                json!({"topic": "news", "data": "hi"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["status"], "ok");

        let response = app
            .oneshot(
                http::Request::builder()
                    .method("POST")
                    .uri("/c/pubsub/acme/main/actions/connections")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(json_body(response).await["connections"], json!([]));
        assert_eq!(state.hub.cached_count(), 1);
    }

    #[tokio::test]
    async fn test_reload_route() {
        let state = test_state();
        let app = app_router(state.clone());
        let before = state.hub.resolve("pubsub", "acme", "main").await.unwrap();

        let response = app
            .oneshot(post_json("/c/pubsub/acme/main/reload", Value::Null))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["status"], "reloaded");

        let after = state.hub.resolve("pubsub", "acme", "main").await.unwrap();
        assert!(!Arc::ptr_eq(&before, &after));
    }

    #[tokio::test]
    async fn test_root_route() {
        let app = app_router(test_state());
        let response = app.clone().oneshot(get("/root/relay")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["capability"], "relay");

        let response = app.oneshot(get("/root/nope")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_relay_post_and_get_are_byte_identical() {
        let app = app_router(test_state());
        let payload: Vec<u8> = (0..70_000u32).map(|i| (i * 7 % 256) as u8).collect();
        let writes: Vec<Result<Bytes, std::io::Error>> = [
            &payload[..32_768],
            &payload[32_768..65_536],
            &payload[65_536..],
        ]
        .iter()
        .map(|part| Ok(Bytes::copy_from_slice(part)))
        .collect();

        let post = http::Request::builder()
            .method("POST")
            .uri("/c/relay/acme/main/h?relay_id=blob")
            .body(Body::from_stream(futures::stream::iter(writes)))
            .unwrap();
        let (get_response, post_response) = tokio::join!(
            app.clone().oneshot(get("/c/relay/acme/main/h/blob")),
            app.clone().oneshot(post),
        );

        let post_response = post_response.unwrap();
        assert_eq!(post_response.status(), StatusCode::OK);
        let receipt = json_body(post_response).await;
        assert_eq!(receipt["relay_id"], "blob");
        assert_eq!(receipt["bytes"], 70_000);

        let get_response = get_response.unwrap();
        assert_eq!(get_response.status(), StatusCode::OK);
        assert_eq!(
            get_response.headers()[header::CONTENT_TYPE],
            "application/octet-stream"
        );
        let chunks: Vec<Bytes> = get_response
            .into_body()
            .into_data_stream()
            .map(|chunk| chunk.unwrap())
            .collect()
            .await;
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks.concat(), payload);
    }

    #[tokio::test]
    async fn test_auth_required_when_configured() {
        let verifier = HmacTokenVerifier::new("s3cret").unwrap();
        let good = verifier
            .issue(&CapabilityClaims::new("acme", "main", "pubsub"))
            .unwrap();
        let other = verifier
            .issue(&CapabilityClaims::new("acme", "main", "relay"))
            .unwrap();
        let app = app_router(test_state().with_verifier(Arc::new(verifier)));

        let with_token = |token: &str| {
            http::Request::builder()
                .uri("/c/pubsub/acme/main/actions")
                .header(header::AUTHORIZATION, format!("Bearer {}", token))
                .body(Body::empty())
                .unwrap()
        };

        let response = app
            .clone()
            .oneshot(get("/c/pubsub/acme/main/actions"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = app.clone().oneshot(with_token(&other)).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = app.clone().oneshot(with_token("garbage")).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = app.clone().oneshot(with_token(&good)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        // Catalog routes stay open.
        let response = app.oneshot(get("/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}

//! Full-router HTTP tests: drives `hub_server::build_router` end to end
//! through `tower::ServiceExt::oneshot`, the same way the teacher's own
//! example pack exercises a router without binding a real listener.

use axum::body::{to_bytes, Body};
use axum::http::{header, Request, StatusCode};
use hub_auth::AuthSigner;
use hub_dispatch::ScriptDispatcher;
use hub_md5cache::Md5Cache;
use hub_protocol::HttpErrorEnvelope;
use hub_server::config::Config;
use hub_server::state::{AppState, ConnRegistry};
use hub_transfer::TokenStore;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

const PASSHASH: &[u8] = b"integration-test-passhash";

fn test_state() -> AppState {
    let config = Arc::new(Config {
        bind_addr: "127.0.0.1:0".to_string(),
        log_level: "error".to_string(),
        passhash: PASSHASH.to_vec(),
        ping_interval: Duration::from_secs(30),
        state_interval: Duration::from_secs(60),
        token_gc_interval: Duration::from_secs(60),
        token_default_ttl: Duration::from_secs(3600),
        shared_source_grace: Duration::from_secs(30),
        script_root: std::env::temp_dir(),
        script_start_delay: Duration::from_millis(500),
        script_start_timeout: Duration::from_secs(360),
        write_arbiter_capacity: 8,
        ice_servers: serde_json::json!([]),
        missed_ping_limit: 3,
    });

    let md5_cache = Arc::new(Md5Cache::new());
    let token_store = Arc::new(TokenStore::new());
    let dispatcher = ScriptDispatcher::new(
        config.script_root.clone(),
        md5_cache.clone(),
        token_store.clone(),
        config.script_start_delay,
        config.script_start_timeout,
        CancellationToken::new(),
    );

    AppState {
        registry: ConnRegistry::new(config.write_arbiter_capacity, config.missed_ping_limit),
        auth: Arc::new(AuthSigner::new(PASSHASH.to_vec())),
        dispatcher,
        token_store,
        md5_cache,
        config,
    }
}

fn router() -> axum::Router {
    hub_server::build_router(test_state())
}

async fn error_body(response: axum::response::Response) -> HttpErrorEnvelope {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn healthz_is_reachable_without_authentication() {
    let app = router();
    let req = Request::builder().uri("/healthz").body(Body::empty()).unwrap();
    let response = app.oneshot(req).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn unknown_route_falls_back_to_404_page() {
    let app = router();
    let req = Request::builder().uri("/nope").body(Body::empty()).unwrap();
    let response = app.oneshot(req).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn dispatch_script_without_signature_is_rejected() {
    let app = router();
    let body = serde_json::json!({"devices": ["D1"], "scriptName": "main.lua"}).to_string();
    let req = Request::builder()
        .method("POST")
        .uri("/dispatch/script")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body))
        .unwrap();

    let response = app.oneshot(req).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let err = error_body(response).await;
    assert_eq!(err.code, hub_protocol::error_codes::AUTH_FAILED);
}

#[tokio::test]
async fn dispatch_script_with_valid_signature_rejects_empty_device_list() {
    let signer = AuthSigner::new(PASSHASH.to_vec());
    let body_str = serde_json::json!({"devices": [], "scriptName": "main.lua"}).to_string();
    let ts = chrono::Utc::now().timestamp();
    let nonce = "n1";
    let sign = signer.sign("POST", "/dispatch/script", body_str.as_bytes(), ts, nonce);

    let app = router();
    let req = Request::builder()
        .method("POST")
        .uri("/dispatch/script")
        .header(header::CONTENT_TYPE, "application/json")
        .header("X-XXT-TS", ts.to_string())
        .header("X-XXT-Nonce", nonce)
        .header("X-XXT-Sign", sign)
        .body(Body::from(body_str))
        .unwrap();

    let response = app.oneshot(req).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let err = error_body(response).await;
    assert_eq!(err.code, hub_protocol::error_codes::BAD_REQUEST);
}

pub mod auth;
pub mod config;
pub mod http;
pub mod scheduled;
pub mod state;
pub mod ws;

pub use state::AppState;

use axum::{
    response::{Html, IntoResponse},
    routing::{get, post, put},
    Router,
};
use tower_http::trace::TraceLayer;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws::ws_handler))
        .route("/transfer/create-token", post(http::transfer::create_token))
        .route("/transfer/download/:token", get(http::transfer::download))
        .route("/transfer/upload/:token", put(http::transfer::upload))
        .route("/transfer/push-to-device", post(http::dispatch::push_to_device))
        .route("/transfer/pull-from-device", post(http::dispatch::pull_from_device))
        .route("/dispatch/script", post(http::script::dispatch_script))
        .route("/healthz", get(health::healthz))
        .route("/readyz", get(health::readyz))
        .fallback(fallback_404)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn fallback_404() -> impl IntoResponse {
    (
        axum::http::StatusCode::NOT_FOUND,
        Html(
            r#"<!DOCTYPE html>
<html lang="en">
<head>
  <meta charset="utf-8">
  <meta name="viewport" content="width=device-width, initial-scale=1">
  <title>404 – Not Found</title>
  <style>
    * { margin: 0; padding: 0; box-sizing: border-box; }
    body {
      font-family: -apple-system, BlinkMacSystemFont, "Segoe UI", Roboto, Helvetica, Arial, sans-serif;
      background: #0f1117;
      color: #e1e4e8;
      display: flex;
      align-items: center;
      justify-content: center;
      min-height: 100vh;
    }
    .container { text-align: center; }
    .code {
      font-size: 8rem;
      font-weight: 700;
      letter-spacing: -0.04em;
      line-height: 1;
      background: linear-gradient(135deg, #667eea, #764ba2);
      -webkit-background-clip: text;
      -webkit-text-fill-color: transparent;
    }
    .message {
      margin-top: 0.5rem;
      font-size: 1.25rem;
      color: #8b949e;
    }
  </style>
</head>
<body>
  <div class="container">
    <div class="code">404</div>
    <p class="message">This page doesn't exist.</p>
  </div>
</body>
</html>"#,
        ),
    )
}

mod health {
    use axum::response::IntoResponse;
    pub async fn healthz() -> impl IntoResponse {
        "ok"
    }
    pub async fn readyz() -> impl IntoResponse {
        "ok"
    }
}

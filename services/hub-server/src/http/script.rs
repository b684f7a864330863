//! `/dispatch/script`: the HTTP surface for `hub-dispatch::ScriptDispatcher`
//! (spec §4.9) — packages a script bundle and fans it out to a device list.

use crate::http::response::{bad_request, HttpResult};
use crate::http::verify_signed;
use crate::state::AppState;
use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use hub_protocol::ScriptDispatchRequest;
use std::collections::HashMap;

pub async fn dispatch_script(
    State(app): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
    body: Bytes,
) -> HttpResult<Response> {
    verify_signed(&app, "POST", "/dispatch/script", &headers, &query, &body)?;
    let req: ScriptDispatchRequest = serde_json::from_slice(&body).map_err(|e| bad_request(e.to_string()))?;
    if req.devices.is_empty() {
        return Err(bad_request("devices must not be empty"));
    }

    let base_url = req.server_base_url.clone().unwrap_or_default();
    app.dispatcher
        .dispatch(&app.registry, req.devices.clone(), &req.script_name, req.config_overlay.clone(), &base_url)
        .await?;

    Ok((StatusCode::OK, axum::Json(serde_json::json!({ "dispatched": req.devices }))).into_response())
}

//! `/transfer/push-to-device` and `/transfer/pull-from-device`: hub-initiated
//! file transfers outside the script-dispatch flow, built on the same
//! `hub-transfer` token machinery `hub-dispatch` uses internally.

use crate::http::response::{bad_request, invalid_path, io_error, HttpResult};
use crate::http::verify_signed;
use crate::state::AppState;
use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use hub_dispatch::DeviceSink;
use hub_md5cache::FileStat;
use hub_protocol::{kind, Envelope, PullFromDeviceRequest, PushToDeviceRequest, TokenDirection, TransferFetch, TransferSend};
use hub_transfer::{TokenStore, TransferRecord};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};

fn rejects_traversal(path: &str) -> bool {
    path.split('/').any(|seg| seg == "..")
}

pub async fn push_to_device(
    State(app): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
    body: Bytes,
) -> HttpResult<Response> {
    verify_signed(&app, "POST", "/transfer/push-to-device", &headers, &query, &body)?;
    let req: PushToDeviceRequest = serde_json::from_slice(&body).map_err(|e| bad_request(e.to_string()))?;
    if rejects_traversal(&req.path) {
        return Err(invalid_path("path must not contain '..' segments"));
    }

    let source = PathBuf::from(&req.path);
    let metadata = tokio::fs::metadata(&source).await.map_err(|e| io_error(e.to_string()))?;
    let stat = FileStat::from_metadata(&metadata).map_err(|e| io_error(e.to_string()))?;
    let digest = app.md5_cache.digest(&source, Some(stat)).await?;

    let base_url = req.server_base_url.clone().unwrap_or_default();
    let ttl = Duration::from_secs(req.timeout.unwrap_or_else(|| app.config.token_default_ttl.as_secs()));
    let target_path = req.target_path.clone().unwrap_or_else(|| req.path.clone());

    let mut results = Vec::with_capacity(req.device_sn.len());
    for device in &req.device_sn {
        let token = TokenStore::generate_token();
        let record = TransferRecord {
            token: token.clone(),
            direction: TokenDirection::Download,
            server_path: source.clone(),
            device_path: target_path.clone(),
            device_udid: device.clone(),
            expires_at: Instant::now() + ttl,
            one_time: true,
            total_bytes: metadata.len(),
            md5: Some(digest.clone()),
            shared_source_id: req.shared_source_id.clone(),
            category: req.category.clone(),
        };
        app.token_store.create(record, Some(source.clone())).await;

        let fetch = TransferFetch {
            request_id: format!("{device}-push-{token}"),
            url: format!("{base_url}/transfer/download/{token}"),
            target_path: target_path.clone(),
            md5: digest.clone(),
            total_bytes: metadata.len(),
        };
        let envelope = Envelope::new(kind::TRANSFER_FETCH, serde_json::to_value(&fetch).unwrap_or_default());
        match app.registry.send_to_device(device, envelope).await {
            Ok(()) => results.push(serde_json::json!({"device": device, "token": token, "sent": true})),
            Err(e) => results.push(serde_json::json!({"device": device, "token": token, "sent": false, "error": e.to_string()})),
        }
    }

    Ok((StatusCode::OK, axum::Json(serde_json::json!({ "results": results }))).into_response())
}

pub async fn pull_from_device(
    State(app): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
    body: Bytes,
) -> HttpResult<Response> {
    verify_signed(&app, "POST", "/transfer/pull-from-device", &headers, &query, &body)?;
    let req: PullFromDeviceRequest = serde_json::from_slice(&body).map_err(|e| bad_request(e.to_string()))?;
    if rejects_traversal(&req.path) {
        return Err(invalid_path("path must not contain '..' segments"));
    }

    let token = TokenStore::generate_token();
    let record = TransferRecord {
        token: token.clone(),
        direction: TokenDirection::Upload,
        server_path: PathBuf::from(&req.path),
        device_path: req.path.clone(),
        device_udid: req.device_sn.clone(),
        expires_at: Instant::now() + app.config.token_default_ttl,
        one_time: true,
        total_bytes: 0,
        md5: None,
        shared_source_id: None,
        category: None,
    };
    app.token_store.create(record, None).await;

    let base_url = req.server_base_url.clone().unwrap_or_default();
    let url = format!("{base_url}/transfer/upload/{token}");
    let send = TransferSend {
        request_id: format!("{}-pull-{token}", req.device_sn),
        url: url.clone(),
        source_path: req.path.clone(),
    };
    let envelope = Envelope::new(kind::TRANSFER_SEND, serde_json::to_value(&send).unwrap_or_default());
    app.registry.send_to_device(&req.device_sn, envelope).await?;

    Ok((StatusCode::OK, axum::Json(serde_json::json!({ "token": token, "url": url }))).into_response())
}

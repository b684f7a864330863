//! `/transfer/*` handlers: token issuance plus the download/upload
//! capability endpoints tokens redeem against.

use crate::http::response::{bad_request, invalid_path, io_error, HttpResult};
use crate::http::verify_signed;
use crate::state::AppState;
use axum::body::{Body, Bytes};
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use futures_util::StreamExt;
use hub_md5cache::FileStat;
use hub_protocol::{kind, CreateTokenRequest, CreateTokenResponse, Envelope, TokenDirection, TransferProgress, UploadResponse};
use hub_transfer::TokenStore;
use hub_transfer::TransferRecord;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tracing::warn;

fn rejects_traversal(path: &str) -> bool {
    path.split('/').any(|seg| seg == "..")
}

pub async fn create_token(
    State(app): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
    body: Bytes,
) -> HttpResult<Response> {
    verify_signed(&app, "POST", "/transfer/create-token", &headers, &query, &body)?;
    let req: CreateTokenRequest = serde_json::from_slice(&body).map_err(|e| bad_request(e.to_string()))?;
    if rejects_traversal(&req.path) {
        return Err(invalid_path("path must not contain '..' segments"));
    }

    let ttl = req.expire_secs.map(Duration::from_secs).unwrap_or(app.config.token_default_ttl);
    let one_time = req.one_time.unwrap_or(false);
    let source = PathBuf::from(&req.path);

    let (total_bytes, md5) = match req.direction {
        TokenDirection::Download => {
            let metadata = tokio::fs::metadata(&source).await.map_err(|e| io_error(e.to_string()))?;
            let stat = FileStat::from_metadata(&metadata).map_err(|e| io_error(e.to_string()))?;
            let digest = app.md5_cache.digest(&source, Some(stat)).await?;
            (metadata.len(), Some(digest))
        }
        TokenDirection::Upload => (0, None),
    };

    let token = TokenStore::generate_token();
    let record = TransferRecord {
        token: token.clone(),
        direction: req.direction,
        server_path: source,
        device_path: req.target_path.clone().unwrap_or_else(|| req.path.clone()),
        device_udid: req.device_sn.clone(),
        expires_at: Instant::now() + ttl,
        one_time,
        total_bytes,
        md5: md5.clone(),
        shared_source_id: None,
        category: req.category.clone(),
    };
    app.token_store.create(record, None).await;

    let segment = match req.direction {
        TokenDirection::Download => "download",
        TokenDirection::Upload => "upload",
    };
    let expires_at = (chrono::Utc::now() + chrono::Duration::from_std(ttl).unwrap_or_default()).to_rfc3339();

    let response = CreateTokenResponse {
        token: token.clone(),
        url: format!("/transfer/{segment}/{token}"),
        direction: req.direction,
        expires_at,
        total_bytes,
        md5,
    };
    Ok((StatusCode::OK, axum::Json(response)).into_response())
}

/// Streams the token's file to the caller, broadcasting throttled
/// `transfer/progress` frames to every connected controller, then best-effort
/// deletes the file if it wasn't part of a shared-source dispatch batch.
pub async fn download(State(app): State<AppState>, Path(token): Path<String>) -> HttpResult<Response> {
    let record = app
        .token_store
        .consume(&token, TokenDirection::Download, app.config.shared_source_grace)
        .await?;

    let file = tokio::fs::File::open(&record.server_path).await.map_err(|e| io_error(e.to_string()))?;

    let sent = Arc::new(AtomicU64::new(0));
    let total = record.total_bytes;
    spawn_progress_ticker(app.clone(), token.clone(), record.device_udid.clone(), sent.clone(), total);

    let body_stream = tokio_util::io::ReaderStream::new(file).inspect(move |chunk| {
        if let Ok(bytes) = chunk {
            sent.fetch_add(bytes.len() as u64, Ordering::Relaxed);
        }
    });

    let mut response = Response::new(Body::from_stream(body_stream));
    *response.status_mut() = StatusCode::OK;
    let headers = response.headers_mut();
    headers.insert("content-length", HeaderValue::from_str(&total.to_string()).unwrap_or(HeaderValue::from_static("0")));
    if let Some(md5) = &record.md5 {
        if let Ok(v) = HeaderValue::from_str(md5) {
            headers.insert("x-file-md5", v);
        }
    }

    if record.shared_source_id.is_none() {
        let path = record.server_path.clone();
        tokio::spawn(async move {
            if let Err(e) = tokio::fs::remove_file(&path).await {
                warn!(path = %path.display(), error = %e, "best-effort delete of one-time download failed");
            }
        });
    }

    Ok(response)
}

/// Periodically reports `sent`/`total` to every controller until the
/// transfer finishes or the token's own expiry window would have long since
/// passed — a generous bound so a stalled client doesn't leak the ticker
/// forever.
fn spawn_progress_ticker(app: AppState, token: String, udid: String, sent: Arc<AtomicU64>, total: u64) {
    tokio::spawn(async move {
        let max_ticks = 3600; // 12 minutes at the 200ms cadence below
        for _ in 0..max_ticks {
            tokio::time::sleep(Duration::from_millis(200)).await;
            let current = sent.load(Ordering::Relaxed);
            let percent = if total > 0 { ((current as f64 / total as f64) * 100.0).min(100.0) as u8 } else { 100 };
            let progress = TransferProgress { token: token.clone(), bytes_sent: current, total_bytes: total, percent };
            let envelope = Envelope::new(kind::TRANSFER_PROGRESS, serde_json::to_value(&progress).unwrap_or_default())
                .with_udid(udid.clone());
            app.registry.broadcast_to_controllers(envelope).await;
            if current >= total {
                break;
            }
        }
    });
}

/// Streams the request body to the token's destination path while tee-hashing
/// it with MD5, then records the digest so a later `download` token created
/// for the same path gets a cache hit instead of re-reading the file.
pub async fn upload(State(app): State<AppState>, Path(token): Path<String>, body: Body) -> HttpResult<Response> {
    let record = app
        .token_store
        .consume(&token, TokenDirection::Upload, app.config.shared_source_grace)
        .await?;

    if let Some(parent) = record.server_path.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(|e| io_error(e.to_string()))?;
    }
    let mut file = tokio::fs::File::create(&record.server_path).await.map_err(|e| io_error(e.to_string()))?;

    let mut stream = body.into_data_stream();
    let mut ctx = md5::Context::new();
    let mut bytes_written: u64 = 0;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| io_error(e.to_string()))?;
        ctx.consume(&chunk);
        file.write_all(&chunk).await.map_err(|e| io_error(e.to_string()))?;
        bytes_written += chunk.len() as u64;
    }
    file.flush().await.map_err(|e| io_error(e.to_string()))?;
    let digest = format!("{:x}", ctx.compute());

    let metadata = tokio::fs::metadata(&record.server_path).await.map_err(|e| io_error(e.to_string()))?;
    let stat = FileStat::from_metadata(&metadata).map_err(|e| io_error(e.to_string()))?;
    app.md5_cache.record(&record.server_path, stat, digest.clone()).await;

    let response = UploadResponse {
        success: true,
        bytes: bytes_written,
        md5: digest,
        path: record.device_path,
    };
    Ok((StatusCode::OK, axum::Json(response)).into_response())
}

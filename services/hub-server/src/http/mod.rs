pub mod dispatch;
pub mod response;
pub mod script;
pub mod transfer;

use crate::auth::extract_signature;
use crate::state::AppState;
use axum::http::HeaderMap;
use response::{auth_failed, HttpResponse};
use std::collections::HashMap;

/// Verifies `(ts, nonce, sign)` against `method`/`canonical_path`/`body` the
/// same way every in-band control frame is verified. Every `/transfer/*`
/// endpoint except `download`/`upload` (capability URLs — the token itself
/// is the credential) runs every request through this first.
pub(crate) fn verify_signed(
    app: &AppState,
    method: &str,
    canonical_path: &str,
    headers: &HeaderMap,
    query: &HashMap<String, String>,
    body: &[u8],
) -> Result<(), HttpResponse> {
    let Some(parts) = extract_signature(headers, query) else {
        return Err(auth_failed("missing X-XXT-TS/Nonce/Sign"));
    };
    let now = chrono::Utc::now().timestamp();
    if !app.auth.verify_http(now, parts.ts, &parts.nonce, &parts.sign, method, canonical_path, body) {
        return Err(auth_failed("invalid signature"));
    }
    Ok(())
}

//! HMAC-SHA256 request/message signing and verification for the hub.
//!
//! One `AuthSigner` is constructed at startup from the configured passhash
//! and shared (behind an `Arc`) across every HTTP handler and WebSocket
//! connection. Signing and verification share a single canonicalization
//! routine so that controllers, devices, and the hub itself always agree
//! on what bytes get hashed.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::sync::Arc;

type HmacSha256 = Hmac<Sha256>;

/// Allowed clock skew between the signer and the hub, in seconds.
pub const TIMESTAMP_WINDOW_SECS: i64 = 10;

#[derive(Debug, Clone)]
pub struct AuthSigner {
    passhash: Arc<[u8]>,
}

impl AuthSigner {
    /// `passhash` is already pre-hashed upstream; the signer does not hash
    /// it again, only uses it as the HMAC key.
    pub fn new(passhash: impl Into<Vec<u8>>) -> Self {
        Self {
            passhash: Arc::from(passhash.into().into_boxed_slice()),
        }
    }

    /// Builds the `|`-delimited canonical string signed or verified against.
    ///
    /// `method` carries the HTTP method for HTTP requests, or the message
    /// `type` for in-band frames (there is no separate "type" slot — the
    /// worked example `1700000000|n1|control/devices|{}` is exactly
    /// `ts|nonce|method|body` with `path`/`query` omitted).
    fn canonical_string(
        ts: i64,
        nonce: &str,
        method: &str,
        canonical_path: Option<&str>,
        query: Option<&str>,
        body: &[u8],
    ) -> Vec<u8> {
        let ts_str = ts.to_string();
        let mut parts: Vec<&[u8]> = vec![ts_str.as_bytes(), nonce.as_bytes(), method.as_bytes()];
        if let Some(path) = canonical_path {
            parts.push(path.as_bytes());
        }
        if let Some(q) = query {
            parts.push(q.as_bytes());
        }
        parts.push(body);
        parts.join(&b'|')
    }

    fn digest(&self, message: &[u8]) -> String {
        let mut mac = HmacSha256::new_from_slice(&self.passhash)
            .expect("HMAC accepts any key length");
        mac.update(message);
        hex::encode(mac.finalize().into_bytes())
    }

    /// `sign(method, canonical-path, body-bytes, ts, nonce) -> hex-digest`
    pub fn sign(
        &self,
        method: &str,
        canonical_path: &str,
        body: &[u8],
        ts: i64,
        nonce: &str,
    ) -> String {
        let (path, query) = split_path_query(canonical_path);
        let message = Self::canonical_string(ts, nonce, method, Some(path), query, body);
        self.digest(&message)
    }

    /// `verify-http(ts, nonce, sign, method, canonical-path, body-bytes) -> bool`
    #[allow(clippy::too_many_arguments)]
    pub fn verify_http(
        &self,
        now: i64,
        ts: i64,
        nonce: &str,
        sign: &str,
        method: &str,
        canonical_path: &str,
        body: &[u8],
    ) -> bool {
        if (now - ts).abs() > TIMESTAMP_WINDOW_SECS {
            return false;
        }
        let expected = self.sign(method, canonical_path, body, ts, nonce);
        constant_time_eq(expected.as_bytes(), sign.as_bytes())
    }

    /// `verify-message(ts, nonce, sign, body-json-canonical) -> bool`
    ///
    /// The message `type` string is folded into the `method` slot of the
    /// shared canonicalization, matching the worked example in the spec.
    pub fn verify_message(
        &self,
        now: i64,
        ts: i64,
        nonce: &str,
        sign: &str,
        msg_type: &str,
        body_canonical: &[u8],
    ) -> bool {
        if (now - ts).abs() > TIMESTAMP_WINDOW_SECS {
            return false;
        }
        let message = Self::canonical_string(ts, nonce, msg_type, None, None, body_canonical);
        let expected = self.digest(&message);
        constant_time_eq(expected.as_bytes(), sign.as_bytes())
    }
}

/// Splits a raw path into `(path, query)`, matching the "no normalization"
/// requirement — the path is used exactly as received, percent-encoding
/// intact.
fn split_path_query(raw: &str) -> (&str, Option<&str>) {
    match raw.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (raw, None),
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_and_verify_message_round_trip() {
        let signer = AuthSigner::new(b"test-passhash".to_vec());
        let body = b"{}";
        let sig = signer.sign("control/devices", "", body, 1_700_000_000, "n1");
        assert!(signer.verify_message(1_700_000_000, 1_700_000_000, "n1", &sig, "control/devices", body));
    }

    #[test]
    fn verify_message_rejects_outside_timestamp_window() {
        let signer = AuthSigner::new(b"test-passhash".to_vec());
        let body = b"{}";
        let sig = signer.sign("control/devices", "", body, 1_700_000_000, "n1");
        assert!(!signer.verify_message(1_700_000_030, 1_700_000_000, "n1", &sig, "control/devices", body));
    }

    #[test]
    fn verify_http_matches_method_path_and_body() {
        let signer = AuthSigner::new(b"test-passhash".to_vec());
        let body = b"{\"a\":1}";
        let sig = signer.sign("POST", "/transfer/create-token", body, 1_700_000_100, "abc");
        assert!(signer.verify_http(
            1_700_000_100,
            1_700_000_100,
            "abc",
            &sig,
            "POST",
            "/transfer/create-token",
            body
        ));
    }

    #[test]
    fn verify_http_rejects_tampered_body() {
        let signer = AuthSigner::new(b"test-passhash".to_vec());
        let sig = signer.sign("POST", "/transfer/create-token", b"{\"a\":1}", 1_700_000_100, "abc");
        assert!(!signer.verify_http(
            1_700_000_100,
            1_700_000_100,
            "abc",
            &sig,
            "POST",
            "/transfer/create-token",
            b"{\"a\":2}"
        ));
    }

    #[test]
    fn verify_http_includes_query_string_in_signature() {
        let signer = AuthSigner::new(b"test-passhash".to_vec());
        let body = b"";
        let sig_with_query = signer.sign("GET", "/foo?x=1", body, 1_700_000_000, "n1");
        assert!(!signer.verify_http(1_700_000_000, 1_700_000_000, "n1", &sig_with_query, "GET", "/foo", body));
        assert!(signer.verify_http(1_700_000_000, 1_700_000_000, "n1", &sig_with_query, "GET", "/foo?x=1", body));
    }

    #[test]
    fn fails_closed_on_digest_mismatch() {
        let signer = AuthSigner::new(b"test-passhash".to_vec());
        assert!(!signer.verify_message(1_700_000_000, 1_700_000_000, "n1", "deadbeef", "control/devices", b"{}"));
    }
}

//! HTTP-side signature extraction: `X-XXT-TS` / `X-XXT-Nonce` / `X-XXT-Sign`
//! headers, falling back to same-named query parameters. Header wins if
//! both are present.

use axum::http::HeaderMap;
use std::collections::HashMap;

#[derive(Debug, Clone)]
pub struct SignatureParts {
    pub ts: i64,
    pub nonce: String,
    pub sign: String,
}

/// Pulls `(ts, nonce, sign)` out of headers first, then the query string.
/// Returns `None` if any of the three fields is missing or `ts` doesn't
/// parse, matching the spec's fail-closed contract.
pub fn extract_signature(headers: &HeaderMap, query: &HashMap<String, String>) -> Option<SignatureParts> {
    let ts_raw = header_str(headers, "x-xxt-ts").or_else(|| query.get("X-XXT-TS").map(String::as_str))?;
    let nonce = header_str(headers, "x-xxt-nonce")
        .or_else(|| query.get("X-XXT-Nonce").map(String::as_str))?
        .to_owned();
    let sign = header_str(headers, "x-xxt-sign")
        .or_else(|| query.get("X-XXT-Sign").map(String::as_str))?
        .to_owned();
    let ts = ts_raw.parse().ok()?;
    Some(SignatureParts { ts, nonce, sign })
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefers_header_over_query_when_both_present() {
        let mut headers = HeaderMap::new();
        headers.insert("x-xxt-ts", "1700000000".parse().unwrap());
        headers.insert("x-xxt-nonce", "header-nonce".parse().unwrap());
        headers.insert("x-xxt-sign", "header-sign".parse().unwrap());

        let mut query = HashMap::new();
        query.insert("X-XXT-TS".to_string(), "1".to_string());
        query.insert("X-XXT-Nonce".to_string(), "query-nonce".to_string());
        query.insert("X-XXT-Sign".to_string(), "query-sign".to_string());

        let parts = extract_signature(&headers, &query).unwrap();
        assert_eq!(parts.ts, 1_700_000_000);
        assert_eq!(parts.nonce, "header-nonce");
        assert_eq!(parts.sign, "header-sign");
    }

    #[test]
    fn falls_back_to_query_when_headers_absent() {
        let headers = HeaderMap::new();
        let mut query = HashMap::new();
        query.insert("X-XXT-TS".to_string(), "1700000000".to_string());
        query.insert("X-XXT-Nonce".to_string(), "n1".to_string());
        query.insert("X-XXT-Sign".to_string(), "s1".to_string());

        let parts = extract_signature(&headers, &query).unwrap();
        assert_eq!(parts.nonce, "n1");
        assert_eq!(parts.sign, "s1");
    }

    #[test]
    fn missing_any_field_fails_closed() {
        let headers = HeaderMap::new();
        let mut query = HashMap::new();
        query.insert("X-XXT-TS".to_string(), "1700000000".to_string());
        query.insert("X-XXT-Nonce".to_string(), "n1".to_string());
        assert!(extract_signature(&headers, &query).is_none());
    }

    #[test]
    fn malformed_timestamp_fails_closed() {
        let headers = HeaderMap::new();
        let mut query = HashMap::new();
        query.insert("X-XXT-TS".to_string(), "not-a-number".to_string());
        query.insert("X-XXT-Nonce".to_string(), "n1".to_string());
        query.insert("X-XXT-Sign".to_string(), "s1".to_string());
        assert!(extract_signature(&headers, &query).is_none());
    }
}

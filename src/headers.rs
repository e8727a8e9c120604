//! Header filtering: the capture blocklist and forward-header construction,
//! per spec.md §4.2.

use axum::http::{HeaderMap, HeaderName, HeaderValue};
use std::collections::BTreeMap;
use std::str::FromStr;

/// Case-insensitive blocklist applied to headers before they are placed in a
/// capture. Exact set per spec.md §4.2 — do not extend casually, this is a
/// cross-tool contract.
const BLOCKLIST: &[&str] = &[
    "authorization",
    "x-api-key",
    "cookie",
    "set-cookie",
    "x-target-url",
    "proxy-authorization",
    "x-auth-token",
    "x-forwarded-authorization",
    "www-authenticate",
    "proxy-authenticate",
    "x-goog-api-key",
];

/// Returns only the header entries whose lowercased key is not in
/// [`BLOCKLIST`]. Multi-valued headers are dropped entirely, since the
/// capture schema stores headers as single scalar strings.
pub fn select_headers(headers: &HeaderMap) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    for name in headers.keys() {
        let lower = name.as_str().to_ascii_lowercase();
        if BLOCKLIST.contains(&lower.as_str()) {
            continue;
        }
        let mut values = headers.get_all(name).iter();
        let first = values.next();
        if values.next().is_some() {
            // more than one value for this header name; drop it.
            continue;
        }
        if let Some(value) = first {
            if let Ok(s) = value.to_str() {
                out.insert(lower, s.to_string());
            }
        }
    }
    out
}

/// Build the header map to send upstream from the incoming request headers:
/// strip `host`, `x-target-url`, `accept-encoding`, `transfer-encoding`; the
/// caller sets `host`/`content-length` afterward. If the body was mutated by
/// a plugin, the caller also strips `content-encoding` (not done here, since
/// this function doesn't know whether a mutation occurred).
pub fn build_forward_headers(incoming: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::new();
    for (name, value) in incoming.iter() {
        let lower = name.as_str().to_ascii_lowercase();
        if matches!(
            lower.as_str(),
            "host" | "x-target-url" | "accept-encoding" | "transfer-encoding"
        ) {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    out
}

pub fn set_header(headers: &mut HeaderMap, name: &str, value: &str) {
    if let (Ok(name), Ok(value)) = (HeaderName::from_str(name), HeaderValue::from_str(value)) {
        headers.insert(name, value);
    }
}

pub fn remove_header(headers: &mut HeaderMap, name: &str) {
    if let Ok(name) = HeaderName::from_str(name) {
        headers.remove(name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn select_headers_drops_blocklisted() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", "Bearer abc".parse().unwrap());
        headers.insert("x-api-key", "key".parse().unwrap());
        headers.insert("content-type", "application/json".parse().unwrap());
        let selected = select_headers(&headers);
        assert!(!selected.contains_key("authorization"));
        assert!(!selected.contains_key("x-api-key"));
        assert_eq!(selected.get("content-type").unwrap(), "application/json");
    }

    #[test]
    fn select_headers_is_case_insensitive() {
        let mut headers = HeaderMap::new();
        headers.insert("Authorization", "Bearer abc".parse().unwrap());
        let selected = select_headers(&headers);
        assert!(!selected.contains_key("authorization"));
    }

    #[test]
    fn select_headers_drops_multivalued() {
        let mut headers = HeaderMap::new();
        headers.append("x-custom", "a".parse().unwrap());
        headers.append("x-custom", "b".parse().unwrap());
        let selected = select_headers(&headers);
        assert!(!selected.contains_key("x-custom"));
    }

    #[test]
    fn build_forward_headers_strips_routing_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("host", "localhost".parse().unwrap());
        headers.insert("x-target-url", "http://x".parse().unwrap());
        headers.insert("accept-encoding", "gzip".parse().unwrap());
        headers.insert("transfer-encoding", "chunked".parse().unwrap());
        headers.insert("authorization", "Bearer abc".parse().unwrap());
        let forward = build_forward_headers(&headers);
        assert!(forward.get("host").is_none());
        assert!(forward.get("x-target-url").is_none());
        assert!(forward.get("accept-encoding").is_none());
        assert!(forward.get("transfer-encoding").is_none());
        assert!(forward.get("authorization").is_some());
    }
}

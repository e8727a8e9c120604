//! Request classification: provider/API-format detection, source-tag and
//! session-id extraction, and upstream URL resolution. All operations here
//! are pure, total functions — no I/O, no failure modes.

use crate::config::Upstreams;
use axum::http::HeaderMap;
use once_cell::sync::Lazy;
use regex::Regex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    Anthropic,
    Openai,
    Chatgpt,
    Gemini,
    Unknown,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Anthropic => "anthropic",
            Provider::Openai => "openai",
            Provider::Chatgpt => "chatgpt",
            Provider::Gemini => "gemini",
            Provider::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiFormat {
    AnthropicMessages,
    ChatgptBackend,
    Responses,
    ChatCompletions,
    Gemini,
    Raw,
    Unknown,
}

impl ApiFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApiFormat::AnthropicMessages => "anthropic-messages",
            ApiFormat::ChatgptBackend => "chatgpt-backend",
            ApiFormat::Responses => "responses",
            ApiFormat::ChatCompletions => "chat-completions",
            ApiFormat::Gemini => "gemini",
            ApiFormat::Raw => "raw",
            ApiFormat::Unknown => "unknown",
        }
    }
}

static CHATGPT_BACKEND_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^/(api|backend-api)/").unwrap());
static GEMINI_MODELS_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"/v1(beta|alpha)/models/").unwrap());
static MODELS_EMBEDDINGS_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"/(models|embeddings)").unwrap());
static SESSION_ID_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-f0-9]{8}$").unwrap());

const RESERVED_SOURCE_TAGS: &[&str] = &[
    "v1",
    "v1beta",
    "v1alpha",
    "v1internal",
    "responses",
    "chat",
    "models",
    "embeddings",
    "backend-api",
    "api",
];

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Classify `(path, headers)` into `(provider, api_format)`. First matching
/// rule wins.
pub fn classify(path: &str, headers: &HeaderMap) -> (Provider, ApiFormat) {
    if CHATGPT_BACKEND_RE.is_match(path) {
        return (Provider::Chatgpt, ApiFormat::ChatgptBackend);
    }
    if path.contains("/v1/messages") {
        return (Provider::Anthropic, ApiFormat::AnthropicMessages);
    }
    if path.contains("/v1/complete") {
        return (Provider::Anthropic, ApiFormat::Unknown);
    }
    if header_str(headers, "anthropic-version").is_some() {
        return (Provider::Anthropic, ApiFormat::Unknown);
    }
    if path.contains(":generateContent")
        || path.contains(":streamGenerateContent")
        || GEMINI_MODELS_RE.is_match(path)
        || path.contains("/v1internal:")
        || header_str(headers, "x-goog-api-key").is_some()
    {
        return (Provider::Gemini, ApiFormat::Gemini);
    }
    if path.contains("/responses") {
        return (Provider::Openai, ApiFormat::Responses);
    }
    if path.contains("/chat/completions") {
        return (Provider::Openai, ApiFormat::ChatCompletions);
    }
    if MODELS_EMBEDDINGS_RE.is_match(path) {
        return (Provider::Openai, ApiFormat::Unknown);
    }
    if header_str(headers, "authorization")
        .map(|v| v.starts_with("Bearer sk-"))
        .unwrap_or(false)
    {
        return (Provider::Openai, ApiFormat::Unknown);
    }
    (Provider::Unknown, ApiFormat::Unknown)
}

/// Result of extracting a source tag and session id from a raw request path.
pub struct ExtractedSource {
    pub source: Option<String>,
    pub session_id: Option<String>,
    pub clean_path: String,
}

/// Percent-decode a single path segment. Returns `None` if decoding is not
/// valid UTF-8.
fn percent_decode_segment(segment: &str) -> Option<String> {
    let mut out = Vec::with_capacity(segment.len());
    let bytes = segment.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).ok()?;
            if let Ok(byte) = u8::from_str_radix(hex, 16) {
                out.push(byte);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8(out).ok()
}

/// Percent-encode a decoded tag the same way a conforming client would, for
/// the roundtrip canonicalization check below. Only encodes the sentinel
/// characters we actually care about; this is not a general URL encoder.
fn percent_reencode(tag: &str) -> String {
    let mut out = String::with_capacity(tag.len());
    for b in tag.bytes() {
        match b {
            b'/' => out.push_str("%2F"),
            b'\\' => out.push_str("%5C"),
            b'.' => out.push('.'),
            _ => out.push(b as char),
        }
    }
    out
}

/// `extractSource(path) -> { source, sessionId, cleanPath }` per spec.md §4.1.
///
/// The first path segment is a source tag unless it's one of the reserved
/// API prefixes. It is URL-decoded; if decoding yields a path-traversal
/// sentinel (`/`, `\`, `..`), or if re-encoding the decoded tag does not
/// round-trip to the original segment (hardening against nested percent
/// encoding), the path is returned unchanged with no tag.
pub fn extract_source(path: &str) -> ExtractedSource {
    let trimmed = path.trim_start_matches('/');
    let mut segments: Vec<&str> = trimmed.splitn(3, '/').collect();
    if segments.is_empty() || segments[0].is_empty() {
        return ExtractedSource {
            source: None,
            session_id: None,
            clean_path: path.to_string(),
        };
    }

    let first = segments[0];
    if RESERVED_SOURCE_TAGS.contains(&first) {
        return ExtractedSource {
            source: None,
            session_id: None,
            clean_path: path.to_string(),
        };
    }

    let decoded = match percent_decode_segment(first) {
        Some(d) => d,
        None => {
            return ExtractedSource {
                source: None,
                session_id: None,
                clean_path: path.to_string(),
            };
        }
    };

    if decoded.contains('/') || decoded.contains('\\') || decoded.contains("..") {
        return ExtractedSource {
            source: None,
            session_id: None,
            clean_path: path.to_string(),
        };
    }

    if percent_reencode(&decoded) != percent_reencode(first) && first.contains('%') {
        // The segment round-trips to a different canonical form than what we
        // decoded once — treat as a rejected tag rather than trust a nested
        // encoding.
        let redecoded = percent_decode_segment(&decoded);
        if redecoded.as_deref() != Some(decoded.as_str()) {
            return ExtractedSource {
                source: None,
                session_id: None,
                clean_path: path.to_string(),
            };
        }
    }

    // Remaining segments after the source tag.
    let rest: Vec<&str> = if segments.len() > 1 {
        segments.drain(1..).collect()
    } else {
        Vec::new()
    };

    let (session_id, remainder) = if let Some(second) = rest.first() {
        if SESSION_ID_RE.is_match(second) {
            (Some(second.to_string()), rest.get(1..).unwrap_or(&[]).join("/"))
        } else {
            (None, rest.join("/"))
        }
    } else {
        (None, String::new())
    };

    let clean_path = if remainder.is_empty() {
        "/".to_string()
    } else {
        format!("/{remainder}")
    };

    ExtractedSource {
        source: Some(decoded),
        session_id,
        clean_path,
    }
}

pub struct ResolvedTarget {
    pub url: String,
    pub provider: Provider,
}

/// `resolveTargetUrl(path, query, headers, upstreams) -> { url, provider }`.
///
/// `path` here is the already-cleaned path (post `extract_source`).
/// `headers` is inspected only for `x-target-url`; callers are responsible
/// for the loopback+config gate in spec.md §4.7 step 2 before this is
/// trusted.
pub fn resolve_target_url(
    path: &str,
    query: Option<&str>,
    headers: &HeaderMap,
    upstreams: &Upstreams,
) -> ResolvedTarget {
    let query_suffix = query.map(|q| format!("?{q}")).unwrap_or_default();

    if let Some(target_url) = header_str(headers, "x-target-url") {
        if target_url.starts_with("http") {
            return ResolvedTarget {
                url: target_url.to_string(),
                provider: classify(path, headers).0,
            };
        }
        return ResolvedTarget {
            url: format!("{target_url}{path}{query_suffix}"),
            provider: classify(path, headers).0,
        };
    }

    let (provider, _) = classify(path, headers);
    let base = match provider {
        Provider::Anthropic => &upstreams.anthropic,
        Provider::Openai => &upstreams.openai,
        Provider::Chatgpt => &upstreams.chatgpt,
        Provider::Gemini => {
            if path.contains("/v1internal") {
                &upstreams.gemini_code_assist
            } else {
                &upstreams.gemini
            }
        }
        Provider::Unknown => &upstreams.openai,
    };

    ResolvedTarget {
        url: format!("{base}{path}{query_suffix}"),
        provider,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers() -> HeaderMap {
        HeaderMap::new()
    }

    #[test]
    fn classifies_chatgpt_backend() {
        let (p, f) = classify("/backend-api/conversation", &headers());
        assert_eq!(p, Provider::Chatgpt);
        assert_eq!(f, ApiFormat::ChatgptBackend);
    }

    #[test]
    fn classifies_anthropic_messages() {
        let (p, f) = classify("/v1/messages", &headers());
        assert_eq!(p, Provider::Anthropic);
        assert_eq!(f, ApiFormat::AnthropicMessages);
    }

    #[test]
    fn classifies_anthropic_complete() {
        let (p, f) = classify("/v1/complete", &headers());
        assert_eq!(p, Provider::Anthropic);
        assert_eq!(f, ApiFormat::Unknown);
    }

    #[test]
    fn classifies_via_anthropic_version_header() {
        let mut h = headers();
        h.insert("anthropic-version", "2023-06-01".parse().unwrap());
        let (p, _) = classify("/some/path", &h);
        assert_eq!(p, Provider::Anthropic);
    }

    #[test]
    fn classifies_gemini_generate_content() {
        let (p, f) = classify("/v1beta/models/gemini-pro:generateContent", &headers());
        assert_eq!(p, Provider::Gemini);
        assert_eq!(f, ApiFormat::Gemini);
    }

    #[test]
    fn classifies_gemini_via_header() {
        let mut h = headers();
        h.insert("x-goog-api-key", "abc".parse().unwrap());
        let (p, f) = classify("/anything", &h);
        assert_eq!(p, Provider::Gemini);
        assert_eq!(f, ApiFormat::Gemini);
    }

    #[test]
    fn classifies_openai_responses_and_chat() {
        assert_eq!(classify("/v1/responses", &headers()).1, ApiFormat::Responses);
        assert_eq!(
            classify("/v1/chat/completions", &headers()).1,
            ApiFormat::ChatCompletions
        );
    }

    #[test]
    fn classifies_openai_models_path() {
        let (p, f) = classify("/v1/models", &headers());
        assert_eq!(p, Provider::Openai);
        assert_eq!(f, ApiFormat::Unknown);
    }

    #[test]
    fn classifies_openai_via_bearer_sk() {
        let mut h = headers();
        h.insert("authorization", "Bearer sk-abc123".parse().unwrap());
        let (p, _) = classify("/unmatched", &h);
        assert_eq!(p, Provider::Openai);
    }

    #[test]
    fn classifies_unknown_fallback() {
        let (p, f) = classify("/nothing/here", &headers());
        assert_eq!(p, Provider::Unknown);
        assert_eq!(f, ApiFormat::Unknown);
    }

    #[test]
    fn extract_source_reserved_prefix_untouched() {
        let out = extract_source("/v1/messages");
        assert!(out.source.is_none());
        assert!(out.session_id.is_none());
        assert_eq!(out.clean_path, "/v1/messages");
    }

    #[test]
    fn extract_source_plain_tag() {
        let out = extract_source("/claude/v1/messages");
        assert_eq!(out.source.as_deref(), Some("claude"));
        assert!(out.session_id.is_none());
        assert_eq!(out.clean_path, "/v1/messages");
    }

    #[test]
    fn extract_source_with_session() {
        let out = extract_source("/claude/aabb0011/v1/messages");
        assert_eq!(out.source.as_deref(), Some("claude"));
        assert_eq!(out.session_id.as_deref(), Some("aabb0011"));
        assert_eq!(out.clean_path, "/v1/messages");
    }

    #[test]
    fn extract_source_rejects_traversal_tag() {
        let out = extract_source("/..%2f/v1/messages");
        assert!(out.source.is_none());
        assert_eq!(out.clean_path, "/..%2f/v1/messages");
    }

    #[test]
    fn extract_source_no_segments_becomes_root() {
        let out = extract_source("/claude");
        assert_eq!(out.source.as_deref(), Some("claude"));
        assert_eq!(out.clean_path, "/");
    }

    #[test]
    fn resolve_target_url_picks_base_by_provider() {
        let upstreams = Upstreams::default();
        let resolved = resolve_target_url("/v1/messages", None, &headers(), &upstreams);
        assert!(resolved.url.starts_with(&upstreams.anthropic));
    }

    #[test]
    fn resolve_target_url_gemini_code_assist_exception() {
        let upstreams = Upstreams::default();
        let resolved = resolve_target_url(
            "/v1internal:generateContent",
            None,
            &headers(),
            &upstreams,
        );
        assert!(resolved.url.starts_with(&upstreams.gemini_code_assist));
    }

    #[test]
    fn resolve_target_url_honors_absolute_x_target_url() {
        let upstreams = Upstreams::default();
        let mut h = headers();
        h.insert("x-target-url", "http://localhost:9999".parse().unwrap());
        let resolved = resolve_target_url("/v1/messages", None, &h, &upstreams);
        assert_eq!(resolved.url, "http://localhost:9999");
    }

    #[test]
    fn resolve_target_url_appends_query() {
        let upstreams = Upstreams::default();
        let resolved =
            resolve_target_url("/v1/models", Some("limit=10"), &headers(), &upstreams);
        assert!(resolved.url.ends_with("/v1/models?limit=10"));
    }
}

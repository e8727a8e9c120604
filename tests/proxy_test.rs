//! Integration tests driving the assembled axum app directly (no TCP
//! listener), against a `wiremock` upstream standing in for the real
//! provider. Mirrors the seed scenarios in spec.md §8.

use apex_redact_proxy::config::{Config, Preset};
use apex_redact_proxy::server::{build_app, build_state};
use axum::body::Body;
use axum::extract::connect_info::ConnectInfo;
use axum::http::{Request, StatusCode};
use std::net::SocketAddr;
use tower::ServiceExt;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn loopback() -> SocketAddr {
    "127.0.0.1:51000".parse().unwrap()
}

fn config_for(upstream: &MockServer) -> Config {
    let mut config = Config::default();
    config.upstreams.anthropic = upstream.uri();
    config.redact.preset = Preset::Pii;
    config.redact.reversible = true;
    config
}

async fn send(app: axum::Router, req: Request<Body>) -> axum::response::Response {
    let mut req = req;
    req.extensions_mut().insert(ConnectInfo(loopback()));
    app.oneshot(req).await.unwrap()
}

#[tokio::test]
async fn s1_request_body_is_redacted_before_forwarding() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"ok": true})))
        .mount(&upstream)
        .await;

    let config = config_for(&upstream);
    let state = build_state(config).unwrap();
    let app = build_app(state);

    let body = serde_json::json!({
        "model": "claude-3",
        "messages": [{"role": "user", "content": "email me at john@example.com"}]
    });
    let req = Request::builder()
        .method("POST")
        .uri("/v1/messages")
        .header("content-type", "application/json")
        .header("anthropic-version", "2023-06-01")
        .body(Body::from(serde_json::to_vec(&body).unwrap()))
        .unwrap();

    let response = send(app, req).await;
    assert_eq!(response.status(), StatusCode::OK);

    let received = upstream.received_requests().await.unwrap();
    assert_eq!(received.len(), 1);
    let forwarded: serde_json::Value = serde_json::from_slice(&received[0].body).unwrap();
    let content = forwarded["messages"][0]["content"].as_str().unwrap();
    assert!(content.contains("[EMAIL_1]"));
    assert!(!content.contains("john@example.com"));
}

#[tokio::test]
async fn s3_non_post_requests_pass_through_without_redaction() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/models"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"object": "list", "data": []})))
        .mount(&upstream)
        .await;

    let config = config_for(&upstream);
    let state = build_state(config).unwrap();
    let app = build_app(state);

    let req = Request::builder()
        .method("GET")
        .uri("/v1/models")
        .body(Body::empty())
        .unwrap();

    let response = send(app, req).await;
    assert_eq!(response.status(), StatusCode::OK);

    let received = upstream.received_requests().await.unwrap();
    assert_eq!(received.len(), 1);
}

#[tokio::test]
async fn s4_gzip_compressed_request_body_is_decompressed_then_redacted() {
    use async_compression::tokio::write::GzipEncoder;
    use tokio::io::AsyncWriteExt;

    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"ok": true})))
        .mount(&upstream)
        .await;

    let config = config_for(&upstream);
    let state = build_state(config).unwrap();
    let app = build_app(state);

    let body = serde_json::json!({
        "messages": [{"role": "user", "content": "ssn 123-45-6789 for my record"}]
    });
    let plain = serde_json::to_vec(&body).unwrap();
    let mut encoder = GzipEncoder::new(Vec::new());
    encoder.write_all(&plain).await.unwrap();
    encoder.shutdown().await.unwrap();
    let compressed = encoder.into_inner();

    let req = Request::builder()
        .method("POST")
        .uri("/v1/messages")
        .header("content-type", "application/json")
        .header("content-encoding", "gzip")
        .header("anthropic-version", "2023-06-01")
        .body(Body::from(compressed))
        .unwrap();

    let response = send(app, req).await;
    assert_eq!(response.status(), StatusCode::OK);

    let received = upstream.received_requests().await.unwrap();
    assert_eq!(received.len(), 1);
    assert!(received[0].headers.get("content-encoding").is_none());
    let forwarded: serde_json::Value = serde_json::from_slice(&received[0].body).unwrap();
    let content = forwarded["messages"][0]["content"].as_str().unwrap();
    assert!(content.contains("[SSN_1]"));
}

#[tokio::test]
async fn s6_capture_file_is_written_per_request() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"ok": true})))
        .mount(&upstream)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let mut config = config_for(&upstream);
    config.logger.capture_dir = dir.path().to_string_lossy().to_string();
    let state = build_state(config).unwrap();
    let app = build_app(state);

    let body = serde_json::json!({"messages": [{"role": "user", "content": "hi"}]});
    let req = Request::builder()
        .method("POST")
        .uri("/claude/aabb0011/v1/messages")
        .header("content-type", "application/json")
        .header("anthropic-version", "2023-06-01")
        .body(Body::from(serde_json::to_vec(&body).unwrap()))
        .unwrap();

    let response = send(app, req).await;
    assert_eq!(response.status(), StatusCode::OK);

    let files: Vec<_> = std::fs::read_dir(dir.path())
        .unwrap()
        .flatten()
        .map(|e| e.file_name().to_string_lossy().to_string())
        .collect();
    assert!(files.iter().any(|f| f.starts_with("claude_aabb0011_")));
}

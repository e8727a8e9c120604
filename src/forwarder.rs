//! The HTTP forwarder: the request lifecycle described in spec.md §4.7.
//! Buffers and decompresses POST bodies, runs the plugin pipeline, forwards
//! to the resolved upstream, and streams-or-buffers the response back to
//! the client while building a capture record.

use crate::capture::{CaptureData, Timings};
use crate::headers::{build_forward_headers, select_headers, set_header};
use crate::plugin::{
    run_on_capture, run_on_request, run_on_response, run_on_stream_chunk, run_on_stream_end,
    HookPresence, Plugin, RequestContext, ResponseContext,
};
use crate::router::{classify, extract_source, resolve_target_url, ApiFormat, Provider};
use crate::server::AppState;
use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::{HeaderMap, Method, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use futures::StreamExt;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::oneshot;

fn is_loopback(headers: &HeaderMap, remote_ip: Option<std::net::IpAddr>) -> bool {
    let _ = headers;
    remote_ip.map(|ip| ip.is_loopback()).unwrap_or(false)
}

fn error_response(status: StatusCode, message: &str) -> Response {
    let body = serde_json::json!({ "error": "Proxy error", "details": message });
    (status, axum::Json(body)).into_response()
}

pub async fn handle(
    State(state): State<Arc<AppState>>,
    axum::extract::ConnectInfo(remote_addr): axum::extract::ConnectInfo<std::net::SocketAddr>,
    req: Request<Body>,
) -> Response {
    let method = req.method().clone();
    let uri = req.uri().clone();
    let raw_path = uri.path().to_string();
    let query = uri.query().map(|q| q.to_string());
    let mut headers = req.headers().clone();

    let extracted = extract_source(&raw_path);
    let span = tracing::info_span!(
        "request",
        method = %method,
        path = %extracted.clean_path,
        source = extracted.source.as_deref().unwrap_or(""),
        session_id = extracted.session_id.as_deref().unwrap_or(""),
    );
    let _enter = span.enter();

    // spec.md §4.7 step 2: only honor x-target-url from loopback callers
    // when explicitly enabled, else drop it before routing.
    let allow_override = state.config_allow_target_override();
    if headers.get("x-target-url").is_some()
        && !(allow_override && is_loopback(&headers, Some(remote_addr.ip())))
    {
        headers.remove("x-target-url");
    }

    let resolved = resolve_target_url(
        &extracted.clean_path,
        query.as_deref(),
        &headers,
        &state.config.upstreams,
    );
    let (_, api_format) = classify(&extracted.clean_path, &headers);

    if resolved.provider == crate::router::Provider::Unknown {
        state
            .metrics
            .classification_miss_total
            .with_label_values(&[method.as_str()])
            .inc();
    }
    state
        .metrics
        .request_total
        .with_label_values(&[resolved.provider.as_str(), method.as_str()])
        .inc();

    if method != Method::POST {
        return forward_passthrough(&state, req, &resolved.url, &headers).await;
    }

    forward_post(
        &state,
        req,
        &resolved.url,
        resolved.provider,
        api_format,
        extracted.source,
        extracted.session_id,
        extracted.clean_path,
        method,
        headers,
    )
    .await
}

/// Non-POST: forward-and-pipe, no plugins, no capture.
async fn forward_passthrough(
    state: &Arc<AppState>,
    req: Request<Body>,
    target_url: &str,
    incoming_headers: &HeaderMap,
) -> Response {
    let method = req.method().clone();
    let body_bytes = match axum::body::to_bytes(req.into_body(), usize::MAX).await {
        Ok(b) => b,
        Err(err) => return error_response(StatusCode::BAD_GATEWAY, &err.to_string()),
    };

    let mut forward_headers = build_forward_headers(incoming_headers);
    if let Ok(url) = url::Url::parse(target_url) {
        if let Some(host) = url.host_str() {
            set_header(&mut forward_headers, "host", host);
        }
    }

    let reqwest_method = reqwest::Method::from_bytes(method.as_str().as_bytes())
        .unwrap_or(reqwest::Method::GET);
    let mut builder = state.client.request(reqwest_method, target_url);
    for (name, value) in forward_headers.iter() {
        if let Ok(v) = value.to_str() {
            builder = builder.header(name.as_str(), v);
        }
    }
    if !body_bytes.is_empty() {
        builder = builder.body(body_bytes.to_vec());
    }

    match builder.send().await {
        Ok(upstream) => upstream_to_response(upstream).await,
        Err(err) => error_response(StatusCode::BAD_GATEWAY, &err.to_string()),
    }
}

async fn upstream_to_response(upstream: reqwest::Response) -> Response {
    let status = StatusCode::from_u16(upstream.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
    let mut response_headers = HeaderMap::new();
    for (name, value) in upstream.headers() {
        if let (Ok(n), Ok(v)) = (
            axum::http::HeaderName::from_bytes(name.as_str().as_bytes()),
            axum::http::HeaderValue::from_bytes(value.as_bytes()),
        ) {
            response_headers.append(n, v);
        }
    }
    let stream = upstream.bytes_stream();
    let body = Body::from_stream(stream);
    let mut response = Response::new(body);
    *response.status_mut() = status;
    *response.headers_mut() = response_headers;
    response
}

#[allow(clippy::too_many_arguments)]
async fn forward_post(
    state: &Arc<AppState>,
    req: Request<Body>,
    target_url: &str,
    provider: crate::router::Provider,
    api_format: crate::router::ApiFormat,
    source: Option<String>,
    session_id: Option<String>,
    clean_path: String,
    method: Method,
    incoming_headers: HeaderMap,
) -> Response {
    let t0 = Instant::now();

    let raw_body = match axum::body::to_bytes(req.into_body(), 64 * 1024 * 1024).await {
        Ok(b) => b,
        Err(err) => return error_response(StatusCode::BAD_GATEWAY, &err.to_string()),
    };

    let content_encoding = incoming_headers
        .get("content-encoding")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string());
    let decompressed = crate::decompress::decompress_request_body(
        &raw_body,
        content_encoding.as_deref(),
    )
    .await;

    let body_text = String::from_utf8_lossy(&decompressed).to_string();
    let parsed_body: Option<serde_json::Value> = serde_json::from_str(&body_text).ok();

    let ctx = RequestContext {
        provider,
        api_format,
        clean_path: clean_path.clone(),
        source: source.clone(),
        session_id: session_id.clone(),
        headers: incoming_headers.clone(),
        body: parsed_body.clone(),
        raw_body: decompressed.clone(),
    };

    let presence = state.hook_presence();
    let after_request = if presence.has_request {
        run_on_request(&state.plugins, ctx, &state.metrics)
    } else {
        ctx
    };

    let body_mutated = after_request.body != parsed_body;
    let (forward_bytes, strip_content_encoding) = if body_mutated {
        match &after_request.body {
            Some(v) => (
                Bytes::from(serde_json::to_vec(v).unwrap_or_default()),
                true,
            ),
            None => (decompressed.clone(), false),
        }
    } else {
        (raw_body.clone(), false)
    };

    let mut forward_headers = build_forward_headers(&incoming_headers);
    if strip_content_encoding {
        forward_headers.remove("content-encoding");
    }
    if let Ok(url) = url::Url::parse(target_url) {
        if let Some(host) = url.host_str() {
            set_header(&mut forward_headers, "host", host);
        }
    }
    set_header(
        &mut forward_headers,
        "content-length",
        &forward_bytes.len().to_string(),
    );

    let reqwest_method =
        reqwest::Method::from_bytes(method.as_str().as_bytes()).unwrap_or(reqwest::Method::POST);
    let mut builder = state.client.request(reqwest_method, target_url);
    for (name, value) in forward_headers.iter() {
        if let Ok(v) = value.to_str() {
            builder = builder.header(name.as_str(), v);
        }
    }
    builder = builder.body(forward_bytes.to_vec());

    let t_request_sent = Instant::now();

    let upstream = match builder.send().await {
        Ok(resp) => resp,
        Err(err) => {
            return error_response(StatusCode::BAD_GATEWAY, &err.to_string());
        }
    };

    let t_first_byte = Instant::now();
    let status = upstream.status().as_u16();
    let upstream_headers = upstream.headers().clone();
    let is_streaming = upstream_headers
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.contains("text/event-stream"))
        .unwrap_or(false);

    let should_buffer = presence.has_response && !is_streaming;

    let finalize_args = FinalizeArgs {
        provider,
        api_format,
        source,
        clean_path,
        method: method.to_string(),
        session_id: session_id.clone(),
        request_headers: select_headers(&incoming_headers),
        request_body: after_request.body,
        request_bytes: raw_body.len(),
        target_url: target_url.to_string(),
        status,
        response_headers: select_headers(&axum_headers_from_reqwest(&upstream_headers)),
        response_is_streaming: is_streaming,
        t0,
        t_request_sent,
        t_first_byte,
    };

    // Non-streaming path: the full response body (and any onResponse
    // mutation) is already in hand, so the capture is built and written
    // before this function returns — `t_end` reflects real completion.
    //
    // Streaming path: the response is handed back to axum immediately so
    // bytes reach the client as they arrive; the capture can only be
    // built once the body stream has actually finished draining, which
    // happens after this function returns. A oneshot channel signals that
    // moment to a detached task that finalizes the capture with the real
    // completion time, per spec.md §3's "created at response end" capture
    // lifecycle.
    if should_buffer {
        let (client_response, response_body_for_capture, response_bytes) = build_buffered_response(
            state,
            upstream,
            status,
            &upstream_headers,
            session_id.clone(),
            presence,
        )
        .await;
        let t_end = Instant::now();
        finalize_capture(
            state.clone(),
            finalize_args,
            response_body_for_capture,
            response_bytes,
            t_end,
        );
        client_response
    } else {
        let (client_response, completion_rx) =
            build_streamed_response(state, upstream, status, &upstream_headers, session_id, presence);
        let state = state.clone();
        tokio::spawn(async move {
            let (response_body_for_capture, response_bytes) =
                completion_rx.await.unwrap_or_default();
            let t_end = Instant::now();
            finalize_capture(state, finalize_args, response_body_for_capture, response_bytes, t_end);
        });
        client_response
    }
}

/// Everything `finalize_capture` needs that is known before the response
/// body has finished being produced. Kept as a single struct so it can be
/// moved wholesale into a detached `tokio::spawn` task for the streaming
/// path.
struct FinalizeArgs {
    provider: Provider,
    api_format: ApiFormat,
    source: Option<String>,
    clean_path: String,
    method: String,
    session_id: Option<String>,
    request_headers: BTreeMap<String, String>,
    request_body: Option<serde_json::Value>,
    request_bytes: usize,
    target_url: String,
    status: u16,
    response_headers: BTreeMap<String, String>,
    response_is_streaming: bool,
    t0: Instant,
    t_request_sent: Instant,
    t_first_byte: Instant,
}

/// Computes timings, builds the `CaptureData`, writes it, and fires
/// `onCapture` for every plugin. `t_end` must reflect when the response
/// body actually finished being produced (spec.md §4.7 step 10).
fn finalize_capture(
    state: Arc<AppState>,
    args: FinalizeArgs,
    response_body: String,
    response_bytes: usize,
    t_end: Instant,
) {
    let send_ms = args
        .t_request_sent
        .saturating_duration_since(args.t0)
        .as_millis() as u64;
    let wait_ms = args
        .t_first_byte
        .saturating_duration_since(args.t_request_sent)
        .as_millis() as u64;
    let receive_ms = t_end.saturating_duration_since(args.t_first_byte).as_millis() as u64;
    let total_ms = t_end.saturating_duration_since(args.t0).as_millis() as u64;

    state
        .metrics
        .total_latency_ms
        .with_label_values(&[
            args.provider.as_str(),
            if args.response_is_streaming { "true" } else { "false" },
        ])
        .observe(total_ms as f64);

    let capture = CaptureData {
        timestamp: chrono::Utc::now().to_rfc3339(),
        session_id: args.session_id,
        method: args.method,
        path: args.clean_path,
        source: args.source,
        provider: args.provider.as_str().to_string(),
        api_format: args.api_format.as_str().to_string(),
        target_url: args.target_url,
        request_headers: args.request_headers,
        request_body: args.request_body,
        request_bytes: args.request_bytes,
        response_status: args.status,
        response_headers: args.response_headers,
        response_body,
        response_is_streaming: args.response_is_streaming,
        response_bytes,
        timings: Timings {
            send_ms,
            wait_ms,
            receive_ms,
            total_ms,
        },
    };

    let wall_ms = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    state.capture_logger.write(&capture, wall_ms);
    state
        .metrics
        .capture_write_total
        .with_label_values(&["ok"])
        .inc();

    if state.hook_presence().has_capture {
        let plugins = state.plugins.clone_handles();
        run_on_capture(&plugins, &capture);
    }
}

async fn build_buffered_response(
    state: &Arc<AppState>,
    upstream: reqwest::Response,
    status: u16,
    upstream_headers: &reqwest::header::HeaderMap,
    session_id: Option<String>,
    presence: HookPresence,
) -> (Response, String, usize) {
    let body_bytes = upstream.bytes().await.unwrap_or_default();
    let body_string = String::from_utf8_lossy(&body_bytes).to_string();

    let ctx = ResponseContext {
        status,
        headers: axum_headers_from_reqwest(upstream_headers),
        body: body_string.clone(),
        streaming: false,
        session_id,
    };

    let after_response = if presence.has_response {
        run_on_response(&state.plugins, ctx, &state.metrics)
    } else {
        ctx
    };

    let final_body = after_response.body;
    let mut response_headers = axum_headers_from_reqwest(upstream_headers);
    response_headers.remove("transfer-encoding");
    set_header(&mut response_headers, "content-length", &final_body.len().to_string());

    let mut response = Response::new(Body::from(final_body.clone()));
    *response.status_mut() = StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY);
    *response.headers_mut() = response_headers;

    let len = final_body.len();
    (response, final_body, len)
}

/// Builds the response axum streams to the client chunk-by-chunk, and a
/// receiver that resolves with `(captured_body_text, captured_byte_count)`
/// once the underlying body stream has fully drained — i.e. once the last
/// byte has actually been produced for the client, not when this function
/// returns (streaming responses are handed to axum before they're
/// complete, by construction).
///
/// A detached task owns the upstream byte stream end-to-end: it runs each
/// chunk through the stream-plugin chain, forwards the result to the
/// client over an mpsc channel, and — once the upstream stream ends (or
/// the client disconnects, dropping the channel's receiver) — invokes
/// `onStreamEnd` and reports the fully captured body. Driving completion
/// through channel closure rather than an in-band sentinel value avoids
/// ever emitting a synthetic zero-length chunk into the client's
/// chunked-transfer body.
fn build_streamed_response(
    state: &Arc<AppState>,
    upstream: reqwest::Response,
    status: u16,
    upstream_headers: &reqwest::header::HeaderMap,
    session_id: Option<String>,
    presence: HookPresence,
) -> (Response, oneshot::Receiver<(String, usize)>) {
    let response_headers = axum_headers_from_reqwest(upstream_headers);
    let plugins = state.plugins.clone_handles();
    let metrics = state.metrics.clone();
    let has_stream_hooks = presence.has_stream;

    let (tx, rx) = tokio::sync::mpsc::channel::<Result<Bytes, std::io::Error>>(32);
    let (done_tx, done_rx) = oneshot::channel::<(String, usize)>();

    tokio::spawn(async move {
        let mut upstream_stream = upstream.bytes_stream();
        let mut captured = Vec::new();
        let mut client_gone = false;

        while let Some(chunk_result) = upstream_stream.next().await {
            let chunk = match chunk_result {
                Ok(c) => c.to_vec(),
                Err(_) => continue,
            };
            let processed = if has_stream_hooks {
                run_on_stream_chunk(&plugins, chunk, session_id.as_deref(), &metrics)
            } else {
                chunk
            };
            captured.extend_from_slice(&processed);
            if !client_gone && tx.send(Ok(Bytes::from(processed))).await.is_err() {
                // Client disconnected: stop writing, but keep draining so the
                // capture still reflects everything the upstream sent, per
                // spec.md §7's "capture still fires with whatever data was
                // received" clause.
                client_gone = true;
            }
        }

        if has_stream_hooks {
            let tail = run_on_stream_end(&plugins, session_id.as_deref(), &metrics);
            if !tail.is_empty() {
                captured.extend_from_slice(&tail);
                if !client_gone {
                    let _ = tx.send(Ok(Bytes::from(tail))).await;
                }
            }
        }

        let text = String::from_utf8_lossy(&captured).to_string();
        let len = captured.len();
        let _ = done_tx.send((text, len));
    });

    let body = Body::from_stream(tokio_stream::wrappers::ReceiverStream::new(rx));

    let mut response = Response::new(body);
    *response.status_mut() = StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY);
    *response.headers_mut() = response_headers;

    (response, done_rx)
}

fn axum_headers_from_reqwest(headers: &reqwest::header::HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::new();
    for (name, value) in headers {
        if let (Ok(n), Ok(v)) = (
            axum::http::HeaderName::from_bytes(name.as_str().as_bytes()),
            axum::http::HeaderValue::from_bytes(value.as_bytes()),
        ) {
            out.append(n, v);
        }
    }
    out
}

/// A cloneable handle to the plugin slice, since plugins are stored behind
/// an `Arc` in `AppState` but the fire-and-forget capture hook and the
/// per-chunk stream hooks both need to move a reference into spawned
/// futures/closures.
pub struct PluginSlice(pub Arc<Vec<Box<dyn Plugin>>>);

impl PluginSlice {
    pub fn new(plugins: Vec<Box<dyn Plugin>>) -> Self {
        Self(Arc::new(plugins))
    }

    pub fn clone_handles(&self) -> Arc<Vec<Box<dyn Plugin>>> {
        self.0.clone()
    }
}

impl std::ops::Deref for PluginSlice {
    type Target = [Box<dyn Plugin>];

    fn deref(&self) -> &Self::Target {
        self.0.as_slice()
    }
}

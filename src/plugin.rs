//! Plugin interface and fail-open dispatch. Per spec.md §4.8: onRequest and
//! onResponse are sequential pipelines; onStreamChunk/onStreamEnd chain
//! per-plugin per-chunk; onCapture is fire-and-forget. Any hook error is
//! caught at the dispatch boundary, logged with the plugin's name, and
//! never halts forwarding or reaches the client.

use crate::capture::CaptureData;
use crate::metrics::MetricsState;
use axum::body::Bytes;
use axum::http::HeaderMap;
use serde_json::Value;

/// Mutable context threaded through the onRequest/onResponse pipelines.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub provider: crate::router::Provider,
    pub api_format: crate::router::ApiFormat,
    pub clean_path: String,
    pub source: Option<String>,
    pub session_id: Option<String>,
    pub headers: HeaderMap,
    pub body: Option<Value>,
    pub raw_body: Bytes,
}

#[derive(Debug, Clone)]
pub struct ResponseContext {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: String,
    pub streaming: bool,
    pub session_id: Option<String>,
}

/// A plugin implements whichever hooks it needs; every hook is optional and
/// defaults to a passthrough/no-op.
pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;

    fn has_on_request(&self) -> bool {
        false
    }
    fn has_on_response(&self) -> bool {
        false
    }
    fn has_on_stream_chunk(&self) -> bool {
        false
    }
    fn has_on_stream_end(&self) -> bool {
        false
    }
    fn has_on_capture(&self) -> bool {
        false
    }

    fn on_request(&self, ctx: RequestContext) -> anyhow::Result<RequestContext> {
        Ok(ctx)
    }

    fn on_response(&self, ctx: ResponseContext) -> anyhow::Result<ResponseContext> {
        Ok(ctx)
    }

    fn on_stream_chunk(&self, bytes: Vec<u8>, session_id: Option<&str>) -> anyhow::Result<Vec<u8>> {
        let _ = session_id;
        Ok(bytes)
    }

    fn on_stream_end(&self, session_id: Option<&str>) -> anyhow::Result<Option<Vec<u8>>> {
        let _ = session_id;
        Ok(None)
    }

    fn on_capture(&self, capture: &CaptureData) {
        let _ = capture;
    }
}

/// Which hook classes at least one plugin in the slice provides. Computed
/// once at startup so the forwarder can skip entire code paths, per
/// spec.md §4.7's pre-scan performance contract.
#[derive(Debug, Clone, Copy, Default)]
pub struct HookPresence {
    pub has_request: bool,
    pub has_response: bool,
    pub has_stream: bool,
    pub has_capture: bool,
}

pub fn scan_hooks(plugins: &[Box<dyn Plugin>]) -> HookPresence {
    let mut presence = HookPresence::default();
    for plugin in plugins {
        presence.has_request |= plugin.has_on_request();
        presence.has_response |= plugin.has_on_response();
        presence.has_stream |= plugin.has_on_stream_chunk() || plugin.has_on_stream_end();
        presence.has_capture |= plugin.has_on_capture();
    }
    presence
}

fn record_plugin_error(metrics: &MetricsState, plugin: &str, hook: &str) {
    metrics
        .plugin_error_total
        .with_label_values(&[plugin, hook])
        .inc();
}

/// Runs the sequential onRequest pipeline. A plugin error is logged and the
/// pipeline continues with the pre-failure context.
pub fn run_on_request(
    plugins: &[Box<dyn Plugin>],
    mut ctx: RequestContext,
    metrics: &MetricsState,
) -> RequestContext {
    for plugin in plugins {
        if !plugin.has_on_request() {
            continue;
        }
        match plugin.on_request(ctx.clone()) {
            Ok(next) => ctx = next,
            Err(err) => {
                tracing::warn!(plugin = plugin.name(), hook = "onRequest", error = %err, "plugin error");
                record_plugin_error(metrics, plugin.name(), "onRequest");
            }
        }
    }
    ctx
}

pub fn run_on_response(
    plugins: &[Box<dyn Plugin>],
    mut ctx: ResponseContext,
    metrics: &MetricsState,
) -> ResponseContext {
    for plugin in plugins {
        if !plugin.has_on_response() {
            continue;
        }
        match plugin.on_response(ctx.clone()) {
            Ok(next) => ctx = next,
            Err(err) => {
                tracing::warn!(plugin = plugin.name(), hook = "onResponse", error = %err, "plugin error");
                record_plugin_error(metrics, plugin.name(), "onResponse");
            }
        }
    }
    ctx
}

/// Chains onStreamChunk across every plugin in array order; a plugin error
/// is logged and the chunk from the previous step is used unchanged.
pub fn run_on_stream_chunk(
    plugins: &[Box<dyn Plugin>],
    mut chunk: Vec<u8>,
    session_id: Option<&str>,
    metrics: &MetricsState,
) -> Vec<u8> {
    for plugin in plugins {
        if !plugin.has_on_stream_chunk() {
            continue;
        }
        match plugin.on_stream_chunk(chunk.clone(), session_id) {
            Ok(next) => chunk = next,
            Err(err) => {
                tracing::warn!(plugin = plugin.name(), hook = "onStreamChunk", error = %err, "plugin error");
                record_plugin_error(metrics, plugin.name(), "onStreamChunk");
            }
        }
    }
    chunk
}

/// Invokes onStreamEnd for every plugin; any bytes returned are
/// concatenated in plugin order.
pub fn run_on_stream_end(
    plugins: &[Box<dyn Plugin>],
    session_id: Option<&str>,
    metrics: &MetricsState,
) -> Vec<u8> {
    let mut out = Vec::new();
    for plugin in plugins {
        if !plugin.has_on_stream_end() {
            continue;
        }
        match plugin.on_stream_end(session_id) {
            Ok(Some(bytes)) => out.extend(bytes),
            Ok(None) => {}
            Err(err) => {
                tracing::warn!(plugin = plugin.name(), hook = "onStreamEnd", error = %err, "plugin error");
                record_plugin_error(metrics, plugin.name(), "onStreamEnd");
            }
        }
    }
    out
}

/// Fire-and-forget: every plugin's onCapture is invoked; panics are not
/// expected (the hook returns no Result) but the call is still isolated per
/// plugin conceptually by iterating rather than collecting failures.
pub fn run_on_capture(plugins: &[Box<dyn Plugin>], capture: &CaptureData) {
    for plugin in plugins {
        if !plugin.has_on_capture() {
            continue;
        }
        plugin.on_capture(capture);
    }
}

//! Axum wiring: `AppState`, route/middleware assembly, and the metrics
//! endpoint. The actual request lifecycle lives in `forwarder.rs` — every
//! path and method is handled by a single fallback handler, since the set
//! of forwardable paths is open-ended (arbitrary upstream API surfaces
//! behind an optional source-tag prefix).

use crate::capture::CaptureLogger;
use crate::config::Config;
use crate::forwarder::PluginSlice;
use crate::metrics::MetricsState;
use crate::plugin::{scan_hooks, HookPresence, Plugin};
use crate::redact::RedactPlugin;
use axum::body::Body;
use axum::extract::State;
use axum::http::{Request, StatusCode};
use axum::response::Response;
use axum::Router;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::{self, TraceLayer};
use tracing::Level;

pub struct AppState {
    pub config: Config,
    pub metrics: Arc<MetricsState>,
    pub capture_logger: Arc<CaptureLogger>,
    pub plugins: PluginSlice,
    pub client: reqwest::Client,
    hook_presence: HookPresence,
}

impl AppState {
    pub fn config_allow_target_override(&self) -> bool {
        self.config.allow_target_override
    }

    pub fn hook_presence(&self) -> HookPresence {
        self.hook_presence
    }
}

pub async fn run_server(config: Config) -> anyhow::Result<()> {
    let state = build_state(config.clone())?;
    let app = build_app(state);

    let addr: SocketAddr = format!("{}:{}", config.bind_host, config.port).parse()?;
    tracing::info!("listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}

pub fn build_state(config: Config) -> anyhow::Result<Arc<AppState>> {
    let client = reqwest::Client::builder()
        .pool_idle_timeout(Duration::from_secs(90))
        .tcp_nodelay(true)
        .build()?;

    let capture_logger = Arc::new(CaptureLogger::new(
        PathBuf::from(&config.logger.capture_dir),
        config.logger.max_sessions,
    ));

    let redact_policy = crate::redact::presets::compile_preset(config.redact.preset);
    let redact_policy = match &config.redact.policy_file {
        Some(policy_path) => crate::redact::policy::compile_policy_from_path(
            std::path::Path::new(policy_path),
            Some(redact_policy),
        )?,
        None => redact_policy,
    };

    let redact_plugin: Box<dyn Plugin> = Box::new(RedactPlugin::new(
        redact_policy,
        config.redact.reversible,
        config.redact.verbose,
        config.redact.session_ttl_ms,
    ));
    let plugins = PluginSlice::new(vec![redact_plugin]);
    let hook_presence = scan_hooks(&plugins);

    Ok(Arc::new(AppState {
        config,
        metrics: Arc::new(MetricsState::new()?),
        capture_logger,
        plugins,
        client,
        hook_presence,
    }))
}

pub fn build_app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/metrics", axum::routing::get(metrics_handler))
        .fallback(crate::forwarder::handle)
        .layer(
            tower::ServiceBuilder::new()
                .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
                .layer(PropagateRequestIdLayer::x_request_id())
                .layer(
                    TraceLayer::new_for_http()
                        .make_span_with(|request: &Request<Body>| {
                            let request_id = request
                                .extensions()
                                .get::<tower_http::request_id::RequestId>()
                                .map(|id| id.header_value().to_str().unwrap_or("unknown"))
                                .unwrap_or("unknown");
                            tracing::info_span!(
                                "http",
                                request_id = %request_id,
                                method = %request.method(),
                                uri = %request.uri(),
                            )
                        })
                        .on_response(trace::DefaultOnResponse::new().level(Level::INFO)),
                ),
        )
        .with_state(state)
}

async fn metrics_handler(state: State<Arc<AppState>>) -> Response<Body> {
    match state.metrics.render() {
        Ok(body) => Response::builder()
            .status(StatusCode::OK)
            .header("content-type", "text/plain; version=0.0.4")
            .body(Body::from(body))
            .unwrap(),
        Err(err) => Response::builder()
            .status(StatusCode::INTERNAL_SERVER_ERROR)
            .body(Body::from(err.to_string()))
            .unwrap(),
    }
}

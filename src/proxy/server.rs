//! Router, shared state and the listener loop.

use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use reqwest::Client;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tower_http::services::{ServeDir, ServeFile};
use tower_http::trace::TraceLayer;

use super::call_log::CallLog;
use super::rate_limit::{self, RateLimiter};
use super::{admin, handlers};
use crate::config::Config;
use crate::pool::CredentialPool;
use crate::upstream::{GeminiClient, Upstream};

/// State shared by every handler.
#[derive(Clone)]
pub struct AppState {
    pub pool: Arc<CredentialPool>,
    pub upstream: Arc<dyn Upstream>,
    pub config: Arc<Config>,
    pub call_log: Arc<CallLog>,
}

impl AppState {
    /// Build state from config with the given upstream.
    pub fn new(config: Config, upstream: Arc<dyn Upstream>) -> Self {
        Self {
            pool: Arc::new(CredentialPool::new(config.upstream.api_keys.clone())),
            upstream,
            config: Arc::new(config),
            call_log: Arc::new(CallLog::default()),
        }
    }
}

/// Mount the OpenAI-compatible and admin routes, plus the optional static site.
pub fn create_router(state: AppState) -> Router {
    let static_dir = state.config.server.static_dir.clone();
    let chat_limit = Arc::new(RateLimiter::new(
        "chat_completions",
        state.config.server.chat_rate_limit,
    ));
    let check_keys_limit = Arc::new(RateLimiter::new(
        "check_keys",
        state.config.server.check_keys_rate_limit,
    ));

    let router = Router::new()
        // OpenAI surface
        .route(
            "/v1/chat/completions",
            post(handlers::chat_completions).route_layer(middleware::from_fn_with_state(
                chat_limit,
                rate_limit::enforce,
            )),
        )
        .route("/v1/models", get(handlers::list_models))
        // Admin
        .route("/api/status", get(admin::status))
        .route("/api/logs", get(admin::logs))
        .route(
            "/api/check-keys",
            post(admin::check_keys).route_layer(middleware::from_fn_with_state(
                check_keys_limit,
                rate_limit::enforce,
            )),
        );

    let router = match static_dir {
        Some(dir) => {
            let index = Path::new(&dir).join("index.html");
            router.fallback_service(ServeDir::new(dir).not_found_service(ServeFile::new(index)))
        }
        None => router,
    };

    router
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Bind the configured address and serve until the process exits.
pub async fn run_server(config: Config) -> anyhow::Result<()> {
    let listen_addr = config.server.listen.clone();

    // No overall timeout: streams are bounded by the idle timeout instead.
    let http_client = Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .build()?;
    let upstream = GeminiClient::new(http_client, config.upstream.base_url.clone());

    let state = AppState::new(config, Arc::new(upstream));
    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(&listen_addr).await?;
    tracing::info!(address = %listen_addr, "Starting gemrelay server");

    // Peer addresses key the per-client rate limits.
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}

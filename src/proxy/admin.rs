//! Admin endpoints: status, call log, and key health probes.

use axum::{extract::State, http::HeaderMap, response::IntoResponse, Json};
use futures::future::join_all;
use serde::Serialize;

use super::handlers::authorize;
use super::server::AppState;
use crate::config::ApiKey;
use crate::error::Error;
use crate::upstream::{ConversationTurn, GenerationOptions, GenerationRequest, UpstreamError};

/// Handle GET /api/status
pub async fn status(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
        "key_count": state.pool.len(),
        "self_healing": state.config.healing.enabled,
        "max_attempts": state.config.upstream.max_attempts,
    }))
}

/// Handle GET /api/logs - newest first
pub async fn logs(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.call_log.snapshot())
}

#[derive(Debug, Serialize)]
pub struct InvalidKey {
    pub key: String,
    pub error: String,
}

#[derive(Debug, Default, Serialize)]
pub struct KeyCheckReport {
    pub valid_keys: Vec<String>,
    pub invalid_keys: Vec<InvalidKey>,
}

/// One-token generation used to probe a key.
fn probe_request(model: &str) -> GenerationRequest {
    GenerationRequest {
        model: model.to_string(),
        turns: vec![ConversationTurn::user("hello")],
        system_instruction: None,
        options: GenerationOptions {
            max_output_tokens: Some(1),
            ..GenerationOptions::default()
        },
    }
}

/// Handle POST /api/check-keys
///
/// Probes every configured key concurrently. Only key suffixes are returned.
pub async fn check_keys(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<KeyCheckReport>, Error> {
    authorize(&state, &headers)?;

    let probe = probe_request(&state.config.upstream.probe_model);
    let timeout = state.config.upstream.attempt_timeout();
    let upstream = &state.upstream;
    let probe = &probe;

    let results = join_all(state.pool.keys().iter().map(|key: &ApiKey| async move {
        let outcome = match tokio::time::timeout(timeout, upstream.generate(key, probe)).await {
            Ok(result) => result.map(|_| ()),
            Err(_) => Err(UpstreamError::Timeout(timeout)),
        };
        (key.suffix(), outcome)
    }))
    .await;

    let mut report = KeyCheckReport::default();
    for (suffix, outcome) in results {
        match outcome {
            Ok(()) => report.valid_keys.push(suffix),
            Err(e) => {
                tracing::warn!(key = %suffix, error = %e, "Key check failed");
                report.invalid_keys.push(InvalidKey {
                    key: suffix,
                    error: e.to_string(),
                });
            }
        }
    }

    tracing::info!(
        valid = report.valid_keys.len(),
        invalid = report.invalid_keys.len(),
        "Key check finished"
    );
    Ok(Json(report))
}

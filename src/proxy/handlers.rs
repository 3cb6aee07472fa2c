//! HTTP request handlers for the OpenAI-compatible API.

use axum::{
    body::{Body, Bytes},
    extract::State,
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};

use super::call_log::CallRecord;
use super::emitter::{sse_frames, ChunkEmitter};
use super::retry::{
    rotate_credentials, AttemptOutcome, FailedAttempt, RotationError, RotationOutcome,
};
use super::server::AppState;
use super::stream::{HealingPolicy, HealingSession};
use super::translate::translate_request;
use super::types::ChatCompletionRequest;
use crate::error::Error;
use crate::upstream::UpstreamError;

/// Outcome of a served request, with what the call log needs.
struct RequestOutcome {
    response: Response,
    key_suffix: String,
    /// Set when the upstream answered but produced nothing usable.
    note: Option<String>,
}

/// Outcome of a failed request, with what the call log needs.
struct RequestError {
    error: Error,
    key_suffix: Option<String>,
}

impl From<Error> for RequestError {
    fn from(error: Error) -> Self {
        Self {
            error,
            key_suffix: None,
        }
    }
}

/// Check the operator secret, if one is configured.
///
/// Accepts `Authorization: Bearer <secret>` or the bare secret.
pub(super) fn authorize(state: &AppState, headers: &HeaderMap) -> Result<(), Error> {
    let Some(secret) = &state.config.auth.secret else {
        return Ok(());
    };

    let presented = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim());
    let Some(presented) = presented.filter(|v| !v.is_empty()) else {
        return Err(Error::Unauthorized(
            "Authorization key required but not provided".to_string(),
        ));
    };

    let token = presented.strip_prefix("Bearer ").unwrap_or(presented).trim();
    if token == secret.expose_secret() {
        Ok(())
    } else {
        Err(Error::Unauthorized("Invalid authorization key".to_string()))
    }
}

/// Convert a failed rotation into the error the caller sees.
fn rotation_error(err: RotationError<UpstreamError>, model: &str) -> Error {
    match err {
        RotationError::NoCandidates => Error::NoCredentials,
        RotationError::Fatal(UpstreamError::Status { status: 404, .. }) => {
            Error::ModelNotFound(model.to_string())
        }
        RotationError::Fatal(e) => Error::Internal(e.to_string()),
        RotationError::Exhausted(e) => Error::UpstreamExhausted(e.to_string()),
    }
}

fn failed_request(failed: &[FailedAttempt], error: Error) -> RequestError {
    RequestError {
        error,
        key_suffix: failed.last().map(|a| a.key_suffix.clone()),
    }
}

/// Handle POST /v1/chat/completions
pub async fn chat_completions(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, Error> {
    authorize(&state, &headers)?;

    let request: ChatCompletionRequest = serde_json::from_slice(&body)
        .map_err(|e| Error::BadRequest(format!("Invalid request body: {}", e)))?;

    tracing::info!(
        model = %request.model,
        stream = request.is_stream(),
        messages = request.messages.len(),
        "Received chat completion request"
    );

    let record = CallRecord::start(&request.model, request.is_stream());
    let result = execute_request(&state, &request).await;

    match result {
        Ok(outcome) => {
            let mut record = record.succeeded(outcome.key_suffix);
            record.error_info = outcome.note;
            state.call_log.record(record);
            Ok(outcome.response)
        }
        Err(failure) => {
            tracing::error!(
                model = %request.model,
                key = failure.key_suffix.as_deref().unwrap_or("-"),
                error = %failure.error,
                "Chat completion failed"
            );
            state
                .call_log
                .record(record.failed(failure.key_suffix, failure.error.to_string()));
            Ok(failure.error.into_response())
        }
    }
}

/// Translate, rotate keys, and build the response.
async fn execute_request(
    state: &AppState,
    request: &ChatCompletionRequest,
) -> std::result::Result<RequestOutcome, RequestError> {
    let generation = translate_request(request)?;
    let keys = state.pool.sample(state.config.upstream.max_attempts)?;
    let attempt_timeout = state.config.upstream.attempt_timeout();
    let upstream = &state.upstream;

    if !request.is_stream() {
        let generation = &generation;
        let outcome = rotate_credentials(&keys, attempt_timeout, |key| async move {
            AttemptOutcome::classify(upstream.generate(&key, generation).await)
        })
        .await;

        let RotationOutcome { result, failed } = outcome;
        let served = match result {
            Ok(served) => served,
            Err(err) => {
                let error = rotation_error(err, &request.model);
                return Err(failed_request(&failed, error));
            }
        };

        let key_suffix = served.key.suffix();
        let emitter = ChunkEmitter::new(&request.model);
        return Ok(match emitter.completion(&served.value) {
            Ok(completion) => RequestOutcome {
                response: Json(completion).into_response(),
                key_suffix,
                note: None,
            },
            Err(blocked) => {
                tracing::warn!(
                    model = %request.model,
                    key = %key_suffix,
                    details = %blocked.details,
                    "Upstream returned no usable content"
                );
                RequestOutcome {
                    note: Some(blocked.details.clone()),
                    response: (StatusCode::OK, Json(blocked)).into_response(),
                    key_suffix,
                }
            }
        });
    }

    let outcome = rotate_credentials(&keys, attempt_timeout, |key| {
        let generation = &generation;
        async move { AttemptOutcome::classify(upstream.stream_generate(&key, generation).await) }
    })
    .await;

    let RotationOutcome { result, failed } = outcome;
    let served = match result {
        Ok(served) => served,
        Err(err) => {
            let error = rotation_error(err, &request.model);
            return Err(failed_request(&failed, error));
        }
    };

    let key_suffix = served.key.suffix();
    tracing::info!(
        model = %request.model,
        key = %key_suffix,
        "Upstream stream opened"
    );

    let session = HealingSession::new(
        state.upstream.clone(),
        served.key,
        generation,
        served.value,
        HealingPolicy::for_model(&state.config, &request.model),
    );
    let emitter = ChunkEmitter::new(&request.model);
    let body = Body::from_stream(sse_frames(emitter, session.into_stream()));

    let response = (
        [
            (header::CONTENT_TYPE, "text/event-stream"),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        body,
    )
        .into_response();

    Ok(RequestOutcome {
        response,
        key_suffix,
        note: None,
    })
}

/// Handle GET /v1/models - models that support content generation
pub async fn list_models(State(state): State<AppState>) -> Result<Json<serde_json::Value>, Error> {
    let keys = state.pool.sample(state.config.upstream.max_attempts)?;
    let upstream = &state.upstream;

    let outcome = rotate_credentials(
        &keys,
        state.config.upstream.attempt_timeout(),
        |key| async move { AttemptOutcome::classify(upstream.list_models(&key).await) },
    )
    .await;

    let models = match outcome.result {
        Ok(served) => served.value,
        Err(RotationError::NoCandidates) => return Err(Error::NoCredentials),
        Err(RotationError::Fatal(e)) | Err(RotationError::Exhausted(e)) => {
            return Err(Error::Internal(format!(
                "Failed to fetch models from upstream: {}",
                e
            )))
        }
    };

    let created = chrono::Utc::now().timestamp();
    let data: Vec<serde_json::Value> = models
        .iter()
        .filter(|m| m.supports_generation())
        .map(|m| {
            serde_json::json!({
                "id": m.id(),
                "object": "model",
                "created": created,
                "owned_by": "google",
            })
        })
        .collect();

    Ok(Json(serde_json::json!({
        "object": "list",
        "data": data
    })))
}

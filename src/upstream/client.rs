//! Upstream client abstraction and the HTTP implementation for Gemini.

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use reqwest::{Client, Response};
use std::collections::VecDeque;
use std::time::Duration;

use super::sse::SseDecoder;
use super::types::{
    ErrorEnvelope, GenerateContentResponse, GenerationRequest, ListModelsResponse, ModelInfo,
};
use crate::config::ApiKey;

/// Header carrying the upstream credential.
pub const API_KEY_HEADER: &str = "x-goog-api-key";

/// Safety bound on `models.list` pagination.
const MAX_MODEL_PAGES: usize = 20;

/// Upstream error bodies longer than this are truncated in messages.
const MAX_ERROR_BODY_CHARS: usize = 512;

/// Events of one upstream streaming call, in arrival order.
pub type FragmentStream = BoxStream<'static, Result<GenerateContentResponse, UpstreamError>>;

/// Failure of a single upstream call.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum UpstreamError {
    #[error("Failed to reach upstream: {0}")]
    Transport(String),

    #[error("Upstream returned HTTP {status}: {message}")]
    Status { status: u16, message: String },

    #[error("Malformed upstream payload: {0}")]
    Malformed(String),

    #[error("Upstream did not respond within {0:?}")]
    Timeout(Duration),

    #[error("Upstream stream ended without a finish reason")]
    Truncated,

    #[error("Upstream stream ended without producing any content")]
    Empty,
}

impl UpstreamError {
    /// Failures no other credential can fix.
    pub fn is_fatal(&self) -> bool {
        matches!(self, UpstreamError::Status { status: 404, .. })
    }
}

impl From<reqwest::Error> for UpstreamError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            UpstreamError::Malformed(e.to_string())
        } else {
            UpstreamError::Transport(e.to_string())
        }
    }
}

/// The generative-content service as seen by the gateway.
///
/// Implemented over HTTP by [`GeminiClient`]; tests substitute scripted fakes.
#[async_trait]
pub trait Upstream: Send + Sync {
    /// Generate a complete answer in one call.
    async fn generate(
        &self,
        key: &ApiKey,
        request: &GenerationRequest,
    ) -> Result<GenerateContentResponse, UpstreamError>;

    /// Open a streaming generation. Resolves once the upstream accepted the call.
    async fn stream_generate(
        &self,
        key: &ApiKey,
        request: &GenerationRequest,
    ) -> Result<FragmentStream, UpstreamError>;

    /// List models advertised by the upstream.
    async fn list_models(&self, key: &ApiKey) -> Result<Vec<ModelInfo>, UpstreamError>;
}

/// HTTP client for the Gemini REST API.
#[derive(Debug, Clone)]
pub struct GeminiClient {
    http: Client,
    base_url: String,
}

impl GeminiClient {
    pub fn new(http: Client, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn model_url(&self, model: &str, method: &str) -> String {
        format!("{}/v1beta/models/{}:{}", self.base_url, model, method)
    }

    /// Turn a non-2xx response into an [`UpstreamError::Status`].
    async fn check_status(response: Response) -> Result<Response, UpstreamError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        let message = match serde_json::from_str::<ErrorEnvelope>(&body) {
            Ok(envelope) => match envelope.error.status {
                Some(code) => format!("{} ({})", envelope.error.message, code),
                None => envelope.error.message,
            },
            Err(_) => body.chars().take(MAX_ERROR_BODY_CHARS).collect(),
        };

        Err(UpstreamError::Status {
            status: status.as_u16(),
            message,
        })
    }
}

#[async_trait]
impl Upstream for GeminiClient {
    async fn generate(
        &self,
        key: &ApiKey,
        request: &GenerationRequest,
    ) -> Result<GenerateContentResponse, UpstreamError> {
        let response = self
            .http
            .post(self.model_url(&request.model, "generateContent"))
            .header(API_KEY_HEADER, key.expose_secret())
            .json(&request.to_wire())
            .send()
            .await?;

        let response = Self::check_status(response).await?;
        let bytes = response.bytes().await?;
        serde_json::from_slice(&bytes).map_err(|e| UpstreamError::Malformed(e.to_string()))
    }

    async fn stream_generate(
        &self,
        key: &ApiKey,
        request: &GenerationRequest,
    ) -> Result<FragmentStream, UpstreamError> {
        let response = self
            .http
            .post(self.model_url(&request.model, "streamGenerateContent"))
            .query(&[("alt", "sse")])
            .header(API_KEY_HEADER, key.expose_secret())
            .json(&request.to_wire())
            .send()
            .await?;

        let response = Self::check_status(response).await?;
        Ok(decode_event_stream(response.bytes_stream()).boxed())
    }

    async fn list_models(&self, key: &ApiKey) -> Result<Vec<ModelInfo>, UpstreamError> {
        let url = format!("{}/v1beta/models", self.base_url);
        let mut models = Vec::new();
        let mut page_token: Option<String> = None;

        for _ in 0..MAX_MODEL_PAGES {
            let mut query = vec![("pageSize".to_string(), "1000".to_string())];
            if let Some(token) = &page_token {
                query.push(("pageToken".to_string(), token.clone()));
            }

            let response = self
                .http
                .get(&url)
                .query(&query)
                .header(API_KEY_HEADER, key.expose_secret())
                .send()
                .await?;
            let page: ListModelsResponse = Self::check_status(response).await?.json().await?;

            models.extend(page.models);
            match page.next_page_token.filter(|t| !t.is_empty()) {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }

        Ok(models)
    }
}

/// Decode an SSE byte stream into upstream responses.
///
/// Transport errors and unparsable events surface as stream items; the
/// stream ends after the first error.
pub fn decode_event_stream<S, B, E>(
    bytes: S,
) -> impl futures::Stream<Item = Result<GenerateContentResponse, UpstreamError>> + Send
where
    S: futures::Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]>,
    E: std::fmt::Display,
{
    stream::unfold(
        (Box::pin(bytes), SseDecoder::new(), VecDeque::<String>::new(), false),
        |(mut bytes, mut decoder, mut pending, mut ended)| async move {
            loop {
                if let Some(data) = pending.pop_front() {
                    let item = serde_json::from_str::<GenerateContentResponse>(&data)
                        .map_err(|e| UpstreamError::Malformed(e.to_string()));
                    if item.is_err() {
                        pending.clear();
                        ended = true;
                    }
                    return Some((item, (bytes, decoder, pending, ended)));
                }
                if ended {
                    return None;
                }
                match bytes.next().await {
                    Some(Ok(chunk)) => match decoder.push(chunk.as_ref()) {
                        Ok(payloads) => pending.extend(payloads),
                        Err(e) => {
                            return Some((
                                Err(UpstreamError::Malformed(e.to_string())),
                                (bytes, decoder, pending, true),
                            ));
                        }
                    },
                    Some(Err(e)) => {
                        return Some((
                            Err(UpstreamError::Transport(e.to_string())),
                            (bytes, decoder, pending, true),
                        ));
                    }
                    None => {
                        pending.extend(decoder.finish());
                        ended = true;
                    }
                }
            }
        },
    )
}

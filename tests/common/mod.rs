//! Shared helpers for integration tests: app construction against a mock
//! upstream and response parsing.

#![allow(dead_code)]

use std::sync::Arc;

use axum::body::Body;
use http::Request;
use serde_json::{json, Value};

use gemrelay::config::{ApiKey, Config};
use gemrelay::proxy::{create_router, AppState};
use gemrelay::upstream::GeminiClient;

/// Config pointing at `base_url` with the given keys and default limits.
pub fn test_config(base_url: &str, keys: &[&str]) -> Config {
    let mut config = Config::default();
    config.server.listen = "127.0.0.1:0".to_string();
    config.upstream.base_url = base_url.to_string();
    config.upstream.api_keys = keys.iter().map(|k| ApiKey::from(*k)).collect();
    config
}

/// Build the router over a real HTTP upstream client.
pub fn setup_app(config: Config) -> (axum::Router, AppState) {
    let upstream = GeminiClient::new(reqwest::Client::new(), config.upstream.base_url.clone());
    let state = AppState::new(config, Arc::new(upstream));
    (create_router(state.clone()), state)
}

/// POST /v1/chat/completions with an optional Authorization header.
pub fn chat_request(body: Value, auth: Option<&str>) -> Request<Body> {
    let mut builder = Request::post("/v1/chat/completions").header("content-type", "application/json");
    if let Some(value) = auth {
        builder = builder.header("authorization", value);
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

pub fn simple_chat(stream: bool) -> Value {
    json!({
        "model": "gemini-2.0-flash",
        "messages": [
            {"role": "system", "content": "Be brief."},
            {"role": "user", "content": "Say hello"}
        ],
        "stream": stream
    })
}

/// A complete upstream answer with usage.
pub fn upstream_answer(text: &str, prompt: u32, completion: u32) -> Value {
    json!({
        "candidates": [{
            "content": {"role": "model", "parts": [{"text": text}]},
            "finishReason": "STOP"
        }],
        "usageMetadata": {
            "promptTokenCount": prompt,
            "candidatesTokenCount": completion,
            "totalTokenCount": prompt + completion
        }
    })
}

/// SSE body built from upstream events.
pub fn sse_body(events: &[Value]) -> String {
    events
        .iter()
        .map(|e| format!("data: {}\r\n\r\n", e))
        .collect()
}

pub fn stream_event(text: &str, finish: Option<&str>) -> Value {
    let mut candidate = json!({"content": {"role": "model", "parts": [{"text": text}]}});
    if let Some(reason) = finish {
        candidate["finishReason"] = json!(reason);
    }
    json!({"candidates": [candidate]})
}

/// Parse the response body as JSON and return (status_code, json_value).
pub async fn parse_body(response: axum::response::Response) -> (http::StatusCode, Value) {
    let status = response.status();
    let body_bytes = axum::body::to_bytes(response.into_body(), 1_048_576)
        .await
        .expect("read body");
    let json: Value = serde_json::from_slice(&body_bytes).unwrap_or_default();
    (status, json)
}

/// Read a streamed response and split it into SSE frames.
pub async fn read_frames(response: axum::response::Response) -> Vec<String> {
    let body_bytes = axum::body::to_bytes(response.into_body(), 1_048_576)
        .await
        .expect("read body");
    String::from_utf8(body_bytes.to_vec())
        .unwrap()
        .split_inclusive("\n\n")
        .map(str::to_string)
        .collect()
}

/// JSON payload of a `data: {...}` frame.
pub fn frame_json(frame: &str) -> Value {
    let data = frame
        .strip_prefix("data: ")
        .expect("data frame")
        .trim_end();
    serde_json::from_str(data).expect("frame json")
}

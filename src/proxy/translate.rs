//! Translation between OpenAI chat requests and upstream generation requests.

use rand::distributions::Alphanumeric;
use rand::Rng;
use regex::Regex;
use std::sync::OnceLock;

use super::types::{ChatCompletionRequest, FinishReason};
use crate::error::{Error, Result};
use crate::upstream::types::{
    ConversationTurn, FinishReason as UpstreamFinish, GenerationOptions, GenerationRequest,
    TurnRole,
};

/// Length of the random token prefixed to the last user turn.
pub const CACHE_BUSTER_LEN: usize = 16;

fn cache_buster_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(&format!("^[A-Za-z0-9]{{{}}}\n", CACHE_BUSTER_LEN))
            .unwrap_or_else(|e| unreachable!("static pattern is valid: {e}"))
    })
}

/// Translate an inbound chat request into an upstream generation request.
pub fn translate_request(request: &ChatCompletionRequest) -> Result<GenerationRequest> {
    translate_request_with(&mut rand::thread_rng(), request)
}

/// [`translate_request`] with a caller-provided RNG for the cache-buster.
pub fn translate_request_with<R: Rng + ?Sized>(
    rng: &mut R,
    request: &ChatCompletionRequest,
) -> Result<GenerationRequest> {
    let mut system_instruction: Option<String> = None;
    let mut turns = Vec::with_capacity(request.messages.len());

    for message in &request.messages {
        let role = match message.role.as_str() {
            "system" => {
                if system_instruction.is_none() {
                    system_instruction = Some(message.content.segments().concat());
                } else {
                    tracing::debug!("Dropping additional system message");
                }
                continue;
            }
            "user" => TurnRole::User,
            "assistant" => TurnRole::Model,
            other => return Err(Error::UnsupportedRole(other.to_string())),
        };
        turns.push(ConversationTurn {
            role,
            segments: message.content.segments(),
        });
    }

    if turns.is_empty() {
        return Err(Error::BadRequest(
            "request must contain at least one user or assistant message".to_string(),
        ));
    }

    if let Some(last_user) = turns.iter_mut().rev().find(|t| t.role == TurnRole::User) {
        let token = cache_buster(rng);
        match last_user.segments.first_mut() {
            Some(first) => first.insert_str(0, &token),
            None => last_user.segments.push(token),
        }
    }

    Ok(GenerationRequest {
        model: request.model.clone(),
        turns,
        system_instruction,
        options: GenerationOptions {
            temperature: request.temperature,
            top_p: request.top_p,
            max_output_tokens: request.max_tokens,
        },
    })
}

/// A fresh `<16 alphanumerics>\n` prefix.
fn cache_buster<R: Rng + ?Sized>(rng: &mut R) -> String {
    let mut token: String = rng
        .sample_iter(&Alphanumeric)
        .take(CACHE_BUSTER_LEN)
        .map(char::from)
        .collect();
    token.push('\n');
    token
}

/// Remove a leading cache-buster token from prompt text, if present.
///
/// Only prompt segments carry the token; model output is forwarded untouched.
pub fn strip_cache_buster(text: &str) -> &str {
    match cache_buster_pattern().find(text) {
        Some(m) => &text[m.end()..],
        None => text,
    }
}

/// Map an upstream finish reason to the outbound one.
///
/// An absent reason means "still generating" mid-stream and "stop" at
/// finalization.
pub fn map_finish_reason(reason: Option<UpstreamFinish>, is_final: bool) -> Option<FinishReason> {
    match reason {
        Some(UpstreamFinish::Stop) | Some(UpstreamFinish::Other) => Some(FinishReason::Stop),
        Some(UpstreamFinish::MaxTokens) => Some(FinishReason::Length),
        Some(r) if r.is_safety_block() => Some(FinishReason::ContentFilter),
        Some(_) => Some(FinishReason::Stop),
        None if is_final => Some(FinishReason::Stop),
        None => None,
    }
}

//! Outbound OpenAI wire format: SSE chunk frames and completion envelopes.

use bytes::Bytes;
use futures::stream::{self, Stream, StreamExt};
use serde::Serialize;
use std::collections::VecDeque;
use std::convert::Infallible;

use super::stream::SessionStream;
use super::translate::map_finish_reason;
use super::types::{
    ChatCompletionChunk, ChatCompletionResponse, Choice, ChunkChoice, Delta, FinishReason,
    Message, Usage,
};
use crate::upstream::{GenerateContentResponse, StreamFragment, UpstreamError};

/// End-of-stream sentinel.
pub const DONE_FRAME: &str = "data: [DONE]\n\n";

/// Identity shared by every frame of one response.
#[derive(Debug, Clone)]
pub struct ChunkEmitter {
    id: String,
    created: i64,
    model: String,
}

impl ChunkEmitter {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            id: format!("chatcmpl-{}", uuid::Uuid::new_v4()),
            created: chrono::Utc::now().timestamp(),
            model: model.into(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    fn chunk(&self, delta: Delta, finish_reason: Option<FinishReason>) -> ChatCompletionChunk {
        ChatCompletionChunk {
            id: self.id.clone(),
            object: "chat.completion.chunk".to_string(),
            created: self.created,
            model: self.model.clone(),
            choices: vec![ChunkChoice {
                index: 0,
                delta,
                finish_reason,
            }],
        }
    }

    /// Frame for one delivered fragment. The first frame also carries the role.
    pub fn fragment_frame(&self, fragment: &StreamFragment, first: bool) -> String {
        let delta = Delta {
            role: first.then(|| "assistant".to_string()),
            content: Some(fragment.text.clone()),
        };
        data_frame(&self.chunk(delta, map_finish_reason(fragment.finish, false)))
    }

    /// Empty-delta frame closing a successful stream.
    pub fn final_frame(&self) -> String {
        data_frame(&self.chunk(Delta::default(), Some(FinishReason::Stop)))
    }

    /// Terminal error frame.
    pub fn error_frame(&self, err: &UpstreamError) -> String {
        data_frame(&serde_json::json!({
            "error": {
                "message": err.to_string(),
                "type": "upstream_error",
                "code": serde_json::Value::Null,
            }
        }))
    }

    /// Build the single-shot completion envelope.
    ///
    /// Fails with a [`BlockedPayload`] when the response has no text or no
    /// usage, which is how a filtered answer comes back.
    pub fn completion(
        &self,
        response: &GenerateContentResponse,
    ) -> Result<ChatCompletionResponse, BlockedPayload> {
        let (Some(text), Some(usage)) = (response.text(), response.usage()) else {
            return Err(BlockedPayload::from_response(response));
        };

        Ok(ChatCompletionResponse {
            id: self.id.clone(),
            object: "chat.completion".to_string(),
            created: self.created,
            model: self.model.clone(),
            choices: vec![Choice {
                index: 0,
                message: Message::new("assistant", text),
                finish_reason: map_finish_reason(response.finish_reason(), true)
                    .unwrap_or(FinishReason::Stop),
            }],
            usage: Usage {
                prompt_tokens: usage.prompt_token_count,
                completion_tokens: usage.candidates_token_count,
                total_tokens: usage.total_token_count,
            },
        })
    }
}

/// Body returned instead of a completion when the upstream produced no usable answer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BlockedPayload {
    pub error: String,
    pub details: String,
}

impl BlockedPayload {
    pub fn from_response(response: &GenerateContentResponse) -> Self {
        Self {
            error: "Failed to process Gemini response".to_string(),
            details: response.feedback_summary(),
        }
    }
}

fn data_frame<T: Serialize>(payload: &T) -> String {
    // Serializing plain structs and json! values cannot fail.
    let json = serde_json::to_string(payload).unwrap_or_default();
    format!("data: {}\n\n", json)
}

struct Framer {
    session: SessionStream,
    emitter: ChunkEmitter,
    pending: VecDeque<String>,
    sent_first: bool,
    finished: bool,
}

impl Framer {
    async fn next_frame(&mut self) -> Option<String> {
        loop {
            if let Some(frame) = self.pending.pop_front() {
                return Some(frame);
            }
            if self.finished {
                return None;
            }

            match self.session.next().await {
                Some(Ok(fragment)) => {
                    let frame = self.emitter.fragment_frame(&fragment, !self.sent_first);
                    self.sent_first = true;
                    self.pending.push_back(frame);
                }
                Some(Err(err)) => {
                    self.finished = true;
                    self.pending.push_back(self.emitter.error_frame(&err));
                    self.pending.push_back(DONE_FRAME.to_string());
                }
                None => {
                    self.finished = true;
                    self.pending.push_back(self.emitter.final_frame());
                    self.pending.push_back(DONE_FRAME.to_string());
                }
            }
        }
    }
}

/// Render a session as SSE frames, always ending with [`DONE_FRAME`].
pub fn sse_frames(
    emitter: ChunkEmitter,
    session: SessionStream,
) -> impl Stream<Item = Result<Bytes, Infallible>> + Send {
    let framer = Framer {
        session,
        emitter,
        pending: VecDeque::new(),
        sent_first: false,
        finished: false,
    };
    stream::unfold(framer, |mut framer| async move {
        let frame = framer.next_frame().await?;
        Some((Ok(Bytes::from(frame)), framer))
    })
}

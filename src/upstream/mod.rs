//! Upstream generative-content API: wire types, SSE decoding and the HTTP client.

pub mod client;
pub mod sse;
pub mod types;

pub use client::{FragmentStream, GeminiClient, Upstream, UpstreamError};
pub use types::{
    ConversationTurn, FinishReason, GenerateContentResponse, GenerationOptions, GenerationRequest,
    StreamFragment, TurnRole,
};

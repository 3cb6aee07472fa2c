//! HTTP proxy server module.
//!
//! Accepts OpenAI-compatible chat requests, rotates upstream keys per
//! request, and streams answers back through a self-healing session.

pub mod admin;
pub mod call_log;
pub mod emitter;
mod handlers;
pub mod rate_limit;
pub mod retry;
mod server;
pub mod stream;
pub mod translate;
pub mod types;

pub use call_log::{CallLog, CallRecord, CallStatus};
pub use server::{create_router, run_server, AppState};
pub use stream::{HealingPolicy, HealingSession};
pub use types::{ChatCompletionRequest, ChatCompletionResponse, Message};

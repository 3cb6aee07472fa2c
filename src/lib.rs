//! gemrelay - OpenAI-compatible gateway for Gemini
//!
//! Translates chat-completion requests into Gemini calls, rotates a pool of
//! upstream API keys per request, and heals interrupted streams by resuming
//! generation from the text already delivered.

pub mod config;
pub mod error;
pub mod pool;
pub mod proxy;
pub mod upstream;

pub use config::Config;
pub use error::{Error, Result};

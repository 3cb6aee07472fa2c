//! Gemini wire types and the conversation model sent upstream.
//!
//! Only the fields the gateway reads are modelled; everything else in an
//! upstream payload is ignored during deserialization.

use serde::{Deserialize, Serialize};

/// Speaker of a conversation turn, as the upstream names it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnRole {
    User,
    Model,
}

/// One message in the upstream conversation.
#[derive(Debug, Clone, PartialEq)]
pub struct ConversationTurn {
    pub role: TurnRole,
    pub segments: Vec<String>,
}

impl ConversationTurn {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: TurnRole::User,
            segments: vec![text.into()],
        }
    }

    pub fn model(text: impl Into<String>) -> Self {
        Self {
            role: TurnRole::Model,
            segments: vec![text.into()],
        }
    }

    /// All segments joined, as the upstream reads them.
    pub fn text(&self) -> String {
        self.segments.concat()
    }
}

/// Sampling options forwarded to the upstream; absent fields keep upstream defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<u32>,
}

impl GenerationOptions {
    pub fn is_empty(&self) -> bool {
        self.temperature.is_none() && self.top_p.is_none() && self.max_output_tokens.is_none()
    }
}

/// A fully translated request for one model.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub model: String,
    pub turns: Vec<ConversationTurn>,
    pub system_instruction: Option<String>,
    pub options: GenerationOptions,
}

impl GenerationRequest {
    /// Build the JSON body for `generateContent` / `streamGenerateContent`.
    pub fn to_wire(&self) -> GenerateContentRequest {
        GenerateContentRequest {
            contents: self.turns.iter().map(Content::from).collect(),
            system_instruction: self.system_instruction.as_ref().map(|text| Content {
                role: None,
                parts: vec![Part::text(text.clone())],
            }),
            generation_config: (!self.options.is_empty()).then(|| self.options.clone()),
            safety_settings: safety_settings_for(&self.model).to_vec(),
        }
    }
}

/// Request body of `generateContent`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateContentRequest {
    pub contents: Vec<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generation_config: Option<GenerationOptions>,
    pub safety_settings: Vec<SafetySetting>,
}

/// A role-tagged list of parts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Content {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<TurnRole>,
    #[serde(default)]
    pub parts: Vec<Part>,
}

impl From<&ConversationTurn> for Content {
    fn from(turn: &ConversationTurn) -> Self {
        Content {
            role: Some(turn.role),
            parts: turn.segments.iter().cloned().map(Part::text).collect(),
        }
    }
}

/// A content part. Only text parts are produced or read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Part {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

impl Part {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
        }
    }
}

/// Per-category block threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SafetySetting {
    pub category: &'static str,
    pub threshold: &'static str,
}

const fn block_none(category: &'static str) -> SafetySetting {
    SafetySetting {
        category,
        threshold: "BLOCK_NONE",
    }
}

/// Safety profile for first-generation models.
pub static LEGACY_SAFETY_PROFILE: [SafetySetting; 4] = [
    block_none("HARM_CATEGORY_HARASSMENT"),
    block_none("HARM_CATEGORY_HATE_SPEECH"),
    block_none("HARM_CATEGORY_SEXUALLY_EXPLICIT"),
    block_none("HARM_CATEGORY_DANGEROUS_CONTENT"),
];

/// Safety profile for models matching [`NEWER_GENERATION_PREFIX`].
///
/// Same thresholds as the legacy profile today; kept separate so either can
/// change without touching the other.
pub static GEN2_SAFETY_PROFILE: [SafetySetting; 4] = [
    block_none("HARM_CATEGORY_HARASSMENT"),
    block_none("HARM_CATEGORY_HATE_SPEECH"),
    block_none("HARM_CATEGORY_SEXUALLY_EXPLICIT"),
    block_none("HARM_CATEGORY_DANGEROUS_CONTENT"),
];

pub const NEWER_GENERATION_PREFIX: &str = "gemini-2";

/// Safety profile for a model identifier.
pub fn safety_settings_for(model: &str) -> &'static [SafetySetting] {
    if model.starts_with(NEWER_GENERATION_PREFIX) {
        &GEN2_SAFETY_PROFILE
    } else {
        &LEGACY_SAFETY_PROFILE
    }
}

/// Why the upstream stopped generating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FinishReason {
    Stop,
    MaxTokens,
    Safety,
    Recitation,
    Blocklist,
    ProhibitedContent,
    Spii,
    #[serde(other)]
    Other,
}

impl FinishReason {
    /// Generation was cut off by a content filter.
    pub fn is_safety_block(&self) -> bool {
        matches!(
            self,
            FinishReason::Safety
                | FinishReason::Recitation
                | FinishReason::Blocklist
                | FinishReason::ProhibitedContent
                | FinishReason::Spii
        )
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Candidate {
    #[serde(default)]
    pub content: Option<Content>,
    #[serde(default)]
    pub finish_reason: Option<FinishReason>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptFeedback {
    #[serde(default)]
    pub block_reason: Option<String>,
    #[serde(default)]
    pub block_reason_message: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageMetadata {
    #[serde(default)]
    pub prompt_token_count: u32,
    #[serde(default)]
    pub candidates_token_count: u32,
    #[serde(default)]
    pub total_token_count: u32,
}

/// Response of `generateContent`, and each event of `streamGenerateContent`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateContentResponse {
    #[serde(default)]
    pub candidates: Vec<Candidate>,
    #[serde(default)]
    pub prompt_feedback: Option<PromptFeedback>,
    #[serde(default)]
    pub usage_metadata: Option<UsageMetadata>,
}

impl GenerateContentResponse {
    fn first_parts(&self) -> &[Part] {
        self.candidates
            .first()
            .and_then(|c| c.content.as_ref())
            .map(|c| c.parts.as_slice())
            .unwrap_or(&[])
    }

    /// Whether the first candidate carries any parts.
    pub fn has_parts(&self) -> bool {
        !self.first_parts().is_empty()
    }

    /// Text of the first candidate, or `None` when it has no parts.
    pub fn text(&self) -> Option<String> {
        let parts = self.first_parts();
        if parts.is_empty() {
            return None;
        }
        Some(parts.iter().filter_map(|p| p.text.as_deref()).collect())
    }

    /// Finish reason of the first candidate.
    ///
    /// A prompt rejected outright has no candidates; that is reported as a
    /// safety stop.
    pub fn finish_reason(&self) -> Option<FinishReason> {
        match self.candidates.first() {
            Some(candidate) => candidate.finish_reason,
            None => self.block_reason().map(|_| FinishReason::Safety),
        }
    }

    pub fn usage(&self) -> Option<UsageMetadata> {
        self.usage_metadata
    }

    /// Prompt-level block reason, if the prompt itself was rejected.
    pub fn block_reason(&self) -> Option<&str> {
        self.prompt_feedback
            .as_ref()
            .and_then(|f| f.block_reason.as_deref())
    }

    /// Human-readable explanation of why no text came back.
    pub fn feedback_summary(&self) -> String {
        if let Some(feedback) = &self.prompt_feedback {
            if let Some(reason) = &feedback.block_reason {
                return match &feedback.block_reason_message {
                    Some(message) => format!("prompt blocked: {} ({})", reason, message),
                    None => format!("prompt blocked: {}", reason),
                };
            }
        }
        match self.candidates.first().and_then(|c| c.finish_reason) {
            Some(reason) => format!("no content returned, finish reason {:?}", reason),
            None if self.candidates.is_empty() => "no candidates returned".to_string(),
            None => "no content returned".to_string(),
        }
    }
}

/// One incremental piece of streamed output.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamFragment {
    pub text: String,
    pub finish: Option<FinishReason>,
}

impl StreamFragment {
    pub fn new(text: impl Into<String>, finish: Option<FinishReason>) -> Self {
        Self {
            text: text.into(),
            finish,
        }
    }
}

impl From<&GenerateContentResponse> for StreamFragment {
    fn from(response: &GenerateContentResponse) -> Self {
        Self {
            text: response.text().unwrap_or_default(),
            finish: response.finish_reason(),
        }
    }
}

/// Entry of `GET /v1beta/models`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelInfo {
    pub name: String,
    #[serde(default)]
    pub supported_generation_methods: Vec<String>,
}

impl ModelInfo {
    /// Model name without the `models/` resource prefix.
    pub fn id(&self) -> &str {
        self.name.strip_prefix("models/").unwrap_or(&self.name)
    }

    pub fn supports_generation(&self) -> bool {
        self.supported_generation_methods
            .iter()
            .any(|m| m == "generateContent")
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListModelsResponse {
    #[serde(default)]
    pub models: Vec<ModelInfo>,
    #[serde(default)]
    pub next_page_token: Option<String>,
}

/// Error envelope returned by the upstream on non-2xx responses.
#[derive(Debug, Clone, Deserialize)]
pub struct ErrorEnvelope {
    pub error: ErrorBody,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ErrorBody {
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub status: Option<String>,
}

//! OpenAI-compatible chat-completion types.
//!
//! Kept wire-compatible with the OpenAI REST API so existing SDK clients
//! work unmodified. Unknown request fields are captured rather than
//! rejected and reach the engine as stringified parameters.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// A single message in the conversation history.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ChatMessage {
    /// The role of the message author (`"system"`, `"user"`, `"assistant"`).
    pub role: String,
    /// The content of the message.
    pub content: String,
}

/// Request body for `POST /v1/chat/completions`.
#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct ChatCompletionRequest {
    /// The model to use; defaults to the server's configured model.
    #[serde(default)]
    pub model: Option<String>,
    /// Session to bind the conversation to; defaults to the request id
    /// (i.e. a fresh single-turn session).
    #[serde(default)]
    pub session_id: Option<String>,
    /// When `true`, the response is streamed as SSE chunks.
    #[serde(default)]
    pub stream: bool,
    /// Full conversation history; the server diffs it against the session.
    pub messages: Vec<ChatMessage>,
    /// Maximum tokens to generate.
    #[serde(default)]
    pub max_tokens: Option<u32>,
    /// Any other generation parameters; preserved as strings.
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// A single choice in the completion response.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ChatChoice {
    /// Zero-based index of this choice.
    pub index: u32,
    /// The generated message.
    pub message: ChatMessage,
    /// Always `null`; logprobs are not produced.
    pub logprobs: Option<serde_json::Value>,
    /// Why generation stopped (`"stop"`, `"length"`, `"cancelled"`, `"error"`).
    pub finish_reason: String,
}

/// Token accounting for the request.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct UsageBody {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

/// Response body for `POST /v1/chat/completions` (non-streaming).
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ChatCompletionResponse {
    /// `"chatcmpl-" + request id`.
    pub id: String,
    /// Always `"chat.completion"`.
    pub object: String,
    /// Unix timestamp of when the response was created.
    pub created: i64,
    /// Model that produced the completion.
    pub model: String,
    /// Generated choices.
    pub choices: Vec<ChatChoice>,
    /// Token usage for this request.
    pub usage: UsageBody,
}

use std::collections::BTreeMap;

/// One message of a conversation. Comparison is structural; the position of a
/// message inside its list is significant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub role: String,
    pub content: String,
}

impl Message {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }
}

/// Terminal cause of a generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    /// The model emitted an end-of-generation token.
    Stop,
    /// The `max_new_tokens` budget was exhausted.
    Length,
    /// The request was cancelled (client disconnect, abort, queue-wait
    /// timeout observed as cancellation).
    Cancelled,
    /// The engine failed; details live in [`Terminal::error_message`].
    Error,
}

impl FinishReason {
    /// The OpenAI wire string for this reason.
    pub fn as_str(self) -> &'static str {
        match self {
            FinishReason::Stop => "stop",
            FinishReason::Length => "length",
            FinishReason::Cancelled => "cancelled",
            FinishReason::Error => "error",
        }
    }
}

/// Machine-readable error class carried alongside an `Error` finish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// A bounded queue refused the request or the queue-wait deadline passed.
    Overloaded,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::Overloaded => "overloaded",
        }
    }
}

/// The read-once terminal state of a request.
#[derive(Debug, Clone)]
pub struct Terminal {
    pub reason: FinishReason,
    pub error_message: Option<String>,
    pub error_code: Option<ErrorCode>,
}

impl Terminal {
    pub fn new(reason: FinishReason) -> Self {
        Self {
            reason,
            error_message: None,
            error_code: None,
        }
    }

    pub fn error(message: impl Into<String>, code: Option<ErrorCode>) -> Self {
        Self {
            reason: FinishReason::Error,
            error_message: Some(message.into()),
            error_code: code,
        }
    }

    pub fn is_overloaded(&self) -> bool {
        matches!(self.error_code, Some(ErrorCode::Overloaded))
    }
}

/// One item on a request's delta stream.
///
/// Deltas are raw bytes: detokenization may split a multi-byte sequence
/// across chunks, and only the stream writer at the HTTP edge is allowed to
/// decide where code points end.
#[derive(Debug, Clone)]
pub enum StreamChunk {
    /// Incremental output bytes.
    Delta(Vec<u8>),
    /// Terminal marker; exactly one per request, after all deltas.
    Finished(Terminal),
}

/// Token accounting for one request. `total_tokens` is always the sum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

/// Typed generation parameters at the core boundary.
///
/// The gateway parses the wire's loose key/value form into this struct;
/// unknown keys survive as strings in `extra` so engines can pick up knobs
/// the core does not model.
#[derive(Debug, Clone, Default)]
pub struct GenParams {
    /// Token budget for the generation loop. `None` falls back to the
    /// engine's configured default.
    pub max_new_tokens: Option<u32>,
    /// Unrecognised wire parameters, stringified.
    pub extra: BTreeMap<String, String>,
}

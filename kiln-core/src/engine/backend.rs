//! The named interface to an external token-generation library.
//!
//! kiln does not ship inference kernels; a [`ModelBackend`] wraps whatever
//! library provides them (weights, vocabulary, sampler). The surface mirrors
//! what llama-style APIs expose: tokenize, decode into a position-indexed
//! cache, sample, accept, detokenize. Detokenization yields raw bytes on
//! purpose; a single token can end mid-way through a multi-byte sequence.

use thiserror::Error;

use crate::serving::Message;

/// Token identifier in the backend's vocabulary.
pub type TokenId = i32;

#[derive(Debug, Clone, Error)]
pub enum BackendError {
    #[error("context creation failed: {message}")]
    ContextCreate { message: String },

    #[error("chat template failed: {message}")]
    Template { message: String },

    #[error("tokenizer failed: {message}")]
    Tokenize { message: String },

    #[error("decode failed: {message}")]
    Decode { message: String },

    #[error("detokenize failed: {message}")]
    Detokenize { message: String },
}

/// One session's native execution state: the position-indexed key/value
/// cache and the sampler bound to it. Created per session, owned by exactly
/// one execution at a time, released deterministically on drop.
pub trait BackendContext: Send {
    /// Token capacity of the cache (the context window).
    fn capacity(&self) -> u32;

    /// Decode `tokens` into the cache starting at position `n_past`.
    fn decode(&mut self, tokens: &[TokenId], n_past: u32) -> Result<(), BackendError>;

    /// Sample the next token from the most recent logits.
    fn sample(&mut self) -> TokenId;

    /// Commit a sampled token to the sampler state.
    fn accept(&mut self, token: TokenId);
}

/// A loaded model: weights, vocabulary, template. Shared across sessions;
/// must be callable from multiple worker threads (the scheduler serializes
/// per model, but warmup and tests may not).
pub trait ModelBackend: Send + Sync + 'static {
    type Ctx: BackendContext + 'static;

    fn new_context(&self) -> Result<Self::Ctx, BackendError>;

    /// Render a message list through the model's chat template.
    fn chat_template(&self, messages: &[Message]) -> Result<String, BackendError>;

    /// `add_special` controls BOS-style tokens and is only set for the very
    /// first prefill of a context.
    fn tokenize(&self, text: &str, add_special: bool) -> Result<Vec<TokenId>, BackendError>;

    /// `true` when the token ends the generation.
    fn token_is_eog(&self, token: TokenId) -> bool;

    /// The byte representation of one token. May be empty, may end inside a
    /// multi-byte sequence.
    fn token_bytes(&self, token: TokenId) -> Result<Vec<u8>, BackendError>;
}

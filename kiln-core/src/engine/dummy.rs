//! Fixed-output engine for tests and warmup.

use std::sync::Arc;

use tracing::debug;

use crate::serving::{FinishReason, Message, ServingContext, Terminal};

use super::ModelEngine;

/// Emits a configured string as word-sized deltas, then finishes with
/// `stop`. Honors the request's token budget (each word counts as one
/// completion token) so `length` finishes are reachable, and checks the
/// cancellation flag between deltas.
pub struct DummyEngine {
    text: String,
    repeat: usize,
}

impl DummyEngine {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            repeat: 1,
        }
    }

    /// Emit the text `repeat` times, for tests that need long generations.
    pub fn with_repeat(text: impl Into<String>, repeat: usize) -> Self {
        Self {
            text: text.into(),
            repeat: repeat.max(1),
        }
    }

    fn rough_token_count(messages: &[Message]) -> u64 {
        messages
            .iter()
            .map(|m| m.content.split_whitespace().count() as u64)
            .sum()
    }
}

impl ModelEngine for DummyEngine {
    fn run(&self, ctx: Arc<ServingContext>) {
        debug!(request_id = %ctx.request_id, "dummy engine start");

        ctx.add_prompt_tokens(Self::rough_token_count(&ctx.messages));

        let budget = ctx.params.max_new_tokens.map(u64::from).unwrap_or(u64::MAX);
        let mut emitted: u64 = 0;

        for _ in 0..self.repeat {
            // split_inclusive keeps the separators, so concatenating the
            // deltas reproduces the configured text exactly.
            for piece in self.text.split_inclusive(' ') {
                if ctx.is_cancelled() {
                    ctx.emit_finish(Terminal::new(FinishReason::Cancelled));
                    return;
                }
                if emitted >= budget {
                    ctx.emit_finish(Terminal::new(FinishReason::Length));
                    return;
                }
                ctx.emit_delta(piece.as_bytes());
                ctx.add_completion_tokens(1);
                emitted += 1;
            }
        }

        ctx.emit_finish(Terminal::new(FinishReason::Stop));
        debug!(request_id = %ctx.request_id, "dummy engine finished");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serving::GenParams;

    #[tokio::test]
    async fn emits_text_and_stops() {
        let ctx = ServingContext::builder("req-1", "dummy")
            .messages(vec![Message::new("user", "hi")])
            .build();
        DummyEngine::new("ok").run(Arc::clone(&ctx));

        let terminal = ctx.finished().await;
        assert_eq!(terminal.reason, FinishReason::Stop);
        assert_eq!(ctx.accumulated_text(), "ok");
        assert!(ctx.usage().completion_tokens > 0);
    }

    #[tokio::test]
    async fn budget_exhaustion_finishes_with_length() {
        let ctx = ServingContext::builder("req-2", "dummy")
            .messages(vec![Message::new("user", "count forever")])
            .params(GenParams {
                max_new_tokens: Some(3),
                ..GenParams::default()
            })
            .build();
        DummyEngine::with_repeat("a b c d ", 4).run(Arc::clone(&ctx));

        let terminal = ctx.finished().await;
        assert_eq!(terminal.reason, FinishReason::Length);
        assert_eq!(ctx.usage().completion_tokens, 3);
        let usage = ctx.usage();
        assert_eq!(
            usage.total_tokens,
            usage.prompt_tokens + usage.completion_tokens
        );
    }

    #[tokio::test]
    async fn cancellation_stops_emission() {
        let ctx = ServingContext::builder("req-3", "dummy")
            .messages(vec![Message::new("user", "hi")])
            .build();
        ctx.cancel();
        DummyEngine::new("never seen").run(Arc::clone(&ctx));

        let terminal = ctx.finished().await;
        assert_eq!(terminal.reason, FinishReason::Cancelled);
        assert_eq!(ctx.accumulated_text(), "");
    }
}

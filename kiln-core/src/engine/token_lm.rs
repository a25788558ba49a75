//! Token-level engine over a [`ModelBackend`], with session-scoped cache
//! reuse.
//!
//! The engine keeps one `ModelContext` per session (backend context +
//! position counter) inside the session's cache slot. Each run extends the
//! cache with exactly the tokens the session has not decoded yet: in chat
//! mode the prompt is the chat-template suffix between the committed history
//! and history-plus-delta, so a continuing conversation only prefills the
//! new turn.

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info};

use crate::serving::{FinishReason, Message, ServingContext, Session, Terminal};

use super::backend::{BackendContext, BackendError, ModelBackend};
use super::ModelEngine;

#[derive(Debug, Clone)]
pub struct TokenLmOptions {
    /// When fewer than this many cache positions remain, the context is
    /// discarded and rebuilt (losing the token-level prefix; the
    /// message-level diff still holds).
    pub kv_reset_margin: u32,
    /// Generation budget when the request does not carry `max_tokens`.
    pub default_max_tokens: u32,
}

impl Default for TokenLmOptions {
    fn default() -> Self {
        Self {
            kv_reset_margin: 256,
            default_max_tokens: 512,
        }
    }
}

/// Session-private execution state stored in the session's cache slot.
struct ModelContext<C> {
    ctx: C,
    /// Tokens committed to the cache so far.
    n_past: u32,
    /// Whether the first prefill has happened.
    initialized: bool,
}

#[derive(Debug, Error)]
enum ServeError {
    #[error("no session attached to request")]
    MissingSession,

    #[error("raw-mode request has no prompt")]
    MissingPrompt,

    #[error(transparent)]
    Backend(#[from] BackendError),
}

pub struct TokenLmEngine<B: ModelBackend> {
    backend: B,
    opts: TokenLmOptions,
}

impl<B: ModelBackend> TokenLmEngine<B> {
    pub fn new(backend: B, opts: TokenLmOptions) -> Self {
        Self { backend, opts }
    }

    fn serve(&self, ctx: &ServingContext) -> Result<FinishReason, ServeError> {
        let session = ctx.session().ok_or(ServeError::MissingSession)?;
        if ctx.is_cancelled() {
            return Ok(FinishReason::Cancelled);
        }

        // Take ownership of the session's cache for the duration of this
        // execution. The epoch lets a concurrent history reset invalidate
        // the copy we hold.
        let (slot, epoch) = session.take_cache();
        let mut mc: ModelContext<B::Ctx> = match slot
            .and_then(|b| b.downcast::<ModelContext<B::Ctx>>().ok())
        {
            Some(boxed) => *boxed,
            None => ModelContext {
                ctx: self.backend.new_context()?,
                n_past: 0,
                initialized: false,
            },
        };

        let result = self.drive(ctx, session, &mut mc);

        // A failed decode leaves the cache in an unknown state; everything
        // else may be reused by the next turn.
        let cache_intact = !matches!(
            result,
            Err(ServeError::Backend(BackendError::Decode { .. }))
        );
        if cache_intact {
            session.restore_cache(Box::new(mc), epoch);
        }
        result
    }

    fn drive(
        &self,
        ctx: &ServingContext,
        session: &Arc<Session>,
        mc: &mut ModelContext<B::Ctx>,
    ) -> Result<FinishReason, ServeError> {
        // Recreate the context when it is close to capacity. The prefix
        // cache is lost; the next prefill replays the whole history.
        if mc.initialized
            && mc.n_past.saturating_add(self.opts.kv_reset_margin) >= mc.ctx.capacity()
        {
            info!(
                session_id = %ctx.session_id,
                n_past = mc.n_past,
                capacity = mc.ctx.capacity(),
                "token cache near capacity; recreating context"
            );
            *mc = ModelContext {
                ctx: self.backend.new_context()?,
                n_past: 0,
                initialized: false,
            };
        }

        let prompt = if ctx.chat {
            let history = session.history_snapshot();
            self.delta_prompt(&history, &ctx.messages, mc.n_past)?
        } else {
            ctx.raw_prompt.clone().ok_or(ServeError::MissingPrompt)?
        };

        if ctx.is_cancelled() {
            return Ok(FinishReason::Cancelled);
        }

        // "Add special" tokens only on the very first prefill of a context.
        let add_special = mc.n_past == 0;
        let tokens = self.backend.tokenize(&prompt, add_special)?;
        ctx.add_prompt_tokens(tokens.len() as u64);
        debug!(
            request_id = %ctx.request_id,
            prompt_tokens = tokens.len(),
            n_past = mc.n_past,
            "prefill"
        );

        if ctx.is_cancelled() {
            return Ok(FinishReason::Cancelled);
        }
        if !tokens.is_empty() {
            mc.ctx.decode(&tokens, mc.n_past)?;
            mc.n_past += tokens.len() as u32;
        }
        mc.initialized = true;

        let budget = ctx
            .params
            .max_new_tokens
            .unwrap_or(self.opts.default_max_tokens);

        for _ in 0..budget {
            if ctx.is_cancelled() {
                return Ok(FinishReason::Cancelled);
            }

            let token = mc.ctx.sample();
            mc.ctx.accept(token);
            if self.backend.token_is_eog(token) {
                return Ok(FinishReason::Stop);
            }

            mc.ctx.decode(&[token], mc.n_past)?;
            mc.n_past += 1;
            ctx.add_completion_tokens(1);

            let piece = self.backend.token_bytes(token)?;
            if ctx.is_cancelled() {
                return Ok(FinishReason::Cancelled);
            }
            if !piece.is_empty() {
                ctx.emit_delta(&piece);
            }
        }

        Ok(FinishReason::Length)
    }

    /// The prompt that extends the cache: the template suffix between the
    /// committed history and history-plus-delta. A fresh context (`n_past ==
    /// 0`) replays the full rendering instead.
    fn delta_prompt(
        &self,
        history: &[Message],
        delta: &[Message],
        n_past: u32,
    ) -> Result<String, ServeError> {
        let mut all = Vec::with_capacity(history.len() + delta.len());
        all.extend_from_slice(history);
        all.extend_from_slice(delta);
        let full = self.backend.chat_template(&all)?;

        if n_past == 0 || history.is_empty() {
            return Ok(full);
        }

        let committed = self.backend.chat_template(history)?;
        let mut common = committed
            .as_bytes()
            .iter()
            .zip(full.as_bytes())
            .take_while(|(a, b)| a == b)
            .count();
        while !full.is_char_boundary(common) {
            common -= 1;
        }
        Ok(full[common..].to_owned())
    }
}

impl<B: ModelBackend> ModelEngine for TokenLmEngine<B> {
    fn run(&self, ctx: Arc<ServingContext>) {
        match self.serve(&ctx) {
            Ok(reason) => ctx.emit_finish(Terminal::new(reason)),
            Err(e) => ctx.finish_error(e.to_string()),
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    use crate::serving::GenParams;

    use super::super::backend::TokenId;
    use super::*;

    const EOG: TokenId = -1;

    /// Backend that tokenizes per byte and replays a scripted token
    /// sequence, recording every prompt it is asked to tokenize.
    struct ScriptedBackend {
        script: Vec<TokenId>,
        capacity: u32,
        prompts: Mutex<Vec<String>>,
        contexts_created: AtomicU32,
    }

    impl ScriptedBackend {
        fn new(script: Vec<TokenId>, capacity: u32) -> Self {
            Self {
                script,
                capacity,
                prompts: Mutex::new(Vec::new()),
                contexts_created: AtomicU32::new(0),
            }
        }

        fn prompts(&self) -> Vec<String> {
            self.prompts.lock().unwrap().clone()
        }
    }

    struct ScriptedCtx {
        capacity: u32,
        script: Vec<TokenId>,
        next: usize,
    }

    impl BackendContext for ScriptedCtx {
        fn capacity(&self) -> u32 {
            self.capacity
        }

        fn decode(&mut self, _tokens: &[TokenId], _n_past: u32) -> Result<(), BackendError> {
            Ok(())
        }

        fn sample(&mut self) -> TokenId {
            let t = self.script.get(self.next).copied().unwrap_or(EOG);
            self.next += 1;
            t
        }

        fn accept(&mut self, _token: TokenId) {}
    }

    impl ModelBackend for Arc<ScriptedBackend> {
        type Ctx = ScriptedCtx;

        fn new_context(&self) -> Result<ScriptedCtx, BackendError> {
            self.contexts_created.fetch_add(1, Ordering::SeqCst);
            Ok(ScriptedCtx {
                capacity: self.capacity,
                script: self.script.clone(),
                next: 0,
            })
        }

        fn chat_template(&self, messages: &[Message]) -> Result<String, BackendError> {
            let mut out = String::new();
            for m in messages {
                out.push_str(&m.role);
                out.push_str(": ");
                out.push_str(&m.content);
                out.push('\n');
            }
            Ok(out)
        }

        fn tokenize(&self, text: &str, add_special: bool) -> Result<Vec<TokenId>, BackendError> {
            self.prompts.lock().unwrap().push(text.to_owned());
            let mut tokens: Vec<TokenId> = text.bytes().map(TokenId::from).collect();
            if add_special {
                tokens.insert(0, 1); // BOS stand-in
            }
            Ok(tokens)
        }

        fn token_is_eog(&self, token: TokenId) -> bool {
            token == EOG
        }

        fn token_bytes(&self, token: TokenId) -> Result<Vec<u8>, BackendError> {
            Ok(vec![u8::try_from(token).unwrap_or(b'?')])
        }
    }

    fn chat_ctx(session: &Arc<Session>, messages: Vec<Message>) -> Arc<ServingContext> {
        ServingContext::builder("req-t", "scripted")
            .session_id(session.id())
            .session(Arc::clone(session))
            .messages(messages)
            .build()
    }

    fn build_session(model: &str) -> (Arc<crate::serving::ServingRoot>, Arc<Session>) {
        let root = crate::serving::ServingRoot::new(Default::default()).expect("root");
        let session = root.sessions().get_or_create("s-1", model);
        (root, session)
    }

    #[tokio::test]
    async fn stop_on_eog_and_usage_counted() {
        let backend = Arc::new(ScriptedBackend::new(vec![b'o'.into(), b'k'.into(), EOG], 4096));
        let engine = TokenLmEngine::new(Arc::clone(&backend), TokenLmOptions::default());
        let (_root, session) = build_session("scripted");

        let ctx = chat_ctx(&session, vec![Message::new("user", "hi")]);
        engine.run(Arc::clone(&ctx));

        let terminal = ctx.finished().await;
        assert_eq!(terminal.reason, FinishReason::Stop);
        assert_eq!(ctx.accumulated_text(), "ok");
        let usage = ctx.usage();
        // "user: hi\n" is 9 bytes plus the BOS stand-in.
        assert_eq!(usage.prompt_tokens, 10);
        assert_eq!(usage.completion_tokens, 2);
        assert_eq!(usage.total_tokens, 12);
    }

    #[tokio::test]
    async fn budget_exhaustion_is_length() {
        let backend = Arc::new(ScriptedBackend::new(
            vec![b'a'.into(), b'b'.into(), b'c'.into(), b'd'.into()],
            4096,
        ));
        let engine = TokenLmEngine::new(Arc::clone(&backend), TokenLmOptions::default());
        let (_root, session) = build_session("scripted");

        let ctx = ServingContext::builder("req-t", "scripted")
            .session_id(session.id())
            .session(Arc::clone(&session))
            .messages(vec![Message::new("user", "go")])
            .params(GenParams {
                max_new_tokens: Some(3),
                ..GenParams::default()
            })
            .build();
        engine.run(Arc::clone(&ctx));

        let terminal = ctx.finished().await;
        assert_eq!(terminal.reason, FinishReason::Length);
        assert_eq!(ctx.usage().completion_tokens, 3);
        assert_eq!(ctx.accumulated_text(), "abc");
    }

    #[tokio::test]
    async fn second_turn_prefills_only_the_suffix() {
        let backend = Arc::new(ScriptedBackend::new(vec![EOG], 4096));
        let engine = TokenLmEngine::new(Arc::clone(&backend), TokenLmOptions::default());
        let (_root, session) = build_session("scripted");

        // Turn 1: full prompt.
        let turn1 = vec![Message::new("user", "A")];
        let delta1 = session.apply_incoming("scripted", &turn1);
        let ctx1 = chat_ctx(&session, delta1);
        engine.run(Arc::clone(&ctx1));
        ctx1.finished().await;
        session.commit_turn(turn1.clone(), "X".to_owned());

        // Turn 2: history is a prefix; the engine must see only the suffix.
        let turn2 = vec![
            Message::new("user", "A"),
            Message::new("assistant", "X"),
            Message::new("user", "B"),
        ];
        let delta2 = session.apply_incoming("scripted", &turn2);
        assert_eq!(delta2, vec![Message::new("user", "B")]);
        let ctx2 = chat_ctx(&session, delta2);
        engine.run(Arc::clone(&ctx2));
        ctx2.finished().await;

        let prompts = backend.prompts();
        assert_eq!(prompts.len(), 2);
        assert_eq!(prompts[0], "user: A\n");
        assert_eq!(prompts[1], "user: B\n");
    }

    #[tokio::test]
    async fn near_capacity_context_is_recreated() {
        // Capacity 300 with margin 256: a context that decoded ~50 tokens
        // is already inside the margin and must be rebuilt.
        let backend = Arc::new(ScriptedBackend::new(vec![EOG], 300));
        let engine = TokenLmEngine::new(Arc::clone(&backend), TokenLmOptions::default());
        let (_root, session) = build_session("scripted");

        let turn1 = vec![Message::new("user", &"x".repeat(60)[..])];
        let delta1 = session.apply_incoming("scripted", &turn1);
        let ctx1 = chat_ctx(&session, delta1);
        engine.run(Arc::clone(&ctx1));
        ctx1.finished().await;
        session.commit_turn(turn1.clone(), String::new());
        assert_eq!(backend.contexts_created.load(Ordering::SeqCst), 1);

        let mut turn2 = turn1.clone();
        turn2.push(Message::new("assistant", ""));
        turn2.push(Message::new("user", "more"));
        let delta2 = session.apply_incoming("scripted", &turn2);
        let ctx2 = chat_ctx(&session, delta2);
        engine.run(Arc::clone(&ctx2));
        ctx2.finished().await;

        assert_eq!(
            backend.contexts_created.load(Ordering::SeqCst),
            2,
            "second turn should have rebuilt the near-full context"
        );
        // A rebuilt context replays the full history, not just the suffix.
        let prompts = backend.prompts();
        assert!(prompts[1].starts_with("user: x"));
    }

    #[tokio::test]
    async fn missing_session_is_an_engine_error() {
        let backend = Arc::new(ScriptedBackend::new(vec![EOG], 4096));
        let engine = TokenLmEngine::new(backend, TokenLmOptions::default());

        let ctx = ServingContext::builder("req-t", "scripted")
            .messages(vec![Message::new("user", "hi")])
            .build();
        engine.run(Arc::clone(&ctx));

        let terminal = ctx.finished().await;
        assert_eq!(terminal.reason, FinishReason::Error);
        assert!(terminal.error_message.unwrap().contains("session"));
    }

    #[tokio::test]
    async fn cancelled_before_start_emits_cancelled() {
        let backend = Arc::new(ScriptedBackend::new(vec![b'a'.into(); 100], 4096));
        let engine = TokenLmEngine::new(backend, TokenLmOptions::default());
        let (_root, session) = build_session("scripted");

        let ctx = chat_ctx(&session, vec![Message::new("user", "hi")]);
        ctx.cancel();
        engine.run(Arc::clone(&ctx));

        let terminal = ctx.finished().await;
        assert_eq!(terminal.reason, FinishReason::Cancelled);
        assert_eq!(ctx.accumulated_text(), "");
    }
}

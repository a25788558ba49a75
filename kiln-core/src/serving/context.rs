//! Per-request serving state and the finish/cancel/streaming contract.
//!
//! A [`ServingContext`] is built by the gateway, handed through the
//! scheduler, and consumed by exactly one engine execution. Three rules hold
//! regardless of who is calling:
//!
//! - `emit_finish` transitions the context to finished exactly once; losers
//!   of the race are no-ops.
//! - `emit_delta` is a no-op once the context is finished.
//! - On the winning finish, the order is: finished flag → terminal stream
//!   chunk → finish listener → terminal value (wakes waiters).

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, watch};

use super::session::Session;
use super::types::{ErrorCode, FinishReason, GenParams, Message, StreamChunk, Terminal, Usage};

/// Lock that survives a panicking engine thread: a poisoned serving context
/// must still be able to report its terminal state.
fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

// ── Delta sink ────────────────────────────────────────────────────────────────

/// Typed destination for a request's stream chunks.
#[derive(Debug, Clone)]
pub enum ChunkSink {
    /// Discard chunks (non-streaming requests, warmup).
    Null,
    /// Forward chunks into a bounded channel drained by the HTTP layer.
    Channel(mpsc::Sender<StreamChunk>),
}

impl ChunkSink {
    fn deliver(&self, chunk: StreamChunk) {
        let tx = match self {
            ChunkSink::Null => return,
            ChunkSink::Channel(tx) => tx,
        };
        match tx.try_send(chunk) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(chunk)) => {
                // Engine worker threads run outside the runtime and may block
                // until the consumer catches up. Async callers only ever
                // deliver a terminal chunk into an empty channel, so a full
                // inbox cannot occur on that path.
                if tokio::runtime::Handle::try_current().is_err() {
                    let _ = tx.blocking_send(chunk);
                }
            }
            // Receiver dropped: the client is gone and cancellation is
            // already on its way via the disconnect guard.
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }
}

/// Observer invoked exactly once, after the terminal chunk, with the final
/// state of the request. The gateway uses this to commit session history and
/// record metrics.
pub trait FinishListener: Send + Sync {
    fn on_finish(&self, ctx: &ServingContext, terminal: &Terminal);
}

// ── One-shot finish signal ────────────────────────────────────────────────────

/// Atomic finish flag plus a watch channel carrying the read-once terminal
/// value. Waiters never observe the flag without being able to read the
/// reason.
struct FinishSignal {
    finished: AtomicBool,
    terminal: watch::Sender<Option<Terminal>>,
}

impl FinishSignal {
    fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self {
            finished: AtomicBool::new(false),
            terminal: tx,
        }
    }

    /// Returns `true` for the single caller that wins the transition.
    /// Deltas are rejected from this moment on; waiters wake only at
    /// [`FinishSignal::publish`].
    fn try_claim(&self) -> bool {
        self.finished
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn publish(&self, terminal: Terminal) {
        self.terminal.send_replace(Some(terminal));
    }

    fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    fn peek(&self) -> Option<Terminal> {
        self.terminal.borrow().clone()
    }

    fn subscribe(&self) -> watch::Receiver<Option<Terminal>> {
        self.terminal.subscribe()
    }
}

// ── Serving context ───────────────────────────────────────────────────────────

/// Everything the scheduler and an engine need to run one request.
pub struct ServingContext {
    pub request_id: String,
    pub session_id: String,
    pub model: String,
    /// Chat mode (`messages`) vs raw-prompt mode (`raw_prompt`).
    pub chat: bool,
    pub stream: bool,
    /// Post-diff message list: only the turns the engine has not seen yet.
    pub messages: Vec<Message>,
    pub raw_prompt: Option<String>,
    pub params: GenParams,

    session: Option<Arc<Session>>,
    accepted_at: Instant,
    cancelled: AtomicBool,
    finish: FinishSignal,
    sink: ChunkSink,
    listener: Mutex<Option<Box<dyn FinishListener>>>,
    buffer: Mutex<Vec<u8>>,
    prompt_tokens: AtomicU64,
    completion_tokens: AtomicU64,
}

impl ServingContext {
    pub fn builder(request_id: impl Into<String>, model: impl Into<String>) -> ContextBuilder {
        ContextBuilder::new(request_id, model)
    }

    /// The session this request executes against, if any. Engines fail the
    /// request when the session is missing in chat mode.
    pub fn session(&self) -> Option<&Arc<Session>> {
        self.session.as_ref()
    }

    /// When the scheduler accepted this request; the queue-wait deadline is
    /// measured from here.
    pub fn accepted_at(&self) -> Instant {
        self.accepted_at
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    pub fn is_finished(&self) -> bool {
        self.finish.is_finished()
    }

    /// Terminal state, if the request already finished.
    pub fn terminal(&self) -> Option<Terminal> {
        self.finish.peek()
    }

    /// One-way cancellation: sets the flag and finishes with `Cancelled`
    /// (a no-op if something else finished first).
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        self.emit_finish(Terminal::new(FinishReason::Cancelled));
    }

    /// Append generated bytes and, in stream mode, forward them as a delta
    /// chunk. No-op once finished.
    pub fn emit_delta(&self, bytes: &[u8]) {
        if bytes.is_empty() || self.is_finished() {
            return;
        }
        lock(&self.buffer).extend_from_slice(bytes);
        if self.stream {
            self.sink.deliver(StreamChunk::Delta(bytes.to_vec()));
        }
    }

    /// Terminate the request. The first caller wins; everyone else is a
    /// no-op.
    ///
    /// Order on the winning path: finished flag, terminal stream chunk,
    /// finish listener, then the terminal value that wakes waiters. Waking
    /// last guarantees that anyone returning from [`Self::finished`] (the
    /// non-stream gateway, the scheduler lanes) observes the session
    /// history the listener committed.
    pub fn emit_finish(&self, terminal: Terminal) {
        if !self.finish.try_claim() {
            return;
        }
        if self.stream {
            self.sink.deliver(StreamChunk::Finished(terminal.clone()));
        }
        if let Some(listener) = lock(&self.listener).take() {
            listener.on_finish(self, &terminal);
        }
        self.finish.publish(terminal);
    }

    /// Finish with an overload error (`queue full` / queue-wait timeout).
    pub fn finish_overloaded(&self, message: impl Into<String>) {
        self.emit_finish(Terminal::error(message, Some(ErrorCode::Overloaded)));
    }

    /// Finish with a plain engine error.
    pub fn finish_error(&self, message: impl Into<String>) {
        self.emit_finish(Terminal::error(message, None));
    }

    /// Wait until the request finishes.
    pub async fn finished(&self) -> Terminal {
        let mut rx = self.finish.subscribe();
        loop {
            if let Some(t) = rx.borrow_and_update().clone() {
                return t;
            }
            if rx.changed().await.is_err() {
                // The sender lives in `self`, so the channel cannot close
                // while a caller still borrows the context.
                return Terminal::new(FinishReason::Cancelled);
            }
        }
    }

    /// Wait until the request finishes, polling `alive` every
    /// `poll_interval`. When `alive` reports false the request is cancelled
    /// and the resulting terminal state returned.
    pub async fn wait_finish_or_cancel(
        &self,
        alive: impl Fn() -> bool,
        poll_interval: Duration,
    ) -> Terminal {
        let mut rx = self.finish.subscribe();
        loop {
            if let Some(t) = rx.borrow_and_update().clone() {
                return t;
            }
            if !alive() {
                self.cancel();
                continue;
            }
            let _ = tokio::time::timeout(poll_interval, rx.changed()).await;
        }
    }

    pub fn add_prompt_tokens(&self, n: u64) {
        self.prompt_tokens.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_completion_tokens(&self, n: u64) {
        self.completion_tokens.fetch_add(n, Ordering::Relaxed);
    }

    pub fn usage(&self) -> Usage {
        let prompt = self.prompt_tokens.load(Ordering::Relaxed);
        let completion = self.completion_tokens.load(Ordering::Relaxed);
        Usage {
            prompt_tokens: prompt,
            completion_tokens: completion,
            total_tokens: prompt + completion,
        }
    }

    /// Everything emitted so far, lossily decoded. Safe to call at any time;
    /// the terminal consumer calls it after `on_finish`.
    pub fn accumulated_text(&self) -> String {
        String::from_utf8_lossy(&lock(&self.buffer)).into_owned()
    }
}

impl std::fmt::Debug for ServingContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServingContext")
            .field("request_id", &self.request_id)
            .field("session_id", &self.session_id)
            .field("model", &self.model)
            .field("stream", &self.stream)
            .field("cancelled", &self.is_cancelled())
            .field("finished", &self.is_finished())
            .finish()
    }
}

// ── Builder ───────────────────────────────────────────────────────────────────

/// Builder for [`ServingContext`]; only identity and model are mandatory.
pub struct ContextBuilder {
    request_id: String,
    session_id: Option<String>,
    model: String,
    chat: bool,
    stream: bool,
    messages: Vec<Message>,
    raw_prompt: Option<String>,
    params: GenParams,
    session: Option<Arc<Session>>,
    sink: ChunkSink,
    listener: Option<Box<dyn FinishListener>>,
}

impl ContextBuilder {
    fn new(request_id: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            session_id: None,
            model: model.into(),
            chat: true,
            stream: false,
            messages: Vec::new(),
            raw_prompt: None,
            params: GenParams::default(),
            session: None,
            sink: ChunkSink::Null,
            listener: None,
        }
    }

    pub fn session_id(mut self, id: impl Into<String>) -> Self {
        self.session_id = Some(id.into());
        self
    }

    pub fn stream(mut self, stream: bool) -> Self {
        self.stream = stream;
        self
    }

    pub fn messages(mut self, messages: Vec<Message>) -> Self {
        self.chat = true;
        self.messages = messages;
        self
    }

    pub fn raw_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.chat = false;
        self.raw_prompt = Some(prompt.into());
        self
    }

    pub fn params(mut self, params: GenParams) -> Self {
        self.params = params;
        self
    }

    pub fn session(mut self, session: Arc<Session>) -> Self {
        self.session = Some(session);
        self
    }

    pub fn sink(mut self, sink: ChunkSink) -> Self {
        self.sink = sink;
        self
    }

    pub fn listener(mut self, listener: Box<dyn FinishListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    pub fn build(self) -> Arc<ServingContext> {
        let session_id = self
            .session_id
            .unwrap_or_else(|| self.request_id.clone());
        Arc::new(ServingContext {
            request_id: self.request_id,
            session_id,
            model: self.model,
            chat: self.chat,
            stream: self.stream,
            messages: self.messages,
            raw_prompt: self.raw_prompt,
            params: self.params,
            session: self.session,
            accepted_at: Instant::now(),
            cancelled: AtomicBool::new(false),
            finish: FinishSignal::new(),
            sink: self.sink,
            listener: Mutex::new(self.listener),
            buffer: Mutex::new(Vec::new()),
            prompt_tokens: AtomicU64::new(0),
            completion_tokens: AtomicU64::new(0),
        })
    }
}

//! OpenAI-compatible chat-completion route – the gateway into the serving
//! pipeline.
//!
//! The handler validates, builds the [`ServingContext`], performs the
//! conversational auto-diff against the session, wires the typed callbacks
//! and submits through the scheduler. Non-streaming requests wait on the
//! context's finish signal; streaming requests return an SSE response fed
//! by the context's chunk channel. SSE headers only go out once the
//! scheduler accepted the submission, so a queue-full rejection is still a
//! plain JSON 429.

use std::convert::Infallible;
use std::sync::{Arc, Weak};
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::State;
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use chrono::Utc;
use futures::StreamExt;
use kiln_core::serving::{
    ChunkSink, FinishListener, FinishReason, GenParams, Message, ServingContext, Session,
    StreamChunk, SubmitError, Terminal,
};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info};
use utoipa::OpenApi;

use crate::error::ServerError;
use crate::metrics::Metrics;
use crate::schemas::v1::chat::{
    ChatChoice, ChatCompletionRequest, ChatCompletionResponse, ChatMessage, UsageBody,
};
use crate::sse::StreamWriter;
use crate::state::AppState;

/// Liveness poll interval for non-streaming waiters.
const WAIT_POLL: Duration = Duration::from_millis(100);

/// Chunk-channel depth between an engine and the SSE drain. Deep enough to
/// ride out consumer hiccups, small enough that a stalled client throttles
/// the engine instead of buffering unboundedly.
const STREAM_CHANNEL_DEPTH: usize = 64;

#[derive(OpenApi)]
#[openapi(
    paths(chat_completions),
    components(schemas(
        ChatCompletionRequest,
        ChatCompletionResponse,
        ChatMessage,
        ChatChoice,
        UsageBody
    ))
)]
pub struct ChatApi;

/// Register chat-completion routes.
pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/chat/completions", post(chat_completions))
}

// ── Typed callbacks ───────────────────────────────────────────────────────────

/// Commits the turn into session history on a successful finish and records
/// request metrics. Runs exactly once, after all deltas.
struct CommitListener {
    session: Arc<Session>,
    /// The client's full incoming message list (pre-diff).
    client_messages: Vec<Message>,
    metrics: Arc<Metrics>,
}

impl FinishListener for CommitListener {
    fn on_finish(&self, ctx: &ServingContext, terminal: &Terminal) {
        // Cancelled or failed turns leave the history untouched.
        if matches!(terminal.reason, FinishReason::Stop | FinishReason::Length) {
            self.session
                .commit_turn(self.client_messages.clone(), ctx.accumulated_text());
        }
        let latency = ctx.accepted_at().elapsed();
        self.metrics.record_finish(terminal.reason, latency);

        let usage = ctx.usage();
        info!(
            request_id = %ctx.request_id,
            session_id = %ctx.session_id,
            reason = terminal.reason.as_str(),
            latency_ms = latency.as_millis() as u64,
            prompt_tokens = usage.prompt_tokens,
            completion_tokens = usage.completion_tokens,
            "request finished"
        );
    }
}

/// Cancels the request when the transport goes away. Holds a weak
/// reference so an abandoned response can never keep the context alive
/// past its natural end; after a normal finish the cancel is a no-op.
struct DisconnectGuard {
    ctx: Weak<ServingContext>,
}

impl Drop for DisconnectGuard {
    fn drop(&mut self) {
        if let Some(ctx) = self.ctx.upgrade() {
            if !ctx.is_finished() {
                info!(request_id = %ctx.request_id, "client went away; cancelling");
                ctx.cancel();
            }
        }
    }
}

// ── Handler ───────────────────────────────────────────────────────────────────

/// OpenAI chat completions (`POST /v1/chat/completions`).
///
/// `stream: true` switches the response to SSE chunks. `session_id` binds
/// the conversation to server-side state so subsequent turns only prefill
/// the new messages.
#[utoipa::path(
    post,
    path = "/v1/chat/completions",
    tag = "chat",
    request_body = ChatCompletionRequest,
    responses(
        (status = 200, description = "Completion generated", body = ChatCompletionResponse),
        (status = 400, description = "Invalid request"),
        (status = 429, description = "Queues saturated"),
        (status = 500, description = "Engine error"),
    )
)]
pub async fn chat_completions(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Response, ServerError> {
    let req: ChatCompletionRequest = serde_json::from_slice(&body)
        .map_err(|_| ServerError::bad_request("invalid json", "invalid_json"))?;
    validate(&req)?;

    let model = req
        .model
        .clone()
        .unwrap_or_else(|| state.config.default_model.clone());
    let request_id = state.root.next_request_id();
    let session_id = req
        .session_id
        .clone()
        .unwrap_or_else(|| request_id.clone());

    let incoming: Vec<Message> = req
        .messages
        .iter()
        .map(|m| Message::new(m.role.clone(), m.content.clone()))
        .collect();

    let session = state.root.sessions().get_or_create(&session_id, &model);
    let delta = session.apply_incoming(&model, &incoming);
    debug!(
        request_id = %request_id,
        session_id = %session_id,
        incoming = incoming.len(),
        delta = delta.len(),
        history = session.history_snapshot().len(),
        "auto-diff"
    );

    let params = GenParams {
        max_new_tokens: req.max_tokens,
        extra: req
            .extra
            .iter()
            .map(|(k, v)| (k.clone(), stringify_param(v)))
            .collect(),
    };

    let listener = Box::new(CommitListener {
        session: Arc::clone(&session),
        client_messages: incoming,
        metrics: Arc::clone(&state.metrics),
    });

    state.metrics.record_accept(req.stream);

    if req.stream {
        serve_streaming(
            &state, request_id, session_id, model, session, delta, params, listener,
        )
    } else {
        serve_blocking(
            &state, request_id, session_id, model, session, delta, params, listener,
        )
        .await
    }
}

fn validate(req: &ChatCompletionRequest) -> Result<(), ServerError> {
    if req.messages.is_empty() {
        return Err(ServerError::bad_param(
            "messages must be a non-empty array",
            "invalid_messages",
            "messages",
        ));
    }
    if req.messages.iter().any(|m| m.role.is_empty()) {
        return Err(ServerError::bad_param(
            "every message needs a role",
            "invalid_messages",
            "messages",
        ));
    }
    if req.max_tokens == Some(0) {
        return Err(ServerError::bad_param(
            "max_tokens must be a positive integer",
            "invalid_max_tokens",
            "max_tokens",
        ));
    }
    Ok(())
}

fn stringify_param(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn map_submit_error(e: SubmitError) -> ServerError {
    match e {
        SubmitError::SessionQueueFull { .. } | SubmitError::ModelQueueFull { .. } => {
            ServerError::overloaded(e.to_string())
        }
        SubmitError::SessionClosed { .. } | SubmitError::NoSession => {
            ServerError::internal(e.to_string())
        }
    }
}

// ── Non-streaming ─────────────────────────────────────────────────────────────

#[allow(clippy::too_many_arguments)]
async fn serve_blocking(
    state: &Arc<AppState>,
    request_id: String,
    session_id: String,
    model: String,
    session: Arc<Session>,
    delta: Vec<Message>,
    params: GenParams,
    listener: Box<CommitListener>,
) -> Result<Response, ServerError> {
    let ctx = ServingContext::builder(request_id.as_str(), model.as_str())
        .session_id(session_id.as_str())
        .session(session)
        .messages(delta)
        .params(params)
        .listener(listener)
        .build();

    if let Err(e) = state.root.submit(Arc::clone(&ctx)) {
        state.metrics.record_rejected();
        return Err(map_submit_error(e));
    }

    // If the handler future is dropped (client hung up), the guard cancels
    // the in-flight execution.
    let _guard = DisconnectGuard {
        ctx: Arc::downgrade(&ctx),
    };

    // axum exposes no is-alive probe on a pending response; a disconnect
    // drops this future, which fires the guard above. The predicate is
    // therefore constant here and the poll only bounds the wait latency.
    let terminal = ctx.wait_finish_or_cancel(|| true, WAIT_POLL).await;

    if terminal.reason == FinishReason::Error {
        let message = terminal
            .error_message
            .clone()
            .unwrap_or_else(|| "engine error".to_owned());
        if terminal.is_overloaded() || message.contains("queue full") {
            return Err(ServerError::overloaded(message));
        }
        return Err(ServerError::internal(message));
    }

    let usage = ctx.usage();
    let response = ChatCompletionResponse {
        id: format!("chatcmpl-{request_id}"),
        object: "chat.completion".to_owned(),
        created: Utc::now().timestamp(),
        model,
        choices: vec![ChatChoice {
            index: 0,
            message: ChatMessage {
                role: "assistant".to_owned(),
                content: ctx.accumulated_text(),
            },
            logprobs: None,
            finish_reason: terminal.reason.as_str().to_owned(),
        }],
        usage: UsageBody {
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
            total_tokens: usage.total_tokens,
        },
    };
    Ok(Json(response).into_response())
}

// ── Streaming ─────────────────────────────────────────────────────────────────

#[allow(clippy::too_many_arguments)]
fn serve_streaming(
    state: &Arc<AppState>,
    request_id: String,
    session_id: String,
    model: String,
    session: Arc<Session>,
    delta: Vec<Message>,
    params: GenParams,
    listener: Box<CommitListener>,
) -> Result<Response, ServerError> {
    let (tx, rx) = mpsc::channel::<StreamChunk>(STREAM_CHANNEL_DEPTH);

    let ctx = ServingContext::builder(request_id.as_str(), model.as_str())
        .session_id(session_id.as_str())
        .session(session)
        .messages(delta)
        .params(params)
        .stream(true)
        .sink(ChunkSink::Channel(tx))
        .listener(listener)
        .build();

    // Rejected before headers: the client still gets a JSON 429. Overload
    // after this point (model queue, queue-wait) arrives as a terminal
    // error chunk on the open stream instead.
    if let Err(e) = state.root.submit(Arc::clone(&ctx)) {
        state.metrics.record_rejected();
        return Err(map_submit_error(e));
    }

    let writer = StreamWriter::new(request_id.as_str(), model.as_str());
    let guard = DisconnectGuard {
        ctx: Arc::downgrade(&ctx),
    };

    Ok(Sse::new(chunk_events(rx, writer, guard)).into_response())
}

/// Adapt the chunk channel into SSE events. The writer state and the
/// disconnect guard live inside the stream: dropping the response (client
/// disconnect) drops the guard, which cancels the execution.
fn chunk_events(
    rx: mpsc::Receiver<StreamChunk>,
    writer: StreamWriter,
    guard: DisconnectGuard,
) -> impl futures::Stream<Item = Result<Event, Infallible>> {
    ReceiverStream::new(rx)
        .scan((writer, guard, false), |(writer, _guard, done), chunk| {
            if *done {
                return std::future::ready(None);
            }
            if matches!(chunk, StreamChunk::Finished(_)) {
                *done = true;
            }
            std::future::ready(Some(futures::stream::iter(writer.render(&chunk))))
        })
        .flatten()
        .map(|payload| Ok(Event::default().data(payload)))
}

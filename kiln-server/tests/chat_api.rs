//! End-to-end tests over the in-process router.
//!
//! Probe engines are registered directly on the serving root, so the full
//! path (validation, session auto-diff, scheduling, engine execution,
//! history commit, response shaping) is exercised without a socket.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

use kiln_core::engine::ModelEngine;
use kiln_core::serving::{FinishReason, Message, ServingContext, Terminal};
use kiln_server::config::Config;
use kiln_server::state::AppState;
use kiln_server::{build_root, build_state, routes};

// ── Harness ───────────────────────────────────────────────────────────────────

fn test_state(mutate: impl FnOnce(&mut Config)) -> Arc<AppState> {
    let mut cfg = Config::from_env();
    cfg.enable_swagger = false;
    mutate(&mut cfg);
    let root = build_root(&cfg).expect("root should start");
    build_state(cfg, root)
}

fn post_request(path: &str, body: &Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(path)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .expect("request builds")
}

async fn post_json(app: &Router, path: &str, body: Value) -> (StatusCode, Value) {
    let response = app
        .clone()
        .oneshot(post_request(path, &body))
        .await
        .expect("infallible");
    let status = response.status();
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("body collects")
        .to_bytes();
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}

/// Engine that records the (post-diff) message list of every invocation and
/// replies with a fixed string, honoring the token budget word-wise.
struct RecordingEngine {
    reply: String,
    seen: Mutex<Vec<Vec<Message>>>,
}

impl RecordingEngine {
    fn new(reply: &str) -> Arc<Self> {
        Arc::new(Self {
            reply: reply.to_owned(),
            seen: Mutex::new(Vec::new()),
        })
    }

    fn seen(&self) -> Vec<Vec<Message>> {
        self.seen.lock().unwrap().clone()
    }
}

impl ModelEngine for RecordingEngine {
    fn run(&self, ctx: Arc<ServingContext>) {
        self.seen.lock().unwrap().push(ctx.messages.clone());
        ctx.add_prompt_tokens(ctx.messages.len() as u64);

        let budget = ctx.params.max_new_tokens.map(u64::from).unwrap_or(u64::MAX);
        let mut emitted = 0u64;
        for piece in self.reply.split_inclusive(' ') {
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
        ctx.emit_finish(Terminal::new(FinishReason::Stop));
    }
}

/// Engine that sleeps before replying, to keep a model queue occupied.
struct SlowEngine {
    delay: Duration,
}

impl ModelEngine for SlowEngine {
    fn run(&self, ctx: Arc<ServingContext>) {
        std::thread::sleep(self.delay);
        ctx.emit_delta(b"done");
        ctx.add_completion_tokens(1);
        ctx.emit_finish(Terminal::new(FinishReason::Stop));
    }
}

fn sse_deltas(body: &str) -> (String, Option<String>) {
    let mut content = String::new();
    let mut finish = None;
    for frame in body.split("\n\n") {
        let Some(payload) = frame.trim().strip_prefix("data: ") else {
            continue;
        };
        if payload == "[DONE]" {
            continue;
        }
        let v: Value = serde_json::from_str(payload).expect("chunk is json");
        if let Some(c) = v["choices"][0]["delta"]["content"].as_str() {
            content.push_str(c);
        }
        if let Some(reason) = v["choices"][0]["finish_reason"].as_str() {
            finish = Some(reason.to_owned());
        }
    }
    (content, finish)
}

// ── Chat completions ──────────────────────────────────────────────────────────

#[tokio::test]
async fn single_turn_stop() {
    let state = test_state(|_| {});
    let engine = RecordingEngine::new("ok");
    state.root.engines().register_instance("probe", engine);
    let app = routes::build(Arc::clone(&state));

    let (status, body) = post_json(
        &app,
        "/v1/chat/completions",
        json!({
            "model": "probe",
            "messages": [{"role": "user", "content": "hi"}],
            "max_tokens": 16,
        }),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["object"], "chat.completion");
    assert!(body["id"].as_str().unwrap().starts_with("chatcmpl-req-"));
    assert_eq!(body["choices"][0]["message"]["content"], "ok");
    assert_eq!(body["choices"][0]["message"]["role"], "assistant");
    assert_eq!(body["choices"][0]["finish_reason"], "stop");
    assert!(body["choices"][0]["logprobs"].is_null());
    assert!(body["usage"]["completion_tokens"].as_u64().unwrap() > 0);
    assert_eq!(
        body["usage"]["total_tokens"].as_u64().unwrap(),
        body["usage"]["prompt_tokens"].as_u64().unwrap()
            + body["usage"]["completion_tokens"].as_u64().unwrap()
    );
}

#[tokio::test]
async fn two_turn_prefix_reuse() {
    let state = test_state(|_| {});
    let engine = RecordingEngine::new("X");
    state.root.engines().register_instance("probe", engine.clone());
    let app = routes::build(Arc::clone(&state));

    let (status, _) = post_json(
        &app,
        "/v1/chat/completions",
        json!({
            "model": "probe",
            "session_id": "conv-1",
            "messages": [{"role": "user", "content": "A"}],
        }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = post_json(
        &app,
        "/v1/chat/completions",
        json!({
            "model": "probe",
            "session_id": "conv-1",
            "messages": [
                {"role": "user", "content": "A"},
                {"role": "assistant", "content": "X"},
                {"role": "user", "content": "B"},
            ],
        }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let seen = engine.seen();
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[0], vec![Message::new("user", "A")]);
    assert_eq!(
        seen[1],
        vec![Message::new("user", "B")],
        "second invocation sees only the suffix"
    );

    let session = state.root.sessions().get("conv-1").expect("session lives");
    assert_eq!(
        session.history_snapshot(),
        vec![
            Message::new("user", "A"),
            Message::new("assistant", "X"),
            Message::new("user", "B"),
            Message::new("assistant", "X"),
        ]
    );
}

#[tokio::test]
async fn divergent_prefix_resets_session() {
    let state = test_state(|_| {});
    let engine = RecordingEngine::new("X");
    state.root.engines().register_instance("probe", engine.clone());
    let app = routes::build(Arc::clone(&state));

    post_json(
        &app,
        "/v1/chat/completions",
        json!({
            "model": "probe",
            "session_id": "conv-2",
            "messages": [{"role": "user", "content": "A"}],
        }),
    )
    .await;

    // Different first message: the prefix diverges.
    let (status, _) = post_json(
        &app,
        "/v1/chat/completions",
        json!({
            "model": "probe",
            "session_id": "conv-2",
            "messages": [{"role": "user", "content": "A'"}],
        }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let seen = engine.seen();
    assert_eq!(seen[1], vec![Message::new("user", "A'")], "full list after reset");

    let session = state.root.sessions().get("conv-2").expect("session lives");
    assert_eq!(
        session.history_snapshot(),
        vec![Message::new("user", "A'"), Message::new("assistant", "X")]
    );
}

#[tokio::test]
async fn length_cap_reports_length_and_commits_history() {
    let state = test_state(|_| {});
    let engine = RecordingEngine::new("one two three four five ");
    state.root.engines().register_instance("probe", engine);
    let app = routes::build(Arc::clone(&state));

    let (status, body) = post_json(
        &app,
        "/v1/chat/completions",
        json!({
            "model": "probe",
            "session_id": "conv-len",
            "messages": [{"role": "user", "content": "count forever"}],
            "max_tokens": 3,
        }),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["choices"][0]["finish_reason"], "length");
    assert_eq!(body["usage"]["completion_tokens"], 3);
    assert_eq!(body["choices"][0]["message"]["content"], "one two three ");

    let session = state.root.sessions().get("conv-len").expect("session");
    let history = session.history_snapshot();
    assert_eq!(history.len(), 2, "length-capped turn still commits");
    assert_eq!(history[1], Message::new("assistant", "one two three "));
}

#[tokio::test]
async fn streaming_emits_chunks_and_done() {
    let state = test_state(|_| {});
    let engine = RecordingEngine::new("str eam");
    state.root.engines().register_instance("probe", engine);
    let app = routes::build(Arc::clone(&state));

    let response = app
        .clone()
        .oneshot(post_request(
            "/v1/chat/completions",
            &json!({
                "model": "probe",
                "stream": true,
                "messages": [{"role": "user", "content": "hi"}],
            }),
        ))
        .await
        .expect("infallible");

    assert_eq!(response.status(), StatusCode::OK);
    let content_type = response
        .headers()
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_owned();
    assert!(content_type.starts_with("text/event-stream"));

    let bytes = response.into_body().collect().await.expect("body").to_bytes();
    let text = String::from_utf8(bytes.to_vec()).expect("utf8");
    assert!(text.contains("chat.completion.chunk"));
    assert!(text.trim_end().ends_with("data: [DONE]"));

    let (content, finish) = sse_deltas(&text);
    assert_eq!(content, "str eam");
    assert_eq!(finish.as_deref(), Some("stop"));
}

#[tokio::test]
async fn session_queue_overflow_returns_429_before_stream_start() {
    // Saturating the per-session pending queue is the one overload the
    // gateway sees synchronously, before SSE headers go out.
    let state = test_state(|cfg| {
        cfg.max_session_pending = 1;
        cfg.max_queue_wait_ms = 10_000;
    });
    state.root.engines().register_instance(
        "slow",
        Arc::new(SlowEngine {
            delay: Duration::from_millis(400),
        }),
    );
    let app = routes::build(Arc::clone(&state));

    let mk = || {
        app.clone().oneshot(post_request(
            "/v1/chat/completions",
            &json!({
                "model": "slow",
                "session_id": "busy-session",
                "stream": true,
                "messages": [{"role": "user", "content": "hi"}],
            }),
        ))
    };
    let (r1, r2, r3, r4) = tokio::join!(mk(), mk(), mk(), mk());

    let mut ok = 0;
    let mut rejected = 0;
    for response in [r1, r2, r3, r4] {
        let response = response.expect("infallible");
        match response.status() {
            StatusCode::OK => {
                let bytes = response.into_body().collect().await.expect("body").to_bytes();
                let text = String::from_utf8_lossy(&bytes).into_owned();
                assert!(text.contains("data: [DONE]"), "accepted stream completes");
                ok += 1;
            }
            StatusCode::TOO_MANY_REQUESTS => {
                let bytes = response.into_body().collect().await.expect("body").to_bytes();
                let body: Value = serde_json::from_slice(&bytes).expect("json error body");
                assert_eq!(body["error"]["type"], "rate_limit_error");
                assert_eq!(body["error"]["code"], "queue_full");
                rejected += 1;
            }
            other => panic!("unexpected status {other}"),
        }
    }
    assert!(rejected >= 1, "at least one request must be shed");
    assert!(ok >= 1, "accepted requests must complete");
    assert_eq!(ok + rejected, 4);
}

#[tokio::test]
async fn model_queue_overflow_surfaces_terminal_error_chunk() {
    // With distinct sessions, model-lane saturation is detected after the
    // stream is already open: the shed requests still answer 200 and carry
    // a terminal chunk with finish_reason "error" instead.
    let state = test_state(|cfg| {
        cfg.max_model_queue = 1;
        cfg.max_queue_wait_ms = 10_000;
    });
    state.root.engines().register_instance(
        "slow",
        Arc::new(SlowEngine {
            delay: Duration::from_millis(400),
        }),
    );
    let app = routes::build(Arc::clone(&state));

    let mk = || {
        app.clone().oneshot(post_request(
            "/v1/chat/completions",
            &json!({
                "model": "slow",
                "stream": true,
                "messages": [{"role": "user", "content": "hi"}],
            }),
        ))
    };
    let (r1, r2, r3, r4) = tokio::join!(mk(), mk(), mk(), mk());

    let mut stopped = 0;
    let mut shed = 0;
    for response in [r1, r2, r3, r4] {
        let response = response.expect("infallible");
        assert_eq!(
            response.status(),
            StatusCode::OK,
            "post-accept overload must not change the status line"
        );
        let bytes = response.into_body().collect().await.expect("body").to_bytes();
        let text = String::from_utf8_lossy(&bytes).into_owned();
        assert!(text.trim_end().ends_with("data: [DONE]"));

        let (_, finish) = sse_deltas(&text);
        match finish.as_deref() {
            Some("stop") => stopped += 1,
            Some("error") => shed += 1,
            other => panic!("unexpected finish reason {other:?}"),
        }
    }
    assert!(shed >= 1, "at least one stream must end with an error chunk");
    assert!(stopped >= 1, "accepted requests must complete normally");
    assert_eq!(stopped + shed, 4);
}

#[tokio::test]
async fn unknown_model_is_an_internal_error() {
    let state = test_state(|_| {});
    let app = routes::build(Arc::clone(&state));

    let (status, body) = post_json(
        &app,
        "/v1/chat/completions",
        json!({
            "model": "no-such-model",
            "messages": [{"role": "user", "content": "hi"}],
        }),
    )
    .await;

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["error"]["type"], "internal_error");
}

// ── Validation and deprecated paths ───────────────────────────────────────────

#[tokio::test]
async fn invalid_json_is_rejected() {
    let state = test_state(|_| {});
    let app = routes::build(state);

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/v1/chat/completions")
                .header("content-type", "application/json")
                .body(Body::from("{not json"))
                .expect("request builds"),
        )
        .await
        .expect("infallible");

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let bytes = response.into_body().collect().await.expect("body").to_bytes();
    let body: Value = serde_json::from_slice(&bytes).expect("json");
    assert_eq!(body["error"]["type"], "invalid_request_error");
    assert_eq!(body["error"]["code"], "invalid_json");
}

#[tokio::test]
async fn empty_messages_are_rejected() {
    let state = test_state(|_| {});
    let app = routes::build(state);

    let (status, body) = post_json(
        &app,
        "/v1/chat/completions",
        json!({ "model": "probe", "messages": [] }),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "invalid_messages");
    assert_eq!(body["error"]["param"], "messages");
}

#[tokio::test]
async fn zero_max_tokens_is_rejected() {
    let state = test_state(|_| {});
    let app = routes::build(state);

    let (status, body) = post_json(
        &app,
        "/v1/chat/completions",
        json!({
            "messages": [{"role": "user", "content": "hi"}],
            "max_tokens": 0,
        }),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "invalid_max_tokens");
}

#[tokio::test]
async fn legacy_completions_endpoint_is_deprecated() {
    let state = test_state(|_| {});
    let app = routes::build(state);

    let (status, body) = post_json(&app, "/v1/completions", json!({ "prompt": "hi" })).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["type"], "invalid_request_error");
    assert_eq!(body["error"]["code"], "endpoint_deprecated");
}

// ── Health and metrics ────────────────────────────────────────────────────────

#[tokio::test]
async fn healthz_reports_uptime() {
    let state = test_state(|_| {});
    let app = routes::build(state);

    let response = app
        .oneshot(
            Request::builder()
                .uri("/healthz")
                .body(Body::empty())
                .expect("request builds"),
        )
        .await
        .expect("infallible");

    assert_eq!(response.status(), StatusCode::OK);
    let bytes = response.into_body().collect().await.expect("body").to_bytes();
    let body: Value = serde_json::from_slice(&bytes).expect("json");
    assert_eq!(body["status"], "ok");
    assert!(body["uptime_ms"].is_u64());
}

#[tokio::test]
async fn metrics_count_finished_requests() {
    let state = test_state(|_| {});
    let engine = RecordingEngine::new("ok");
    state.root.engines().register_instance("probe", engine);
    let app = routes::build(Arc::clone(&state));

    post_json(
        &app,
        "/v1/chat/completions",
        json!({
            "model": "probe",
            "messages": [{"role": "user", "content": "hi"}],
        }),
    )
    .await;

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/metrics")
                .body(Body::empty())
                .expect("request builds"),
        )
        .await
        .expect("infallible");
    let bytes = response.into_body().collect().await.expect("body").to_bytes();
    let body: Value = serde_json::from_slice(&bytes).expect("json");

    assert_eq!(body["requests_total"], 1);
    assert_eq!(body["requests_in_flight"], 0);
    assert_eq!(body["requests_error_total"], 0);
}

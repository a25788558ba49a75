//! Two-level scheduling: per-session lanes over per-model lanes over the
//! worker pool.
//!
//! Both levels are actors with bounded inboxes; a full inbox is the
//! backpressure signal. The session lane forwards one turn at a time and
//! waits for its terminal state, so a session's turns are strictly
//! linearized. The model lane does the same with executions, so a model
//! runs at most one request at any instant. Across models, parallelism is
//! bounded only by the worker pool.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::engine::EngineFactory;

use super::context::ServingContext;
use super::pool::WorkerPool;
use super::types::{FinishReason, Terminal};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Why a submission was refused. Every variant is a fail-fast signal; the
/// scheduler never buffers beyond its bounded inboxes.
#[derive(Debug, Clone, Error)]
pub enum SubmitError {
    #[error("session queue full: {session_id} (capacity {capacity})")]
    SessionQueueFull { session_id: String, capacity: usize },

    #[error("model queue full: {model} (capacity {capacity})")]
    ModelQueueFull { model: String, capacity: usize },

    #[error("session closed: {session_id}")]
    SessionClosed { session_id: String },

    #[error("request has no session attached")]
    NoSession,
}

#[derive(Debug, Clone)]
pub struct SchedulerLimits {
    /// Per-model inbox capacity.
    pub max_model_queue: usize,
    /// Per-session inbox capacity.
    pub max_session_pending: usize,
    /// A task that begins after waiting longer than this finishes
    /// immediately with an overload error.
    pub max_queue_wait: Duration,
}

impl Default for SchedulerLimits {
    fn default() -> Self {
        Self {
            max_model_queue: 8,
            max_session_pending: 64,
            max_queue_wait: Duration::from_millis(2000),
        }
    }
}

// ── Per-model scheduling ──────────────────────────────────────────────────────

struct SchedulerInner {
    pool: Arc<WorkerPool>,
    engines: Arc<EngineFactory>,
    limits: SchedulerLimits,
    /// One lane per model name, spawned lazily, never reclaimed (the set of
    /// models is small and fixed by configuration).
    lanes: Mutex<HashMap<String, mpsc::Sender<Arc<ServingContext>>>>,
}

/// Cheap handle to the per-model scheduling layer.
#[derive(Clone)]
pub struct ModelScheduler {
    inner: Arc<SchedulerInner>,
}

impl ModelScheduler {
    pub fn new(pool: Arc<WorkerPool>, engines: Arc<EngineFactory>, limits: SchedulerLimits) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                pool,
                engines,
                limits,
                lanes: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn limits(&self) -> &SchedulerLimits {
        &self.inner.limits
    }

    /// Enqueue a request on its model's lane. Fails fast when the lane's
    /// inbox is full.
    pub fn submit(&self, ctx: Arc<ServingContext>) -> Result<(), SubmitError> {
        let model = ctx.model.clone();
        let tx = self.lane(&model);
        tx.try_send(ctx).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SubmitError::ModelQueueFull {
                model,
                capacity: self.inner.limits.max_model_queue,
            },
            // Lane tasks only exit at shutdown; treat as a full queue so the
            // caller fails the request rather than retrying.
            mpsc::error::TrySendError::Closed(_) => SubmitError::ModelQueueFull {
                model,
                capacity: self.inner.limits.max_model_queue,
            },
        })
    }

    fn lane(&self, model: &str) -> mpsc::Sender<Arc<ServingContext>> {
        let mut lanes = lock(&self.inner.lanes);
        lanes
            .entry(model.to_owned())
            .or_insert_with(|| {
                let (tx, rx) = mpsc::channel(self.inner.limits.max_model_queue);
                info!(model, "model lane started");
                tokio::spawn(run_model_lane(
                    model.to_owned(),
                    rx,
                    Arc::clone(&self.inner.pool),
                    Arc::clone(&self.inner.engines),
                    self.inner.limits.max_queue_wait,
                ));
                tx
            })
            .clone()
    }
}

/// Drain one model's inbox, one execution at a time.
async fn run_model_lane(
    model: String,
    mut rx: mpsc::Receiver<Arc<ServingContext>>,
    pool: Arc<WorkerPool>,
    engines: Arc<EngineFactory>,
    max_queue_wait: Duration,
) {
    while let Some(ctx) = rx.recv().await {
        // A request can be cancelled (and therefore finished) while still
        // queued; skip it without touching the pool.
        if ctx.is_finished() {
            continue;
        }

        let job_ctx = Arc::clone(&ctx);
        let job_engines = Arc::clone(&engines);
        let job_model = model.clone();
        pool.execute(move || run_one(&job_model, &job_engines, job_ctx, max_queue_wait));

        // Serialize: the next execution starts only after this one reached
        // its terminal state. Engines must emit a finish on every path.
        ctx.finished().await;
    }
    debug!(model, "model lane drained");
}

/// One execution on a pool worker: deadline check, engine resolution, run.
fn run_one(
    model: &str,
    engines: &EngineFactory,
    ctx: Arc<ServingContext>,
    max_queue_wait: Duration,
) {
    if ctx.is_finished() {
        return;
    }
    if ctx.accepted_at().elapsed() > max_queue_wait {
        warn!(
            request_id = %ctx.request_id,
            model,
            waited_ms = ctx.accepted_at().elapsed().as_millis() as u64,
            "queue wait exceeded; rejecting"
        );
        ctx.finish_overloaded(format!(
            "queue full: request waited longer than {} ms",
            max_queue_wait.as_millis()
        ));
        return;
    }
    if ctx.is_cancelled() {
        ctx.emit_finish(Terminal::new(FinishReason::Cancelled));
        return;
    }

    let engine = match engines.get_or_create(model) {
        Ok(engine) => engine,
        Err(e) => {
            error!(model, error = %e, "engine unavailable");
            ctx.finish_error(format!("engine unavailable: {e}"));
            return;
        }
    };

    // A panicking engine must not wedge the model lane: restore the finish
    // invariant before the worker moves on.
    let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| engine.run(Arc::clone(&ctx))));
    if outcome.is_err() {
        error!(request_id = %ctx.request_id, model, "engine panicked");
        ctx.finish_error("engine panicked");
    }
}

// ── Per-session scheduling ────────────────────────────────────────────────────

/// Drain one session's inbox, one turn at a time. Spawned when the session
/// is created; ends when the session object is dropped.
pub(crate) async fn run_session_turns(
    session_id: String,
    mut rx: mpsc::Receiver<Arc<ServingContext>>,
    scheduler: ModelScheduler,
) {
    while let Some(ctx) = rx.recv().await {
        if ctx.is_finished() {
            continue;
        }
        match scheduler.submit(Arc::clone(&ctx)) {
            Ok(()) => {
                ctx.finished().await;
            }
            Err(e) => {
                warn!(session_id = %session_id, request_id = %ctx.request_id, error = %e, "turn rejected");
                ctx.finish_overloaded(e.to_string());
            }
        }
    }
    debug!(session_id = %session_id, "session lane drained");
}

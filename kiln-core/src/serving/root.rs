//! The explicit composition root of the serving pipeline.
//!
//! Constructed once at startup and threaded through the gateway; there are
//! no process-wide singletons. Owns the worker pool, the engine factory,
//! the model scheduler, the session manager, and the request-id counter.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::engine::EngineFactory;

use super::context::ServingContext;
use super::pool::WorkerPool;
use super::scheduler::{ModelScheduler, SchedulerLimits, SubmitError};
use super::session::{SessionManager, SessionManagerOptions};

#[derive(Debug, Clone, Default)]
pub struct RootOptions {
    /// Worker pool size. Zero means "one".
    pub worker_threads: usize,
    pub limits: SchedulerLimits,
    pub sessions: SessionManagerOptions,
}

pub struct ServingRoot {
    pool: Arc<WorkerPool>,
    engines: Arc<EngineFactory>,
    scheduler: ModelScheduler,
    sessions: Arc<SessionManager>,
    request_seq: AtomicU64,
    reaper: tokio::task::JoinHandle<()>,
}

impl ServingRoot {
    /// Build the pipeline. Must run inside a tokio runtime (the session
    /// reaper and scheduler lanes are spawned tasks).
    pub fn new(opts: RootOptions) -> io::Result<Arc<Self>> {
        let worker_threads = if opts.worker_threads == 0 {
            4
        } else {
            opts.worker_threads
        };
        let pool = Arc::new(WorkerPool::new(worker_threads)?);
        let engines = Arc::new(EngineFactory::new());
        let scheduler = ModelScheduler::new(Arc::clone(&pool), Arc::clone(&engines), opts.limits);
        let sessions = Arc::new(SessionManager::new(opts.sessions, scheduler.clone()));
        let reaper = sessions.start_reaper();

        Ok(Arc::new(Self {
            pool,
            engines,
            scheduler,
            sessions,
            request_seq: AtomicU64::new(0),
            reaper,
        }))
    }

    pub fn engines(&self) -> &Arc<EngineFactory> {
        &self.engines
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    pub fn scheduler(&self) -> &ModelScheduler {
        &self.scheduler
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    /// Process-wide monotonically increasing request id.
    pub fn next_request_id(&self) -> String {
        let n = self.request_seq.fetch_add(1, Ordering::Relaxed) + 1;
        format!("req-{n}")
    }

    /// Hand a built context to its session's lane. Fails fast when the
    /// session inbox is full; the caller decides how to surface that.
    pub fn submit(&self, ctx: Arc<ServingContext>) -> Result<(), SubmitError> {
        let session = ctx.session().ok_or(SubmitError::NoSession)?;
        let session_id = ctx.session_id.clone();
        session
            .ingress()
            .try_send(Arc::clone(&ctx))
            .map_err(|e| match e {
                tokio::sync::mpsc::error::TrySendError::Full(_) => SubmitError::SessionQueueFull {
                    session_id,
                    capacity: self.sessions.options().pending_capacity,
                },
                tokio::sync::mpsc::error::TrySendError::Closed(_) => {
                    SubmitError::SessionClosed { session_id }
                }
            })
    }
}

impl Drop for ServingRoot {
    fn drop(&mut self) {
        self.reaper.abort();
    }
}

//! kiln-server – OpenAI-compatible HTTP gateway over the kiln-core serving
//! pipeline.
//!
//! The binary in `main.rs` is a thin wrapper: configuration, tracing, root
//! construction, warmup, router, listen. Everything else lives here so the
//! integration tests can drive the exact router the binary serves.

pub mod config;
pub mod error;
pub mod metrics;
pub mod middleware;
pub mod routes;
pub mod schemas;
pub mod sse;
pub mod state;

use std::sync::Arc;

use kiln_core::engine::{DummyEngine, ModelEngine};
use kiln_core::serving::{RootOptions, ServingRoot};
use tracing::{info, warn};

use crate::config::Config;
use crate::metrics::Metrics;
use crate::state::AppState;

/// Wire the serving root from configuration and register the built-in
/// engines. Model names without a registered builder fail their requests
/// with `unknown model`; the dummy engine is always available for smoke
/// tests and warmup.
pub fn build_root(cfg: &Config) -> anyhow::Result<Arc<ServingRoot>> {
    let root = ServingRoot::new(RootOptions {
        worker_threads: cfg.worker_threads,
        limits: cfg.scheduler_limits(),
        sessions: cfg.session_options(),
    })?;

    root.engines().register("dummy", || {
        Ok(Arc::new(DummyEngine::new("Hello from kiln.")) as Arc<dyn ModelEngine>)
    });

    if let Some(path) = &cfg.model_path {
        // Loading a real model means implementing a ModelBackend over the
        // inference library of choice and registering a TokenLmEngine here.
        warn!(model_path = %path, "no token backend compiled in; MODEL_PATH ignored");
    }

    Ok(root)
}

/// Assemble the shared application state.
pub fn build_state(cfg: Config, root: Arc<ServingRoot>) -> Arc<AppState> {
    Arc::new(AppState {
        config: Arc::new(cfg),
        root,
        metrics: Arc::new(Metrics::new()),
        started_at: std::time::Instant::now(),
    })
}

/// Run one synchronous turn through the default model so the first real
/// request does not pay engine construction.
pub async fn warmup(state: &Arc<AppState>) {
    let model = state.config.default_model.clone();
    let engines = Arc::clone(state.root.engines());
    let outcome = tokio::task::spawn_blocking(move || {
        let engine = engines.get_or_create(&model)?;
        let ctx = kiln_core::serving::ServingContext::builder("warmup", model.as_str())
            .messages(vec![kiln_core::serving::Message::new("user", "Hello")])
            .build();
        engine.run(Arc::clone(&ctx));
        Ok::<_, kiln_core::engine::EngineError>(ctx.terminal())
    })
    .await;

    match outcome {
        Ok(Ok(Some(terminal))) => {
            info!(reason = terminal.reason.as_str(), "warmup finished")
        }
        Ok(Ok(None)) => warn!("warmup did not reach a terminal state"),
        Ok(Err(e)) => warn!(error = %e, "warmup skipped"),
        Err(e) => warn!(error = %e, "warmup task failed"),
    }
}

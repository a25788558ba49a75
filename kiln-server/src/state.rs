//! Shared application state injected into every Axum handler.

use std::sync::Arc;
use std::time::Instant;

use kiln_core::serving::ServingRoot;

use crate::config::Config;
use crate::metrics::Metrics;

/// State shared across all HTTP handlers.
pub struct AppState {
    /// Server configuration (file + env derived).
    pub config: Arc<Config>,
    /// The serving pipeline: sessions, scheduler, engines.
    pub root: Arc<ServingRoot>,
    /// Request counters served by `GET /metrics`.
    pub metrics: Arc<Metrics>,
    /// Process start, for the health endpoint's uptime.
    pub started_at: Instant,
}

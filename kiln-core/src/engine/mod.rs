//! The model-execution contract and the engine factory.
//!
//! Engines consume a [`ServingContext`] and must eventually emit a finish
//! exactly once, on every path. They may be called concurrently for
//! different sessions and must not assume any serialization beyond what the
//! scheduler provides (one execution per model, one per session).

mod backend;
mod dummy;
mod token_lm;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use thiserror::Error;

use crate::serving::ServingContext;

pub use backend::{BackendContext, BackendError, ModelBackend, TokenId};
pub use dummy::DummyEngine;
pub use token_lm::{TokenLmEngine, TokenLmOptions};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A model execution backend.
pub trait ModelEngine: Send + Sync {
    /// Run one request to completion. Must call `emit_finish` (directly or
    /// via `cancel`/`finish_error`) exactly once before returning or
    /// arranging completion.
    fn run(&self, ctx: Arc<ServingContext>);
}

impl std::fmt::Debug for dyn ModelEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("dyn ModelEngine")
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("unknown model: {model}")]
    UnknownModel { model: String },

    #[error("failed to load model {model}: {message}")]
    Load { model: String, message: String },

    #[error(transparent)]
    Backend(#[from] BackendError),
}

/// Constructor for an engine; invoked at most once per model name under
/// normal operation (concurrent first use may build extra instances, the
/// losers are discarded).
pub type EngineBuilder = Arc<dyn Fn() -> Result<Arc<dyn ModelEngine>, EngineError> + Send + Sync>;

/// Caches one engine instance per model name.
pub struct EngineFactory {
    builders: Mutex<HashMap<String, EngineBuilder>>,
    cache: Mutex<HashMap<String, Arc<dyn ModelEngine>>>,
}

impl EngineFactory {
    pub fn new() -> Self {
        Self {
            builders: Mutex::new(HashMap::new()),
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Register the constructor for a model name. Replaces any previous
    /// registration; does not invalidate an already-built instance.
    pub fn register(
        &self,
        model: impl Into<String>,
        builder: impl Fn() -> Result<Arc<dyn ModelEngine>, EngineError> + Send + Sync + 'static,
    ) {
        lock(&self.builders).insert(model.into(), Arc::new(builder));
    }

    /// Install a ready-made engine under a model name.
    pub fn register_instance(&self, model: impl Into<String>, engine: Arc<dyn ModelEngine>) {
        lock(&self.cache).insert(model.into(), engine);
    }

    /// Get the engine for `model`, building it on first use.
    ///
    /// Construction happens outside the lock (model loading is slow); a
    /// double-check on re-acquire keeps at most one instance per name when
    /// first-use requests race.
    pub fn get_or_create(&self, model: &str) -> Result<Arc<dyn ModelEngine>, EngineError> {
        if let Some(engine) = lock(&self.cache).get(model) {
            return Ok(Arc::clone(engine));
        }

        let builder = lock(&self.builders)
            .get(model)
            .cloned()
            .ok_or_else(|| EngineError::UnknownModel {
                model: model.to_owned(),
            })?;
        let engine = builder()?;

        let mut cache = lock(&self.cache);
        Ok(Arc::clone(
            cache.entry(model.to_owned()).or_insert(engine),
        ))
    }

    /// Drop all cached instances (testing hook).
    pub fn clear(&self) {
        lock(&self.cache).clear();
    }
}

impl Default for EngineFactory {
    fn default() -> Self {
        Self::new()
    }
}

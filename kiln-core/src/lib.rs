//! kiln-core – the request-serving pipeline behind the kiln HTTP gateway.
//!
//! The crate is split into two layers:
//!
//! - [`serving`] – everything between "a validated request exists" and "an
//!   engine produced a terminal result": the per-request [`ServingContext`],
//!   the session store with its LRU/TTL reaper, and the two-level scheduler
//!   (per-session actors over per-model actors over a blocking worker pool).
//! - [`engine`] – the model-execution contract: the [`ModelEngine`] trait,
//!   the engine factory, the dummy engine used for tests and warmup, and the
//!   token-level engine that drives a [`ModelBackend`] while reusing a
//!   session-scoped token cache.
//!
//! [`ServingContext`]: serving::ServingContext
//! [`ModelEngine`]: engine::ModelEngine
//! [`ModelBackend`]: engine::ModelBackend

pub mod engine;
pub mod serving;

pub use engine::{EngineError, EngineFactory, ModelEngine};
pub use serving::{
    FinishReason, GenParams, Message, ServingContext, ServingRoot, SessionManager, StreamChunk,
    SubmitError, Terminal,
};

//! The serving layer: request state, sessions, and the two-level scheduler.

mod context;
mod pool;
mod root;
mod scheduler;
mod session;
mod types;

pub use context::{ChunkSink, ContextBuilder, FinishListener, ServingContext};
pub use pool::WorkerPool;
pub use root::{RootOptions, ServingRoot};
pub use scheduler::{ModelScheduler, SchedulerLimits, SubmitError};
pub use session::{Session, SessionManager, SessionManagerOptions};
pub use types::{ErrorCode, FinishReason, GenParams, Message, StreamChunk, Terminal, Usage};

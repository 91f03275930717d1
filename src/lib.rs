//! llamux - request scheduler for a single LLM context
//!
//! llamux multiplexes completion, embedding, rerank and tokenize requests
//! from many callers over one compute context that can only run one
//! primitive at a time.
//!
//! # Architecture
//!
//! - **scheduler**: FIFO queue, slot admission, dispatch thread, cancellation
//!   and the exclusive lifecycle operations (load, parallel mode, sessions)
//! - **engine**: the [`ComputeEngine`] seam, the context handle and a
//!   deterministic simulated engine
//! - **streaming**: per-request token and result delivery, callback or async
//!   stream
//! - **config**: typed, validated parameter records
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use llamux::engine::sim::{SimConfig, SimEngine};
//! use llamux::{CompletionParams, LoadParams, Scheduler};
//!
//! # fn main() -> Result<(), llamux::SchedulerError> {
//! let scheduler = Scheduler::new(SimEngine::new(SimConfig::default()))?;
//! scheduler.load(&LoadParams::new("model.gguf"), |pct| println!("{}%", pct))?;
//! let (id, events) = scheduler.stream_completion(CompletionParams::new("Hello"))?;
//! # let _ = (id, events);
//! # Ok(())
//! # }
//! ```

pub mod cli;
pub mod config;
pub mod engine;
pub mod error;
pub mod scheduler;
pub mod streaming;
pub mod utf8;

// Re-export key types
pub use config::{
    CompletionParams, EmbeddingParams, EngineConfig, GenerationConfig, LoadParams, LoraAdapter,
    ParallelConfig, RerankParams, TokenizeParams,
};
pub use engine::{ComputeEngine, ModelInfo, MultimodalSupport};
pub use error::{EngineError, FailureKind, SchedulerError};
pub use scheduler::{Outcome, RequestId, RequestKind, RequestState, Scheduler};
pub use streaming::{EventSink, StreamEvent, TokenEvent};

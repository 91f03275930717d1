//! Compute engine boundary
//!
//! This module defines the contract the scheduler consumes from the native
//! inference engine:
//! - `ComputeEngine`: synchronous, non-reentrant primitives over one context
//! - `EngineHandle`: owns the engine plus its attachment state
//! - `sim`: a deterministic in-process engine for tests and benchmarks

mod handle;
pub mod sim;

pub use handle::{ContextStatus, EngineHandle};

use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::config::{
    EmbeddingParams, GenerationConfig, LoadParams, LoraAdapter, MultimodalParams, RerankParams,
    VocoderParams,
};
use crate::error::EngineError;

/// Token id in the model vocabulary
pub type Token = u32;

/// Index of a decode lane inside the context
pub type SlotId = usize;

/// Description of a loaded model
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ModelInfo {
    pub description: String,
    pub n_params: u64,
    pub size_bytes: u64,
    pub n_ctx_train: usize,
    pub n_embd: usize,
    pub n_vocab: usize,
    pub has_chat_template: bool,
    pub gpu: bool,
}

/// Result of tokenizing a prompt
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TokenizeOutput {
    pub tokens: Vec<Token>,
    pub has_media: bool,
}

/// What one decode step produced
#[derive(Debug, Clone, PartialEq)]
pub enum DecodeOutput {
    /// A sampled token and its raw text piece
    Token { id: Token, piece: Vec<u8> },
    /// The engine sampled an end-of-generation token
    EndOfGeneration,
}

/// Input modalities accepted by the attached multimodal projector
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MultimodalSupport {
    pub vision: bool,
    pub audio: bool,
}

/// Session restored from disk
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SessionInfo {
    pub tokens_loaded: usize,
    pub prompt: String,
}

/// Inference primitives over a single native context
///
/// Implementations may assume they are never called concurrently: the
/// scheduler holds an exclusive lock around every call.
pub trait ComputeEngine: Send {
    /// Load model weights, reporting percent progress between steps.
    ///
    /// `progress` returns `false` when the caller wants the load aborted;
    /// the engine must then stop and return [`EngineError::Interrupted`].
    fn load_model(
        &mut self,
        params: &LoadParams,
        progress: &mut dyn FnMut(u8) -> bool,
    ) -> Result<ModelInfo, EngineError>;

    /// Free the model and every attachment
    fn unload(&mut self);

    /// Resize the sequence pool
    fn configure_slots(&mut self, n_parallel: usize, n_batch: usize) -> Result<(), EngineError>;

    fn tokenize(&mut self, text: &str, media: &[PathBuf]) -> Result<TokenizeOutput, EngineError>;

    /// Raw bytes of the concatenated token pieces
    fn detokenize(&mut self, tokens: &[Token]) -> Result<Vec<u8>, EngineError>;

    /// Evaluate a prompt into `slot` and prepare its sampler
    fn begin_sequence(
        &mut self,
        slot: SlotId,
        prompt: &[Token],
        generation: &GenerationConfig,
    ) -> Result<(), EngineError>;

    /// Sample and evaluate one token for `slot`
    fn decode_step(&mut self, slot: SlotId) -> Result<DecodeOutput, EngineError>;

    /// Drop the KV state of `slot`
    fn end_sequence(&mut self, slot: SlotId);

    fn embed(&mut self, text: &str, params: &EmbeddingParams) -> Result<Vec<f32>, EngineError>;

    /// One relevance score per document, in document order
    fn rerank(
        &mut self,
        query: &str,
        documents: &[String],
        params: &RerankParams,
    ) -> Result<Vec<f32>, EngineError>;

    /// Persist the session state, returning bytes written
    fn save_session(&mut self, path: &Path, max_tokens: Option<usize>)
        -> Result<usize, EngineError>;

    fn load_session(&mut self, path: &Path) -> Result<SessionInfo, EngineError>;

    fn apply_lora(&mut self, adapters: &[LoraAdapter]) -> Result<(), EngineError>;

    fn remove_lora(&mut self);

    /// Attach a projector and report which media it accepts
    fn init_multimodal(&mut self, params: &MultimodalParams)
        -> Result<MultimodalSupport, EngineError>;

    fn release_multimodal(&mut self);

    fn init_vocoder(&mut self, params: &VocoderParams) -> Result<(), EngineError>;

    fn release_vocoder(&mut self);
}

/// Boxed engine type for use in the scheduler
pub type BoxedEngine = Box<dyn ComputeEngine>;

//! Engine handle
//!
//! Wraps a `ComputeEngine` with what the scheduler needs to know about it:
//! whether a model is loaded, with which parameters, and which optional
//! components are attached. Every primitive is guarded so calls against an
//! unloaded context fail with `ModelNotLoaded` instead of reaching the engine.

use std::path::{Path, PathBuf};

use crate::config::{
    EmbeddingParams, GenerationConfig, LoadParams, LoraAdapter, MultimodalParams, RerankParams,
    VocoderParams,
};
use crate::engine::{
    BoxedEngine, ComputeEngine, DecodeOutput, ModelInfo, MultimodalSupport, SessionInfo, SlotId,
    Token, TokenizeOutput,
};
use crate::error::EngineError;
use crate::utf8;

/// State attached to a loaded model
struct LoadedContext {
    params: LoadParams,
    info: ModelInfo,
    lora: Vec<LoraAdapter>,
    multimodal: Option<MultimodalSupport>,
    vocoder: bool,
}

/// Snapshot of the context, mirrored by the scheduler for lock-free queries
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContextStatus {
    pub info: Option<ModelInfo>,
    pub embedding: bool,
    pub n_ctx: usize,
    pub n_batch: usize,
    /// Present while a projector is attached
    pub multimodal: Option<MultimodalSupport>,
    pub vocoder: bool,
    pub lora: Vec<LoraAdapter>,
}

impl ContextStatus {
    pub fn is_loaded(&self) -> bool {
        self.info.is_some()
    }
}

/// Owner of the single native context
pub struct EngineHandle {
    engine: BoxedEngine,
    loaded: Option<LoadedContext>,
}

impl EngineHandle {
    pub fn new<E: ComputeEngine + 'static>(engine: E) -> Self {
        Self::from_boxed(Box::new(engine))
    }

    pub fn from_boxed(engine: BoxedEngine) -> Self {
        Self {
            engine,
            loaded: None,
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded.is_some()
    }

    pub fn status(&self) -> ContextStatus {
        match &self.loaded {
            Some(ctx) => ContextStatus {
                info: Some(ctx.info.clone()),
                embedding: ctx.params.embedding,
                n_ctx: ctx.params.n_ctx,
                n_batch: ctx.params.n_batch,
                multimodal: ctx.multimodal,
                vocoder: ctx.vocoder,
                lora: ctx.lora.clone(),
            },
            None => ContextStatus::default(),
        }
    }

    /// Load a model, replacing the current one.
    ///
    /// Progress reported to `on_progress` never goes backwards and ends at
    /// 100 on success. `keep_going` is polled between engine load steps.
    pub fn load(
        &mut self,
        params: &LoadParams,
        on_progress: &mut dyn FnMut(u8),
        keep_going: &dyn Fn() -> bool,
    ) -> Result<ModelInfo, EngineError> {
        self.unload();

        let mut last = 0u8;
        let result = self.engine.load_model(params, &mut |percent| {
            let percent = percent.min(100);
            if percent > last {
                last = percent;
                on_progress(percent);
            }
            keep_going()
        });

        let info = match result {
            Ok(info) => info,
            Err(e) => {
                self.engine.unload();
                return Err(e);
            }
        };
        if last < 100 {
            on_progress(100);
        }

        if !params.lora_adapters.is_empty() {
            if let Err(e) = self.engine.apply_lora(&params.lora_adapters) {
                self.engine.unload();
                return Err(e);
            }
        }

        self.loaded = Some(LoadedContext {
            params: params.clone(),
            info: info.clone(),
            lora: params.lora_adapters.clone(),
            multimodal: None,
            vocoder: false,
        });
        Ok(info)
    }

    /// Release the model and all attachments
    pub fn unload(&mut self) {
        if self.loaded.take().is_some() {
            self.engine.unload();
        }
    }

    fn context(&self) -> Result<&LoadedContext, EngineError> {
        self.loaded.as_ref().ok_or(EngineError::ModelNotLoaded)
    }

    fn context_mut(&mut self) -> Result<&mut LoadedContext, EngineError> {
        self.loaded.as_mut().ok_or(EngineError::ModelNotLoaded)
    }

    pub fn configure_slots(&mut self, n_parallel: usize, n_batch: usize) -> Result<(), EngineError> {
        self.context()?;
        self.engine.configure_slots(n_parallel, n_batch)
    }

    pub fn tokenize(&mut self, text: &str, media: &[PathBuf]) -> Result<TokenizeOutput, EngineError> {
        let ctx = self.context()?;
        if !media.is_empty() && ctx.multimodal.is_none() {
            return Err(EngineError::Unsupported(
                "media input requires an initialized multimodal projector".to_string(),
            ));
        }
        self.engine.tokenize(text, media)
    }

    /// Detokenize into a valid UTF-8 string
    pub fn detokenize(&mut self, tokens: &[Token]) -> Result<String, EngineError> {
        self.context()?;
        let bytes = self.engine.detokenize(tokens)?;
        Ok(utf8::sanitize(&bytes))
    }

    pub fn begin_sequence(
        &mut self,
        slot: SlotId,
        prompt: &[Token],
        generation: &GenerationConfig,
    ) -> Result<(), EngineError> {
        self.context()?;
        self.engine.begin_sequence(slot, prompt, generation)
    }

    pub fn decode_step(&mut self, slot: SlotId) -> Result<DecodeOutput, EngineError> {
        self.context()?;
        self.engine.decode_step(slot)
    }

    pub fn end_sequence(&mut self, slot: SlotId) {
        if self.loaded.is_some() {
            self.engine.end_sequence(slot);
        }
    }

    pub fn embed(&mut self, text: &str, params: &EmbeddingParams) -> Result<Vec<f32>, EngineError> {
        let ctx = self.context()?;
        if !ctx.params.embedding {
            return Err(EngineError::Unsupported(
                "context was not loaded in embedding mode".to_string(),
            ));
        }
        let mut params = params.clone();
        if params.embd_normalize == -1 {
            params.embd_normalize = ctx.params.embd_normalize;
        }
        self.engine.embed(text, &params)
    }

    pub fn rerank(
        &mut self,
        query: &str,
        documents: &[String],
        params: &RerankParams,
    ) -> Result<Vec<f32>, EngineError> {
        self.context()?;
        let scores = self.engine.rerank(query, documents, params)?;
        if scores.len() != documents.len() {
            return Err(EngineError::Decode(format!(
                "rerank returned {} scores for {} documents",
                scores.len(),
                documents.len()
            )));
        }
        Ok(scores)
    }

    pub fn save_session(&mut self, path: &Path, max_tokens: Option<usize>) -> Result<usize, EngineError> {
        self.context()?;
        self.engine.save_session(path, max_tokens)
    }

    pub fn load_session(&mut self, path: &Path) -> Result<SessionInfo, EngineError> {
        self.context()?;
        let mut info = self.engine.load_session(path)?;
        info.prompt = utf8::sanitize(info.prompt.as_bytes());
        Ok(info)
    }

    pub fn apply_lora(&mut self, adapters: &[LoraAdapter]) -> Result<(), EngineError> {
        self.context()?;
        self.engine.apply_lora(adapters)?;
        self.context_mut()?.lora = adapters.to_vec();
        Ok(())
    }

    pub fn remove_lora(&mut self) -> Result<(), EngineError> {
        self.context()?;
        self.engine.remove_lora();
        self.context_mut()?.lora.clear();
        Ok(())
    }

    pub fn init_multimodal(&mut self, params: &MultimodalParams) -> Result<(), EngineError> {
        self.context()?;
        let support = self.engine.init_multimodal(params)?;
        self.context_mut()?.multimodal = Some(support);
        Ok(())
    }

    pub fn release_multimodal(&mut self) -> Result<(), EngineError> {
        if self.context()?.multimodal.is_some() {
            self.engine.release_multimodal();
            self.context_mut()?.multimodal = None;
        }
        Ok(())
    }

    pub fn init_vocoder(&mut self, params: &VocoderParams) -> Result<(), EngineError> {
        self.context()?;
        self.engine.init_vocoder(params)?;
        self.context_mut()?.vocoder = true;
        Ok(())
    }

    pub fn release_vocoder(&mut self) -> Result<(), EngineError> {
        if self.context()?.vocoder {
            self.engine.release_vocoder();
            self.context_mut()?.vocoder = false;
        }
        Ok(())
    }
}

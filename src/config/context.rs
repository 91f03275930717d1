//! Context configuration: model load parameters and attachments

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::SchedulerError;

/// Parameters for loading a model into the shared context
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoadParams {
    /// Path to the model weights
    pub model: PathBuf,

    /// Chat template override
    #[serde(default)]
    pub chat_template: Option<String>,

    /// Load the context in embedding mode
    #[serde(default)]
    pub embedding: bool,

    /// Embedding normalization (-1 = none, 0 = max-abs, 1 = taxicab, 2 = euclidean, >2 = p-norm)
    #[serde(default = "default_embd_normalize")]
    pub embd_normalize: i32,

    /// Context size in tokens
    #[serde(default = "default_n_ctx")]
    pub n_ctx: usize,

    /// Logical batch size
    #[serde(default = "default_n_batch")]
    pub n_batch: usize,

    /// Physical batch size
    #[serde(default = "default_n_batch")]
    pub n_ubatch: usize,

    /// Number of threads (0 = engine default)
    #[serde(default)]
    pub n_threads: usize,

    /// Parallel slots to enable right after loading (0 or 1 = sequential)
    #[serde(default)]
    pub n_parallel: usize,

    /// Layers to offload to the GPU (-1 = all)
    #[serde(default)]
    pub n_gpu_layers: i32,

    /// Enable flash attention if available
    #[serde(default)]
    pub flash_attn: bool,

    /// KV cache type for K
    #[serde(default)]
    pub cache_type_k: Option<String>,

    /// KV cache type for V
    #[serde(default)]
    pub cache_type_v: Option<String>,

    #[serde(default = "default_true")]
    pub use_mlock: bool,

    #[serde(default = "default_true")]
    pub use_mmap: bool,

    /// Only load the vocabulary
    #[serde(default)]
    pub vocab_only: bool,

    /// LoRA adapters applied at load time
    #[serde(default)]
    pub lora_adapters: Vec<LoraAdapter>,

    /// RoPE base frequency (0 = from model)
    #[serde(default)]
    pub rope_freq_base: f32,

    /// RoPE frequency scale (0 = from model)
    #[serde(default)]
    pub rope_freq_scale: f32,

    /// Shift the context when it fills up instead of stopping
    #[serde(default = "default_true")]
    pub ctx_shift: bool,
}

fn default_embd_normalize() -> i32 {
    -1
}

fn default_n_ctx() -> usize {
    512
}

fn default_n_batch() -> usize {
    512
}

fn default_true() -> bool {
    true
}

impl LoadParams {
    /// Load parameters with defaults for everything but the model path
    pub fn new(model: impl Into<PathBuf>) -> Self {
        Self {
            model: model.into(),
            chat_template: None,
            embedding: false,
            embd_normalize: default_embd_normalize(),
            n_ctx: default_n_ctx(),
            n_batch: default_n_batch(),
            n_ubatch: default_n_batch(),
            n_threads: 0,
            n_parallel: 0,
            n_gpu_layers: 0,
            flash_attn: false,
            cache_type_k: None,
            cache_type_v: None,
            use_mlock: true,
            use_mmap: true,
            vocab_only: false,
            lora_adapters: Vec::new(),
            rope_freq_base: 0.0,
            rope_freq_scale: 0.0,
            ctx_shift: true,
        }
    }

    pub fn validate(&self) -> Result<(), SchedulerError> {
        if self.model.as_os_str().is_empty() {
            return Err(SchedulerError::config("model path cannot be empty"));
        }
        if self.n_ctx == 0 {
            return Err(SchedulerError::config("n_ctx must be > 0"));
        }
        if self.n_batch == 0 {
            return Err(SchedulerError::config("n_batch must be > 0"));
        }
        if self.n_ubatch == 0 || self.n_ubatch > self.n_batch {
            return Err(SchedulerError::config(format!(
                "n_ubatch must be in 1..={}, got {}",
                self.n_batch, self.n_ubatch
            )));
        }
        if self.n_parallel > 1 && self.n_batch < self.n_parallel {
            return Err(SchedulerError::config(format!(
                "n_batch ({}) must be >= n_parallel ({})",
                self.n_batch, self.n_parallel
            )));
        }
        if self.embd_normalize < -1 {
            return Err(SchedulerError::config("embd_normalize must be >= -1"));
        }
        for adapter in &self.lora_adapters {
            adapter.validate()?;
        }
        Ok(())
    }
}

/// A LoRA adapter and its scale
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoraAdapter {
    pub path: PathBuf,

    #[serde(default = "default_lora_scale", alias = "scaled")]
    pub scale: f32,
}

fn default_lora_scale() -> f32 {
    1.0
}

impl LoraAdapter {
    pub fn new(path: impl Into<PathBuf>, scale: f32) -> Self {
        Self {
            path: path.into(),
            scale,
        }
    }

    pub fn validate(&self) -> Result<(), SchedulerError> {
        if self.path.as_os_str().is_empty() {
            return Err(SchedulerError::config("lora adapter path cannot be empty"));
        }
        if !self.scale.is_finite() {
            return Err(SchedulerError::config("lora adapter scale must be finite"));
        }
        Ok(())
    }
}

/// Multimodal projector attachment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MultimodalParams {
    /// Path to the mmproj file
    pub path: PathBuf,

    #[serde(default = "default_true")]
    pub use_gpu: bool,
}

impl MultimodalParams {
    pub fn validate(&self) -> Result<(), SchedulerError> {
        if self.path.as_os_str().is_empty() {
            return Err(SchedulerError::config("mmproj path cannot be empty"));
        }
        Ok(())
    }
}

/// Vocoder attachment for audio output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VocoderParams {
    pub path: PathBuf,

    #[serde(default = "default_n_batch")]
    pub n_batch: usize,
}

impl VocoderParams {
    pub fn validate(&self) -> Result<(), SchedulerError> {
        if self.path.as_os_str().is_empty() {
            return Err(SchedulerError::config("vocoder model path cannot be empty"));
        }
        if self.n_batch == 0 {
            return Err(SchedulerError::config("vocoder n_batch must be > 0"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_params_defaults() {
        let params = LoadParams::new("model.gguf");
        assert_eq!(params.n_ctx, 512);
        assert_eq!(params.n_batch, 512);
        assert!(params.use_mmap);
        params.validate().unwrap();
    }

    #[test]
    fn test_load_params_rejects_bad_batches() {
        let mut params = LoadParams::new("model.gguf");
        params.n_ubatch = 1024;
        assert!(params.validate().is_err());

        let mut params = LoadParams::new("model.gguf");
        params.n_batch = 2;
        params.n_ubatch = 2;
        params.n_parallel = 4;
        assert!(params.validate().is_err());

        assert!(LoadParams::new("").validate().is_err());
    }

    #[test]
    fn test_lora_scale_alias() {
        let adapter: LoraAdapter =
            serde_json::from_str(r#"{"path": "a.gguf", "scaled": 0.5}"#).unwrap();
        assert_eq!(adapter.scale, 0.5);
    }
}

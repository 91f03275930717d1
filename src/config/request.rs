//! Per-request parameter records
//!
//! Every record carries `batch_units`: the per-step token budget the request
//! reserves while it occupies a slot.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::GenerationConfig;
use crate::error::SchedulerError;

fn default_batch_units() -> usize {
    1
}

fn default_normalize() -> i32 {
    -1
}

fn check_batch_units(units: usize) -> Result<(), SchedulerError> {
    if units == 0 {
        return Err(SchedulerError::config("batch_units must be >= 1"));
    }
    Ok(())
}

/// Text completion request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CompletionParams {
    /// Prompt text (already chat-formatted if needed)
    pub prompt: String,

    /// Media files referenced by the prompt
    #[serde(default)]
    pub media_paths: Vec<PathBuf>,

    #[serde(default)]
    pub generation: GenerationConfig,

    #[serde(default = "default_batch_units")]
    pub batch_units: usize,
}

impl CompletionParams {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            media_paths: Vec::new(),
            generation: GenerationConfig::default(),
            batch_units: default_batch_units(),
        }
    }

    pub fn with_generation(mut self, generation: GenerationConfig) -> Self {
        self.generation = generation;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: usize) -> Self {
        self.generation.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_batch_units(mut self, units: usize) -> Self {
        self.batch_units = units;
        self
    }

    pub fn validate(&self) -> Result<(), SchedulerError> {
        check_batch_units(self.batch_units)?;
        if self.media_paths.iter().any(|p| p.as_os_str().is_empty()) {
            return Err(SchedulerError::config("media paths must not be empty"));
        }
        self.generation.validate()
    }
}

/// Embedding request options
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EmbeddingParams {
    /// Normalization override (-1 = context default)
    #[serde(default = "default_normalize")]
    pub embd_normalize: i32,

    #[serde(default = "default_batch_units")]
    pub batch_units: usize,
}

impl Default for EmbeddingParams {
    fn default() -> Self {
        Self {
            embd_normalize: default_normalize(),
            batch_units: default_batch_units(),
        }
    }
}

impl EmbeddingParams {
    pub fn validate(&self) -> Result<(), SchedulerError> {
        check_batch_units(self.batch_units)?;
        if self.embd_normalize < -1 {
            return Err(SchedulerError::config("embd_normalize must be >= -1"));
        }
        Ok(())
    }
}

/// Rerank request options
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RerankParams {
    /// Score normalization (-1 = raw scores, 1 = sigmoid)
    #[serde(default = "default_normalize")]
    pub normalize: i32,

    #[serde(default = "default_batch_units")]
    pub batch_units: usize,
}

impl Default for RerankParams {
    fn default() -> Self {
        Self {
            normalize: default_normalize(),
            batch_units: default_batch_units(),
        }
    }
}

impl RerankParams {
    pub fn validate(&self) -> Result<(), SchedulerError> {
        check_batch_units(self.batch_units)?;
        if !matches!(self.normalize, -1 | 0 | 1) {
            return Err(SchedulerError::config(format!(
                "normalize must be -1, 0 or 1, got {}",
                self.normalize
            )));
        }
        Ok(())
    }
}

/// Tokenize request options
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TokenizeParams {
    #[serde(default)]
    pub media_paths: Vec<PathBuf>,

    #[serde(default = "default_batch_units")]
    pub batch_units: usize,
}

impl Default for TokenizeParams {
    fn default() -> Self {
        Self {
            media_paths: Vec::new(),
            batch_units: default_batch_units(),
        }
    }
}

impl TokenizeParams {
    pub fn validate(&self) -> Result<(), SchedulerError> {
        check_batch_units(self.batch_units)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_completion_from_nested_record() {
        let params: CompletionParams = serde_json::from_value(serde_json::json!({
            "prompt": "Hi",
            "generation": { "n_predict": 8, "temperature": 0.0 },
            "batch_units": 4
        }))
        .unwrap();
        assert_eq!(params.generation.max_tokens, Some(8));
        assert!(params.generation.is_greedy());
        assert_eq!(params.batch_units, 4);
        params.validate().unwrap();
    }

    #[test]
    fn test_zero_batch_units_rejected() {
        let params = CompletionParams::new("x").with_batch_units(0);
        assert!(params.validate().is_err());
        let params = EmbeddingParams {
            batch_units: 0,
            ..Default::default()
        };
        assert!(params.validate().is_err());
    }

    #[test]
    fn test_rerank_normalize_range() {
        let params = RerankParams {
            normalize: 3,
            ..Default::default()
        };
        assert!(params.validate().is_err());
        RerankParams::default().validate().unwrap();
    }
}

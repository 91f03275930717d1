//! Configuration system for llamux
//!
//! Parameter records are plain serde structs. They arrive either from a
//! YAML/JSON engine configuration file or, at the host boundary, as loosely
//! typed JSON values; both paths end in the same `validate()` calls.

mod context;
mod generation;
mod parallel;
mod request;

pub use context::{LoadParams, LoraAdapter, MultimodalParams, VocoderParams};
pub use generation::GenerationConfig;
pub use parallel::ParallelConfig;
pub use request::{CompletionParams, EmbeddingParams, RerankParams, TokenizeParams};

use std::path::Path;

use anyhow::{anyhow, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::SchedulerError;

/// Decode a host-supplied record into a typed parameter struct.
///
/// Unknown fields, wrong types and missing required fields all surface as
/// [`SchedulerError::Configuration`].
pub fn from_value<T: DeserializeOwned>(value: serde_json::Value) -> Result<T, SchedulerError> {
    serde_json::from_value(value).map_err(|e| SchedulerError::config(e.to_string()))
}

/// Engine configuration file
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    /// Model load parameters
    pub model: LoadParams,

    /// Parallel mode to enable after load
    #[serde(default)]
    pub parallel: Option<ParallelConfig>,

    /// Default generation settings
    #[serde(default)]
    pub generation: GenerationConfig,
}

impl EngineConfig {
    /// Load configuration from a YAML file
    pub fn from_yaml<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Load configuration from a JSON file
    pub fn from_json<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Load configuration, picking the format from the file extension
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => Self::from_yaml(path),
            Some("json") => Self::from_json(path),
            other => Err(anyhow!(
                "unsupported config extension {:?} for {}",
                other.unwrap_or(""),
                path.display()
            )),
        }
    }

    pub fn validate(&self) -> Result<(), SchedulerError> {
        self.model.validate()?;
        if let Some(parallel) = &self.parallel {
            parallel.validate()?;
        }
        self.generation.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_config_yaml() {
        let yaml = r#"
model:
  model: ./models/qwen2.5-0.5b-q4_k_m.gguf
  n_ctx: 4096
  n_batch: 512
  embedding: false
  lora_adapters:
    - path: ./adapters/style.gguf
      scale: 0.8

parallel:
  n_parallel: 4
  n_batch: 512

generation:
  max_tokens: 256
  temperature: 0.7
  stop: ["</s>"]
"#;
        let config: EngineConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.model.n_ctx, 4096);
        assert_eq!(config.model.lora_adapters.len(), 1);
        assert_eq!(config.parallel, Some(ParallelConfig::new(4, 512)));
        assert_eq!(config.generation.max_tokens, Some(256));
        assert_eq!(config.generation.stop_sequences, vec!["</s>".to_string()]);
        config.validate().unwrap();
    }

    #[test]
    fn test_engine_config_rejects_unknown_keys() {
        let yaml = r#"
model:
  model: m.gguf
  n_gpu: 99
"#;
        assert!(serde_yaml::from_str::<EngineConfig>(yaml).is_err());
    }

    #[test]
    fn test_from_value_reports_configuration_error() {
        let err = from_value::<CompletionParams>(serde_json::json!({ "n_predict": 3 }))
            .unwrap_err();
        assert!(matches!(err, SchedulerError::Configuration(_)));

        let err = from_value::<CompletionParams>(serde_json::json!({
            "prompt": "hi",
            "temperature_typo": 1.0
        }))
        .unwrap_err();
        assert!(matches!(err, SchedulerError::Configuration(_)));

        let params: CompletionParams =
            from_value(serde_json::json!({ "prompt": "hi" })).unwrap();
        assert_eq!(params.prompt, "hi");
    }

    #[test]
    fn test_from_path_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.json");
        std::fs::write(
            &path,
            r#"{"model": {"model": "m.gguf", "n_ctx": 1024}, "parallel": {"n_parallel": 2, "n_batch": 8}}"#,
        )
        .unwrap();
        let config = EngineConfig::from_path(&path).unwrap();
        assert_eq!(config.model.n_ctx, 1024);
        config.validate().unwrap();

        assert!(EngineConfig::from_path(dir.path().join("engine.toml")).is_err());
    }
}

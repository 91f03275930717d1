//! Generation configuration settings

use serde::{Deserialize, Deserializer, Serialize};

use crate::error::SchedulerError;

/// Negative limits mean "no limit"
fn token_limit<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<usize>, D::Error> {
    let limit = Option::<i64>::deserialize(deserializer)?;
    Ok(limit.and_then(|n| usize::try_from(n).ok()))
}

/// Sampling and stopping configuration for a completion
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GenerationConfig {
    /// Maximum number of tokens to generate (None = until EOS or the context edge)
    #[serde(default, alias = "n_predict", deserialize_with = "token_limit")]
    pub max_tokens: Option<usize>,

    /// Temperature for sampling (0 = greedy)
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Top-p nucleus sampling threshold
    #[serde(default = "default_top_p")]
    pub top_p: f32,

    /// Top-k sampling (None = disabled)
    #[serde(default)]
    pub top_k: Option<usize>,

    /// Min-p sampling threshold (0 = disabled)
    #[serde(default)]
    pub min_p: f32,

    /// Repetition penalty (1.0 = no penalty)
    #[serde(default = "default_repeat_penalty")]
    pub repeat_penalty: f32,

    /// Number of trailing tokens the repetition penalty looks at
    #[serde(default = "default_repeat_last_n")]
    pub repeat_last_n: usize,

    /// Frequency penalty
    #[serde(default)]
    pub frequency_penalty: f32,

    /// Presence penalty
    #[serde(default)]
    pub presence_penalty: f32,

    /// Stop sequences
    #[serde(default, alias = "stop")]
    pub stop_sequences: Vec<String>,

    /// Keep generating past the end-of-generation token
    #[serde(default)]
    pub ignore_eos: bool,

    /// Random seed (None = random)
    #[serde(default)]
    pub seed: Option<u64>,
}

fn default_temperature() -> f32 {
    1.0
}

fn default_top_p() -> f32 {
    1.0
}

fn default_repeat_penalty() -> f32 {
    1.0
}

fn default_repeat_last_n() -> usize {
    64
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_tokens: None,
            temperature: default_temperature(),
            top_p: default_top_p(),
            top_k: None,
            min_p: 0.0,
            repeat_penalty: default_repeat_penalty(),
            repeat_last_n: default_repeat_last_n(),
            frequency_penalty: 0.0,
            presence_penalty: 0.0,
            stop_sequences: Vec::new(),
            ignore_eos: false,
            seed: None,
        }
    }
}

impl GenerationConfig {
    /// Create a greedy decoding config (temperature = 0)
    pub fn greedy() -> Self {
        Self {
            temperature: 0.0,
            top_p: 1.0,
            top_k: None,
            ..Default::default()
        }
    }

    /// Create a creative sampling config
    pub fn creative() -> Self {
        Self {
            temperature: 1.2,
            top_p: 0.95,
            top_k: Some(50),
            ..Default::default()
        }
    }

    /// Create a balanced sampling config
    pub fn balanced() -> Self {
        Self {
            temperature: 0.7,
            top_p: 0.9,
            top_k: Some(40),
            ..Default::default()
        }
    }

    /// Check if greedy decoding should be used
    pub fn is_greedy(&self) -> bool {
        self.temperature == 0.0
    }

    /// Reject values the engine cannot sample with
    pub fn validate(&self) -> Result<(), SchedulerError> {
        if !self.temperature.is_finite() || self.temperature < 0.0 {
            return Err(SchedulerError::config(format!(
                "temperature must be a finite value >= 0, got {}",
                self.temperature
            )));
        }
        if !(self.top_p > 0.0 && self.top_p <= 1.0) {
            return Err(SchedulerError::config(format!(
                "top_p must be in (0, 1], got {}",
                self.top_p
            )));
        }
        if !(0.0..=1.0).contains(&self.min_p) {
            return Err(SchedulerError::config(format!(
                "min_p must be in [0, 1], got {}",
                self.min_p
            )));
        }
        if self.top_k == Some(0) {
            return Err(SchedulerError::config("top_k must be >= 1 when set"));
        }
        if !self.repeat_penalty.is_finite() || self.repeat_penalty <= 0.0 {
            return Err(SchedulerError::config(format!(
                "repeat_penalty must be > 0, got {}",
                self.repeat_penalty
            )));
        }
        if self.stop_sequences.iter().any(|s| s.is_empty()) {
            return Err(SchedulerError::config("stop sequences must not be empty"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presets_validate() {
        for preset in [
            GenerationConfig::default(),
            GenerationConfig::greedy(),
            GenerationConfig::creative(),
            GenerationConfig::balanced(),
        ] {
            preset.validate().unwrap();
        }
        assert!(GenerationConfig::greedy().is_greedy());
        assert!(!GenerationConfig::balanced().is_greedy());
    }

    #[test]
    fn test_invalid_sampling_values() {
        let cfg = GenerationConfig {
            top_p: 0.0,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());

        let cfg = GenerationConfig {
            temperature: f32::NAN,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());

        let cfg = GenerationConfig {
            stop_sequences: vec![String::new()],
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_host_aliases() {
        let cfg: GenerationConfig =
            serde_json::from_str(r#"{"n_predict": 12, "stop": ["\n"]}"#).unwrap();
        assert_eq!(cfg.max_tokens, Some(12));
        assert_eq!(cfg.stop_sequences, vec!["\n".to_string()]);

        let cfg: GenerationConfig = serde_json::from_str(r#"{"n_predict": -1}"#).unwrap();
        assert_eq!(cfg.max_tokens, None);
    }
}

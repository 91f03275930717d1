//! Configuration check command

use std::path::PathBuf;

use anyhow::{Context, Result};

use crate::config::EngineConfig;

/// Parse and validate an engine configuration file
pub async fn check_config(path: PathBuf) -> Result<()> {
    let config = EngineConfig::from_path(&path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    config
        .validate()
        .with_context(|| format!("invalid configuration in {}", path.display()))?;

    println!("Config: {}\n", path.display());
    println!("Model:       {}", config.model.model.display());
    println!("Context:     {} tokens", config.model.n_ctx);
    println!("Batch:       {} (ubatch {})", config.model.n_batch, config.model.n_ubatch);
    println!("Embedding:   {}", config.model.embedding);
    if !config.model.lora_adapters.is_empty() {
        println!("LoRA:        {} adapter(s)", config.model.lora_adapters.len());
    }
    match config.parallel {
        Some(parallel) => println!(
            "Parallel:    {} slots, {} batch units",
            parallel.n_parallel, parallel.n_batch
        ),
        None => println!("Parallel:    off"),
    }
    println!("Temperature: {}", config.generation.temperature);
    if let Some(max_tokens) = config.generation.max_tokens {
        println!("Max tokens:  {}", max_tokens);
    }
    println!("\nOK");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn test_check_accepts_valid_config() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(file, "model:\n  model: ./models/tiny.gguf\n  n_ctx: 1024").unwrap();
        check_config(file.path().to_path_buf()).await.unwrap();
    }

    #[tokio::test]
    async fn test_check_rejects_invalid_config() {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        writeln!(file, r#"{{"model": {{"model": "m.gguf", "n_ctx": 0}}}}"#).unwrap();
        assert!(check_config(file.path().to_path_buf()).await.is_err());

        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "model = 1").unwrap();
        assert!(check_config(file.path().to_path_buf()).await.is_err());
    }
}

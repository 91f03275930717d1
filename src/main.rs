use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use llamux::cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "llamux=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Bench {
            requests,
            parallel,
            n_batch,
            tokens,
            step_delay_us,
            seed,
        } => {
            llamux::cli::bench(requests, parallel, n_batch, tokens, step_delay_us, seed).await?;
        }
        Commands::CheckConfig { path } => {
            llamux::cli::check_config(path).await?;
        }
    }

    Ok(())
}

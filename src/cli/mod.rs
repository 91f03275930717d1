//! CLI commands
//!
//! `bench` drives the scheduler against the simulated engine;
//! `check-config` validates an engine configuration file.

mod bench;
mod check;

pub use bench::bench;
pub use check::check_config;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// llamux - request scheduler for a single LLM context
#[derive(Parser)]
#[command(name = "llamux")]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Benchmark the scheduler with the simulated engine
    Bench {
        /// Number of completion requests to submit
        #[arg(long, short = 'n', default_value = "32")]
        requests: usize,

        /// Parallel slots (1 = serial dispatch)
        #[arg(long, short, default_value = "4")]
        parallel: usize,

        /// Batch units shared by the parallel slots
        #[arg(long, default_value = "512")]
        n_batch: usize,

        /// Upper bound on tokens generated per request
        #[arg(long, default_value = "64")]
        tokens: usize,

        /// Simulated latency of one decode step, in microseconds
        #[arg(long, default_value = "200")]
        step_delay_us: u64,

        /// Seed for prompt and length jitter
        #[arg(long, default_value = "42")]
        seed: u64,
    },

    /// Parse and validate a YAML or JSON engine configuration
    CheckConfig {
        /// Configuration file (.yaml, .yml or .json)
        path: PathBuf,
    },
}

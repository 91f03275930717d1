//! Scheduler benchmark command
//!
//! Submits a burst of completions to a scheduler backed by the simulated
//! engine and reports throughput and time-to-first-token.

use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use futures::future::join_all;
use futures::StreamExt;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::{CompletionParams, GenerationConfig, LoadParams};
use crate::engine::sim::{SimConfig, SimEngine};
use crate::scheduler::Scheduler;
use crate::streaming::StreamEvent;

const PROMPT_WORDS: &[&str] = &[
    "explain", "the", "scheduler", "queue", "in", "plain", "words", "please", "with", "detail",
];

#[derive(Debug)]
struct RequestStats {
    first_token: Option<Duration>,
    total: Duration,
    tokens: usize,
    completed: bool,
}

/// Run the benchmark
pub async fn bench(
    requests: usize,
    parallel: usize,
    n_batch: usize,
    tokens: usize,
    step_delay_us: u64,
    seed: u64,
) -> Result<()> {
    if requests == 0 || tokens == 0 {
        bail!("requests and tokens must be > 0");
    }

    let engine = SimEngine::new(SimConfig {
        step_delay: Duration::from_micros(step_delay_us),
        ..SimConfig::sampling(tokens)
    });
    let scheduler = Scheduler::new(engine)?;
    let load = LoadParams {
        n_batch: n_batch.max(1),
        n_ubatch: n_batch.max(1),
        ..LoadParams::new("sim-bench.gguf")
    };
    let info = scheduler.load(&load, |_| {})?;
    tracing::info!("Loaded {}", info.description);

    if parallel > 1 && !scheduler.enable_parallel_mode(parallel, n_batch) {
        bail!(
            "cannot run {} parallel slots over {} batch units",
            parallel,
            n_batch
        );
    }
    let batch_units = (n_batch / parallel.max(1)).max(1);

    let mut rng = StdRng::seed_from_u64(seed);
    let started = Instant::now();
    let mut pending = Vec::with_capacity(requests);
    for i in 0..requests {
        let words = rng.gen_range(2..=PROMPT_WORDS.len());
        let prompt = PROMPT_WORDS[..words].join(" ");
        let generation = GenerationConfig {
            max_tokens: Some(rng.gen_range(tokens.div_ceil(2)..=tokens)),
            seed: Some(seed.wrapping_add(i as u64)),
            ..Default::default()
        };
        let params = CompletionParams::new(prompt)
            .with_generation(generation)
            .with_batch_units(batch_units);

        let enqueued = Instant::now();
        let (_, stream) = scheduler.stream_completion(params)?;
        pending.push(async move {
            let mut stream = Box::pin(stream);
            let mut stats = RequestStats {
                first_token: None,
                total: Duration::ZERO,
                tokens: 0,
                completed: false,
            };
            while let Some(event) = stream.next().await {
                match event {
                    StreamEvent::Token(_) => {
                        stats.first_token.get_or_insert_with(|| enqueued.elapsed());
                        stats.tokens += 1;
                    }
                    StreamEvent::Done(outcome) => stats.completed = outcome.is_completed(),
                }
            }
            stats.total = enqueued.elapsed();
            stats
        });
    }

    let results = join_all(pending).await;
    let elapsed = started.elapsed();
    scheduler.invalidate()?;

    report(&results, elapsed, parallel);
    Ok(())
}

fn report(results: &[RequestStats], elapsed: Duration, parallel: usize) {
    let total_tokens: usize = results.iter().map(|r| r.tokens).sum();
    let completed = results.iter().filter(|r| r.completed).count();
    let mut ttft: Vec<Duration> = results.iter().filter_map(|r| r.first_token).collect();
    ttft.sort();
    let mut latency: Vec<Duration> = results.iter().map(|r| r.total).collect();
    latency.sort();

    println!("Requests:    {} ({} completed)", results.len(), completed);
    println!("Slots:       {}", parallel.max(1));
    println!("Tokens:      {}", total_tokens);
    println!("Wall time:   {:.2?}", elapsed);
    println!(
        "Throughput:  {:.1} tokens/s",
        total_tokens as f64 / elapsed.as_secs_f64().max(f64::EPSILON)
    );
    println!(
        "TTFT:        p50 {:.2?}  p95 {:.2?}",
        percentile(&ttft, 50),
        percentile(&ttft, 95)
    );
    println!(
        "Latency:     p50 {:.2?}  p95 {:.2?}",
        percentile(&latency, 50),
        percentile(&latency, 95)
    );
}

/// Nearest-rank percentile of sorted samples
fn percentile(sorted: &[Duration], pct: usize) -> Duration {
    if sorted.is_empty() {
        return Duration::ZERO;
    }
    let rank = (pct * sorted.len()).div_ceil(100).max(1);
    sorted[rank.min(sorted.len()) - 1]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percentile() {
        let samples: Vec<Duration> = (1..=10).map(Duration::from_millis).collect();
        assert_eq!(percentile(&samples, 50), Duration::from_millis(5));
        assert_eq!(percentile(&samples, 95), Duration::from_millis(10));
        assert_eq!(percentile(&[], 50), Duration::ZERO);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_bench_runs_to_completion() {
        bench(6, 2, 64, 8, 0, 7).await.unwrap();
    }

    #[tokio::test]
    async fn test_bench_rejects_bad_parallel_mode() {
        assert!(bench(2, 4, 2, 8, 0, 7).await.is_err());
    }
}

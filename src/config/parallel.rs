//! Parallel decoding configuration

use serde::{Deserialize, Serialize};

use crate::error::SchedulerError;

/// Slot pool shape: `n_parallel` lanes sharing `n_batch` batch units
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ParallelConfig {
    /// Number of slots
    pub n_parallel: usize,

    /// Total batch capacity shared by all slots
    pub n_batch: usize,
}

impl ParallelConfig {
    pub fn new(n_parallel: usize, n_batch: usize) -> Self {
        Self { n_parallel, n_batch }
    }

    pub fn validate(&self) -> Result<(), SchedulerError> {
        if self.n_parallel == 0 {
            return Err(SchedulerError::config("n_parallel must be > 0"));
        }
        if self.n_batch < self.n_parallel {
            return Err(SchedulerError::config(format!(
                "n_batch ({}) must be >= n_parallel ({})",
                self.n_batch, self.n_parallel
            )));
        }
        Ok(())
    }
}

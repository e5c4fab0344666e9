//! Exponential backoff retry policy with deterministic per-task jitter.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration for action retries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total executions allowed before a task is dead-lettered.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub initial_backoff_ms: u64,
    /// Maximum backoff delay (caps exponential growth).
    pub max_backoff_ms: u64,
    /// Multiplier applied to backoff on each retry.
    pub multiplier: f64,
    /// Spread delays by up to ±`jitter_fraction * backoff` (0.0 = no jitter).
    pub jitter_fraction: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff_ms: 1_000,
            max_backoff_ms: 300_000,
            multiplier: 2.0,
            jitter_fraction: 0.1,
        }
    }
}

/// Stateless retry policy — computes the next delay given the attempt number.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Returns `true` if a task that has failed `attempt` times may run again.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.config.max_attempts
    }

    /// Delay before the retry that follows the `attempt`-th failure (1-based).
    ///
    /// The jitter is derived from `key`, so one task always gets the same
    /// schedule while different tasks spread out.
    pub fn next_delay(&self, attempt: u32, key: &str) -> Duration {
        let exp = attempt.saturating_sub(1).min(63) as i32;
        let base_ms = self.config.initial_backoff_ms as f64 * self.config.multiplier.powi(exp);
        let capped = base_ms.min(self.config.max_backoff_ms as f64);

        let fraction = self.config.jitter_fraction.clamp(0.0, 1.0);
        let jitter_ms = capped * fraction * unit_jitter(key, attempt);
        let total_ms = (capped + jitter_ms).max(0.0);

        Duration::from_millis(total_ms as u64)
    }
}

/// Pseudo-random value in `[-1.0, 1.0]` derived from `(key, attempt)`.
///
/// FNV-1a over the key, then a splitmix64 finalizer, so schedules are stable
/// across builds and toolchains.
fn unit_jitter(key: &str, attempt: u32) -> f64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in key.bytes() {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    let bucket = splitmix64(hash ^ u64::from(attempt)) % 2001;
    (bucket as f64 - 1000.0) / 1000.0
}

fn splitmix64(seed: u64) -> u64 {
    let mut z = seed.wrapping_add(0x9e37_79b9_7f4a_7c15);
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^ (z >> 31)
}

//! Exponential reconnect backoff with optional jitter.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Backoff parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BackoffConfig {
    /// First delay after a failure (ms)
    pub initial_ms: u64,
    /// Upper bound on any delay (ms)
    pub max_ms: u64,
    /// Growth factor per consecutive failure
    pub multiplier: f64,
    /// Fraction of the delay randomly added or removed, in [0, 1]
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_ms: 500,
            max_ms: 5_000,
            multiplier: 1.7,
            jitter: 0.2,
        }
    }
}

/// Tracks the current delay across consecutive failures.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    current: Duration,
    attempts: u32,
    rng: StdRng,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self::with_rng(config, StdRng::from_os_rng())
    }

    /// Backoff with a fixed jitter sequence.
    pub fn with_seed(config: BackoffConfig, seed: u64) -> Self {
        Self::with_rng(config, StdRng::seed_from_u64(seed))
    }

    fn with_rng(config: BackoffConfig, rng: StdRng) -> Self {
        Self {
            config,
            current: Duration::from_millis(config.initial_ms),
            attempts: 0,
            rng,
        }
    }

    /// Consecutive failures since the last reset.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Delay to wait before the next attempt; grows the base delay.
    pub fn next_delay(&mut self) -> Duration {
        let max = Duration::from_millis(self.config.max_ms);
        let base = self.current.min(max);

        self.attempts = self.attempts.saturating_add(1);
        let grown = base.as_secs_f64() * self.config.multiplier.max(1.0);
        self.current = Duration::from_secs_f64(grown.min(max.as_secs_f64()));

        self.apply_jitter(base).min(max)
    }

    /// Return to the seed delay after a successful connection.
    pub fn reset(&mut self) {
        self.current = Duration::from_millis(self.config.initial_ms);
        self.attempts = 0;
    }

    fn apply_jitter(&mut self, base: Duration) -> Duration {
        let jitter = self.config.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 {
            return base;
        }
        let spread = self.rng.random_range(-jitter..=jitter);
        Duration::from_secs_f64((base.as_secs_f64() * (1.0 + spread)).max(0.0))
    }
}

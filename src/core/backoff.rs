//! Exponential retry delay with capped maximum and multiplicative jitter.
//!
//! ```text
//! retry  un-jittered (base 1s, max 32s)
//! -----  -----------
//! 0      1s
//! 1      2s
//! 2      4s
//! 3      8s
//! 4      16s
//! 5+     32s
//! ```
//!
//! Each value is then scaled by a random factor in `[1 - jitter, 1 + jitter]`
//! so clients that regain connectivity together spread their retries.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Default delay before the first retry.
pub const DEFAULT_BASE_DELAY_MS: u64 = 1_000;
/// Default ceiling for the un-jittered delay.
pub const DEFAULT_MAX_DELAY_MS: u64 = 32_000;
/// Default jitter ratio (±10%).
pub const DEFAULT_JITTER_RATIO: f64 = 0.1;

/// Backoff parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Backoff {
    /// Delay for `retry_count = 0`, in milliseconds.
    pub base_delay_ms: u64,
    /// Cap applied before jitter, in milliseconds.
    pub max_delay_ms: u64,
    /// Jitter ratio; `0.1` means ±10%.
    pub jitter_ratio: f64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base_delay_ms: DEFAULT_BASE_DELAY_MS,
            max_delay_ms: DEFAULT_MAX_DELAY_MS,
            jitter_ratio: DEFAULT_JITTER_RATIO,
        }
    }
}

impl Backoff {
    /// Tight timers for tests.
    pub fn testing() -> Self {
        Self {
            base_delay_ms: 10,
            max_delay_ms: 80,
            jitter_ratio: DEFAULT_JITTER_RATIO,
        }
    }

    /// `min(base * 2^retry_count, max)` without jitter.
    pub fn unjittered_delay(&self, retry_count: u32) -> Duration {
        let factor = 2f64.powi(retry_count.min(1023) as i32);
        let delay_ms = (self.base_delay_ms as f64 * factor).min(self.max_delay_ms as f64);
        Duration::from_millis(delay_ms as u64)
    }

    /// Jittered delay using the thread-local RNG.
    pub fn compute_delay(&self, retry_count: u32) -> Duration {
        self.compute_delay_with(retry_count, &mut rand::thread_rng())
    }

    /// Jittered delay using the supplied RNG.
    pub fn compute_delay_with<R: Rng + ?Sized>(&self, retry_count: u32, rng: &mut R) -> Duration {
        let delay_ms = self.unjittered_delay(retry_count).as_millis() as f64;
        let ratio = self.jitter_ratio.clamp(0.0, 1.0);
        let spread: f64 = rng.gen_range(-1.0..=1.0);
        let jittered = delay_ms * (1.0 + ratio * spread);
        Duration::from_millis(jittered.max(0.0).round() as u64)
    }
}

/// Retry delay for `retry_count` with explicit base and max, ±10% jitter.
pub fn compute_delay(retry_count: u32, base_delay: Duration, max_delay: Duration) -> Duration {
    Backoff {
        base_delay_ms: base_delay.as_millis() as u64,
        max_delay_ms: max_delay.as_millis() as u64,
        jitter_ratio: DEFAULT_JITTER_RATIO,
    }
    .compute_delay(retry_count)
}

//! Retry/backoff policy for queued mutations.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};

pub const DEFAULT_BASE_DELAY_MS: i64 = 5_000;
pub const DEFAULT_MAX_DELAY_MS: i64 = 300_000;
pub const DEFAULT_MAX_ATTEMPTS: i64 = 5;
const MIN_DELAY_MS: i64 = 1_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    pub base_delay_ms: i64,
    pub max_delay_ms: i64,
    /// Attempts after which an entry is flagged failed.
    pub max_attempts: i64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: DEFAULT_BASE_DELAY_MS,
            max_delay_ms: DEFAULT_MAX_DELAY_MS,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

fn deterministic_jitter_ms(seed: i64) -> i64 {
    (seed.unsigned_abs() % 700) as i64 + 50
}

impl RetryPolicy {
    /// Clamp fields into the ranges the engine can work with.
    pub fn normalized(self) -> Self {
        let max_delay_ms = self.max_delay_ms.max(MIN_DELAY_MS);
        Self {
            base_delay_ms: self.base_delay_ms.clamp(MIN_DELAY_MS, max_delay_ms),
            max_delay_ms,
            max_attempts: self.max_attempts.clamp(1, 100),
        }
    }

    /// Delay before the next attempt, after `attempts` failures.
    ///
    /// Doubles from the base delay per failure, capped at `max_delay_ms`,
    /// plus a small deterministic jitter derived from `seed` so entries
    /// failing together do not retry in lockstep.
    pub fn delay_for_attempt(&self, attempts: i64, seed: i64) -> i64 {
        let exponent = (attempts.max(1) - 1).min(20) as u32;
        let raw = self.base_delay_ms.saturating_mul(1_i64 << exponent);
        raw.clamp(MIN_DELAY_MS, self.max_delay_ms.max(MIN_DELAY_MS)) + deterministic_jitter_ms(seed)
    }

    /// Timestamp of the next attempt. A server `Retry-After` hint replaces
    /// the exponential delay when present.
    pub fn next_attempt_at(
        &self,
        now: DateTime<Utc>,
        attempts: i64,
        seed: i64,
        retry_after_secs: Option<u64>,
    ) -> DateTime<Utc> {
        let delay_ms = match retry_after_secs {
            Some(secs) => (secs as i64)
                .saturating_mul(1_000)
                .clamp(MIN_DELAY_MS, self.max_delay_ms.max(MIN_DELAY_MS)),
            None => self.delay_for_attempt(attempts, seed),
        };
        now + ChronoDuration::milliseconds(delay_ms)
    }

    pub fn is_exhausted(&self, attempts: i64) -> bool {
        attempts >= self.max_attempts
    }
}

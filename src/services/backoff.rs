use rand::Rng;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

/// Lower and upper bounds of the jitter factor (±30%).
const JITTER_MIN: f64 = 0.7;
const JITTER_MAX: f64 = 1.3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffStrategy {
    Linear,
    Exponential,
    Fibonacci,
}

impl FromStr for BackoffStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "linear" => Ok(BackoffStrategy::Linear),
            "exponential" => Ok(BackoffStrategy::Exponential),
            "fibonacci" => Ok(BackoffStrategy::Fibonacci),
            other => Err(format!("unknown backoff strategy: {}", other)),
        }
    }
}

/// Retry budget and delay curve for one kind of operation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub strategy: BackoffStrategy,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub jitter: bool,
    /// Retries after the first attempt; total attempts are `max_retries + 1`.
    pub max_retries: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            strategy: BackoffStrategy::Exponential,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            jitter: true,
            max_retries: 5,
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for(&self, attempt: u32) -> Duration {
        compute_delay(
            attempt,
            self.strategy,
            self.initial_delay,
            self.max_delay,
            self.jitter,
        )
    }
}

/// Delay to wait after the `attempt`-th failure (1-based).
///
/// The un-jittered value is clamped to `max_delay`. With `jitter` it is scaled
/// by a uniform factor in `[0.7, 1.3]` and clamped again, so the result never
/// exceeds `max_delay`.
pub fn compute_delay(
    attempt: u32,
    strategy: BackoffStrategy,
    initial_delay: Duration,
    max_delay: Duration,
    jitter: bool,
) -> Duration {
    if attempt == 0 {
        return Duration::ZERO;
    }

    let multiplier: u64 = match strategy {
        BackoffStrategy::Linear => attempt as u64,
        BackoffStrategy::Exponential => 1u64.checked_shl(attempt - 1).unwrap_or(u64::MAX),
        BackoffStrategy::Fibonacci => fibonacci(attempt),
    };

    let base_ms = initial_delay.as_millis().min(u64::MAX as u128) as u64;
    let max_ms = max_delay.as_millis().min(u64::MAX as u128) as u64;
    let capped = base_ms.saturating_mul(multiplier).min(max_ms);

    if !jitter {
        return Duration::from_millis(capped);
    }

    let factor = rand::thread_rng().gen_range(JITTER_MIN..=JITTER_MAX);
    let jittered = ((capped as f64) * factor).round() as u64;
    Duration::from_millis(jittered.min(max_ms))
}

/// `fib(1) = 1, fib(2) = 1`, saturating at `u64::MAX`.
fn fibonacci(n: u32) -> u64 {
    let (mut a, mut b) = (0u64, 1u64);
    for _ in 1..n {
        let next = a.saturating_add(b);
        a = b;
        b = next;
    }
    b
}

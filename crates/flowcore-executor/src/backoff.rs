//! Exponential backoff schedule: `min(initialDelay *
//! multiplier^attempt, maxDelay)`.

use std::time::Duration;

#[derive(Debug, Clone, Copy)]
pub struct RetryStrategy {
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
}

impl Default for RetryStrategy {
    fn default() -> Self {
        RetryStrategy {
            max_retries: 3,
            initial_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(30_000),
            backoff_multiplier: 2.0,
        }
    }
}

pub fn delay_for_attempt(strategy: &RetryStrategy, attempt: u32) -> Duration {
    let factor = strategy.backoff_multiplier.powi(attempt as i32);
    let scaled = (strategy.initial_delay.as_millis() as f64) * factor;
    let capped = scaled.min(strategy.max_delay.as_millis() as f64);
    Duration::from_millis(capped.max(0.0) as u64)
}

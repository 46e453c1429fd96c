//! Bounded exponential backoff.
//!
//! Used by the distributed sender for routing retries and by the
//! transaction coordinator for backoff restarts.

use rand::Rng;
use std::time::Duration;

/// Backoff policy.
#[derive(Debug, Clone)]
pub struct RetryOptions {
    /// Delay before the first retry.
    pub initial_backoff: Duration,
    /// Ceiling on the delay between retries.
    pub max_backoff: Duration,
    /// Growth factor between consecutive delays.
    pub multiplier: f64,
    /// Maximum number of attempts; 0 means unbounded.
    pub max_attempts: usize,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(5),
            multiplier: 2.0,
            max_attempts: 0,
        }
    }
}

impl RetryOptions {
    /// A policy suited to quick in-process tests.
    pub fn fast() -> Self {
        Self {
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(10),
            multiplier: 2.0,
            max_attempts: 0,
        }
    }
}

/// Backoff state for one retry loop.
pub struct Backoff {
    opts: RetryOptions,
    attempt: usize,
}

impl Backoff {
    pub fn new(opts: RetryOptions) -> Self {
        Self { opts, attempt: 0 }
    }

    /// The delay to sleep before the next attempt, or `None` once the
    /// attempt budget is spent. Jittered by up to 50% to spread thundering
    /// retries.
    pub fn next_backoff(&mut self) -> Option<Duration> {
        if self.opts.max_attempts != 0 && self.attempt >= self.opts.max_attempts {
            return None;
        }
        let exp = self.opts.multiplier.powi(self.attempt as i32);
        self.attempt += 1;
        let base = self.opts.initial_backoff.as_secs_f64() * exp;
        let capped = base.min(self.opts.max_backoff.as_secs_f64());
        let jittered = capped * rand::thread_rng().gen_range(0.75..1.25);
        Some(Duration::from_secs_f64(
            jittered.min(self.opts.max_backoff.as_secs_f64()),
        ))
    }

    /// Attempts made so far.
    pub fn attempts(&self) -> usize {
        self.attempt
    }

    /// Reset after a successful attempt so a later failure starts over.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

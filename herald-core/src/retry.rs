//! Bounded exponential backoff shared by every upstream call.
//!
//! A policy yields `max_attempts - 1` delays, so driving it through
//! `tokio_retry::RetryIf` gives exactly `max_attempts` tries of one call.
//! Delay `n` is `min(base * 2^n, cap)` scaled by a uniform factor in
//! `[0.5, 1.0]`, which keeps it at or below `cap`.

use rand::Rng;
use std::time::Duration;

use crate::config::ClientConfig;

/// How a failed call should be treated by the retry loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Timeout, connection reset, 5xx, rate limiting.
    Retryable,
    /// The session handle is no longer valid upstream (404/410 on a respond call).
    SessionInvalid,
    /// Authentication or malformed request. Never retried.
    Fatal,
}

impl ErrorClass {
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorClass::Retryable)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total tries of one primitive call, including the first.
    pub max_attempts: usize,
    pub base: Duration,
    pub cap: Duration,
    pub attempt_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&ClientConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &ClientConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base: Duration::from_millis(config.backoff_base_ms),
            cap: Duration::from_millis(config.backoff_cap_ms),
            attempt_timeout: Duration::from_secs(config.attempt_timeout_secs),
        }
    }

    /// Un-jittered delay before retry number `n` (0-based).
    pub fn ceiling(&self, n: u32) -> Duration {
        let factor = 2u32.checked_pow(n).unwrap_or(u32::MAX);
        self.base
            .checked_mul(factor)
            .map(|d| d.min(self.cap))
            .unwrap_or(self.cap)
    }

    pub fn delays(&self) -> Backoff {
        Backoff {
            policy: self.clone(),
            next: 0,
            remaining: self.max_attempts.saturating_sub(1),
        }
    }
}

/// Iterator of jittered delays handed to `RetryIf`.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: RetryPolicy,
    next: u32,
    remaining: usize,
}

impl Iterator for Backoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        let ceiling = self.policy.ceiling(self.next);
        self.next = self.next.saturating_add(1);
        Some(half_jitter(ceiling))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl ExactSizeIterator for Backoff {}

fn half_jitter(d: Duration) -> Duration {
    if d.is_zero() {
        return d;
    }
    let nanos = u64::try_from(d.as_nanos()).unwrap_or(u64::MAX);
    Duration::from_nanos(rand::thread_rng().gen_range(nanos / 2..=nanos))
}

//! Exponential backoff shared by tunnel reconnects and upstream retries.

use std::time::Duration;

/// Immutable backoff parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub max: Duration,
    pub multiplier: f64,
}

impl Default for BackoffPolicy {
    /// Link reconnect defaults: base 1s, factor 2, cap 30s.
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

/// Mutable backoff state for one retry loop.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: BackoffPolicy,
    next: Duration,
}

impl Backoff {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            next: policy.initial,
        }
    }

    /// The delay to wait before the next attempt. Each call grows the
    /// following delay by the multiplier, up to the cap.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        let grown = self.next.mul_f64(self.policy.multiplier);
        self.next = grown.min(self.policy.max);
        delay
    }

    /// Reset to the initial delay (after a successful attempt).
    pub fn reset(&mut self) {
        self.next = self.policy.initial;
    }
}

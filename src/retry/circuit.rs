//! Batch-level circuit breaker.
//!
//! Unlike per-operation retry, this guards a loop over many independent
//! items: a run of consecutive failures means the gateway (or the site) is
//! down and the rest of the batch should not be attempted.

use tracing::warn;

#[derive(Debug, Clone)]
pub struct BatchCircuitBreaker {
    threshold: u32,
    consecutive_failures: u32,
    total_failures: u32,
    total_successes: u32,
    tripped: bool,
}

impl BatchCircuitBreaker {
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold: threshold.max(1),
            consecutive_failures: 0,
            total_failures: 0,
            total_successes: 0,
            tripped: false,
        }
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    /// Any success resets the consecutive-failure count.
    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
        self.total_successes += 1;
    }

    /// Record a failure. Returns true once the breaker has tripped.
    pub fn record_failure(&mut self) -> bool {
        self.consecutive_failures += 1;
        self.total_failures += 1;
        if !self.tripped && self.consecutive_failures >= self.threshold {
            self.tripped = true;
            warn!(
                "Circuit breaker tripped after {} consecutive failures",
                self.consecutive_failures
            );
        }
        self.tripped
    }

    pub fn is_tripped(&self) -> bool {
        self.tripped
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn total_failures(&self) -> u32 {
        self.total_failures
    }

    pub fn total_successes(&self) -> u32 {
        self.total_successes
    }
}

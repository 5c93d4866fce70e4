use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Stops talking to a PLC after `threshold` consecutive failures, and lets a single attempt
/// through again once `timeout` has passed since the last failure.
#[derive(Debug)]
pub struct CircuitBreaker {
    threshold: u32,
    timeout: Duration,
    failure_count: u32,
    last_failure: Option<Instant>,
    open: bool,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, timeout: Duration) -> Self {
        Self { threshold, timeout, failure_count: 0, last_failure: None, open: false }
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    pub fn failure_count(&self) -> u32 {
        self.failure_count
    }

    pub fn record_success(&mut self) {
        if self.open {
            info!(message = "circuit breaker closed", previous_failures = self.failure_count);
        }
        self.failure_count = 0;
        self.open = false;
    }

    pub fn record_failure(&mut self) {
        self.failure_count = self.failure_count.saturating_add(1);
        self.last_failure = Some(Instant::now());
        debug!(
            message = "failure recorded",
            failures = self.failure_count,
            threshold = self.threshold
        );
        if self.failure_count >= self.threshold && !self.open {
            warn!(
                message = "circuit breaker opened",
                failures = self.failure_count,
                timeout = ?self.timeout,
            );
            self.open = true;
        }
    }

    pub fn can_attempt(&self) -> bool {
        if !self.open {
            return true;
        }
        let Some(last_failure) = self.last_failure else {
            return true;
        };
        let expired = last_failure.elapsed() > self.timeout;
        if expired {
            debug!(message = "circuit breaker timeout expired, letting an attempt through");
        }
        expired
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn opens_at_threshold_and_recovers() {
        let mut breaker = CircuitBreaker::new(3, Duration::from_secs(60));
        breaker.record_failure();
        breaker.record_failure();
        assert!(!breaker.is_open());
        assert!(breaker.can_attempt());
        breaker.record_failure();
        assert!(breaker.is_open());
        assert!(!breaker.can_attempt());

        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(!breaker.can_attempt());
        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(breaker.can_attempt());

        breaker.record_success();
        assert!(!breaker.is_open());
        assert_eq!(breaker.failure_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn failure_while_half_open_restarts_timeout() {
        let mut breaker = CircuitBreaker::new(1, Duration::from_secs(10));
        breaker.record_failure();
        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(breaker.can_attempt());
        breaker.record_failure();
        assert!(!breaker.can_attempt());
        assert_eq!(breaker.failure_count(), 2);
    }
}

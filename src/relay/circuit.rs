//! Per-relay circuit breaker

use serde::Serialize;
use std::time::{Duration, Instant};

/// Health state of one relay.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CircuitState {
    /// Publishes proceed normally
    Closed,
    /// Skipped until the cooldown elapses, then probed again
    OpenTemporary,
    /// Skipped until an explicit reset. Reserved for relays we can never
    /// satisfy, such as proof-of-work demands.
    OpenPermanent,
}

/// Failure tracking for a single relay.
#[derive(Debug)]
pub struct CircuitBreaker {
    failure_threshold: u32,
    cooldown: Duration,
    failures: u32,
    state: CircuitState,
    opened_at: Option<Instant>,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, cooldown: Duration) -> Self {
        CircuitBreaker {
            failure_threshold,
            cooldown,
            failures: 0,
            state: CircuitState::Closed,
            opened_at: None,
        }
    }

    /// Whether a publish to this relay should be attempted now.
    ///
    /// A temporarily open circuit lets one attempt through once the cooldown
    /// has elapsed (half-open probe); the attempt's outcome then decides the
    /// next state.
    pub fn should_attempt(&self) -> bool {
        match self.state {
            CircuitState::Closed => true,
            CircuitState::OpenPermanent => false,
            CircuitState::OpenTemporary => self
                .opened_at
                .map_or(true, |at| at.elapsed() >= self.cooldown),
        }
    }

    /// Record an accepted publish.
    pub fn record_success(&mut self) {
        self.failures = 0;
        self.state = CircuitState::Closed;
        self.opened_at = None;
    }

    /// Record a failed publish. An error carrying a proof-of-work demand
    /// opens the circuit permanently.
    pub fn record_failure(&mut self, error: &str) {
        if error.contains("pow:") {
            self.state = CircuitState::OpenPermanent;
            self.opened_at = Some(Instant::now());
            return;
        }
        self.failures += 1;
        if self.failures >= self.failure_threshold {
            // also re-arms the cooldown when a half-open probe fails
            self.state = CircuitState::OpenTemporary;
            self.opened_at = Some(Instant::now());
        }
    }

    /// Manual reset, clearing a permanent open as well.
    pub fn reset(&mut self) {
        self.failures = 0;
        self.state = CircuitState::Closed;
        self.opened_at = None;
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new(3, Duration::from_secs(300))
    }

    #[test]
    fn test_opens_after_consecutive_failures() {
        let mut cb = breaker();
        cb.record_failure("connection refused");
        cb.record_failure("connection refused");
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.should_attempt());
        cb.record_failure("connection refused");
        assert_eq!(cb.state(), CircuitState::OpenTemporary);
        assert!(!cb.should_attempt());
    }

    #[test]
    fn test_success_resets_counter() {
        let mut cb = breaker();
        cb.record_failure("timeout");
        cb.record_failure("timeout");
        cb.record_success();
        assert_eq!(cb.failures(), 0);
        cb.record_failure("timeout");
        cb.record_failure("timeout");
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_half_open_after_cooldown() {
        let mut cb = CircuitBreaker::new(1, Duration::from_millis(0));
        cb.record_failure("timeout");
        assert_eq!(cb.state(), CircuitState::OpenTemporary);
        // zero cooldown: the probe is allowed immediately
        assert!(cb.should_attempt());
        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_pow_demand_opens_permanently() {
        let mut cb = CircuitBreaker::new(3, Duration::from_millis(0));
        cb.record_failure("pow: 28 bits required");
        assert_eq!(cb.state(), CircuitState::OpenPermanent);
        // cooldown never reopens a permanent circuit
        assert!(!cb.should_attempt());

        cb.reset();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.should_attempt());
    }
}

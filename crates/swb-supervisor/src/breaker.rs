// SPDX-License-Identifier: MIT OR Apache-2.0
//! Crash-based circuit breaker.
//!
//! Exits faster than the crash threshold count as failures; anything longer
//! counts as a success that resets the failure window. Re-entry from open is
//! an explicit probe (the management plane or relaunch path opts in), not a
//! wall-clock cooldown.

/// Breaker position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    /// Normal operation; restarts allowed.
    Closed,
    /// Tripped; restarts refused until a probe is allowed.
    Open,
    /// One probe in flight; its outcome decides the next state.
    HalfOpen,
}

impl BreakerState {
    /// Wire spelling, as carried in `process:exited` events.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Circuit breaker over consecutive quick-crash counts.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    failure_threshold: u32,
    consecutive_failures: u32,
    state: BreakerState,
}

impl CircuitBreaker {
    /// Create a closed breaker tripping after `failure_threshold` quick
    /// failures in a row.
    #[must_use]
    pub fn new(failure_threshold: u32) -> Self {
        Self {
            failure_threshold: failure_threshold.max(1),
            consecutive_failures: 0,
            state: BreakerState::Closed,
        }
    }

    /// Current breaker position.
    #[must_use]
    pub fn state(&self) -> BreakerState {
        self.state
    }

    /// Consecutive quick failures recorded since the last success.
    #[must_use]
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Whether a restart may proceed right now.
    #[must_use]
    pub fn can_restart(&self) -> bool {
        !matches!(self.state, BreakerState::Open)
    }

    /// Record a quick failure (crash before the crash threshold).
    pub fn record_failure(&mut self) {
        self.consecutive_failures += 1;
        if matches!(self.state, BreakerState::HalfOpen)
            || self.consecutive_failures >= self.failure_threshold
        {
            self.state = BreakerState::Open;
        }
    }

    /// Record a success (uptime at or beyond the crash threshold).
    ///
    /// Resets the failure window and closes the breaker from any state.
    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
        self.state = BreakerState::Closed;
    }

    /// Allow one probe spawn from the open state.
    ///
    /// No-op unless currently open.
    pub fn allow_probe(&mut self) {
        if matches!(self.state, BreakerState::Open) {
            self.state = BreakerState::HalfOpen;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opens_after_threshold_failures() {
        let mut breaker = CircuitBreaker::new(5);
        for _ in 0..4 {
            breaker.record_failure();
            assert!(breaker.can_restart());
        }
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);
        assert!(!breaker.can_restart());
    }

    #[test]
    fn success_resets_failure_window() {
        let mut breaker = CircuitBreaker::new(3);
        breaker.record_failure();
        breaker.record_failure();
        breaker.record_success();
        assert_eq!(breaker.consecutive_failures(), 0);
        breaker.record_failure();
        breaker.record_failure();
        assert!(breaker.can_restart());
    }

    #[test]
    fn probe_success_recloses() {
        let mut breaker = CircuitBreaker::new(2);
        breaker.record_failure();
        breaker.record_failure();
        assert!(!breaker.can_restart());

        breaker.allow_probe();
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
        assert!(breaker.can_restart());

        breaker.record_success();
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn probe_failure_reopens_immediately() {
        let mut breaker = CircuitBreaker::new(3);
        for _ in 0..3 {
            breaker.record_failure();
        }
        breaker.allow_probe();
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);
    }

    #[test]
    fn allow_probe_is_noop_when_closed() {
        let mut breaker = CircuitBreaker::new(3);
        breaker.allow_probe();
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn five_quick_exits_then_long_uptime_scenario() {
        // Five consecutive quick crashes trip the breaker; one probe that
        // outlives the crash threshold closes it again.
        let mut breaker = CircuitBreaker::new(5);
        for _ in 0..5 {
            breaker.record_failure();
        }
        assert!(!breaker.can_restart());

        breaker.allow_probe();
        breaker.record_success();
        assert!(breaker.can_restart());
        assert_eq!(breaker.state(), BreakerState::Closed);
    }
}

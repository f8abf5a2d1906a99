//! Bounded retry with exponential backoff.
//!
//! Used for requests that depend on a handshake or on the remote side being
//! ready (activation requests, snapshot requests while the server link is
//! down). Time is the caller's session clock in seconds, so the schedule is
//! deterministic unless jitter is configured.

use rand::Rng;

/// Backoff parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Delay before the first retry (seconds). Default: 0.5.
    pub initial_delay: f64,
    /// Multiplier applied to the delay after each attempt. Default: 2.0.
    pub multiplier: f64,
    /// Maximum delay between attempts (seconds). Default: 4.0.
    pub max_delay: f64,
    /// Attempts before giving up. Default: 6.
    pub max_attempts: u32,
    /// Jitter factor (0.0–1.0), applied as ±jitter to each delay. Default: 0.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: 0.5,
            multiplier: 2.0,
            max_delay: 4.0,
            max_attempts: 6,
            jitter: 0.0,
        }
    }
}

impl From<&nebula_config::RetryConfig> for RetryPolicy {
    fn from(config: &nebula_config::RetryConfig) -> Self {
        Self {
            initial_delay: config.initial_delay,
            multiplier: config.multiplier,
            max_delay: config.max_delay,
            max_attempts: config.max_attempts,
            jitter: config.jitter.clamp(0.0, 1.0),
        }
    }
}

/// Attempt counter plus the time the next attempt is allowed.
#[derive(Debug, Clone)]
pub struct RetryState {
    policy: RetryPolicy,
    attempts: u32,
    current_delay: f64,
    next_at: f64,
}

impl RetryState {
    /// A fresh state; the first attempt is allowed immediately.
    pub fn new(policy: RetryPolicy) -> Self {
        let initial = policy.initial_delay;
        Self {
            policy,
            attempts: 0,
            current_delay: initial,
            next_at: f64::NEG_INFINITY,
        }
    }

    /// `true` if an attempt may be made at `now`.
    pub fn ready(&self, now: f64) -> bool {
        !self.is_exhausted() && now >= self.next_at
    }

    /// Record an attempt made at `now` and schedule the next one.
    /// Returns the delay until the next attempt, or `None` when this was the
    /// last attempt allowed.
    pub fn record_attempt(&mut self, now: f64) -> Option<f64> {
        self.attempts += 1;
        if self.is_exhausted() {
            self.next_at = f64::INFINITY;
            return None;
        }

        let base = self.current_delay;
        let delay = if self.policy.jitter > 0.0 {
            let mut rng = rand::rng();
            let factor = rng.random_range((1.0 - self.policy.jitter)..=(1.0 + self.policy.jitter));
            base * factor
        } else {
            base
        }
        .min(self.policy.max_delay);

        self.current_delay = (self.current_delay * self.policy.multiplier).min(self.policy.max_delay);
        self.next_at = now + delay;
        Some(delay)
    }

    /// `true` once `max_attempts` attempts have been recorded.
    pub fn is_exhausted(&self) -> bool {
        self.attempts >= self.policy.max_attempts
    }

    /// Start over (after success, or when the reason for retrying went away).
    pub fn reset(&mut self) {
        self.attempts = 0;
        self.current_delay = self.policy.initial_delay;
        self.next_at = f64::NEG_INFINITY;
    }

    /// Attempts made so far.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            initial_delay: 1.0,
            multiplier: 2.0,
            max_delay: 3.0,
            max_attempts: 4,
            jitter: 0.0,
        }
    }

    #[test]
    fn test_first_attempt_is_immediate() {
        let state = RetryState::new(policy());
        assert!(state.ready(0.0));
    }

    #[test]
    fn test_delays_grow_and_cap() {
        let mut state = RetryState::new(policy());
        assert_eq!(state.record_attempt(0.0), Some(1.0));
        assert!(!state.ready(0.5));
        assert!(state.ready(1.0));
        assert_eq!(state.record_attempt(1.0), Some(2.0));
        assert_eq!(state.record_attempt(3.0), Some(3.0));
        assert!(state.ready(6.0));
    }

    #[test]
    fn test_exhaustion_stops_attempts() {
        let mut state = RetryState::new(policy());
        let mut now = 0.0;
        for _ in 0..3 {
            now += state.record_attempt(now).unwrap();
        }
        assert_eq!(state.record_attempt(now), None);
        assert!(state.is_exhausted());
        assert!(!state.ready(now + 1000.0));
    }

    #[test]
    fn test_reset_restores_initial_schedule() {
        let mut state = RetryState::new(policy());
        state.record_attempt(0.0);
        state.record_attempt(1.0);
        state.reset();
        assert_eq!(state.attempts(), 0);
        assert!(state.ready(1.1));
        assert_eq!(state.record_attempt(1.1), Some(1.0));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let mut state = RetryState::new(RetryPolicy {
            jitter: 0.25,
            max_delay: 100.0,
            max_attempts: 100,
            ..policy()
        });
        let delay = state.record_attempt(0.0).unwrap();
        assert!((0.75..=1.25).contains(&delay), "delay {delay} out of range");
    }
}

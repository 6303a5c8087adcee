//! Reconnection Controller - per-subscription state machine and backoff

use serde::Serialize;
use std::time::Duration;

/// Lifecycle of one subscription
///
/// `Idle → Subscribing → Live`, or `Subscribing → Failed(n) → Subscribing`
/// until `Abandoned` once the attempt budget is spent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(tag = "state", content = "attempt", rename_all = "snake_case")]
pub enum SubscriptionState {
    #[default]
    Idle,
    Subscribing,
    Live,
    /// Waiting for retry number `n` (1-based)
    Failed(u32),
    Abandoned,
}

impl SubscriptionState {
    #[inline]
    pub fn is_live(self) -> bool {
        matches!(self, SubscriptionState::Live)
    }
}

/// Exponential backoff `base × 2^attempt`, bounded by `max_attempts`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(1000),
            max_attempts: 5,
        }
    }
}

impl ReconnectPolicy {
    pub fn new(base: Duration, max_attempts: u32) -> Self {
        Self { base, max_attempts }
    }

    /// Delay before the retry following failure number `attempt` (0-based),
    /// or None once the budget is exhausted.
    #[inline]
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        if attempt >= self.max_attempts {
            return None;
        }
        Some(self.base.saturating_mul(2u32.saturating_pow(attempt)))
    }
}

/// Attempt counter for one subscription
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconnectState {
    attempts: u32,
}

/// Outcome of recording a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry number `attempt` (1-based) after `delay`
    Retry { attempt: u32, delay: Duration },
    Abandon { attempts: u32 },
}

impl ReconnectState {
    #[inline]
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Successful (re)subscription
    #[inline]
    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    pub fn on_failure(&mut self, policy: &ReconnectPolicy) -> RetryDecision {
        match policy.delay_for(self.attempts) {
            Some(delay) => {
                self.attempts += 1;
                RetryDecision::Retry {
                    attempt: self.attempts,
                    delay,
                }
            }
            None => RetryDecision::Abandon {
                attempts: self.attempts,
            },
        }
    }

    /// State to report while waiting on the decision
    #[inline]
    pub fn state_for(decision: RetryDecision) -> SubscriptionState {
        match decision {
            RetryDecision::Retry { attempt, .. } => SubscriptionState::Failed(attempt),
            RetryDecision::Abandon { .. } => SubscriptionState::Abandoned,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_schedule() {
        let p = ReconnectPolicy::default();
        let mut s = ReconnectState::default();
        let mut delays = Vec::new();
        loop {
            match s.on_failure(&p) {
                RetryDecision::Retry { delay, .. } => delays.push(delay.as_millis()),
                RetryDecision::Abandon { attempts } => {
                    assert_eq!(attempts, 5);
                    break;
                }
            }
        }
        assert_eq!(delays, vec![1000, 2000, 4000, 8000, 16000]);
    }

    #[test]
    fn test_reset_restarts_schedule() {
        let p = ReconnectPolicy::default();
        let mut s = ReconnectState::default();
        s.on_failure(&p);
        s.on_failure(&p);
        assert_eq!(s.attempts(), 2);
        s.reset();
        assert_eq!(
            s.on_failure(&p),
            RetryDecision::Retry {
                attempt: 1,
                delay: Duration::from_secs(1)
            }
        );
    }

    #[test]
    fn test_zero_budget() {
        let p = ReconnectPolicy::new(Duration::from_millis(10), 0);
        assert_eq!(p.delay_for(0), None);
        let d = RetryDecision::Abandon { attempts: 0 };
        assert_eq!(ReconnectState::state_for(d), SubscriptionState::Abandoned);
    }
}

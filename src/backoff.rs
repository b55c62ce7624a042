/// backoff.rs – Reconnect delay schedule for the push-update feed.
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffStrategy {
    /// `attempt * base`
    #[default]
    Linear,
    /// `base * 2^(attempt - 1)`
    Exponential,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    pub strategy: BackoffStrategy,
    pub base_delay: Duration,
    /// Upper clamp applied to every computed delay.
    pub max_delay: Duration,
    /// `None` retries forever.
    pub max_attempts: Option<u32>,
    /// Full jitter: the actual delay is drawn uniformly from `[0, delay]`.
    pub jitter: bool,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            strategy: BackoffStrategy::Linear,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_attempts: Some(5),
            jitter: false,
        }
    }
}

impl ReconnectPolicy {
    /// Un-jittered delay before the given (1-based) attempt.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        let raw = match self.strategy {
            BackoffStrategy::Linear => self.base_delay.saturating_mul(attempt),
            BackoffStrategy::Exponential => {
                let factor = 2u32.saturating_pow(attempt - 1);
                self.base_delay.saturating_mul(factor)
            }
        };
        raw.min(self.max_delay)
    }
}

/// Attempt counter driving the reconnect loop.
#[derive(Debug, Clone)]
pub struct Reconnector {
    policy: ReconnectPolicy,
    attempts: u32,
}

impl Reconnector {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            attempts: 0,
        }
    }

    pub fn policy(&self) -> &ReconnectPolicy {
        &self.policy
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn is_exhausted(&self) -> bool {
        matches!(self.policy.max_attempts, Some(max) if self.attempts >= max)
    }

    /// Consume one attempt and return how long to wait before it, or `None`
    /// once the cap has been reached.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.is_exhausted() {
            return None;
        }
        self.attempts += 1;
        let delay = self.policy.delay_for(self.attempts);
        Some(if self.policy.jitter {
            full_jitter(delay)
        } else {
            delay
        })
    }

    /// Called on every successful open and on a manual reconnect.
    pub fn reset(&mut self) {
        self.attempts = 0;
    }
}

fn full_jitter(delay: Duration) -> Duration {
    let ms = delay.as_millis().min(u64::MAX as u128) as u64;
    if ms == 0 {
        return delay;
    }
    Duration::from_millis(rand::thread_rng().gen_range(0..=ms))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_policy_is_linear_one_second_five_attempts() {
        let p = ReconnectPolicy::default();
        assert_eq!(p.strategy, BackoffStrategy::Linear);
        assert_eq!(p.base_delay, Duration::from_secs(1));
        assert_eq!(p.max_attempts, Some(5));
        assert!(!p.jitter);
    }

    #[test]
    fn attempt_zero_is_treated_as_first() {
        let p = ReconnectPolicy::default();
        assert_eq!(p.delay_for(0), p.delay_for(1));
    }

    #[test]
    fn jitter_of_zero_delay_is_zero() {
        assert_eq!(full_jitter(Duration::ZERO), Duration::ZERO);
    }
}

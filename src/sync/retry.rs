//! Per-action retry policy.
//!
//! The default `Flat` strategy retries every queued action on every drain.
//! `Exponential` holds a failed action back for `base * 2^(retries - 1)`,
//! capped at `max`, then spread by an optional `jitter` fraction. Either
//! strategy can park actions after `max_attempts` failures; parked actions
//! stay queued and visible but are not dispatched.

use chrono::{DateTime, Utc};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::time::Duration;

use crate::config::{RetryConfig, RetryStrategy};
use crate::types::{ActionStatus, PendingAction};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Due,
    Wait(Duration),
    Parked,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub strategy: RetryStrategy,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: Option<u32>,
    /// Fraction in `[0, 1]`; 0 disables jitter.
    pub jitter: f64,
}

impl RetryPolicy {
    pub fn flat() -> Self {
        Self::from(&RetryConfig::default())
    }

    pub fn exponential(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            strategy: RetryStrategy::Exponential,
            base_delay,
            max_delay,
            max_attempts: None,
            jitter: 0.0,
        }
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    /// Hold-back delay after `retry_count` failed attempts.
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        match self.strategy {
            RetryStrategy::Flat => Duration::ZERO,
            RetryStrategy::Exponential if retry_count == 0 => Duration::ZERO,
            RetryStrategy::Exponential => {
                let exponent = (retry_count - 1).min(31);
                self.base_delay
                    .saturating_mul(1u32 << exponent)
                    .min(self.max_delay)
            }
        }
    }

    /// [`delay_for`](Self::delay_for) scaled by a factor in
    /// `[1 - jitter, 1 + jitter]`. The factor is derived from the action id
    /// and attempt number, so one action gets the same delay on every drain
    /// while different actions spread out.
    pub fn delay_for_action(&self, action_id: &str, retry_count: u32) -> Duration {
        let delay = self.delay_for(retry_count);
        if self.jitter <= 0.0 || delay.is_zero() {
            return delay;
        }
        let mut hasher = DefaultHasher::new();
        action_id.hash(&mut hasher);
        retry_count.hash(&mut hasher);
        let unit = (hasher.finish() % 10_001) as f64 / 10_000.0;
        let factor = 1.0 + self.jitter * (2.0 * unit - 1.0);
        delay.mul_f64(factor.max(0.0))
    }

    pub fn decide(&self, action: &PendingAction, now: DateTime<Utc>) -> RetryDecision {
        if action.status != ActionStatus::Failed {
            return RetryDecision::Due;
        }
        if let Some(max) = self.max_attempts {
            if action.retry_count >= max {
                return RetryDecision::Parked;
            }
        }

        let delay = self.delay_for_action(&action.id, action.retry_count);
        let Some(last_attempt) = action.last_attempt_at else {
            return RetryDecision::Due;
        };
        let elapsed = (now - last_attempt).to_std().unwrap_or(Duration::ZERO);
        if elapsed >= delay {
            RetryDecision::Due
        } else {
            RetryDecision::Wait(delay - elapsed)
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::flat()
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            strategy: config.strategy,
            base_delay: Duration::from_secs(config.base_delay_secs),
            max_delay: Duration::from_secs(config.max_delay_secs),
            max_attempts: config.max_attempts,
            jitter: config.jitter.clamp(0.0, 1.0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ActionPayload, ActionType, FailureKind};
    use chrono::Duration as ChronoDuration;

    fn failed_action(retry_count: u32, last_attempt_at: DateTime<Utc>) -> PendingAction {
        PendingAction {
            id: "a1".to_string(),
            action_type: ActionType::CreateRecord,
            payload: ActionPayload::new(serde_json::json!({})),
            created_at: last_attempt_at - ChronoDuration::minutes(10),
            status: ActionStatus::Failed,
            retry_count,
            last_error: Some("network timeout".to_string()),
            failure_kind: Some(FailureKind::Dispatch),
            last_attempt_at: Some(last_attempt_at),
        }
    }

    #[test]
    fn flat_policy_always_retries() {
        let now = Utc::now();
        let policy = RetryPolicy::flat();
        assert_eq!(policy.decide(&failed_action(7, now), now), RetryDecision::Due);
    }

    #[test]
    fn pending_actions_are_always_due() {
        let now = Utc::now();
        let policy = RetryPolicy::exponential(Duration::from_secs(5), Duration::from_secs(60))
            .with_max_attempts(1);
        let mut action = failed_action(3, now);
        action.status = ActionStatus::Pending;
        assert_eq!(policy.decide(&action, now), RetryDecision::Due);
    }

    #[test]
    fn exponential_delay_doubles_and_caps() {
        let policy = RetryPolicy::exponential(Duration::from_secs(5), Duration::from_secs(60));
        assert_eq!(policy.delay_for(0), Duration::ZERO);
        assert_eq!(policy.delay_for(1), Duration::from_secs(5));
        assert_eq!(policy.delay_for(2), Duration::from_secs(10));
        assert_eq!(policy.delay_for(4), Duration::from_secs(40));
        assert_eq!(policy.delay_for(5), Duration::from_secs(60));
        assert_eq!(policy.delay_for(40), Duration::from_secs(60));
    }

    #[test]
    fn exponential_defers_until_delay_elapsed() {
        let now = Utc::now();
        let policy = RetryPolicy::exponential(Duration::from_secs(5), Duration::from_secs(60));

        let recent = failed_action(2, now - ChronoDuration::seconds(4));
        assert_eq!(
            policy.decide(&recent, now),
            RetryDecision::Wait(Duration::from_secs(6))
        );

        let old = failed_action(2, now - ChronoDuration::seconds(11));
        assert_eq!(policy.decide(&old, now), RetryDecision::Due);
    }

    #[test]
    fn jitter_stays_within_bounds_and_spreads_actions() {
        let policy = RetryPolicy::exponential(Duration::from_secs(100), Duration::from_secs(1000))
            .with_jitter(0.2);
        let delays: Vec<Duration> = (0..50)
            .map(|i| policy.delay_for_action(&format!("action-{}", i), 1))
            .collect();

        for delay in &delays {
            assert!(*delay >= Duration::from_secs(80), "{:?}", delay);
            assert!(*delay <= Duration::from_secs(120), "{:?}", delay);
        }
        let first = delays[0];
        assert!(delays.iter().any(|d| *d != first));

        assert_eq!(
            policy.delay_for_action("action-1", 1),
            policy.delay_for_action("action-1", 1)
        );
    }

    #[test]
    fn zero_jitter_keeps_exact_delays() {
        let policy = RetryPolicy::exponential(Duration::from_secs(5), Duration::from_secs(60));
        assert_eq!(policy.delay_for_action("a1", 2), Duration::from_secs(10));
        assert_eq!(
            RetryPolicy::flat().with_jitter(0.5).delay_for_action("a1", 3),
            Duration::ZERO
        );
    }

    #[test]
    fn jitter_is_read_from_config() {
        let config = RetryConfig {
            strategy: RetryStrategy::Exponential,
            jitter: 3.0,
            ..RetryConfig::default()
        };
        assert_eq!(RetryPolicy::from(&config).jitter, 1.0);
    }

    #[test]
    fn parks_after_max_attempts() {
        let now = Utc::now();
        let policy = RetryPolicy::flat().with_max_attempts(3);
        assert_eq!(policy.decide(&failed_action(2, now), now), RetryDecision::Due);
        assert_eq!(
            policy.decide(&failed_action(3, now), now),
            RetryDecision::Parked
        );
    }
}

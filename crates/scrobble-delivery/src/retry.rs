//! Backoff and give-up policy for queued scrobbles.
//!
//! An entry's retry count drives both how long the drainer waits before the
//! next redelivery and when it stops trying. Delays grow from the time of
//! the last failed attempt and carry jitter so a backlog built up during an
//! outage does not retry in lockstep. The jittered time is decided once per
//! failure and stored on the entry as `next_attempt_at`.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use scrobble_core::QueuedScrobbleEvent;
use serde::{Deserialize, Serialize};

use crate::error::DeliveryError;

/// Retry policy for queued scrobbles.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Failed redeliveries tolerated before an entry is dropped.
    pub max_retries: u32,

    /// Delay before the first redelivery.
    pub base_delay: Duration,

    /// Upper bound on any single delay.
    pub max_delay: Duration,

    /// Jitter fraction (0.0 to 1.0) applied to each delay.
    pub jitter_factor: f64,

    /// How delays grow with the retry count.
    pub backoff_strategy: BackoffStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 10,
            base_delay: Duration::from_secs(30),
            max_delay: Duration::from_secs(30 * 60),
            jitter_factor: 0.25,
            backoff_strategy: BackoffStrategy::Exponential,
        }
    }
}

/// Strategy for calculating retry delays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffStrategy {
    /// Same delay before every retry.
    Fixed,
    /// Delay doubles with each retry.
    Exponential,
    /// Delay grows by the base amount with each retry.
    Linear,
}

impl RetryPolicy {
    /// Un-jittered delay before the retry following `retry_count` failures.
    pub fn backoff(&self, retry_count: u32) -> Duration {
        let delay = match self.backoff_strategy {
            BackoffStrategy::Fixed => self.base_delay,
            BackoffStrategy::Linear => self.base_delay.saturating_mul(retry_count.saturating_add(1)),
            BackoffStrategy::Exponential => {
                let multiplier = 2_u32.saturating_pow(retry_count.min(20));
                self.base_delay.saturating_mul(multiplier)
            },
        };
        delay.min(self.max_delay)
    }

    /// Jittered delay before the retry following `retry_count` failures.
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        apply_jitter(self.backoff(retry_count), self.jitter_factor).min(self.max_delay)
    }

    /// Returns true when the entry may be redelivered at `now`.
    ///
    /// Entries carry their own schedule once one was recorded. Unscheduled
    /// entries wait the un-jittered backoff from their last attempt.
    pub fn is_due(&self, entry: &QueuedScrobbleEvent, now: DateTime<Utc>) -> bool {
        if let Some(next_attempt_at) = entry.next_attempt_at {
            return next_attempt_at <= now;
        }

        let last = entry.last_attempt_at.unwrap_or(entry.enqueued_at);
        match chrono::Duration::from_std(self.backoff(entry.retry_count)) {
            Ok(delay) => last + delay <= now,
            Err(_) => false,
        }
    }
}

/// Retry decision context for a failed redelivery.
#[derive(Debug, Clone)]
pub struct RetryContext {
    /// Failed redeliveries recorded before this one.
    pub retry_count: u32,
    /// Error from this attempt.
    pub error: DeliveryError,
    /// When this attempt failed.
    pub failed_at: DateTime<Utc>,
    /// Policy to apply.
    pub policy: RetryPolicy,
}

/// Result of a retry decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Keep the entry and retry no earlier than `next_attempt_at`.
    Retry {
        /// Earliest time of the next redelivery
        next_attempt_at: DateTime<Utc>,
        /// Retry count to persist
        retry_count: u32,
    },
    /// Drop the entry.
    GiveUp {
        /// Why the entry is being dropped
        reason: String,
    },
}

impl RetryContext {
    /// Creates a new retry context for a failed redelivery.
    pub fn new(
        retry_count: u32,
        error: DeliveryError,
        failed_at: DateTime<Utc>,
        policy: RetryPolicy,
    ) -> Self {
        Self { retry_count, error, failed_at, policy }
    }

    /// Decides whether the entry stays queued.
    ///
    /// Entries whose retry count already reached the maximum are dropped on
    /// this failure, as are entries that failed with a non-retryable error.
    pub fn decide_retry(&self) -> RetryDecision {
        if self.retry_count >= self.policy.max_retries {
            return RetryDecision::GiveUp {
                reason: format!("maximum retries ({}) reached", self.policy.max_retries),
            };
        }

        if !self.error.is_retryable() {
            return RetryDecision::GiveUp {
                reason: format!("non-retryable error: {}", self.error),
            };
        }

        let retry_count = self.retry_count + 1;
        let delay = match self.error.retry_after_seconds() {
            Some(seconds) => Duration::from_secs(seconds),
            None => self.policy.delay_for(retry_count),
        };
        let Ok(delay) = chrono::Duration::from_std(delay) else {
            return RetryDecision::GiveUp { reason: "retry delay out of range".to_string() };
        };

        RetryDecision::Retry { next_attempt_at: self.failed_at + delay, retry_count }
    }
}

/// Randomizes a delay by up to ±`jitter_factor` of its length.
fn apply_jitter(duration: Duration, jitter_factor: f64) -> Duration {
    if jitter_factor <= 0.0 || duration.is_zero() {
        return duration;
    }

    let clamped_jitter = jitter_factor.clamp(0.0, 1.0);

    let mut rng = rand::rng();
    let jitter_range = duration.as_secs_f64() * clamped_jitter;
    let jitter_offset = rng.random_range(-jitter_range..=jitter_range);

    Duration::from_secs_f64((duration.as_secs_f64() + jitter_offset).max(0.0))
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use scrobble_core::{
        ExternalIds, MediaItem, MediaKind, PlaybackAction, PlaybackEvent, UserId,
    };
    use uuid::Uuid;

    use super::*;

    fn no_jitter() -> RetryPolicy {
        RetryPolicy { jitter_factor: 0.0, ..RetryPolicy::default() }
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).single().unwrap()
    }

    fn entry(retry_count: u32, last_attempt_at: DateTime<Utc>) -> QueuedScrobbleEvent {
        let event = PlaybackEvent {
            event_id: Uuid::new_v4(),
            user_id: UserId::new(),
            account: "neil".to_string(),
            player_uuid: "player".to_string(),
            rating_key: "1".to_string(),
            action: PlaybackAction::Stop,
            progress: 90.0,
            media: MediaItem {
                kind: MediaKind::Movie,
                title: "Heat".to_string(),
                year: Some(1995),
                ids: ExternalIds::default(),
                show: None,
                season: None,
                number: None,
            },
            received_at: at(0),
        };
        let mut entry = QueuedScrobbleEvent::new(event.user_id, event, None, "503", at(0));
        entry.retry_count = retry_count;
        entry.last_attempt_at = Some(last_attempt_at);
        entry
    }

    #[test]
    fn exponential_backoff_increases_correctly() {
        let policy = no_jitter();

        let delays: Vec<_> = (0..5).map(|n| policy.backoff(n)).collect();

        assert_eq!(
            delays,
            [30, 60, 120, 240, 480].map(Duration::from_secs).to_vec(),
        );
    }

    #[test]
    fn max_delay_enforced() {
        let policy = RetryPolicy { max_delay: Duration::from_secs(60), ..no_jitter() };

        assert_eq!(policy.backoff(9), Duration::from_secs(60));
        assert_eq!(policy.delay_for(30), Duration::from_secs(60));
    }

    #[test]
    fn linear_and_fixed_strategies() {
        let linear = RetryPolicy {
            backoff_strategy: BackoffStrategy::Linear,
            base_delay: Duration::from_secs(5),
            ..no_jitter()
        };
        let fixed = RetryPolicy { backoff_strategy: BackoffStrategy::Fixed, ..linear.clone() };

        assert_eq!(linear.backoff(0), Duration::from_secs(5));
        assert_eq!(linear.backoff(3), Duration::from_secs(20));
        assert_eq!(fixed.backoff(7), Duration::from_secs(5));
    }

    #[test]
    fn entries_become_due_after_backoff() {
        let policy = no_jitter();
        let queued = entry(1, at(0));

        assert!(!policy.is_due(&queued, at(59)));
        assert!(policy.is_due(&queued, at(60)));
    }

    #[test]
    fn due_check_is_stable_under_jitter() {
        let policy = RetryPolicy::default();
        let queued = entry(0, at(0));

        let due: Vec<_> = (0..200).map(|_| policy.is_due(&queued, at(28))).collect();

        assert!(due.iter().all(|d| !d), "same entry flipped between due and not due");
        assert!(policy.is_due(&queued, at(30)));
    }

    #[test]
    fn recorded_schedule_overrides_backoff() {
        let policy = no_jitter();
        let mut queued = entry(1, at(0));
        queued.next_attempt_at = Some(at(600));

        assert!(!policy.is_due(&queued, at(60)));
        assert!(!policy.is_due(&queued, at(599)));
        assert!(policy.is_due(&queued, at(600)));
    }

    #[test]
    fn retry_gives_up_at_maximum() {
        let policy = RetryPolicy { max_retries: 3, ..no_jitter() };

        let decision =
            RetryContext::new(3, DeliveryError::upstream(503), at(0), policy.clone()).decide_retry();
        assert!(matches!(decision, RetryDecision::GiveUp { ref reason } if reason.contains("maximum retries")));

        let decision = RetryContext::new(2, DeliveryError::upstream(503), at(0), policy).decide_retry();
        assert_eq!(
            decision,
            RetryDecision::Retry { next_attempt_at: at(240), retry_count: 3 }
        );
    }

    #[test]
    fn non_retryable_errors_rejected() {
        let decision =
            RetryContext::new(0, DeliveryError::upstream(422), at(0), no_jitter()).decide_retry();

        match decision {
            RetryDecision::GiveUp { reason } => assert!(reason.contains("non-retryable")),
            RetryDecision::Retry { .. } => unreachable!("client errors are never retried"),
        }
    }

    #[test]
    fn retry_after_header_respected() {
        let error = DeliveryError::Upstream {
            status_code: 429,
            code: None,
            description: None,
            retry_after_seconds: Some(120),
        };

        let decision = RetryContext::new(0, error, at(0), no_jitter()).decide_retry();

        assert_eq!(decision, RetryDecision::Retry { next_attempt_at: at(120), retry_count: 1 });
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let base = Duration::from_secs(10);
        let mut seen = std::collections::HashSet::new();

        for _ in 0..50 {
            let jittered = apply_jitter(base, 0.5);
            assert!(jittered >= Duration::from_secs(5), "too small: {jittered:?}");
            assert!(jittered <= Duration::from_secs(15), "too large: {jittered:?}");
            seen.insert(jittered.as_millis());
        }

        assert!(seen.len() > 1, "jitter should vary the delay");
    }
}

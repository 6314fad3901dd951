use std::time::Duration;

use chrono::{DateTime, Utc};
use listq_core::JobStatus;

/// Backoff schedule for failed attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Attempts after which an `error` job is left without `retry_after`.
    pub max_attempts: u32,
    /// Fixed wait after a challenge; always longer than `max_delay`.
    pub captcha_cooldown: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(60),
            max_delay: Duration::from_secs(3600),
            max_attempts: 5,
            captcha_cooldown: Duration::from_secs(6 * 3600),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Terminal success; nothing to schedule.
    None,
    RetryAt(DateTime<Utc>),
    /// Out of attempts; the job stays failed until an operator requeues it.
    Exhausted,
}

impl RetryDecision {
    pub fn retry_after(&self) -> Option<DateTime<Utc>> {
        match self {
            RetryDecision::RetryAt(at) => Some(*at),
            RetryDecision::None | RetryDecision::Exhausted => None,
        }
    }
}

impl RetryPolicy {
    pub fn delay_for_attempt(&self, attempt_index: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt_index).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    pub fn captcha_delay(&self) -> Duration {
        let floor = self
            .max_delay
            .saturating_add(self.base_delay.max(Duration::from_secs(1)));
        self.captcha_cooldown.max(floor)
    }

    /// `attempt` is 1-based: the attempt that just ended.
    pub fn decide(&self, status: JobStatus, attempt: u32, now: DateTime<Utc>) -> RetryDecision {
        let delay = match status {
            JobStatus::Error => self.delay_for_attempt(attempt.saturating_sub(1)),
            JobStatus::Captcha => self.captcha_delay(),
            JobStatus::Pending | JobStatus::Processing | JobStatus::Completed => {
                return RetryDecision::None
            }
        };
        if attempt >= self.max_attempts {
            return RetryDecision::Exhausted;
        }
        match chrono::Duration::from_std(delay)
            .ok()
            .and_then(|d| now.checked_add_signed(d))
        {
            Some(at) => RetryDecision::RetryAt(at),
            None => RetryDecision::Exhausted,
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap()
    }

    #[test]
    fn backoff_doubles_then_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for_attempt(0), Duration::from_secs(60));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(120));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(480));
        assert_eq!(policy.delay_for_attempt(10), Duration::from_secs(3600));
        assert_eq!(policy.delay_for_attempt(40), Duration::from_secs(3600));
    }

    #[test]
    fn captcha_waits_longer_than_any_error_retry() {
        let policy = RetryPolicy {
            captcha_cooldown: Duration::from_secs(10),
            ..RetryPolicy::default()
        };
        let error_at = policy.decide(JobStatus::Error, 4, now()).retry_after().unwrap();
        let captcha_at = policy.decide(JobStatus::Captcha, 1, now()).retry_after().unwrap();
        assert!(captcha_at > error_at);
        assert_eq!(captcha_at, now() + chrono::Duration::seconds(3660));
    }

    #[test]
    fn captcha_beats_capped_error_delay_even_when_cooldown_equals_cap() {
        let policy = RetryPolicy {
            max_attempts: 10,
            captcha_cooldown: Duration::from_secs(1800),
            max_delay: Duration::from_secs(1800),
            ..RetryPolicy::default()
        };
        let error_at = policy.decide(JobStatus::Error, 8, now()).retry_after().unwrap();
        let captcha_at = policy.decide(JobStatus::Captcha, 8, now()).retry_after().unwrap();
        assert_eq!(error_at, now() + chrono::Duration::seconds(1800));
        assert!(captcha_at > error_at);

        let no_base = RetryPolicy {
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            captcha_cooldown: Duration::ZERO,
            ..RetryPolicy::default()
        };
        assert!(no_base.captcha_delay() > no_base.delay_for_attempt(5));
    }

    #[test]
    fn attempts_run_out() {
        let policy = RetryPolicy {
            max_attempts: 2,
            ..RetryPolicy::default()
        };
        assert!(matches!(policy.decide(JobStatus::Error, 1, now()), RetryDecision::RetryAt(_)));
        assert_eq!(policy.decide(JobStatus::Error, 2, now()), RetryDecision::Exhausted);
        assert_eq!(policy.decide(JobStatus::Completed, 9, now()), RetryDecision::None);
    }
}

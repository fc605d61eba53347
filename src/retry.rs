use crate::errors::ErrorCategory;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JitterMode {
    None,
    /// +/- 50% of the computed delay.
    EqualSplit,
    /// Uniform in [0, delay).
    Full,
}

/// Per-category retry parameters (spec §4.5). Pure: no I/O, no clock reads beyond what's passed in.
#[derive(Debug, Clone)]
pub struct CategoryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
    pub jitter: JitterMode,
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub retriable: CategoryPolicy,
    pub rate_limited: CategoryPolicy,
    pub business: CategoryPolicy,
    pub fatal: CategoryPolicy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        let default_max = Duration::from_secs(30);
        RetryPolicy {
            retriable: CategoryPolicy {
                max_attempts: 3,
                base_delay: Duration::from_millis(1500),
                multiplier: 2.0,
                max_delay: default_max,
                jitter: JitterMode::Full,
            },
            rate_limited: CategoryPolicy {
                max_attempts: 3,
                base_delay: Duration::from_secs(5),
                multiplier: 1.5,
                max_delay: default_max,
                jitter: JitterMode::Full,
            },
            business: CategoryPolicy {
                // "at most 1 retry" (spec §4.5) means 2 total attempts.
                max_attempts: 2,
                base_delay: Duration::from_millis(1500),
                multiplier: 2.0,
                max_delay: default_max,
                jitter: JitterMode::None,
            },
            fatal: CategoryPolicy {
                max_attempts: 1,
                base_delay: Duration::from_millis(0),
                multiplier: 1.0,
                max_delay: default_max,
                jitter: JitterMode::None,
            },
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RetryDecision {
    pub retry: bool,
    pub delay: Duration,
}

impl RetryPolicy {
    fn policy_for(&self, category: ErrorCategory) -> &CategoryPolicy {
        match category {
            ErrorCategory::Retriable => &self.retriable,
            ErrorCategory::RateLimited => &self.rate_limited,
            ErrorCategory::Business => &self.business,
            ErrorCategory::Fatal => &self.fatal,
        }
    }

    /// `attempt` is the attempt number that just failed (1-based). `jitter_seed` makes the
    /// jitter deterministic for a given device/attempt pair instead of relying on a live RNG,
    /// mirroring the teacher's deterministic-modulo jitter in `compute_backoff_seconds`.
    pub fn decide(&self, category: ErrorCategory, attempt: u32, jitter_seed: u64) -> RetryDecision {
        let policy = self.policy_for(category);

        if attempt >= policy.max_attempts {
            return RetryDecision {
                retry: false,
                delay: Duration::from_secs(0),
            };
        }

        let base_ms = policy.base_delay.as_millis() as f64;
        let max_ms = policy.max_delay.as_millis() as f64;
        let exp = (attempt.saturating_sub(1)).min(32);
        let raw = base_ms * policy.multiplier.powi(exp as i32);
        let capped = raw.min(max_ms).max(0.0) as u64;

        let delay_ms = match policy.jitter {
            JitterMode::None => capped,
            JitterMode::EqualSplit => {
                if capped == 0 {
                    0
                } else {
                    let half = capped / 2;
                    let offset = jitter_seed % (capped.max(1));
                    let centered = offset as i64 - half as i64;
                    (capped as i64 + centered).clamp(0, max_ms as i64) as u64
                }
            }
            JitterMode::Full => {
                if capped == 0 {
                    0
                } else {
                    jitter_seed % capped
                }
            }
        };

        RetryDecision {
            retry: true,
            delay: Duration::from_millis(delay_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn business_errors_get_at_most_one_retry() {
        let policy = RetryPolicy::default();
        assert!(policy.decide(ErrorCategory::Business, 1, 0).retry);
        assert!(!policy.decide(ErrorCategory::Business, 2, 0).retry);
    }

    #[test]
    fn retriable_errors_retry_up_to_max_attempts() {
        let policy = RetryPolicy::default();
        assert!(policy.decide(ErrorCategory::Retriable, 1, 0).retry);
        assert!(policy.decide(ErrorCategory::Retriable, 2, 0).retry);
        assert!(!policy.decide(ErrorCategory::Retriable, 3, 0).retry);
    }

    #[test]
    fn rate_limited_uses_larger_base_than_retriable() {
        let policy = RetryPolicy::default();
        assert!(policy.rate_limited.base_delay > policy.retriable.base_delay);
    }

    #[test]
    fn delay_never_exceeds_cap() {
        let policy = RetryPolicy::default();
        for attempt in 1..3 {
            let d = policy.decide(ErrorCategory::Retriable, attempt, 999_999);
            assert!(d.delay <= policy.retriable.max_delay);
        }
    }
}

//! Retry budgets and backoff.
//!
//! Job faults (non-zero exit, timeout) consume `retry_count` against the
//! job's own `max_retries`. Lost agents consume `infra_retry_count` against
//! a separate cap, so a flaky fleet cannot burn a job's retry budget.

use std::time::Duration;

use chrono::{DateTime, Utc};

/// Backoff and infrastructure-retry settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Delay before the first retry.
    pub base_backoff: Duration,
    /// Upper bound on any single delay.
    pub max_backoff: Duration,
    /// Lost-agent requeues before a job is failed.
    pub max_infra_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(300),
            max_infra_retries: 5,
        }
    }
}

/// What to do after a job fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Go back to Pending, gated until `not_before`.
    Retry {
        /// New retry count.
        retry_count: u32,
        /// Earliest time the job may be scheduled again.
        not_before: DateTime<Utc>,
    },
    /// Fail for good.
    GiveUp {
        /// Final retry count, never above the budget.
        retry_count: u32,
    },
}

/// What to do after the job's agent was lost.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InfraDecision {
    /// Requeue with this many infrastructure retries consumed.
    Requeue {
        /// New infrastructure retry count.
        infra_retry_count: u32,
    },
    /// Cap reached.
    Exhausted,
}

impl RetryPolicy {
    /// Set the initial delay.
    #[must_use]
    pub const fn with_base_backoff(mut self, base: Duration) -> Self {
        self.base_backoff = base;
        self
    }

    /// Set the delay cap.
    #[must_use]
    pub const fn with_max_backoff(mut self, max: Duration) -> Self {
        self.max_backoff = max;
        self
    }

    /// Set the lost-agent cap.
    #[must_use]
    pub const fn with_max_infra_retries(mut self, max: u32) -> Self {
        self.max_infra_retries = max;
        self
    }

    /// Delay after `prior_retries` earlier retries: `base * 2^prior`, capped.
    #[must_use]
    pub fn backoff(&self, prior_retries: u32) -> Duration {
        let factor = 2u32.checked_pow(prior_retries).unwrap_or(u32::MAX);
        self.base_backoff
            .checked_mul(factor)
            .map_or(self.max_backoff, |d| d.min(self.max_backoff))
    }

    /// Decide the outcome of a job fault.
    #[must_use]
    pub fn on_job_failure(
        &self,
        retry_count: u32,
        max_retries: u32,
        now: DateTime<Utc>,
    ) -> RetryDecision {
        let next = retry_count.saturating_add(1);
        if next < max_retries {
            let delay = chrono::Duration::from_std(self.backoff(retry_count))
                .unwrap_or(chrono::Duration::MAX);
            RetryDecision::Retry {
                retry_count: next,
                not_before: now.checked_add_signed(delay).unwrap_or(now),
            }
        } else {
            RetryDecision::GiveUp {
                retry_count: next.min(max_retries),
            }
        }
    }

    /// Decide the outcome of losing the job's agent.
    #[must_use]
    pub const fn on_agent_lost(&self, infra_retry_count: u32) -> InfraDecision {
        if infra_retry_count < self.max_infra_retries {
            InfraDecision::Requeue {
                infra_retry_count: infra_retry_count + 1,
            }
        } else {
            InfraDecision::Exhausted
        }
    }
}

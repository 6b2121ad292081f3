use crate::metrics_defs::{RATE_LIMIT_DENIED, RATE_LIMIT_FAIL_OPEN};
use crate::store::{CounterStore, StoreError, bounded};
use crate::window::Window;
use chrono::{DateTime, Utc};
use shared::clock::Clock;
use shared::counter;
use std::sync::Arc;
use std::time::Duration;

/// A named counter scope with a ceiling per window.
#[derive(Clone, Debug, PartialEq)]
pub struct RateLimitSpec {
    pub key: String,
    pub limit: u64,
    pub window: Window,
}

impl RateLimitSpec {
    pub fn new(key: impl Into<String>, limit: u64, window: Window) -> Self {
        RateLimitSpec {
            key: key.into(),
            limit,
            window,
        }
    }

    /// Store key of the window containing `now`.
    pub fn bucket_key(&self, now: DateTime<Utc>) -> String {
        format!("{}:{}", self.key, self.window.bucket(now))
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    /// Post-increment counter value.
    pub count: u64,
    pub remaining: u64,
    pub reset_at: DateTime<Utc>,
}

impl RateLimitDecision {
    fn from_count(count: u64, spec: &RateLimitSpec, now: DateTime<Utc>) -> Self {
        RateLimitDecision {
            allowed: count <= spec.limit,
            count,
            remaining: spec.limit.saturating_sub(count),
            reset_at: spec.window.reset_at(now),
        }
    }
}

/// What a check does when the counter store cannot answer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Allow the event and log a warning. For advisory heuristics only.
    Open,
    /// Surface the store error to the caller. For budgets and quotas.
    Closed,
}

/// Fixed-window counters on top of a [`CounterStore`].
///
/// Every check increments first and compares the post-increment value, so the event that
/// overflows the window is itself counted: with a limit of `L` the `L + 1`-th event is the
/// first one denied.
#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn CounterStore>,
    clock: Arc<dyn Clock>,
    timeout: Duration,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn CounterStore>, clock: Arc<dyn Clock>, timeout: Duration) -> Self {
        RateLimiter {
            store,
            clock,
            timeout,
        }
    }

    pub fn store(&self) -> &Arc<dyn CounterStore> {
        &self.store
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub async fn check_and_increment(
        &self,
        spec: &RateLimitSpec,
    ) -> Result<RateLimitDecision, StoreError> {
        self.check_and_increment_by(spec, 1).await
    }

    pub async fn check_and_increment_by(
        &self,
        spec: &RateLimitSpec,
        amount: u64,
    ) -> Result<RateLimitDecision, StoreError> {
        let now = self.clock.now();
        let key = spec.bucket_key(now);
        let by = i64::try_from(amount).unwrap_or(i64::MAX);
        let count = bounded(
            self.timeout,
            self.store.incr_by(&key, by, spec.window.ttl()),
        )
        .await?;

        let decision = RateLimitDecision::from_count(count.max(0) as u64, spec, now);
        if !decision.allowed {
            counter!(RATE_LIMIT_DENIED, "window" => spec.window.as_str()).increment(1);
        }
        Ok(decision)
    }

    /// Like [`check_and_increment`](Self::check_and_increment), with an explicit policy for
    /// store failures.
    pub async fn check(
        &self,
        spec: &RateLimitSpec,
        policy: FailurePolicy,
    ) -> Result<RateLimitDecision, StoreError> {
        match self.check_and_increment(spec).await {
            Ok(decision) => Ok(decision),
            Err(err) if policy == FailurePolicy::Open => {
                tracing::warn!(key = %spec.key, error = %err, "rate limit check failed open");
                counter!(RATE_LIMIT_FAIL_OPEN).increment(1);
                let now = self.clock.now();
                Ok(RateLimitDecision {
                    allowed: true,
                    count: 0,
                    remaining: spec.limit,
                    reset_at: spec.window.reset_at(now),
                })
            }
            Err(err) => Err(err),
        }
    }
}

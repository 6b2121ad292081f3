//! Billable session quotas.
//!
//! Usage is aggregated from the relational store and cached in the counter store under
//! `session_usage:{team}:{period}`. Every cache key is also registered in the set
//! `session_usage_keys:{team}` so that invalidation can find it.
//!
//! A cold cache is populated by a single caller at a time. The caller that wins
//! `lock:{cache key}` computes; the others poll the cache until it is filled or the lock
//! wait times out, after which they compute on their own. Nobody blocks forever, and the
//! aggregation runs once per cold key in the common case.
//!
//! Every eviction bumps `session_usage_gen:{team}`. A computation that started before an
//! eviction discards the value it just cached, so a pre-increment total never outlives
//! the invalidation that should have removed it.
//!
//! Cache failures are advisory. Relational failures fail closed with
//! [`QuotaError::QuotaUnavailable`].

use crate::alerts::{AlertError, UsageAlert, UsageNotifier, crossed_thresholds, record_sent};
use crate::config::SessionQuotaConfig;
use crate::errors::QuotaError;
use crate::metrics_defs::{
    SESSION_LIMIT_REACHED, SESSION_USAGE_CACHE_HIT, SESSION_USAGE_CACHE_MISS,
    SESSION_USAGE_COMPUTE_DURATION, SESSION_USAGE_LOCK_WAIT_TIMEOUT,
};
use crate::period::BillingPeriod;
use crate::types::SessionLimitCheck;
use crate::usage::{PlanTier, TeamBilling, UsageStore, bounded_query};
use chrono::{DateTime, Utc};
use counters::{CounterStore, bounded};
use shared::clock::Clock;
use shared::tasks::TaskQueue;
use shared::{counter, histogram};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

const ALERT_TASK: &str = "usage_alert_check";

fn cache_key(team_id: &str, period_key: &str) -> String {
    format!("session_usage:{team_id}:{period_key}")
}

fn index_key(team_id: &str) -> String {
    format!("session_usage_keys:{team_id}")
}

fn generation_key(team_id: &str) -> String {
    format!("session_usage_gen:{team_id}")
}

/// A team's usage as of one moment.
struct Snapshot {
    billing: TeamBilling,
    period: BillingPeriod,
    now: DateTime<Utc>,
    check: SessionLimitCheck,
}

#[derive(Clone)]
pub struct SessionQuotaGate {
    inner: Arc<GateInner>,
}

struct GateInner {
    usage: Arc<dyn UsageStore>,
    counters: Arc<dyn CounterStore>,
    notifier: Arc<dyn UsageNotifier>,
    tasks: TaskQueue,
    clock: Arc<dyn Clock>,
    config: SessionQuotaConfig,
    counter_timeout: Duration,
}

impl SessionQuotaGate {
    pub fn new(
        usage: Arc<dyn UsageStore>,
        counters: Arc<dyn CounterStore>,
        notifier: Arc<dyn UsageNotifier>,
        tasks: TaskQueue,
        clock: Arc<dyn Clock>,
        config: SessionQuotaConfig,
        counter_timeout: Duration,
    ) -> Self {
        SessionQuotaGate {
            inner: Arc::new(GateInner {
                usage,
                counters,
                notifier,
                tasks,
                clock,
                config,
                counter_timeout,
            }),
        }
    }

    /// Returns the team's usage, or [`QuotaError::SessionLimitReached`] if the team may not
    /// record another billable session this period.
    pub async fn check_and_enforce(&self, team_id: &str) -> Result<SessionLimitCheck, QuotaError> {
        let snapshot = self.snapshot(team_id).await?;
        if snapshot.check.is_at_limit {
            let retry_after_secs = snapshot.period.seconds_remaining(snapshot.now);
            tracing::info!(
                team_id,
                sessions_used = snapshot.check.sessions_used,
                session_limit = snapshot.check.session_limit,
                retry_after_secs,
                "session limit reached"
            );
            counter!(SESSION_LIMIT_REACHED).increment(1);
            return Err(QuotaError::SessionLimitReached {
                sessions_used: snapshot.check.sessions_used,
                session_limit: snapshot.check.session_limit,
                retry_after_secs,
            });
        }
        Ok(snapshot.check)
    }

    /// The team's usage for its current period, without enforcing the limit.
    pub async fn get_team_session_usage(
        &self,
        team_id: &str,
    ) -> Result<SessionLimitCheck, QuotaError> {
        Ok(self.snapshot(team_id).await?.check)
    }

    /// Adds `sessions` to the project's usage row for the team's current period.
    ///
    /// Invalidates cached usage for the team (and its free-tier siblings) and queues a
    /// usage alert check. Neither can fail the increment. Returns the new row total.
    pub async fn increment_session_count(
        &self,
        project_id: &str,
        team_id: &str,
        sessions: u64,
    ) -> Result<u64, QuotaError> {
        let billing = self.team_billing(team_id).await?;
        let period = BillingPeriod::containing(billing.billing_anchor, self.inner.clock.now());
        let period_key = period.key();

        let total = bounded_query(
            self.inner.config.query_timeout(),
            self.inner
                .usage
                .increment_usage(project_id, &period_key, sessions),
        )
        .await?;
        tracing::debug!(project_id, team_id, sessions, total, "session usage incremented");

        if let Err(err) = self.invalidate_session_cache(team_id).await {
            tracing::warn!(team_id, error = %err, "session usage invalidation failed");
        }

        let gate = self.clone();
        let team_id = team_id.to_string();
        self.inner.tasks.spawn(ALERT_TASK, async move {
            gate.check_usage_alerts(&team_id).await
        });

        Ok(total)
    }

    /// Drops every cached usage value for the team and for every free-tier team of the
    /// same owner.
    ///
    /// Siblings are evicted whatever the team's current tier: after an upgrade the team is
    /// already paid, but the pools cached for its former free siblings still include its
    /// sessions.
    pub async fn invalidate_session_cache(&self, team_id: &str) -> Result<(), QuotaError> {
        let billing = self.team_billing(team_id).await?;
        let siblings = bounded_query(
            self.inner.config.query_timeout(),
            self.inner.usage.free_teams_for_owner(&billing.owner_id),
        )
        .await?;
        let mut teams = vec![billing.team_id.clone()];
        teams.extend(
            siblings
                .into_iter()
                .map(|t| t.team_id)
                .filter(|id| id != team_id),
        );

        for team in &teams {
            self.evict_team(team).await;
        }
        Ok(())
    }

    /// Flushes queued background work, such as usage alert checks.
    pub async fn flush(&self) {
        self.inner.tasks.flush().await;
    }

    async fn snapshot(&self, team_id: &str) -> Result<Snapshot, QuotaError> {
        let billing = self.team_billing(team_id).await?;
        let now = self.inner.clock.now();
        let period = BillingPeriod::containing(billing.billing_anchor, now);
        let used = self.cached_usage(&billing, &period, now).await?;
        let check = SessionLimitCheck::new(used, billing.session_limit);
        Ok(Snapshot {
            billing,
            period,
            now,
            check,
        })
    }

    async fn team_billing(&self, team_id: &str) -> Result<TeamBilling, QuotaError> {
        bounded_query(
            self.inner.config.query_timeout(),
            self.inner.usage.team_billing(team_id),
        )
        .await?
        .ok_or_else(|| QuotaError::TeamNotFound(team_id.to_string()))
    }

    async fn cached_usage(
        &self,
        billing: &TeamBilling,
        period: &BillingPeriod,
        now: DateTime<Utc>,
    ) -> Result<u64, QuotaError> {
        let key = cache_key(&billing.team_id, &period.key());
        if let Some(used) = self.read_cache(&key).await {
            counter!(SESSION_USAGE_CACHE_HIT).increment(1);
            return Ok(used);
        }
        counter!(SESSION_USAGE_CACHE_MISS).increment(1);

        let lock_key = format!("lock:{key}");
        let token = format!("{:016x}", rand::random::<u64>());
        let deadline = Instant::now() + self.inner.config.lock_wait_timeout();

        loop {
            match self.try_lock(&lock_key, &token).await {
                Ok(true) => {
                    // Another caller may have filled the cache between our read and the lock.
                    let result = match self.read_cache(&key).await {
                        Some(used) => Ok(used),
                        None => self.compute_and_store(billing, period, now, &key).await,
                    };
                    self.unlock(&lock_key, &token).await;
                    return result;
                }
                Ok(false) => {}
                Err(err) => {
                    tracing::warn!(key = %lock_key, error = %err, "usage lock unavailable");
                    return self.compute_and_store(billing, period, now, &key).await;
                }
            }

            if Instant::now() >= deadline {
                tracing::warn!(key = %key, "gave up waiting for usage computation");
                counter!(SESSION_USAGE_LOCK_WAIT_TIMEOUT).increment(1);
                return self.compute_and_store(billing, period, now, &key).await;
            }

            tokio::time::sleep(self.inner.config.lock_poll_interval()).await;
            if let Some(used) = self.read_cache(&key).await {
                counter!(SESSION_USAGE_CACHE_HIT).increment(1);
                return Ok(used);
            }
        }
    }

    async fn compute_and_store(
        &self,
        billing: &TeamBilling,
        period: &BillingPeriod,
        now: DateTime<Utc>,
        key: &str,
    ) -> Result<u64, QuotaError> {
        let generation = bounded(
            self.inner.counter_timeout,
            self.inner.counters.get(&generation_key(&billing.team_id)),
        )
        .await;
        let started = Instant::now();
        let used = self.compute_usage(billing, period, now).await?;
        histogram!(SESSION_USAGE_COMPUTE_DURATION).record(started.elapsed().as_secs_f64());
        match generation {
            Ok(generation) => {
                self.write_cache(&billing.team_id, key, used, generation)
                    .await
            }
            Err(err) => tracing::warn!(key, error = %err, "not caching session usage"),
        }
        Ok(used)
    }

    async fn compute_usage(
        &self,
        billing: &TeamBilling,
        period: &BillingPeriod,
        now: DateTime<Utc>,
    ) -> Result<u64, QuotaError> {
        let timeout = self.inner.config.query_timeout();
        let usage = &self.inner.usage;

        let teams = match billing.tier {
            PlanTier::Paid => vec![billing.clone()],
            PlanTier::Free => {
                let mut siblings =
                    bounded_query(timeout, usage.free_teams_for_owner(&billing.owner_id)).await?;
                if !siblings.iter().any(|t| t.team_id == billing.team_id) {
                    siblings.push(billing.clone());
                }
                siblings
            }
        };

        // Each team contributes usage from its own current period.
        let mut by_period: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for team in &teams {
            let period_key = if team.team_id == billing.team_id {
                period.key()
            } else {
                BillingPeriod::containing(team.billing_anchor, now).key()
            };
            let projects = bounded_query(timeout, usage.project_ids(&team.team_id)).await?;
            by_period.entry(period_key).or_default().extend(projects);
        }

        let mut total = 0u64;
        for (period_key, projects) in &by_period {
            if projects.is_empty() {
                continue;
            }
            total += bounded_query(timeout, usage.session_usage(projects, period_key)).await?;
        }
        Ok(total)
    }

    async fn read_cache(&self, key: &str) -> Option<u64> {
        match bounded(self.inner.counter_timeout, self.inner.counters.get(key)).await {
            Ok(Some(raw)) => match raw.parse() {
                Ok(used) => Some(used),
                Err(_) => {
                    tracing::warn!(key, value = %raw, "ignoring malformed cached usage");
                    None
                }
            },
            Ok(None) => None,
            Err(err) => {
                tracing::warn!(key, error = %err, "session usage cache read failed");
                None
            }
        }
    }

    /// Caches `used`, unless the team was evicted after `generation` was read.
    async fn write_cache(&self, team_id: &str, key: &str, used: u64, generation: Option<String>) {
        let counters = &self.inner.counters;
        let timeout = self.inner.counter_timeout;
        let ttl = self.inner.config.cache_ttl();

        // Register before writing so a cached value is never invisible to invalidation.
        let result = async {
            bounded(timeout, counters.set_add(&index_key(team_id), key, ttl)).await?;
            bounded(timeout, counters.set_ex(key, &used.to_string(), ttl)).await?;
            let current = bounded(timeout, counters.get(&generation_key(team_id))).await?;
            if current != generation {
                tracing::debug!(key, "usage invalidated during computation, discarding");
                bounded(timeout, counters.delete(key)).await?;
            }
            Ok::<(), counters::StoreError>(())
        };
        if let Err(err) = result.await {
            tracing::warn!(key, error = %err, "session usage cache write failed");
        }
    }

    async fn evict_team(&self, team_id: &str) {
        let counters = &self.inner.counters;
        let timeout = self.inner.counter_timeout;
        let index = index_key(team_id);

        let result = async {
            bounded(
                timeout,
                counters.incr_by(&generation_key(team_id), 1, self.inner.config.cache_ttl()),
            )
            .await?;
            let keys = bounded(timeout, counters.set_members(&index)).await?;
            for key in &keys {
                bounded(timeout, counters.delete(key)).await?;
            }
            bounded(timeout, counters.delete(&index)).await
        };
        if let Err(err) = result.await {
            tracing::warn!(team_id, error = %err, "session usage cache eviction failed");
        }
    }

    async fn try_lock(&self, lock_key: &str, token: &str) -> Result<bool, counters::StoreError> {
        bounded(
            self.inner.counter_timeout,
            self.inner
                .counters
                .set_nx_ex(lock_key, token, self.inner.config.lock_ttl()),
        )
        .await
    }

    async fn unlock(&self, lock_key: &str, token: &str) {
        let released = bounded(
            self.inner.counter_timeout,
            self.inner.counters.delete_if_eq(lock_key, token),
        )
        .await;
        match released {
            Ok(true) => {}
            Ok(false) => tracing::debug!(key = lock_key, "usage lock expired before release"),
            Err(err) => tracing::warn!(key = lock_key, error = %err, "usage lock release failed"),
        }
    }

    /// Sends any threshold alerts the team's current usage has crossed and that have not
    /// been sent this period.
    async fn check_usage_alerts(&self, team_id: &str) -> Result<(), AlertError> {
        let snapshot = self.snapshot(team_id).await?;
        let period_key = snapshot.period.key();
        let timeout = self.inner.config.query_timeout();
        let mut first_error = None;

        for threshold in crossed_thresholds(
            snapshot.check.sessions_used,
            snapshot.check.session_limit,
        ) {
            let fresh = bounded_query(
                timeout,
                self.inner
                    .usage
                    .record_usage_notification(team_id, &period_key, threshold),
            )
            .await?;
            if !fresh {
                continue;
            }

            let alert = UsageAlert {
                team_id: snapshot.billing.team_id.clone(),
                period_key: period_key.clone(),
                threshold,
                sessions_used: snapshot.check.sessions_used,
                session_limit: snapshot.check.session_limit,
            };
            match self.inner.notifier.send_usage_alert(&alert).await {
                Ok(()) => record_sent(&alert),
                Err(err) => {
                    first_error.get_or_insert(err);
                }
            }
        }

        match first_error {
            Some(err) => Err(err.into()),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryUsageStore, RecordingNotifier};
    use chrono::TimeZone;
    use counters::memory::MemoryCounterStore;
    use shared::clock::ManualClock;
    use shared::tasks::TaskFailure;
    use tokio::sync::mpsc;
    use crate::usage::UsageStoreError;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::Notify;
    use tokio::task::JoinSet;

    struct Harness {
        usage: Arc<MemoryUsageStore>,
        counters: Arc<MemoryCounterStore>,
        notifier: Arc<RecordingNotifier>,
        failures: mpsc::UnboundedReceiver<TaskFailure>,
        gate: SessionQuotaGate,
    }

    fn utc(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).unwrap()
    }

    fn team(id: &str, owner: &str, tier: PlanTier, limit: u64, anchor_day: u32) -> TeamBilling {
        TeamBilling {
            team_id: id.into(),
            owner_id: owner.into(),
            tier,
            session_limit: limit,
            billing_anchor: utc(2024, 1, anchor_day),
        }
    }

    fn harness() -> Harness {
        let usage = Arc::new(MemoryUsageStore::new());
        let counters = Arc::new(MemoryCounterStore::new());
        let notifier = Arc::new(RecordingNotifier::new());
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 6, 20, 12, 0, 0).unwrap(),
        ));
        let (tasks, failures) = TaskQueue::new();
        let gate = SessionQuotaGate::new(
            usage.clone(),
            counters.clone(),
            notifier.clone(),
            tasks,
            clock,
            SessionQuotaConfig::default(),
            Duration::from_millis(100),
        );
        Harness {
            usage,
            counters,
            notifier,
            failures,
            gate,
        }
    }

    #[tokio::test]
    async fn test_free_teams_pool_usage_across_their_own_periods() {
        let h = harness();
        h.usage
            .add_team(team("t1", "owner", PlanTier::Free, 5_000, 1), &["p1"]);
        h.usage
            .add_team(team("t2", "owner", PlanTier::Free, 1_000, 15), &["p2"]);
        h.usage
            .add_team(team("t3", "owner", PlanTier::Paid, 50_000, 1), &["p3"]);
        h.usage.set_usage("p1", "2024-06-01", 3_000);
        h.usage.set_usage("p2", "2024-06-15", 1_990);
        h.usage.set_usage("p2", "2024-05-15", 999);
        h.usage.set_usage("p3", "2024-06-01", 40_000);

        let check = h.gate.check_and_enforce("t1").await.unwrap();
        assert_eq!(check.sessions_used, 4_990);
        assert_eq!(check.session_limit, 5_000);
        assert_eq!(check.sessions_remaining, 10);
        assert!(check.allowed);
        assert!(check.is_near_limit);

        // The sibling sees the same pool against its own limit.
        let err = h.gate.check_and_enforce("t2").await.unwrap_err();
        assert!(matches!(
            err,
            QuotaError::SessionLimitReached {
                sessions_used: 4_990,
                session_limit: 1_000,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_paid_teams_only_count_their_own_projects() {
        let h = harness();
        h.usage
            .add_team(team("paid", "owner", PlanTier::Paid, 100, 10), &["a", "b"]);
        h.usage
            .add_team(team("free", "owner", PlanTier::Free, 100, 10), &["c"]);
        h.usage.set_usage("a", "2024-06-10", 20);
        h.usage.set_usage("b", "2024-06-10", 5);
        h.usage.set_usage("c", "2024-06-10", 60);

        let check = h.gate.get_team_session_usage("paid").await.unwrap();
        assert_eq!(check.sessions_used, 25);
        assert_eq!(check.percent_used, 25.0);
    }

    #[tokio::test]
    async fn test_at_limit_carries_seconds_until_period_end() {
        let h = harness();
        h.usage
            .add_team(team("t", "o", PlanTier::Paid, 100, 21), &["p"]);
        h.usage.set_usage("p", "2024-05-21", 100);

        let err = h.gate.check_and_enforce("t").await.unwrap_err();
        // Period ends 2024-06-21T00:00, twelve hours after the pinned clock.
        assert_eq!(err.retry_after_secs(), Some(12 * 3600));
        assert_eq!(err.kind(), crate::ErrorKind::QuotaExceeded);

        // Reporting does not enforce.
        let check = h.gate.get_team_session_usage("t").await.unwrap();
        assert!(check.is_at_limit);
        assert!(!check.allowed);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_cold_reads_aggregate_once() {
        let h = harness();
        h.usage
            .add_team(team("t", "o", PlanTier::Paid, 1_000, 1), &["p1", "p2"]);
        h.usage.set_usage("p1", "2024-06-01", 7);
        h.usage.set_query_delay(Some(Duration::from_millis(50)));

        let mut set = JoinSet::new();
        for _ in 0..50 {
            let gate = h.gate.clone();
            set.spawn(async move { gate.get_team_session_usage("t").await });
        }
        while let Some(result) = set.join_next().await {
            assert_eq!(result.unwrap().unwrap().sessions_used, 7);
        }

        assert_eq!(h.usage.aggregation_calls(), 1);
        assert!(h.counters.keys_with_prefix("lock:").is_empty());
    }

    #[tokio::test]
    async fn test_waiters_compute_after_the_lock_wait_times_out() {
        let h = harness();
        h.usage
            .add_team(team("t", "o", PlanTier::Paid, 1_000, 1), &["p"]);
        h.usage.set_usage("p", "2024-06-01", 3);

        // A crashed holder left the lock behind.
        h.counters
            .set_nx_ex(
                "lock:session_usage:t:2024-06-01",
                "someone-else",
                Duration::from_secs(60),
            )
            .await
            .unwrap();

        let started = Instant::now();
        let check = h.gate.get_team_session_usage("t").await.unwrap();
        assert_eq!(check.sessions_used, 3);
        assert!(started.elapsed() >= SessionQuotaConfig::default().lock_wait_timeout());
    }

    #[tokio::test]
    async fn test_cached_usage_is_served_until_invalidated() {
        let h = harness();
        h.usage
            .add_team(team("t1", "o", PlanTier::Free, 100, 1), &["p1"]);
        h.usage
            .add_team(team("t2", "o", PlanTier::Free, 100, 1), &["p2"]);
        h.usage.set_usage("p1", "2024-06-01", 10);

        assert_eq!(h.gate.get_team_session_usage("t1").await.unwrap().sessions_used, 10);
        h.usage.set_usage("p2", "2024-06-01", 5);
        assert_eq!(h.gate.get_team_session_usage("t1").await.unwrap().sessions_used, 10);
        assert_eq!(h.usage.aggregation_calls(), 1);

        // Invalidating a sibling clears the pooled value cached for t1.
        h.gate.invalidate_session_cache("t2").await.unwrap();
        assert_eq!(h.gate.get_team_session_usage("t1").await.unwrap().sessions_used, 15);
        assert!(h.counters.keys_with_prefix("session_usage:t2").is_empty());
    }

    #[tokio::test]
    async fn test_upgrading_a_free_team_clears_its_former_siblings() {
        let h = harness();
        h.usage
            .add_team(team("t1", "o", PlanTier::Free, 100, 1), &["p1"]);
        h.usage
            .add_team(team("t2", "o", PlanTier::Free, 100, 1), &["p2"]);
        h.usage.set_usage("p1", "2024-06-01", 10);
        h.usage.set_usage("p2", "2024-06-01", 85);
        assert_eq!(h.gate.get_team_session_usage("t1").await.unwrap().sessions_used, 95);

        h.usage
            .add_team(team("t2", "o", PlanTier::Paid, 1_000, 1), &["p2"]);
        h.gate.invalidate_session_cache("t2").await.unwrap();

        assert_eq!(h.gate.get_team_session_usage("t1").await.unwrap().sessions_used, 10);
        assert_eq!(h.gate.get_team_session_usage("t2").await.unwrap().sessions_used, 85);
    }

    /// Holds the first usage aggregation open until the test releases it.
    struct HeldUsageStore {
        inner: Arc<MemoryUsageStore>,
        hold: AtomicBool,
        reached: Notify,
        release: Notify,
    }

    #[async_trait::async_trait]
    impl UsageStore for HeldUsageStore {
        async fn team_billing(
            &self,
            team_id: &str,
        ) -> Result<Option<TeamBilling>, UsageStoreError> {
            self.inner.team_billing(team_id).await
        }

        async fn free_teams_for_owner(
            &self,
            owner_id: &str,
        ) -> Result<Vec<TeamBilling>, UsageStoreError> {
            self.inner.free_teams_for_owner(owner_id).await
        }

        async fn project_ids(&self, team_id: &str) -> Result<Vec<String>, UsageStoreError> {
            self.inner.project_ids(team_id).await
        }

        async fn session_usage(
            &self,
            project_ids: &[String],
            period_key: &str,
        ) -> Result<u64, UsageStoreError> {
            let used = self.inner.session_usage(project_ids, period_key).await?;
            if self.hold.swap(false, Ordering::SeqCst) {
                self.reached.notify_one();
                self.release.notified().await;
            }
            Ok(used)
        }

        async fn increment_usage(
            &self,
            project_id: &str,
            period_key: &str,
            by: u64,
        ) -> Result<u64, UsageStoreError> {
            self.inner.increment_usage(project_id, period_key, by).await
        }

        async fn record_usage_notification(
            &self,
            team_id: &str,
            period_key: &str,
            threshold: u8,
        ) -> Result<bool, UsageStoreError> {
            self.inner
                .record_usage_notification(team_id, period_key, threshold)
                .await
        }
    }

    #[tokio::test]
    async fn test_values_computed_before_an_increment_are_not_kept() {
        let inner = Arc::new(MemoryUsageStore::new());
        inner.add_team(team("t", "o", PlanTier::Paid, 100, 1), &["p"]);
        inner.set_usage("p", "2024-06-01", 10);
        let usage = Arc::new(HeldUsageStore {
            inner: inner.clone(),
            hold: AtomicBool::new(true),
            reached: Notify::new(),
            release: Notify::new(),
        });
        let (tasks, _failures) = TaskQueue::new();
        let gate = SessionQuotaGate::new(
            usage.clone(),
            Arc::new(MemoryCounterStore::new()),
            Arc::new(RecordingNotifier::new()),
            tasks,
            Arc::new(ManualClock::new(
                Utc.with_ymd_and_hms(2024, 6, 20, 12, 0, 0).unwrap(),
            )),
            SessionQuotaConfig::default(),
            Duration::from_millis(100),
        );

        let slow_read = tokio::spawn({
            let gate = gate.clone();
            async move { gate.get_team_session_usage("t").await }
        });
        usage.reached.notified().await;

        // The read above has already aggregated 10.
        assert_eq!(gate.increment_session_count("p", "t", 1).await.unwrap(), 11);
        usage.release.notify_one();
        assert_eq!(slow_read.await.unwrap().unwrap().sessions_used, 10);

        assert_eq!(gate.get_team_session_usage("t").await.unwrap().sessions_used, 11);
        gate.flush().await;
    }

    #[tokio::test]
    async fn test_counter_store_outage_is_advisory() {
        let h = harness();
        h.usage
            .add_team(team("t", "o", PlanTier::Paid, 100, 1), &["p"]);
        h.usage.set_usage("p", "2024-06-01", 42);
        h.counters.set_unavailable(true);

        let check = h.gate.check_and_enforce("t").await.unwrap();
        assert_eq!(check.sessions_used, 42);
        h.gate.invalidate_session_cache("t").await.unwrap();
    }

    #[tokio::test]
    async fn test_relational_failures_fail_closed() {
        let h = harness();
        h.usage
            .add_team(team("t", "o", PlanTier::Paid, 100, 1), &["p"]);
        h.usage.set_unavailable(true);

        let err = h.gate.check_and_enforce("t").await.unwrap_err();
        assert!(matches!(err, QuotaError::QuotaUnavailable(_)));
        assert!(err.is_retryable());

        h.usage.set_unavailable(false);
        assert!(matches!(
            h.gate.check_and_enforce("missing").await,
            Err(QuotaError::TeamNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_increments_invalidate_and_alert_once_per_threshold() {
        let h = harness();
        h.usage
            .add_team(team("t", "o", PlanTier::Paid, 100, 1), &["p"]);
        h.usage.set_usage("p", "2024-06-01", 78);
        assert_eq!(h.gate.get_team_session_usage("t").await.unwrap().sessions_used, 78);

        assert_eq!(h.gate.increment_session_count("p", "t", 1).await.unwrap(), 79);
        h.gate.flush().await;
        assert!(h.notifier.alerts().is_empty());

        assert_eq!(h.gate.increment_session_count("p", "t", 1).await.unwrap(), 80);
        h.gate.flush().await;
        assert_eq!(h.gate.get_team_session_usage("t").await.unwrap().sessions_used, 80);

        h.gate.increment_session_count("p", "t", 5).await.unwrap();
        h.gate.flush().await;
        h.gate.increment_session_count("p", "t", 15).await.unwrap();
        h.gate.flush().await;
        h.gate.increment_session_count("p", "t", 1).await.unwrap();
        h.gate.flush().await;

        let thresholds: Vec<u8> = h.notifier.alerts().iter().map(|a| a.threshold).collect();
        assert_eq!(thresholds, vec![80, 100]);
        assert_eq!(h.usage.notifications().len(), 2);
        assert_eq!(h.usage.usage("p", "2024-06-01"), 101);
    }

    #[tokio::test]
    async fn test_alert_failures_never_fail_the_increment() {
        let mut h = harness();
        h.usage
            .add_team(team("t", "o", PlanTier::Paid, 10, 1), &["p"]);
        h.notifier.set_failing(true);

        assert_eq!(h.gate.increment_session_count("p", "t", 10).await.unwrap(), 10);
        h.gate.flush().await;

        let failure = h.failures.try_recv().expect("alert failure reported");
        assert_eq!(failure.task, ALERT_TASK);
        assert!(failure.error.contains("smtp unreachable"));
        assert!(h.notifier.alerts().is_empty());
    }
}

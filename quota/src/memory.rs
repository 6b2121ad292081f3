//! In-process usage store and notifier.
//!
//! Used by tests and by the standalone binary.

use crate::alerts::{NotifyError, UsageAlert, UsageNotifier};
use crate::usage::{PlanTier, TeamBilling, UsageStore, UsageStoreError};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

#[derive(Default)]
pub struct MemoryUsageStore {
    teams: Mutex<HashMap<String, TeamBilling>>,
    projects: Mutex<HashMap<String, Vec<String>>>,
    usage: Mutex<HashMap<(String, String), u64>>,
    notifications: Mutex<BTreeSet<(String, String, u8)>>,
    aggregation_calls: AtomicUsize,
    query_delay: Mutex<Option<Duration>>,
    unavailable: AtomicBool,
}

impl MemoryUsageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_team(&self, billing: TeamBilling, project_ids: &[&str]) {
        self.projects.lock().insert(
            billing.team_id.clone(),
            project_ids.iter().map(|p| p.to_string()).collect(),
        );
        self.teams.lock().insert(billing.team_id.clone(), billing);
    }

    pub fn set_usage(&self, project_id: &str, period_key: &str, sessions: u64) {
        self.usage
            .lock()
            .insert((project_id.to_string(), period_key.to_string()), sessions);
    }

    pub fn usage(&self, project_id: &str, period_key: &str) -> u64 {
        self.usage
            .lock()
            .get(&(project_id.to_string(), period_key.to_string()))
            .copied()
            .unwrap_or(0)
    }

    /// Number of `session_usage` aggregations run so far.
    pub fn aggregation_calls(&self) -> usize {
        self.aggregation_calls.load(Ordering::SeqCst)
    }

    /// Delays every subsequent query by `delay`.
    pub fn set_query_delay(&self, delay: Option<Duration>) {
        *self.query_delay.lock() = delay;
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Recorded `(team, period, threshold)` notifications, sorted.
    pub fn notifications(&self) -> Vec<(String, String, u8)> {
        self.notifications.lock().iter().cloned().collect()
    }

    async fn before_query(&self) -> Result<(), UsageStoreError> {
        let delay = *self.query_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(UsageStoreError::Unavailable("injected outage".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl UsageStore for MemoryUsageStore {
    async fn team_billing(&self, team_id: &str) -> Result<Option<TeamBilling>, UsageStoreError> {
        self.before_query().await?;
        Ok(self.teams.lock().get(team_id).cloned())
    }

    async fn free_teams_for_owner(
        &self,
        owner_id: &str,
    ) -> Result<Vec<TeamBilling>, UsageStoreError> {
        self.before_query().await?;
        let mut teams: Vec<TeamBilling> = self
            .teams
            .lock()
            .values()
            .filter(|t| t.owner_id == owner_id && t.tier == PlanTier::Free)
            .cloned()
            .collect();
        teams.sort_by(|a, b| a.team_id.cmp(&b.team_id));
        Ok(teams)
    }

    async fn project_ids(&self, team_id: &str) -> Result<Vec<String>, UsageStoreError> {
        self.before_query().await?;
        Ok(self.projects.lock().get(team_id).cloned().unwrap_or_default())
    }

    async fn session_usage(
        &self,
        project_ids: &[String],
        period_key: &str,
    ) -> Result<u64, UsageStoreError> {
        self.aggregation_calls.fetch_add(1, Ordering::SeqCst);
        self.before_query().await?;
        let usage = self.usage.lock();
        Ok(project_ids
            .iter()
            .filter_map(|p| usage.get(&(p.clone(), period_key.to_string())))
            .sum())
    }

    async fn increment_usage(
        &self,
        project_id: &str,
        period_key: &str,
        by: u64,
    ) -> Result<u64, UsageStoreError> {
        self.before_query().await?;
        let mut usage = self.usage.lock();
        let row = usage
            .entry((project_id.to_string(), period_key.to_string()))
            .or_insert(0);
        *row += by;
        Ok(*row)
    }

    async fn record_usage_notification(
        &self,
        team_id: &str,
        period_key: &str,
        threshold: u8,
    ) -> Result<bool, UsageStoreError> {
        self.before_query().await?;
        Ok(self.notifications.lock().insert((
            team_id.to_string(),
            period_key.to_string(),
            threshold,
        )))
    }
}

/// Keeps every alert it is asked to send.
#[derive(Default)]
pub struct RecordingNotifier {
    alerts: Mutex<Vec<UsageAlert>>,
    failing: AtomicBool,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alerts(&self) -> Vec<UsageAlert> {
        self.alerts.lock().clone()
    }

    /// Makes every subsequent delivery fail.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl UsageNotifier for RecordingNotifier {
    async fn send_usage_alert(&self, alert: &UsageAlert) -> Result<(), NotifyError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(NotifyError("smtp unreachable".into()));
        }
        self.alerts.lock().push(alert.clone());
        Ok(())
    }
}

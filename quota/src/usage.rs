//! Relational access needed for session quotas: billing facts, team/project ownership,
//! per-period usage rows and notification records.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanTier {
    Free,
    Paid,
}

/// Plan facts for one team, as resolved by the billing collaborator.
#[derive(Clone, Debug, PartialEq)]
pub struct TeamBilling {
    pub team_id: String,
    pub owner_id: String,
    pub tier: PlanTier,
    pub session_limit: u64,
    pub billing_anchor: DateTime<Utc>,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum UsageStoreError {
    #[error("usage store unavailable: {0}")]
    Unavailable(String),

    #[error("usage store query timed out after {0:?}")]
    Timeout(Duration),
}

#[async_trait]
pub trait UsageStore: Send + Sync {
    async fn team_billing(&self, team_id: &str) -> Result<Option<TeamBilling>, UsageStoreError>;

    /// Every free-tier team owned by `owner_id`.
    async fn free_teams_for_owner(
        &self,
        owner_id: &str,
    ) -> Result<Vec<TeamBilling>, UsageStoreError>;

    async fn project_ids(&self, team_id: &str) -> Result<Vec<String>, UsageStoreError>;

    /// Total sessions recorded by `project_ids` in the period identified by `period_key`.
    async fn session_usage(
        &self,
        project_ids: &[String],
        period_key: &str,
    ) -> Result<u64, UsageStoreError>;

    /// Upserts the `(project, period)` row, adding `by`. Returns the new row total.
    async fn increment_usage(
        &self,
        project_id: &str,
        period_key: &str,
        by: u64,
    ) -> Result<u64, UsageStoreError>;

    /// Records that the `threshold` alert was sent for this team and period. Returns
    /// `false` when the record already existed.
    async fn record_usage_notification(
        &self,
        team_id: &str,
        period_key: &str,
        threshold: u8,
    ) -> Result<bool, UsageStoreError>;
}

/// Runs a usage store query with an upper bound on its duration.
pub async fn bounded_query<T, F>(timeout: Duration, fut: F) -> Result<T, UsageStoreError>
where
    F: Future<Output = Result<T, UsageStoreError>>,
{
    tokio::time::timeout(timeout, fut)
        .await
        .unwrap_or(Err(UsageStoreError::Timeout(timeout)))
}

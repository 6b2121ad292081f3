//! Collaborators that own sessions and project settings.

use crate::types::{ProjectFunnelStats, PromotionReason, QuotaConfig, SessionMetrics, SessionRecord};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::future::Future;
use std::time::Duration;

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum SessionStoreError {
    #[error("session store unavailable: {0}")]
    Unavailable(String),

    #[error("session store query timed out after {0:?}")]
    Timeout(Duration),
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn session(&self, session_id: &str) -> Result<Option<SessionRecord>, SessionStoreError>;

    async fn session_metrics(
        &self,
        session_id: &str,
    ) -> Result<Option<SessionMetrics>, SessionStoreError>;

    async fn record_score(&self, session_id: &str, score: f64) -> Result<(), SessionStoreError>;

    /// Writes the promotion fields only if the session is not promoted yet. Returns
    /// whether this call performed the write.
    async fn mark_promoted(
        &self,
        session_id: &str,
        reason: PromotionReason,
        score: f64,
        promoted_at: DateTime<Utc>,
    ) -> Result<bool, SessionStoreError>;

    /// Screen paths of the project's most recent sessions, newest first, restricted to
    /// sessions lasting at least `min_duration_secs` with at least `min_path_len` screens.
    async fn recent_screen_paths(
        &self,
        project_id: &str,
        min_duration_secs: u64,
        min_path_len: usize,
        limit: usize,
    ) -> Result<Vec<Vec<String>>, SessionStoreError>;

    async fn funnel_stats(
        &self,
        project_id: &str,
    ) -> Result<Option<ProjectFunnelStats>, SessionStoreError>;

    /// Replaces the project's funnel record.
    async fn upsert_funnel_stats(&self, stats: &ProjectFunnelStats) -> Result<(), SessionStoreError>;

    /// Projects with recent sessions, for the periodic funnel job.
    async fn active_project_ids(&self) -> Result<Vec<String>, SessionStoreError>;
}

#[async_trait]
pub trait ProjectDirectory: Send + Sync {
    async fn quota_config(&self, project_id: &str) -> Result<Option<QuotaConfig>, SessionStoreError>;
}

pub async fn bounded_query<T, F>(timeout: Duration, fut: F) -> Result<T, SessionStoreError>
where
    F: Future<Output = Result<T, SessionStoreError>>,
{
    tokio::time::timeout(timeout, fut)
        .await
        .unwrap_or(Err(SessionStoreError::Timeout(timeout)))
}

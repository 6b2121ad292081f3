//! In-process session store and project directory.
//!
//! Used by tests and by the standalone binary.

use crate::store::{ProjectDirectory, SessionStore, SessionStoreError};
use crate::types::{
    ProjectFunnelStats, Promotion, PromotionReason, QuotaConfig, SessionMetrics, SessionRecord,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

struct SamplePath {
    duration_secs: u64,
    screens: Vec<String>,
}

#[derive(Default)]
pub struct MemorySessionStore {
    sessions: Mutex<HashMap<String, SessionRecord>>,
    metrics: Mutex<HashMap<String, SessionMetrics>>,
    // Oldest first, per project.
    paths: Mutex<HashMap<String, Vec<SamplePath>>>,
    funnels: Mutex<HashMap<String, ProjectFunnelStats>>,
    path_queries: AtomicUsize,
    promotion_writes: AtomicUsize,
    write_delay: Mutex<Option<Duration>>,
    unavailable: AtomicBool,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_session(&self, record: SessionRecord, metrics: SessionMetrics) {
        self.metrics.lock().insert(record.id.clone(), metrics);
        self.sessions.lock().insert(record.id.clone(), record);
    }

    pub fn session_record(&self, session_id: &str) -> Option<SessionRecord> {
        self.sessions.lock().get(session_id).cloned()
    }

    /// Adds a sampled session path as the project's newest.
    pub fn add_path(&self, project_id: &str, duration_secs: u64, screens: Vec<String>) {
        self.paths
            .lock()
            .entry(project_id.to_string())
            .or_default()
            .push(SamplePath {
                duration_secs,
                screens,
            });
    }

    pub fn set_funnel(&self, stats: ProjectFunnelStats) {
        self.funnels.lock().insert(stats.project_id.clone(), stats);
    }

    pub fn funnel(&self, project_id: &str) -> Option<ProjectFunnelStats> {
        self.funnels.lock().get(project_id).cloned()
    }

    pub fn path_queries(&self) -> usize {
        self.path_queries.load(Ordering::SeqCst)
    }

    /// Successful `mark_promoted` writes.
    pub fn promotion_writes(&self) -> usize {
        self.promotion_writes.load(Ordering::SeqCst)
    }

    /// Delays `record_score` and `mark_promoted`, widening races between evaluations.
    pub fn set_write_delay(&self, delay: Option<Duration>) {
        *self.write_delay.lock() = delay;
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), SessionStoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(SessionStoreError::Unavailable("injected outage".into()));
        }
        Ok(())
    }

    async fn before_write(&self) -> Result<(), SessionStoreError> {
        let delay = *self.write_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.check_available()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn session(&self, session_id: &str) -> Result<Option<SessionRecord>, SessionStoreError> {
        self.check_available()?;
        Ok(self.sessions.lock().get(session_id).cloned())
    }

    async fn session_metrics(
        &self,
        session_id: &str,
    ) -> Result<Option<SessionMetrics>, SessionStoreError> {
        self.check_available()?;
        Ok(self.metrics.lock().get(session_id).cloned())
    }

    async fn record_score(&self, session_id: &str, score: f64) -> Result<(), SessionStoreError> {
        self.before_write().await?;
        if let Some(record) = self.sessions.lock().get_mut(session_id) {
            record.promotion_score = Some(score);
        }
        Ok(())
    }

    async fn mark_promoted(
        &self,
        session_id: &str,
        reason: PromotionReason,
        score: f64,
        promoted_at: DateTime<Utc>,
    ) -> Result<bool, SessionStoreError> {
        self.before_write().await?;
        let mut sessions = self.sessions.lock();
        let Some(record) = sessions.get_mut(session_id) else {
            return Ok(false);
        };
        if record.promotion.is_some() {
            return Ok(false);
        }
        record.promotion_score = Some(score);
        record.promotion = Some(Promotion {
            reason,
            score,
            promoted_at,
        });
        self.promotion_writes.fetch_add(1, Ordering::SeqCst);
        Ok(true)
    }

    async fn recent_screen_paths(
        &self,
        project_id: &str,
        min_duration_secs: u64,
        min_path_len: usize,
        limit: usize,
    ) -> Result<Vec<Vec<String>>, SessionStoreError> {
        self.path_queries.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;
        let paths = self.paths.lock();
        Ok(paths
            .get(project_id)
            .map(|samples| {
                samples
                    .iter()
                    .rev()
                    .filter(|s| s.duration_secs >= min_duration_secs)
                    .filter(|s| s.screens.len() >= min_path_len)
                    .take(limit)
                    .map(|s| s.screens.clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn funnel_stats(
        &self,
        project_id: &str,
    ) -> Result<Option<ProjectFunnelStats>, SessionStoreError> {
        self.check_available()?;
        Ok(self.funnels.lock().get(project_id).cloned())
    }

    async fn upsert_funnel_stats(&self, stats: &ProjectFunnelStats) -> Result<(), SessionStoreError> {
        self.check_available()?;
        self.funnels
            .lock()
            .insert(stats.project_id.clone(), stats.clone());
        Ok(())
    }

    async fn active_project_ids(&self) -> Result<Vec<String>, SessionStoreError> {
        self.check_available()?;
        let mut ids: Vec<String> = self.paths.lock().keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }
}

#[derive(Default)]
pub struct MemoryProjectDirectory {
    configs: Mutex<HashMap<String, QuotaConfig>>,
}

impl MemoryProjectDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, project_id: &str, config: QuotaConfig) {
        self.configs.lock().insert(project_id.to_string(), config);
    }
}

#[async_trait]
impl ProjectDirectory for MemoryProjectDirectory {
    async fn quota_config(&self, project_id: &str) -> Result<Option<QuotaConfig>, SessionStoreError> {
        Ok(self.configs.lock().get(project_id).cloned())
    }
}

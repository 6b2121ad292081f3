//! Periodic funnel analysis.
//!
//! Persists a durable funnel per project, which defines the expected path used for
//! failed-funnel detection. The bar for persisting is stricter than for the cached
//! advisory profile.

use crate::errors::PromotionError;
use crate::funnel::FunnelLearner;
use crate::metrics_defs::{FUNNEL_JOB_FAILED, FUNNEL_JOB_PERSISTED, FUNNEL_JOB_SKIPPED};
use crate::store::{SessionStore, bounded_query};
use crate::types::ProjectFunnelStats;
use shared::clock::Clock;
use shared::counter;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SkipReason {
    NoProfile,
    SmallSample,
    LowConfidence,
    ShortPath,
}

impl SkipReason {
    fn as_str(&self) -> &'static str {
        match self {
            SkipReason::NoProfile => "no_profile",
            SkipReason::SmallSample => "small_sample",
            SkipReason::LowConfidence => "low_confidence",
            SkipReason::ShortPath => "short_path",
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum AnalysisOutcome {
    Persisted(ProjectFunnelStats),
    Skipped(SkipReason),
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct JobSummary {
    pub analyzed: usize,
    pub persisted: usize,
    pub failed: usize,
}

pub struct FunnelJob {
    learner: Arc<FunnelLearner>,
    store: Arc<dyn SessionStore>,
    clock: Arc<dyn Clock>,
}

impl FunnelJob {
    pub fn new(
        learner: Arc<FunnelLearner>,
        store: Arc<dyn SessionStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        FunnelJob {
            learner,
            store,
            clock,
        }
    }

    /// Rebuilds the project's profile and persists it if it clears the job's bars.
    pub async fn analyze_project_funnel(
        &self,
        project_id: &str,
    ) -> Result<AnalysisOutcome, PromotionError> {
        let config = self.learner.config();
        let outcome = match self.learner.compute_profile(project_id).await? {
            None => AnalysisOutcome::Skipped(SkipReason::NoProfile),
            Some(p) if p.sample_size < config.job_min_sample_size => {
                AnalysisOutcome::Skipped(SkipReason::SmallSample)
            }
            Some(p) if p.path_confidence < config.job_min_confidence => {
                AnalysisOutcome::Skipped(SkipReason::LowConfidence)
            }
            Some(p) if p.dominant_path.len() < 2 => AnalysisOutcome::Skipped(SkipReason::ShortPath),
            Some(profile) => {
                let Some(target_screen) = profile.dominant_path.last().cloned() else {
                    return Ok(AnalysisOutcome::Skipped(SkipReason::ShortPath));
                };
                let stats = ProjectFunnelStats {
                    project_id: project_id.to_string(),
                    target_screen,
                    confidence: profile.path_confidence,
                    sample_size: profile.sample_size,
                    entry_screens: profile.entry_screens,
                    dominant_path: profile.dominant_path,
                    analyzed_at: self.clock.now(),
                };
                bounded_query(config.query_timeout(), self.store.upsert_funnel_stats(&stats))
                    .await?;
                AnalysisOutcome::Persisted(stats)
            }
        };

        match &outcome {
            AnalysisOutcome::Persisted(stats) => {
                tracing::info!(
                    project_id,
                    path = ?stats.dominant_path,
                    confidence = stats.confidence,
                    sample_size = stats.sample_size,
                    "persisted project funnel"
                );
                counter!(FUNNEL_JOB_PERSISTED).increment(1);
            }
            AnalysisOutcome::Skipped(reason) => {
                tracing::debug!(project_id, reason = reason.as_str(), "funnel not persisted");
                counter!(FUNNEL_JOB_SKIPPED, "reason" => reason.as_str()).increment(1);
            }
        }
        // The advisory cache may now be older than what was just sampled.
        self.learner.invalidate(project_id);
        Ok(outcome)
    }

    /// Analyzes every active project once. One project's failure does not stop the others.
    pub async fn run_once(&self) -> Result<JobSummary, PromotionError> {
        let timeout = self.learner.config().query_timeout();
        let projects = bounded_query(timeout, self.store.active_project_ids()).await?;
        let mut summary = JobSummary::default();

        for project_id in &projects {
            summary.analyzed += 1;
            match self.analyze_project_funnel(project_id).await {
                Ok(AnalysisOutcome::Persisted(_)) => summary.persisted += 1,
                Ok(AnalysisOutcome::Skipped(_)) => {}
                Err(err) => {
                    summary.failed += 1;
                    tracing::error!(project_id = %project_id, error = %err, "funnel analysis failed");
                    counter!(FUNNEL_JOB_FAILED).increment(1);
                }
            }
        }
        Ok(summary)
    }

    /// Runs [`run_once`](Self::run_once) every `interval` until `cancel` fires.
    pub async fn run(&self, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("funnel job stopped");
                    return;
                }
                _ = ticker.tick() => {
                    match self.run_once().await {
                        Ok(summary) => tracing::info!(
                            analyzed = summary.analyzed,
                            persisted = summary.persisted,
                            failed = summary.failed,
                            "funnel job pass complete"
                        ),
                        Err(err) => tracing::error!(error = %err, "funnel job pass failed"),
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FunnelConfig;
    use crate::memory::MemorySessionStore;
    use chrono::{TimeZone, Utc};
    use shared::clock::ManualClock;

    fn path(screens: &[&str]) -> Vec<String> {
        screens.iter().map(|s| s.to_string()).collect()
    }

    fn job() -> (Arc<MemorySessionStore>, FunnelJob) {
        let store = Arc::new(MemorySessionStore::new());
        let learner = Arc::new(FunnelLearner::new(store.clone(), FunnelConfig::default()));
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 7, 1, 3, 0, 0).unwrap(),
        ));
        (store.clone(), FunnelJob::new(learner, store, clock))
    }

    fn add(store: &MemorySessionStore, project: &str, screens: &[&str], n: usize) {
        for _ in 0..n {
            store.add_path(project, 90, path(screens));
        }
    }

    #[tokio::test]
    async fn test_persists_confident_funnels() {
        let (store, job) = job();
        add(&store, "shop", &["Home", "Search", "Checkout"], 45);
        add(&store, "shop", &["Home", "Profile"], 15);

        let outcome = job.analyze_project_funnel("shop").await.unwrap();
        let AnalysisOutcome::Persisted(stats) = outcome else {
            panic!("expected a persisted funnel, got {outcome:?}");
        };
        assert_eq!(stats.dominant_path, path(&["Home", "Search", "Checkout"]));
        assert_eq!(stats.target_screen, "Checkout");
        assert_eq!(stats.confidence, 0.75);
        assert_eq!(stats.sample_size, 60);
        assert_eq!(store.funnel("shop"), Some(stats));
    }

    #[tokio::test]
    async fn test_stricter_than_the_advisory_profile() {
        let (store, job) = job();
        // Enough for a cached profile (20), not for the job (50).
        add(&store, "small", &["A", "B"], 30);
        assert_eq!(
            job.analyze_project_funnel("small").await.unwrap(),
            AnalysisOutcome::Skipped(SkipReason::SmallSample)
        );
        assert!(store.funnel("small").is_none());

        // Entry split evenly: the dominant path is one step deep.
        add(&store, "flat", &["A", "X"], 20);
        add(&store, "flat", &["A", "Y"], 20);
        add(&store, "flat", &["A", "Z"], 20);
        assert_eq!(
            job.analyze_project_funnel("flat").await.unwrap(),
            AnalysisOutcome::Skipped(SkipReason::ShortPath)
        );

        assert_eq!(
            job.analyze_project_funnel("empty").await.unwrap(),
            AnalysisOutcome::Skipped(SkipReason::NoProfile)
        );
    }

    #[tokio::test]
    async fn test_low_confidence_is_skipped() {
        let (store, job) = job();
        for i in 0..60 {
            let first = format!("Entry{}", i % 4);
            store.add_path("spread", 90, vec![first, "Next".into()]);
        }
        // Each entry holds 15 of 60 sessions.
        assert_eq!(
            job.analyze_project_funnel("spread").await.unwrap(),
            AnalysisOutcome::Skipped(SkipReason::LowConfidence)
        );
    }

    #[tokio::test]
    async fn test_run_once_covers_every_active_project() {
        let (store, job) = job();
        add(&store, "a", &["Home", "Cart", "Pay"], 60);
        add(&store, "b", &["X", "Y"], 5);

        let summary = job.run_once().await.unwrap();
        assert_eq!(
            summary,
            JobSummary {
                analyzed: 2,
                persisted: 1,
                failed: 0,
            }
        );
    }

    #[tokio::test]
    async fn test_run_stops_when_cancelled() {
        let (store, job) = job();
        add(&store, "a", &["Home", "Cart", "Pay"], 60);
        let cancel = CancellationToken::new();

        let job = Arc::new(job);
        let handle = tokio::spawn({
            let job = job.clone();
            let cancel = cancel.clone();
            async move { job.run(Duration::from_millis(10), cancel).await }
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        handle.await.unwrap();
        assert!(store.funnel("a").is_some());
    }
}

//! The promotion decision.
//!
//! One verdict per session, reached through an ordered cascade where the first match wins:
//! project quota gate, hard rules, soft score, baseline sampling. Every promoting branch
//! consumes a slot in a per-project, per-reason counter over a fixed 15 minute window; a
//! full counter turns the verdict into `rate_limited`.
//!
//! Promotion is write-once. The promoted fields are written with a compare-and-swap, so
//! when two evaluations of the same session race, both run the cascade but only one
//! verdict is persisted and both callers observe it.

use crate::config::PromotionConfig;
use crate::errors::PromotionError;
use crate::funnel::{FunnelLearner, normalize_path};
use crate::metrics_defs::{
    PROMOTION_CAS_LOST, PROMOTION_FAILED, PROMOTION_RATE_LIMITED, PROMOTION_VERDICT,
    SAMPLING_SCALE_FALLBACK,
};
use crate::rules::{RuleContext, first_match, needs_funnel, needs_profile};
use crate::sampling::{FixedScale, RandomSource, SamplingScale, ThreadRandom, effective_rate};
use crate::scoring::{SoftScorer, WeightedScorer};
use crate::store::{ProjectDirectory, SessionStore, bounded_query};
use crate::types::{
    FunnelProfile, ProjectFunnelStats, PromotionReason, PromotionResult, QuotaConfig,
    SessionRecord,
};
use counters::{RateLimitSpec, RateLimiter, Window};
use shared::counter;
use std::sync::Arc;

pub struct PromotionEngine {
    sessions: Arc<dyn SessionStore>,
    projects: Arc<dyn ProjectDirectory>,
    limiter: RateLimiter,
    learner: Arc<FunnelLearner>,
    scorer: Arc<dyn SoftScorer>,
    random: Arc<dyn RandomSource>,
    scale: Arc<dyn SamplingScale>,
    config: PromotionConfig,
}

impl PromotionEngine {
    pub fn new(
        sessions: Arc<dyn SessionStore>,
        projects: Arc<dyn ProjectDirectory>,
        limiter: RateLimiter,
        learner: Arc<FunnelLearner>,
        config: PromotionConfig,
    ) -> Self {
        PromotionEngine {
            sessions,
            projects,
            limiter,
            learner,
            scorer: Arc::new(WeightedScorer::from_config(&config)),
            random: Arc::new(ThreadRandom),
            scale: Arc::new(FixedScale::default()),
            config,
        }
    }

    pub fn with_scorer(mut self, scorer: Arc<dyn SoftScorer>) -> Self {
        self.scorer = scorer;
        self
    }

    pub fn with_random(mut self, random: Arc<dyn RandomSource>) -> Self {
        self.random = random;
        self
    }

    pub fn with_sampling_scale(mut self, scale: Arc<dyn SamplingScale>) -> Self {
        self.scale = scale;
        self
    }

    /// Decides whether to keep the session's replay and persists the decision.
    ///
    /// Never fails: internal errors are logged and reported as `not_promoted`.
    pub async fn evaluate_and_promote(
        &self,
        session_id: &str,
        project_id: &str,
        duration_secs: u64,
    ) -> PromotionResult {
        match self.evaluate(session_id, project_id, duration_secs).await {
            Ok(result) => {
                counter!(
                    PROMOTION_VERDICT,
                    "reason" => result.reason.as_str(),
                    "promoted" => if result.promoted { "true" } else { "false" }
                )
                .increment(1);
                result
            }
            Err(err) => {
                tracing::error!(session_id, project_id, error = %err, "promotion evaluation failed");
                counter!(PROMOTION_FAILED).increment(1);
                PromotionResult::declined(PromotionReason::NotPromoted, None)
            }
        }
    }

    async fn evaluate(
        &self,
        session_id: &str,
        project_id: &str,
        duration_secs: u64,
    ) -> Result<PromotionResult, PromotionError> {
        let timeout = self.config.query_timeout();

        let session = bounded_query(timeout, self.sessions.session(session_id))
            .await?
            .ok_or_else(|| PromotionError::SessionNotFound(session_id.to_string()))?;
        if let Some(stored) = stored_verdict(&session) {
            return Ok(stored);
        }

        let quota = bounded_query(timeout, self.projects.quota_config(project_id))
            .await?
            .unwrap_or_else(|| {
                tracing::debug!(project_id, "no quota config, using defaults");
                QuotaConfig::default()
            });
        if !quota.recording_enabled {
            return Ok(PromotionResult::declined(PromotionReason::RecordingDisabled, None));
        }
        if duration_secs > u64::from(quota.max_recording_minutes) * 60 {
            return Ok(PromotionResult::declined(PromotionReason::QuotaExceeded, None));
        }

        let metrics = bounded_query(timeout, self.sessions.session_metrics(session_id))
            .await?
            .ok_or_else(|| PromotionError::MetricsNotFound(session_id.to_string()))?;
        let score = self.scorer.score(&metrics, duration_secs);
        let path = normalize_path(&metrics.screens, self.learner.config().max_path_len);

        let mut ctx = RuleContext {
            metrics: &metrics,
            duration_secs,
            path: &path,
            profile: None,
            funnel: None,
        };
        let profile = if needs_profile(&ctx, &self.config) {
            self.entry_profile(project_id).await
        } else {
            None
        };
        let funnel = if needs_funnel(&ctx) {
            self.persisted_funnel(project_id).await
        } else {
            None
        };
        ctx.profile = profile.as_ref();
        ctx.funnel = funnel.as_ref();

        let candidate = match first_match(&ctx, &self.config) {
            Some(reason) => Some(reason),
            None if score >= self.config.soft_score_threshold => Some(PromotionReason::SoftScore),
            None if self.sampled(project_id).await => Some(PromotionReason::Sample),
            None => None,
        };

        let verdict = match candidate {
            Some(reason) => self.rate_limited(project_id, reason).await?,
            None => PromotionReason::NotPromoted,
        };

        self.persist(session_id, verdict, score).await
    }

    /// Consumes a slot for `reason`, returning the reason or `rate_limited`.
    async fn rate_limited(
        &self,
        project_id: &str,
        reason: PromotionReason,
    ) -> Result<PromotionReason, PromotionError> {
        let spec = RateLimitSpec::new(
            format!("promotion:{project_id}:{}", reason.as_str()),
            self.config.rate_limit_for(reason),
            Window::Custom(self.config.rate_limit_window()),
        );
        let decision = self.limiter.check_and_increment(&spec).await?;
        if decision.allowed {
            return Ok(reason);
        }
        tracing::debug!(project_id, reason = reason.as_str(), "promotion rate limited");
        counter!(PROMOTION_RATE_LIMITED, "reason" => reason.as_str()).increment(1);
        Ok(PromotionReason::RateLimited)
    }

    async fn persist(
        &self,
        session_id: &str,
        verdict: PromotionReason,
        score: f64,
    ) -> Result<PromotionResult, PromotionError> {
        let timeout = self.config.query_timeout();
        bounded_query(timeout, self.sessions.record_score(session_id, score)).await?;

        if !is_promoting(verdict) {
            return Ok(PromotionResult::declined(verdict, Some(score)));
        }

        let now = self.limiter.clock().now();
        let won = bounded_query(
            timeout,
            self.sessions.mark_promoted(session_id, verdict, score, now),
        )
        .await?;
        if won {
            tracing::info!(session_id, reason = verdict.as_str(), score, "session promoted");
            return Ok(PromotionResult::promoted(verdict, score));
        }

        // A concurrent evaluation promoted first; report its verdict.
        counter!(PROMOTION_CAS_LOST).increment(1);
        let session = bounded_query(timeout, self.sessions.session(session_id))
            .await?
            .ok_or_else(|| PromotionError::SessionNotFound(session_id.to_string()))?;
        Ok(stored_verdict(&session)
            .unwrap_or_else(|| PromotionResult::declined(PromotionReason::NotPromoted, Some(score))))
    }

    /// Advisory: a failure only disables the entry-screen rule for this session.
    async fn entry_profile(&self, project_id: &str) -> Option<FunnelProfile> {
        match self.learner.get_profile(project_id).await {
            Ok(profile) => profile,
            Err(err) => {
                tracing::warn!(project_id, error = %err, "funnel profile unavailable");
                None
            }
        }
    }

    /// Advisory: a failure only disables the failed-funnel rule for this session.
    async fn persisted_funnel(&self, project_id: &str) -> Option<ProjectFunnelStats> {
        let timeout = self.config.query_timeout();
        match bounded_query(timeout, self.sessions.funnel_stats(project_id)).await {
            Ok(stats) => stats,
            Err(err) => {
                tracing::warn!(project_id, error = %err, "project funnel unavailable");
                None
            }
        }
    }

    async fn sampled(&self, project_id: &str) -> bool {
        let scale = match tokio::time::timeout(
            self.config.query_timeout(),
            self.scale.scale(project_id),
        )
        .await
        {
            Ok(Ok(scale)) => scale,
            Ok(Err(err)) => {
                tracing::warn!(project_id, error = %err, "sampling scale failed, using 1.0");
                counter!(SAMPLING_SCALE_FALLBACK).increment(1);
                1.0
            }
            Err(_) => {
                tracing::warn!(project_id, "sampling scale timed out, using 1.0");
                counter!(SAMPLING_SCALE_FALLBACK).increment(1);
                1.0
            }
        };
        let rate = effective_rate(self.config.baseline_sample_rate, scale);
        self.random.next_f64() < rate
    }
}

fn is_promoting(reason: PromotionReason) -> bool {
    !matches!(
        reason,
        PromotionReason::NotPromoted
            | PromotionReason::RateLimited
            | PromotionReason::RecordingDisabled
            | PromotionReason::QuotaExceeded
    )
}

fn stored_verdict(session: &SessionRecord) -> Option<PromotionResult> {
    session
        .promotion
        .as_ref()
        .map(|p| PromotionResult::promoted(p.reason, p.score))
}

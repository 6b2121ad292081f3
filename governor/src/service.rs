//! The operations the ingest pipeline and billing collaborator call.
//!
//! [`Governor`] is built once at process start from a [`Config`] and a set of
//! [`Collaborators`], then shared. Budget and quota methods return typed
//! [`QuotaError`]s that the caller translates into a rejected request. Promotion never
//! fails the caller.

use crate::config::Config;
use counters::memory::MemoryCounterStore;
use counters::{CounterStore, RateLimiter};
use promotion::funnel_job::{AnalysisOutcome, JobSummary};
use promotion::memory::{MemoryProjectDirectory, MemorySessionStore};
use promotion::sampling::{FixedScale, RandomSource, SamplingScale, ThreadRandom};
use promotion::scoring::SoftScorer;
use promotion::store::{ProjectDirectory, SessionStore};
use promotion::{
    FunnelJob, FunnelLearner, FunnelProfile, PromotionEngine, PromotionError, PromotionResult,
};
use quota::alerts::{LogNotifier, UsageNotifier};
use quota::memory::MemoryUsageStore;
use quota::usage::UsageStore;
use quota::{BudgetRequest, ByteBudgetEnforcer, QuotaError, SessionLimitCheck, SessionQuotaGate};
use shared::clock::{Clock, SystemClock};
use shared::tasks::{TaskFailure, TaskQueue};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Backends the governor talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub counters: Arc<dyn CounterStore>,
    pub usage: Arc<dyn UsageStore>,
    pub notifier: Arc<dyn UsageNotifier>,
    pub sessions: Arc<dyn SessionStore>,
    pub projects: Arc<dyn ProjectDirectory>,
    pub sampling_scale: Arc<dyn SamplingScale>,
    pub random: Arc<dyn RandomSource>,
    /// Replaces the weighted scorer built from the promotion config.
    pub scorer: Option<Arc<dyn SoftScorer>>,
    pub clock: Arc<dyn Clock>,
}

impl Collaborators {
    /// In-process backends that start empty and forget everything on exit.
    pub fn in_memory() -> Self {
        Collaborators {
            counters: Arc::new(MemoryCounterStore::new()),
            usage: Arc::new(MemoryUsageStore::new()),
            notifier: Arc::new(LogNotifier),
            sessions: Arc::new(MemorySessionStore::new()),
            projects: Arc::new(MemoryProjectDirectory::new()),
            sampling_scale: Arc::new(FixedScale::default()),
            random: Arc::new(ThreadRandom),
            scorer: None,
            clock: Arc::new(SystemClock),
        }
    }
}

pub struct Governor {
    byte_budget: ByteBudgetEnforcer,
    session_gate: SessionQuotaGate,
    learner: Arc<FunnelLearner>,
    funnel_job: FunnelJob,
    promotion: PromotionEngine,
    tasks: TaskQueue,
    funnel_interval: Duration,
    shutdown: CancellationToken,
}

impl Governor {
    /// Wires every component. The receiver yields failures of background work such as
    /// usage alerts; the caller decides whether to log or assert on them.
    pub fn new(
        config: &Config,
        collaborators: Collaborators,
    ) -> (Self, mpsc::UnboundedReceiver<TaskFailure>) {
        let Collaborators {
            counters,
            usage,
            notifier,
            sessions,
            projects,
            sampling_scale,
            random,
            scorer,
            clock,
        } = collaborators;
        let counter_timeout = config.counter_store.operation_timeout();
        let (tasks, failures) = TaskQueue::new();

        let byte_budget = ByteBudgetEnforcer::new(
            counters.clone(),
            clock.clone(),
            config.byte_budget.clone(),
            counter_timeout,
        );
        let session_gate = SessionQuotaGate::new(
            usage,
            counters.clone(),
            notifier,
            tasks.clone(),
            clock.clone(),
            config.session_quota.clone(),
            counter_timeout,
        );
        let learner = Arc::new(FunnelLearner::new(sessions.clone(), config.funnel.clone()));
        let funnel_job = FunnelJob::new(learner.clone(), sessions.clone(), clock.clone());
        let limiter = RateLimiter::new(counters, clock, counter_timeout);
        let mut promotion = PromotionEngine::new(
            sessions,
            projects,
            limiter,
            learner.clone(),
            config.promotion.clone(),
        )
        .with_sampling_scale(sampling_scale)
        .with_random(random);
        if let Some(scorer) = scorer {
            promotion = promotion.with_scorer(scorer);
        }

        let governor = Governor {
            byte_budget,
            session_gate,
            learner,
            funnel_job,
            promotion,
            tasks,
            funnel_interval: config.funnel.job_interval(),
            shutdown: CancellationToken::new(),
        };
        (governor, failures)
    }

    /// A governor backed entirely by in-process stores.
    pub fn standalone(config: &Config) -> (Self, mpsc::UnboundedReceiver<TaskFailure>) {
        tracing::warn!("using in-process stores; counters and usage are not shared or persisted");
        Self::new(config, Collaborators::in_memory())
    }

    pub async fn enforce_ingest_byte_budget(
        &self,
        request: &BudgetRequest<'_>,
    ) -> Result<(), QuotaError> {
        self.byte_budget.enforce(request).await
    }

    pub async fn check_and_enforce_session_limit(
        &self,
        team_id: &str,
    ) -> Result<SessionLimitCheck, QuotaError> {
        self.session_gate.check_and_enforce(team_id).await
    }

    pub async fn get_team_session_usage(
        &self,
        team_id: &str,
    ) -> Result<SessionLimitCheck, QuotaError> {
        self.session_gate.get_team_session_usage(team_id).await
    }

    /// Records `sessions` new billable sessions for the project. Returns the project's
    /// total for the current period.
    pub async fn increment_project_session_count(
        &self,
        project_id: &str,
        team_id: &str,
        sessions: u64,
    ) -> Result<u64, QuotaError> {
        self.session_gate
            .increment_session_count(project_id, team_id, sessions)
            .await
    }

    /// Called by billing when a team's plan changes.
    pub async fn invalidate_session_cache(&self, team_id: &str) -> Result<(), QuotaError> {
        self.session_gate.invalidate_session_cache(team_id).await
    }

    /// The project's learned navigation profile, if there is enough data for one. Store
    /// failures are logged and reported as no profile.
    pub async fn get_project_flow_profile(&self, project_id: &str) -> Option<FunnelProfile> {
        match self.learner.get_profile(project_id).await {
            Ok(profile) => profile,
            Err(err) => {
                tracing::warn!(project_id, error = %err, "flow profile unavailable");
                None
            }
        }
    }

    pub async fn analyze_project_funnel(
        &self,
        project_id: &str,
    ) -> Result<AnalysisOutcome, PromotionError> {
        self.funnel_job.analyze_project_funnel(project_id).await
    }

    /// One pass of funnel analysis over every active project.
    pub async fn analyze_all_funnels(&self) -> Result<JobSummary, PromotionError> {
        self.funnel_job.run_once().await
    }

    pub async fn evaluate_and_promote_session(
        &self,
        session_id: &str,
        project_id: &str,
        duration_secs: u64,
    ) -> PromotionResult {
        self.promotion
            .evaluate_and_promote(session_id, project_id, duration_secs)
            .await
    }

    /// Runs funnel analysis on the configured interval until [`close`](Self::close).
    pub async fn run_funnel_job(&self) {
        self.funnel_job
            .run(self.funnel_interval, self.shutdown.clone())
            .await
    }

    /// Stops the funnel job, waits for queued background work and drops cached profiles.
    pub async fn close(&self) {
        self.shutdown.cancel();
        self.tasks.flush().await;
        self.learner.invalidate_all();
        tracing::info!("governor closed");
    }
}

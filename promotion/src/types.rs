use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Per-session aggregates produced by the ingest pipeline.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionMetrics {
    pub crash_count: u32,
    pub anr_count: u32,
    pub rage_tap_count: u32,
    pub dead_tap_count: u32,
    pub api_error_count: u32,
    pub api_avg_latency_ms: Option<u64>,
    pub startup_time_ms: Option<u64>,
    /// Visited screens in visit order, repeats included.
    pub screens: Vec<String>,
    pub duration_secs: u64,
    /// 0.0 to 1.0; higher means the user interacted more.
    pub interaction_score: f64,
    /// 0.0 to 1.0; higher means the user explored more of the app.
    pub exploration_score: f64,
}

/// The persisted result of a positive promotion decision.
#[derive(Clone, Debug, PartialEq)]
pub struct Promotion {
    pub reason: PromotionReason,
    pub score: f64,
    pub promoted_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct SessionRecord {
    pub id: String,
    pub project_id: String,
    pub started_at: DateTime<Utc>,
    pub duration_secs: u64,
    /// Last computed promotion score, written for every verdict.
    pub promotion_score: Option<f64>,
    /// Set once and never cleared.
    pub promotion: Option<Promotion>,
}

impl SessionRecord {
    pub fn new(id: impl Into<String>, project_id: impl Into<String>, started_at: DateTime<Utc>) -> Self {
        SessionRecord {
            id: id.into(),
            project_id: project_id.into(),
            started_at,
            duration_secs: 0,
            promotion_score: None,
            promotion: None,
        }
    }

    pub fn is_promoted(&self) -> bool {
        self.promotion.is_some()
    }
}

/// Project-level recording policy.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaConfig {
    pub recording_enabled: bool,
    pub max_recording_minutes: u32,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        QuotaConfig {
            recording_enabled: true,
            max_recording_minutes: 60,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromotionReason {
    Crash,
    Anr,
    ApiLatency,
    SlowStartup,
    RageTap,
    DeadTap,
    ApiError,
    StuckOnEntry,
    LowExploration,
    FailedFunnel,
    SoftScore,
    Sample,
    RateLimited,
    RecordingDisabled,
    QuotaExceeded,
    NotPromoted,
}

impl PromotionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            PromotionReason::Crash => "crash",
            PromotionReason::Anr => "anr",
            PromotionReason::ApiLatency => "api_latency",
            PromotionReason::SlowStartup => "slow_startup",
            PromotionReason::RageTap => "rage_tap",
            PromotionReason::DeadTap => "dead_tap",
            PromotionReason::ApiError => "api_error",
            PromotionReason::StuckOnEntry => "stuck_on_entry",
            PromotionReason::LowExploration => "low_exploration",
            PromotionReason::FailedFunnel => "failed_funnel",
            PromotionReason::SoftScore => "soft_score",
            PromotionReason::Sample => "sample",
            PromotionReason::RateLimited => "rate_limited",
            PromotionReason::RecordingDisabled => "recording_disabled",
            PromotionReason::QuotaExceeded => "quota_exceeded",
            PromotionReason::NotPromoted => "not_promoted",
        }
    }
}

impl fmt::Display for PromotionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PromotionResult {
    pub promoted: bool,
    pub reason: PromotionReason,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
}

impl PromotionResult {
    pub fn promoted(reason: PromotionReason, score: f64) -> Self {
        PromotionResult {
            promoted: true,
            reason,
            score: Some(score),
        }
    }

    pub fn declined(reason: PromotionReason, score: Option<f64>) -> Self {
        PromotionResult {
            promoted: false,
            reason,
            score,
        }
    }
}

/// Learned navigation model for one project.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FunnelProfile {
    pub entry_screens: Vec<String>,
    pub entry_screen_counts: IndexMap<String, u64>,
    pub entry_confidence: f64,
    pub dominant_path: Vec<String>,
    pub path_confidence: f64,
    pub sample_size: usize,
}

impl FunnelProfile {
    pub fn is_entry_screen(&self, screen: &str) -> bool {
        self.entry_screens.iter().any(|s| s == screen)
    }
}

/// The durable funnel record written by the periodic analysis job.
#[derive(Clone, Debug, PartialEq)]
pub struct ProjectFunnelStats {
    pub project_id: String,
    pub dominant_path: Vec<String>,
    /// Last step of the dominant path.
    pub target_screen: String,
    pub confidence: f64,
    pub sample_size: usize,
    pub entry_screens: Vec<String>,
    pub analyzed_at: DateTime<Utc>,
}

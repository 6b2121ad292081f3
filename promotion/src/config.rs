use crate::types::PromotionReason;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum ValidationError {
    #[error("{0} cannot be 0")]
    Zero(&'static str),

    #[error("{field} must be between 0 and 1, got {value}")]
    NotAFraction { field: &'static str, value: f64 },

    #[error("min_path_len ({min}) exceeds max_path_len ({max})")]
    PathBounds { min: usize, max: usize },

    #[error("job thresholds must be at least as strict as the cached profile's")]
    JobLooserThanCache,
}

fn fraction(field: &'static str, value: f64) -> Result<(), ValidationError> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(ValidationError::NotAFraction { field, value })
    }
}

/// Funnel learning and periodic analysis settings.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct FunnelConfig {
    /// Most recent sessions sampled per profile.
    pub sample_limit: usize,
    pub min_session_duration_secs: u64,
    pub min_path_len: usize,
    /// Normalized paths are truncated to this many screens.
    pub max_path_len: usize,
    /// Below this many sampled sessions no profile is produced.
    pub min_sample_size: usize,
    pub min_entry_count: u64,
    pub min_entry_share: f64,
    pub max_entry_screens: usize,
    pub max_depth: usize,
    /// The dominant path stops when fewer than this share of sessions continue.
    pub drop_off_ratio: f64,
    pub cache_ttl_secs: u64,
    pub cache_capacity: u64,
    /// Bars a profile must clear before the periodic job persists it.
    pub job_min_sample_size: usize,
    pub job_min_confidence: f64,
    pub job_interval_secs: u64,
    pub query_timeout_ms: u64,
}

impl Default for FunnelConfig {
    fn default() -> Self {
        FunnelConfig {
            sample_limit: 200,
            min_session_duration_secs: 5,
            min_path_len: 2,
            max_path_len: 20,
            min_sample_size: 20,
            min_entry_count: 3,
            min_entry_share: 0.05,
            max_entry_screens: 3,
            max_depth: 8,
            drop_off_ratio: 0.5,
            cache_ttl_secs: 3600,
            cache_capacity: 10_000,
            job_min_sample_size: 50,
            job_min_confidence: 0.3,
            job_interval_secs: 3600,
            query_timeout_ms: 2_000,
        }
    }
}

impl FunnelConfig {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn job_interval(&self) -> Duration {
        Duration::from_secs(self.job_interval_secs)
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        for (field, value) in [
            ("sample_limit", self.sample_limit as u64),
            ("max_path_len", self.max_path_len as u64),
            ("max_depth", self.max_depth as u64),
            ("min_sample_size", self.min_sample_size as u64),
            ("cache_ttl_secs", self.cache_ttl_secs),
            ("job_interval_secs", self.job_interval_secs),
            ("query_timeout_ms", self.query_timeout_ms),
        ] {
            if value == 0 {
                return Err(ValidationError::Zero(field));
            }
        }
        if self.min_path_len > self.max_path_len {
            return Err(ValidationError::PathBounds {
                min: self.min_path_len,
                max: self.max_path_len,
            });
        }
        fraction("min_entry_share", self.min_entry_share)?;
        fraction("drop_off_ratio", self.drop_off_ratio)?;
        fraction("job_min_confidence", self.job_min_confidence)?;
        if self.job_min_sample_size < self.min_sample_size {
            return Err(ValidationError::JobLooserThanCache);
        }
        Ok(())
    }
}

/// Weights of the default soft scorer. Each signal is normalized to 0..=1 first.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct SoftScoreWeights {
    pub dead_taps: f64,
    pub api_latency: f64,
    pub startup: f64,
    pub low_interaction: f64,
    pub low_exploration: f64,
}

impl Default for SoftScoreWeights {
    fn default() -> Self {
        SoftScoreWeights {
            dead_taps: 0.3,
            api_latency: 0.25,
            startup: 0.15,
            low_interaction: 0.15,
            low_exploration: 0.15,
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct PromotionConfig {
    pub api_latency_threshold_ms: u64,
    pub slow_startup_threshold_ms: u64,
    pub dead_tap_threshold: u32,
    pub stuck_min_duration_secs: u64,
    pub low_exploration_min_duration_secs: u64,
    pub low_exploration_screens_per_minute: f64,
    pub soft_score_threshold: f64,
    pub soft_score_weights: SoftScoreWeights,
    /// Probability of sampling an otherwise unremarkable session, before scaling.
    pub baseline_sample_rate: f64,
    pub rate_limit_window_secs: u64,
    /// Promotions per project per window, by reason.
    pub rate_limits: HashMap<PromotionReason, u64>,
    /// Ceiling for reasons missing from `rate_limits`.
    pub default_rate_limit: u64,
    pub query_timeout_ms: u64,
}

impl Default for PromotionConfig {
    fn default() -> Self {
        let rate_limits = [
            (PromotionReason::Crash, 100),
            (PromotionReason::Anr, 100),
            (PromotionReason::ApiLatency, 50),
            (PromotionReason::SlowStartup, 50),
            (PromotionReason::RageTap, 50),
            (PromotionReason::DeadTap, 30),
            (PromotionReason::ApiError, 50),
            (PromotionReason::StuckOnEntry, 20),
            (PromotionReason::LowExploration, 20),
            (PromotionReason::FailedFunnel, 30),
            (PromotionReason::SoftScore, 30),
            (PromotionReason::Sample, 20),
        ]
        .into_iter()
        .collect();

        PromotionConfig {
            api_latency_threshold_ms: 2_000,
            slow_startup_threshold_ms: 3_000,
            dead_tap_threshold: 3,
            stuck_min_duration_secs: 30,
            low_exploration_min_duration_secs: 120,
            low_exploration_screens_per_minute: 0.5,
            soft_score_threshold: 0.6,
            soft_score_weights: SoftScoreWeights::default(),
            baseline_sample_rate: 0.05,
            rate_limit_window_secs: 15 * 60,
            rate_limits,
            default_rate_limit: 25,
            query_timeout_ms: 2_000,
        }
    }
}

impl PromotionConfig {
    pub fn rate_limit_for(&self, reason: PromotionReason) -> u64 {
        self.rate_limits
            .get(&reason)
            .copied()
            .unwrap_or(self.default_rate_limit)
    }

    pub fn rate_limit_window(&self) -> Duration {
        Duration::from_secs(self.rate_limit_window_secs)
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.rate_limit_window_secs == 0 {
            return Err(ValidationError::Zero("rate_limit_window_secs"));
        }
        if self.query_timeout_ms == 0 {
            return Err(ValidationError::Zero("query_timeout_ms"));
        }
        if self.dead_tap_threshold == 0 {
            return Err(ValidationError::Zero("dead_tap_threshold"));
        }
        fraction("baseline_sample_rate", self.baseline_sample_rate)?;
        fraction("soft_score_threshold", self.soft_score_threshold)?;
        Ok(())
    }
}

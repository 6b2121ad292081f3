use crate::config::{PromotionConfig, SoftScoreWeights};
use crate::types::SessionMetrics;

/// Combines minor signals into a score between 0 and 1.
pub trait SoftScorer: Send + Sync {
    fn score(&self, metrics: &SessionMetrics, duration_secs: u64) -> f64;
}

/// Weighted sum of normalized signals. Each signal saturates at the matching hard rule's
/// threshold, so a session that just misses a hard rule still scores high on it.
pub struct WeightedScorer {
    weights: SoftScoreWeights,
    dead_tap_threshold: f64,
    api_latency_threshold_ms: f64,
    slow_startup_threshold_ms: f64,
}

impl WeightedScorer {
    pub fn from_config(config: &PromotionConfig) -> Self {
        WeightedScorer {
            weights: config.soft_score_weights.clone(),
            dead_tap_threshold: config.dead_tap_threshold.max(1) as f64,
            api_latency_threshold_ms: config.api_latency_threshold_ms.max(1) as f64,
            slow_startup_threshold_ms: config.slow_startup_threshold_ms.max(1) as f64,
        }
    }
}

fn ratio(value: f64, ceiling: f64) -> f64 {
    (value / ceiling).clamp(0.0, 1.0)
}

impl SoftScorer for WeightedScorer {
    fn score(&self, metrics: &SessionMetrics, _duration_secs: u64) -> f64 {
        let w = &self.weights;
        let signals = [
            (
                w.dead_taps,
                ratio(metrics.dead_tap_count as f64, self.dead_tap_threshold),
            ),
            (
                w.api_latency,
                ratio(
                    metrics.api_avg_latency_ms.unwrap_or(0) as f64,
                    self.api_latency_threshold_ms,
                ),
            ),
            (
                w.startup,
                ratio(
                    metrics.startup_time_ms.unwrap_or(0) as f64,
                    self.slow_startup_threshold_ms,
                ),
            ),
            (w.low_interaction, 1.0 - metrics.interaction_score.clamp(0.0, 1.0)),
            (w.low_exploration, 1.0 - metrics.exploration_score.clamp(0.0, 1.0)),
        ];
        let total_weight: f64 = signals.iter().map(|(weight, _)| weight).sum();
        if total_weight <= 0.0 {
            return 0.0;
        }
        signals.iter().map(|(weight, value)| weight * value).sum::<f64>() / total_weight
    }
}

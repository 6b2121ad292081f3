//! Hard promotion rules, in cascade order.

use crate::config::PromotionConfig;
use crate::types::{FunnelProfile, ProjectFunnelStats, PromotionReason, SessionMetrics};
use std::collections::HashSet;

/// Everything a rule may look at for one session.
pub struct RuleContext<'a> {
    pub metrics: &'a SessionMetrics,
    pub duration_secs: u64,
    /// Normalized screen path.
    pub path: &'a [String],
    /// Cached advisory profile; only loaded for single-screen sessions.
    pub profile: Option<&'a FunnelProfile>,
    /// Persisted funnel; only loaded for multi-screen sessions.
    pub funnel: Option<&'a ProjectFunnelStats>,
}

type Rule = fn(&RuleContext<'_>, &PromotionConfig) -> bool;

/// Evaluated top to bottom; the first match wins.
pub const HARD_RULES: &[(PromotionReason, Rule)] = &[
    (PromotionReason::Crash, crash),
    (PromotionReason::Anr, anr),
    (PromotionReason::ApiLatency, api_latency),
    (PromotionReason::SlowStartup, slow_startup),
    (PromotionReason::RageTap, rage_tap),
    (PromotionReason::DeadTap, dead_tap),
    (PromotionReason::ApiError, api_error),
    (PromotionReason::StuckOnEntry, stuck_on_entry),
    (PromotionReason::LowExploration, low_exploration),
    (PromotionReason::FailedFunnel, failed_funnel),
];

pub fn first_match(ctx: &RuleContext<'_>, config: &PromotionConfig) -> Option<PromotionReason> {
    HARD_RULES
        .iter()
        .find(|(_, rule)| rule(ctx, config))
        .map(|(reason, _)| *reason)
}

/// Whether any rule could depend on the learned entry screens.
pub fn needs_profile(ctx: &RuleContext<'_>, config: &PromotionConfig) -> bool {
    ctx.path.len() == 1 && ctx.duration_secs >= config.stuck_min_duration_secs
}

/// Whether any rule could depend on the persisted funnel.
pub fn needs_funnel(ctx: &RuleContext<'_>) -> bool {
    ctx.path.len() >= 2
}

fn crash(ctx: &RuleContext<'_>, _: &PromotionConfig) -> bool {
    ctx.metrics.crash_count >= 1
}

fn anr(ctx: &RuleContext<'_>, _: &PromotionConfig) -> bool {
    ctx.metrics.anr_count >= 1
}

fn api_latency(ctx: &RuleContext<'_>, config: &PromotionConfig) -> bool {
    ctx.metrics
        .api_avg_latency_ms
        .is_some_and(|ms| ms >= config.api_latency_threshold_ms)
}

fn slow_startup(ctx: &RuleContext<'_>, config: &PromotionConfig) -> bool {
    ctx.metrics
        .startup_time_ms
        .is_some_and(|ms| ms >= config.slow_startup_threshold_ms)
}

fn rage_tap(ctx: &RuleContext<'_>, _: &PromotionConfig) -> bool {
    ctx.metrics.rage_tap_count >= 1
}

fn dead_tap(ctx: &RuleContext<'_>, config: &PromotionConfig) -> bool {
    ctx.metrics.dead_tap_count >= config.dead_tap_threshold
}

fn api_error(ctx: &RuleContext<'_>, _: &PromotionConfig) -> bool {
    ctx.metrics.api_error_count >= 1
}

fn stuck_on_entry(ctx: &RuleContext<'_>, config: &PromotionConfig) -> bool {
    let [screen] = ctx.path else {
        return false;
    };
    ctx.duration_secs >= config.stuck_min_duration_secs
        && ctx.profile.is_some_and(|p| p.is_entry_screen(screen))
}

fn low_exploration(ctx: &RuleContext<'_>, config: &PromotionConfig) -> bool {
    if ctx.duration_secs < config.low_exploration_min_duration_secs {
        return false;
    }
    let unique: HashSet<&String> = ctx.metrics.screens.iter().collect();
    let minutes = ctx.duration_secs as f64 / 60.0;
    (unique.len() as f64 / minutes) < config.low_exploration_screens_per_minute
}

/// Started down the expected funnel but never reached its target.
fn failed_funnel(ctx: &RuleContext<'_>, _: &PromotionConfig) -> bool {
    let Some(funnel) = ctx.funnel else {
        return false;
    };
    if funnel.dominant_path.len() < 2 || ctx.path.len() < 2 {
        return false;
    }
    // The normalized path is truncated; the target may only appear in the full visit list.
    ctx.path[..2] == funnel.dominant_path[..2]
        && !ctx.metrics.screens.iter().any(|s| *s == funnel.target_screen)
}

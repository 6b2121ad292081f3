//! Metrics definitions for promotion and funnel learning.

use shared::metrics_defs::{MetricDef, MetricType};

pub const PROMOTION_VERDICT: MetricDef = MetricDef {
    name: "promotion.verdict",
    metric_type: MetricType::Counter,
    description: "Promotion verdicts reached. Tagged with reason and promoted.",
};

pub const PROMOTION_RATE_LIMITED: MetricDef = MetricDef {
    name: "promotion.rate_limited",
    metric_type: MetricType::Counter,
    description: "Promotions suppressed by the per-reason ceiling. Tagged with reason.",
};

pub const PROMOTION_FAILED: MetricDef = MetricDef {
    name: "promotion.failed",
    metric_type: MetricType::Counter,
    description: "Evaluations that hit an internal error and degraded to not_promoted",
};

pub const PROMOTION_CAS_LOST: MetricDef = MetricDef {
    name: "promotion.cas_lost",
    metric_type: MetricType::Counter,
    description: "Promotions discarded because a concurrent evaluation promoted first",
};

pub const SAMPLING_SCALE_FALLBACK: MetricDef = MetricDef {
    name: "promotion.sampling_scale.fallback",
    metric_type: MetricType::Counter,
    description: "Sampling scale lookups that failed and fell back to 1.0",
};

pub const FUNNEL_PROFILE_CACHE_HIT: MetricDef = MetricDef {
    name: "funnel_profile.cache.hit",
    metric_type: MetricType::Counter,
    description: "Funnel profile lookups answered from the cache",
};

pub const FUNNEL_PROFILE_CACHE_MISS: MetricDef = MetricDef {
    name: "funnel_profile.cache.miss",
    metric_type: MetricType::Counter,
    description: "Funnel profile lookups that rebuilt the profile",
};

pub const FUNNEL_PROFILE_SAMPLE_SIZE: MetricDef = MetricDef {
    name: "funnel_profile.sample_size",
    metric_type: MetricType::Histogram,
    description: "Number of sessions sampled when building a funnel profile",
};

pub const FUNNEL_JOB_PERSISTED: MetricDef = MetricDef {
    name: "funnel_job.persisted",
    metric_type: MetricType::Counter,
    description: "Project funnel records written by the periodic job",
};

pub const FUNNEL_JOB_SKIPPED: MetricDef = MetricDef {
    name: "funnel_job.skipped",
    metric_type: MetricType::Counter,
    description: "Projects the periodic job did not persist. Tagged with reason.",
};

pub const FUNNEL_JOB_FAILED: MetricDef = MetricDef {
    name: "funnel_job.failed",
    metric_type: MetricType::Counter,
    description: "Projects the periodic job could not analyze",
};

pub const ALL_METRICS: &[MetricDef] = &[
    PROMOTION_VERDICT,
    PROMOTION_RATE_LIMITED,
    PROMOTION_FAILED,
    PROMOTION_CAS_LOST,
    SAMPLING_SCALE_FALLBACK,
    FUNNEL_PROFILE_CACHE_HIT,
    FUNNEL_PROFILE_CACHE_MISS,
    FUNNEL_PROFILE_SAMPLE_SIZE,
    FUNNEL_JOB_PERSISTED,
    FUNNEL_JOB_SKIPPED,
    FUNNEL_JOB_FAILED,
];

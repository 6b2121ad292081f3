//! Metrics definitions for counter store access and rate limiting.

use shared::metrics_defs::{MetricDef, MetricType};

pub const RATE_LIMIT_DENIED: MetricDef = MetricDef {
    name: "rate_limit.denied",
    metric_type: MetricType::Counter,
    description: "Rate limit checks that exceeded their window limit. Tagged with window.",
};

pub const RATE_LIMIT_FAIL_OPEN: MetricDef = MetricDef {
    name: "rate_limit.fail_open",
    metric_type: MetricType::Counter,
    description: "Advisory rate limit checks allowed because the counter store failed",
};

pub const COUNTER_STORE_TIMEOUT: MetricDef = MetricDef {
    name: "counter_store.timeout",
    metric_type: MetricType::Counter,
    description: "Counter store calls abandoned after the operation timeout",
};

pub const ALL_METRICS: &[MetricDef] =
    &[RATE_LIMIT_DENIED, RATE_LIMIT_FAIL_OPEN, COUNTER_STORE_TIMEOUT];

//! Metrics definitions for byte budgets and session quotas.

use shared::metrics_defs::{MetricDef, MetricType};

pub const BYTE_BUDGET_ACCEPTED_BYTES: MetricDef = MetricDef {
    name: "byte_budget.accepted_bytes",
    metric_type: MetricType::Histogram,
    description: "Size of upload requests that passed every byte budget. Tagged with endpoint.",
};

pub const BYTE_BUDGET_REJECTED: MetricDef = MetricDef {
    name: "byte_budget.rejected",
    metric_type: MetricType::Counter,
    description: "Upload requests rejected by a byte budget. Tagged with reason.",
};

pub const BYTE_BUDGET_UNAVAILABLE: MetricDef = MetricDef {
    name: "byte_budget.unavailable",
    metric_type: MetricType::Counter,
    description: "Upload requests failed closed because the counter store was unavailable",
};

pub const DEVICE_FANOUT_SUSPECT: MetricDef = MetricDef {
    name: "byte_budget.device_fanout_suspect",
    metric_type: MetricType::Counter,
    description: "Uploads from an IP that has exceeded the distinct device threshold today",
};

pub const SESSION_USAGE_CACHE_HIT: MetricDef = MetricDef {
    name: "session_usage.cache.hit",
    metric_type: MetricType::Counter,
    description: "Session usage lookups answered from the cache",
};

pub const SESSION_USAGE_CACHE_MISS: MetricDef = MetricDef {
    name: "session_usage.cache.miss",
    metric_type: MetricType::Counter,
    description: "Session usage lookups that missed the cache",
};

pub const SESSION_USAGE_COMPUTE_DURATION: MetricDef = MetricDef {
    name: "session_usage.compute.duration",
    metric_type: MetricType::Histogram,
    description: "Time to aggregate a team's session usage in seconds",
};

pub const SESSION_USAGE_LOCK_WAIT_TIMEOUT: MetricDef = MetricDef {
    name: "session_usage.lock.wait_timeout",
    metric_type: MetricType::Counter,
    description: "Callers that gave up waiting on another caller's usage computation",
};

pub const SESSION_LIMIT_REACHED: MetricDef = MetricDef {
    name: "session_limit.reached",
    metric_type: MetricType::Counter,
    description: "Session limit checks rejected because the team is at its limit",
};

pub const USAGE_ALERT_SENT: MetricDef = MetricDef {
    name: "usage_alert.sent",
    metric_type: MetricType::Counter,
    description: "Usage threshold alerts handed to the notifier. Tagged with threshold.",
};

pub const ALL_METRICS: &[MetricDef] = &[
    BYTE_BUDGET_ACCEPTED_BYTES,
    BYTE_BUDGET_REJECTED,
    BYTE_BUDGET_UNAVAILABLE,
    DEVICE_FANOUT_SUSPECT,
    SESSION_USAGE_CACHE_HIT,
    SESSION_USAGE_CACHE_MISS,
    SESSION_USAGE_COMPUTE_DURATION,
    SESSION_USAGE_LOCK_WAIT_TIMEOUT,
    SESSION_LIMIT_REACHED,
    USAGE_ALERT_SENT,
];

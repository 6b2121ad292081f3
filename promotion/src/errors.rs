use crate::store::SessionStoreError;
use counters::StoreError;

/// Failures inside promotion. None of these reach the ingest path: the engine degrades
/// them to a `not_promoted` verdict.
#[derive(thiserror::Error, Debug)]
pub enum PromotionError {
    #[error(transparent)]
    SessionStore(#[from] SessionStoreError),

    #[error("promotion rate limit unavailable: {0}")]
    RateLimit(#[from] StoreError),

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("no metrics for session {0}")]
    MetricsNotFound(String),
}

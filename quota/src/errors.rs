use crate::usage::UsageStoreError;
use counters::StoreError;

/// How a caller should react to a [`QuotaError`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed or oversized request. Retrying without changing it will fail again.
    Client,
    /// A budget or quota is exhausted until `retry_after_secs` has passed.
    QuotaExceeded,
    /// A backing store could not answer. Retryable with backoff.
    Unavailable,
}

#[derive(thiserror::Error, Debug)]
pub enum QuotaError {
    #[error("invalid payload size: {0}")]
    InvalidSize(String),

    #[error("payload of {bytes} bytes exceeds the {max_bytes} byte object limit")]
    PayloadTooLarge { bytes: u64, max_bytes: u64 },

    #[error("{scope} byte budget exceeded, retry after {retry_after_secs}s")]
    BudgetExceeded { scope: String, retry_after_secs: u64 },

    #[error(
        "session limit reached ({sessions_used}/{session_limit}), retry after {retry_after_secs}s"
    )]
    SessionLimitReached {
        sessions_used: u64,
        session_limit: u64,
        retry_after_secs: u64,
    },

    #[error("budget service unavailable: {0}")]
    BudgetUnavailable(#[source] StoreError),

    #[error("quota service unavailable: {0}")]
    QuotaUnavailable(#[from] UsageStoreError),

    #[error("team not found: {0}")]
    TeamNotFound(String),
}

impl QuotaError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            QuotaError::InvalidSize(_)
            | QuotaError::PayloadTooLarge { .. }
            | QuotaError::TeamNotFound(_) => ErrorKind::Client,
            QuotaError::BudgetExceeded { .. } | QuotaError::SessionLimitReached { .. } => {
                ErrorKind::QuotaExceeded
            }
            QuotaError::BudgetUnavailable(_) | QuotaError::QuotaUnavailable(_) => {
                ErrorKind::Unavailable
            }
        }
    }

    /// Seconds the caller should wait before retrying, for quota rejections.
    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            QuotaError::BudgetExceeded {
                retry_after_secs, ..
            }
            | QuotaError::SessionLimitReached {
                retry_after_secs, ..
            } => Some(*retry_after_secs),
            _ => None,
        }
    }

    pub fn is_retryable(&self) -> bool {
        !matches!(self.kind(), ErrorKind::Client)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_taxonomy() {
        let too_large = QuotaError::PayloadTooLarge {
            bytes: 10,
            max_bytes: 5,
        };
        assert_eq!(too_large.kind(), ErrorKind::Client);
        assert_eq!(too_large.retry_after_secs(), None);
        assert!(!too_large.is_retryable());

        let exceeded = QuotaError::BudgetExceeded {
            scope: "project:minute".into(),
            retry_after_secs: 42,
        };
        assert_eq!(exceeded.kind(), ErrorKind::QuotaExceeded);
        assert_eq!(exceeded.retry_after_secs(), Some(42));
        assert_eq!(
            exceeded.to_string(),
            "project:minute byte budget exceeded, retry after 42s"
        );

        let unavailable = QuotaError::BudgetUnavailable(StoreError::Unavailable("down".into()));
        assert_eq!(unavailable.kind(), ErrorKind::Unavailable);
        assert!(unavailable.is_retryable());
        assert_eq!(unavailable.retry_after_secs(), None);
    }
}

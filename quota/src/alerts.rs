//! Usage threshold alerts.

use crate::errors::QuotaError;
use crate::metrics_defs::USAGE_ALERT_SENT;
use crate::usage::UsageStoreError;
use async_trait::async_trait;
use shared::counter;

/// Percent-of-limit thresholds that trigger an alert, lowest first.
pub const ALERT_THRESHOLDS: [u8; 2] = [80, 100];

#[derive(Clone, Debug, PartialEq)]
pub struct UsageAlert {
    pub team_id: String,
    pub period_key: String,
    pub threshold: u8,
    pub sessions_used: u64,
    pub session_limit: u64,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
#[error("notification delivery failed: {0}")]
pub struct NotifyError(pub String);

#[derive(thiserror::Error, Debug)]
pub enum AlertError {
    #[error(transparent)]
    Quota(#[from] QuotaError),

    #[error(transparent)]
    Usage(#[from] UsageStoreError),

    #[error(transparent)]
    Notify(#[from] NotifyError),
}

/// Delivers usage alerts to a team, typically by email.
#[async_trait]
pub trait UsageNotifier: Send + Sync {
    async fn send_usage_alert(&self, alert: &UsageAlert) -> Result<(), NotifyError>;
}

/// Writes alerts to the log. Used when no delivery backend is configured.
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl UsageNotifier for LogNotifier {
    async fn send_usage_alert(&self, alert: &UsageAlert) -> Result<(), NotifyError> {
        tracing::info!(
            team_id = %alert.team_id,
            period = %alert.period_key,
            threshold = alert.threshold,
            sessions_used = alert.sessions_used,
            session_limit = alert.session_limit,
            "session usage alert"
        );
        Ok(())
    }
}

/// Thresholds crossed by `sessions_used` out of `session_limit`.
pub fn crossed_thresholds(sessions_used: u64, session_limit: u64) -> Vec<u8> {
    ALERT_THRESHOLDS
        .iter()
        .copied()
        .filter(|threshold| {
            // used / limit >= threshold / 100, without floating point.
            sessions_used as u128 * 100 >= session_limit as u128 * *threshold as u128
        })
        .collect()
}

pub(crate) fn record_sent(alert: &UsageAlert) {
    counter!(USAGE_ALERT_SENT, "threshold" => alert.threshold.to_string()).increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_thresholds() {
        assert!(crossed_thresholds(79, 100).is_empty());
        assert_eq!(crossed_thresholds(80, 100), vec![80]);
        assert_eq!(crossed_thresholds(4_990, 5_000), vec![80]);
        assert_eq!(crossed_thresholds(5_000, 5_000), vec![80, 100]);
        assert_eq!(crossed_thresholds(0, 0), vec![80, 100]);
    }
}

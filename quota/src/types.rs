use serde::{Deserialize, Serialize};

/// Share of the limit at which a team counts as near its limit.
pub const NEAR_LIMIT_PERCENT: f64 = 80.0;

/// A team's session usage for its current billing period.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionLimitCheck {
    pub allowed: bool,
    pub sessions_used: u64,
    pub session_limit: u64,
    pub sessions_remaining: u64,
    pub percent_used: f64,
    pub is_at_limit: bool,
    pub is_near_limit: bool,
}

impl SessionLimitCheck {
    pub fn new(sessions_used: u64, session_limit: u64) -> Self {
        let percent_used = if session_limit == 0 {
            100.0
        } else {
            sessions_used as f64 / session_limit as f64 * 100.0
        };
        let is_at_limit = sessions_used >= session_limit;

        SessionLimitCheck {
            allowed: !is_at_limit,
            sessions_used,
            session_limit,
            sessions_remaining: session_limit.saturating_sub(sessions_used),
            percent_used,
            is_at_limit,
            is_near_limit: percent_used >= NEAR_LIMIT_PERCENT,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derived_fields() {
        let check = SessionLimitCheck::new(4_990, 5_000);
        assert!(check.allowed);
        assert_eq!(check.sessions_remaining, 10);
        assert!(check.is_near_limit);
        assert!(!check.is_at_limit);

        let check = SessionLimitCheck::new(5_200, 5_000);
        assert!(!check.allowed);
        assert!(check.is_at_limit);
        assert_eq!(check.sessions_remaining, 0);

        let check = SessionLimitCheck::new(100, 1_000);
        assert!(!check.is_near_limit);
        assert_eq!(check.percent_used, 10.0);

        assert!(SessionLimitCheck::new(0, 0).is_at_limit);
    }

    #[test]
    fn test_serializes_camel_case() {
        let json = serde_json::to_value(SessionLimitCheck::new(1, 4)).unwrap();
        assert_eq!(json["sessionsUsed"], 1);
        assert_eq!(json["sessionsRemaining"], 3);
        assert_eq!(json["percentUsed"], 25.0);
        assert_eq!(json["isNearLimit"], false);
    }
}

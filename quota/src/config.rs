use serde::Deserialize;
use std::time::Duration;

const MIB: u64 = 1024 * 1024;
const GIB: u64 = 1024 * MIB;

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum ValidationError {
    #[error("{0} cannot be 0")]
    Zero(&'static str),

    #[error("max_object_bytes ({max_object_bytes}) exceeds the {scope} budget ({budget})")]
    ObjectLargerThanBudget {
        max_object_bytes: u64,
        scope: &'static str,
        budget: u64,
    },

    #[error("lock_wait_timeout_ms must be shorter than lock_ttl_ms")]
    LockWaitOutlivesLock,
}

/// Byte ceilings for upload-presign requests.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct ByteBudgetConfig {
    /// Largest single object accepted, independent of any window.
    pub max_object_bytes: u64,
    pub project_minute_bytes: u64,
    pub project_day_bytes: u64,
    pub device_minute_bytes: u64,
    pub device_day_bytes: u64,
    pub ip_minute_bytes: u64,
    pub ip_day_bytes: u64,
    /// Distinct devices seen from one IP in a day before the fan-out warning fires.
    pub devices_per_ip_warn_threshold: u64,
}

impl Default for ByteBudgetConfig {
    fn default() -> Self {
        ByteBudgetConfig {
            max_object_bytes: 50 * MIB,
            project_minute_bytes: 500 * MIB,
            project_day_bytes: 50 * GIB,
            device_minute_bytes: 50 * MIB,
            device_day_bytes: 2 * GIB,
            ip_minute_bytes: 100 * MIB,
            ip_day_bytes: 5 * GIB,
            devices_per_ip_warn_threshold: 50,
        }
    }
}

impl ByteBudgetConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.max_object_bytes == 0 {
            return Err(ValidationError::Zero("max_object_bytes"));
        }

        // Every window must be able to admit at least one maximal object.
        let budgets = [
            ("project_minute_bytes", self.project_minute_bytes),
            ("project_day_bytes", self.project_day_bytes),
            ("device_minute_bytes", self.device_minute_bytes),
            ("device_day_bytes", self.device_day_bytes),
            ("ip_minute_bytes", self.ip_minute_bytes),
            ("ip_day_bytes", self.ip_day_bytes),
        ];
        for (scope, budget) in budgets {
            if budget < self.max_object_bytes {
                return Err(ValidationError::ObjectLargerThanBudget {
                    max_object_bytes: self.max_object_bytes,
                    scope,
                    budget,
                });
            }
        }
        Ok(())
    }
}

/// Session quota cache and single-flight settings.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionQuotaConfig {
    /// Safety expiry for cached usage. Entries are normally invalidated explicitly.
    pub cache_ttl_secs: u64,
    /// Expiry of the population lock, in case its holder dies.
    pub lock_ttl_ms: u64,
    /// How long a caller waits for another caller's computation before computing itself.
    pub lock_wait_timeout_ms: u64,
    pub lock_poll_interval_ms: u64,
    /// Upper bound on any single relational query.
    pub query_timeout_ms: u64,
}

impl Default for SessionQuotaConfig {
    fn default() -> Self {
        SessionQuotaConfig {
            cache_ttl_secs: 300,
            lock_ttl_ms: 5_000,
            lock_wait_timeout_ms: 2_000,
            lock_poll_interval_ms: 25,
            query_timeout_ms: 2_000,
        }
    }
}

impl SessionQuotaConfig {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn lock_ttl(&self) -> Duration {
        Duration::from_millis(self.lock_ttl_ms)
    }

    pub fn lock_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_wait_timeout_ms)
    }

    pub fn lock_poll_interval(&self) -> Duration {
        Duration::from_millis(self.lock_poll_interval_ms)
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.cache_ttl_secs == 0 {
            return Err(ValidationError::Zero("cache_ttl_secs"));
        }
        if self.lock_poll_interval_ms == 0 {
            return Err(ValidationError::Zero("lock_poll_interval_ms"));
        }
        if self.query_timeout_ms == 0 {
            return Err(ValidationError::Zero("query_timeout_ms"));
        }
        if self.lock_wait_timeout_ms >= self.lock_ttl_ms {
            return Err(ValidationError::LockWaitOutlivesLock);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_partial_config() {
        let yaml = r#"
max_object_bytes: 1048576
ip_day_bytes: 10485760
"#;
        let config: ByteBudgetConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.max_object_bytes, MIB);
        assert_eq!(config.ip_day_bytes, 10 * MIB);
        assert_eq!(config.project_day_bytes, 50 * GIB);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_errors() {
        let mut config = ByteBudgetConfig::default();
        config.max_object_bytes = 0;
        assert_eq!(
            config.validate(),
            Err(ValidationError::Zero("max_object_bytes"))
        );

        let mut config = ByteBudgetConfig::default();
        config.device_minute_bytes = config.max_object_bytes - 1;
        assert!(matches!(
            config.validate(),
            Err(ValidationError::ObjectLargerThanBudget {
                scope: "device_minute_bytes",
                ..
            })
        ));

        let mut config = SessionQuotaConfig::default();
        config.lock_wait_timeout_ms = config.lock_ttl_ms;
        assert_eq!(config.validate(), Err(ValidationError::LockWaitOutlivesLock));

        assert!(SessionQuotaConfig::default().validate().is_ok());
    }
}

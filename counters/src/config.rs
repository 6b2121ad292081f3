use serde::Deserialize;
use std::time::Duration;

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum ValidationError {
    #[error("counter store operation timeout cannot be 0")]
    ZeroTimeout,
}

/// Counter store client settings.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct CounterStoreConfig {
    /// Upper bound on any single counter store round trip.
    pub operation_timeout_ms: u64,
}

impl Default for CounterStoreConfig {
    fn default() -> Self {
        CounterStoreConfig {
            operation_timeout_ms: 250,
        }
    }
}

impl CounterStoreConfig {
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.operation_timeout_ms == 0 {
            return Err(ValidationError::ZeroTimeout);
        }
        Ok(())
    }
}

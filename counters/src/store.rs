use crate::metrics_defs::COUNTER_STORE_TIMEOUT;
use async_trait::async_trait;
use shared::counter;
use std::future::Future;
use std::time::Duration;

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    #[error("counter store unavailable: {0}")]
    Unavailable(String),

    #[error("counter store call timed out after {0:?}")]
    Timeout(Duration),

    #[error("key {0} holds a value of the wrong type")]
    WrongType(String),
}

/// One entry of an atomic increment batch.
#[derive(Clone, Debug, PartialEq)]
pub struct Increment {
    pub key: String,
    pub by: i64,
    /// Expiry applied (and refreshed) on every increment.
    pub ttl: Duration,
}

impl Increment {
    pub fn new(key: impl Into<String>, by: i64, ttl: Duration) -> Self {
        Increment {
            key: key.into(),
            by,
            ttl,
        }
    }
}

/// Low-latency shared key-value store.
///
/// Keys are independent: there are no cross-key transactions except [`incr_batch`], which
/// applies all of its increments or none of them.
///
/// [`incr_batch`]: CounterStore::incr_batch
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Adds `by` to the integer at `key` (missing keys start at 0), refreshes its expiry
    /// and returns the new value.
    async fn incr_by(&self, key: &str, by: i64, ttl: Duration) -> Result<i64, StoreError>;

    /// Applies every increment atomically and returns the new values in input order.
    async fn incr_batch(&self, ops: &[Increment]) -> Result<Vec<i64>, StoreError>;

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError>;

    /// Sets `key` only if it does not exist. Returns whether the value was written.
    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StoreError>;

    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Deletes `key` only if it currently holds `value`. Returns whether it was deleted.
    async fn delete_if_eq(&self, key: &str, value: &str) -> Result<bool, StoreError>;

    /// Adds `member` to the set at `key`. Returns whether the member was new.
    async fn set_add(&self, key: &str, member: &str, ttl: Duration) -> Result<bool, StoreError>;

    async fn set_members(&self, key: &str) -> Result<Vec<String>, StoreError>;

    async fn set_card(&self, key: &str) -> Result<u64, StoreError>;
}

/// Runs a store call with an upper bound on its duration.
pub async fn bounded<T, F>(timeout: Duration, fut: F) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => {
            counter!(COUNTER_STORE_TIMEOUT).increment(1);
            Err(StoreError::Timeout(timeout))
        }
    }
}

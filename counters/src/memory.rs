//! In-process counter store.
//!
//! Used by tests and by the standalone binary. Behaves like the shared store for a single
//! process: values expire, batches are atomic, and outages or latency can be injected.

use crate::store::{CounterStore, Increment, StoreError};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
enum Value {
    Int(i64),
    Text(String),
    Set(BTreeSet<String>),
}

#[derive(Debug)]
struct Entry {
    value: Value,
    expires_at: Instant,
}

#[derive(Default)]
pub struct MemoryCounterStore {
    entries: Mutex<HashMap<String, Entry>>,
    unavailable: AtomicBool,
    latency: Mutex<Option<Duration>>,
    calls: AtomicU64,
}

impl MemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent call fail with [`StoreError::Unavailable`].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Delays every subsequent call by `latency`.
    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.lock() = latency;
    }

    /// Number of calls made through the [`CounterStore`] trait.
    pub fn call_count(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Current integer value at `key`, bypassing fault injection.
    pub fn counter_value(&self, key: &str) -> Option<i64> {
        let mut entries = self.entries.lock();
        match live(&mut entries, key).map(|e| &e.value) {
            Some(Value::Int(v)) => Some(*v),
            _ => None,
        }
    }

    /// Live keys starting with `prefix`, sorted.
    pub fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        let now = Instant::now();
        let entries = self.entries.lock();
        let mut keys: Vec<String> = entries
            .iter()
            .filter(|(k, e)| k.starts_with(prefix) && e.expires_at > now)
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort();
        keys
    }

    async fn before_call(&self) -> Result<(), StoreError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let latency = *self.latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("injected outage".into()));
        }
        Ok(())
    }
}

/// Returns the entry at `key`, dropping it first if it has expired.
fn live<'a>(entries: &'a mut HashMap<String, Entry>, key: &str) -> Option<&'a mut Entry> {
    if entries
        .get(key)
        .is_some_and(|e| e.expires_at <= Instant::now())
    {
        entries.remove(key);
    }
    entries.get_mut(key)
}

fn current_int(entries: &mut HashMap<String, Entry>, key: &str) -> Result<i64, StoreError> {
    match live(entries, key).map(|e| &e.value) {
        None => Ok(0),
        Some(Value::Int(v)) => Ok(*v),
        Some(_) => Err(StoreError::WrongType(key.to_string())),
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn incr_by(&self, key: &str, by: i64, ttl: Duration) -> Result<i64, StoreError> {
        let values = self.incr_batch(&[Increment::new(key, by, ttl)]).await?;
        Ok(values[0])
    }

    async fn incr_batch(&self, ops: &[Increment]) -> Result<Vec<i64>, StoreError> {
        self.before_call().await?;
        let mut entries = self.entries.lock();

        // Validate every key before touching any of them so a batch is all or nothing.
        for op in ops {
            current_int(&mut entries, &op.key)?;
        }

        let now = Instant::now();
        let mut results = Vec::with_capacity(ops.len());
        for op in ops {
            let entry = entries.entry(op.key.clone()).or_insert(Entry {
                value: Value::Int(0),
                expires_at: now + op.ttl,
            });
            let Value::Int(current) = entry.value else {
                return Err(StoreError::WrongType(op.key.clone()));
            };
            let next = current + op.by;
            entry.value = Value::Int(next);
            entry.expires_at = now + op.ttl;
            results.push(next);
        }

        Ok(results)
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.before_call().await?;
        let mut entries = self.entries.lock();
        match live(&mut entries, key).map(|e| &e.value) {
            None => Ok(None),
            Some(Value::Int(v)) => Ok(Some(v.to_string())),
            Some(Value::Text(s)) => Ok(Some(s.clone())),
            Some(Value::Set(_)) => Err(StoreError::WrongType(key.to_string())),
        }
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        self.before_call().await?;
        self.entries.lock().insert(
            key.to_string(),
            Entry {
                value: Value::Text(value.to_string()),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StoreError> {
        self.before_call().await?;
        let mut entries = self.entries.lock();
        if live(&mut entries, key).is_some() {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            Entry {
                value: Value::Text(value.to_string()),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(true)
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.before_call().await?;
        self.entries.lock().remove(key);
        Ok(())
    }

    async fn delete_if_eq(&self, key: &str, value: &str) -> Result<bool, StoreError> {
        self.before_call().await?;
        let mut entries = self.entries.lock();
        let matches = matches!(
            live(&mut entries, key).map(|e| &e.value),
            Some(Value::Text(current)) if current == value
        );
        if matches {
            entries.remove(key);
        }
        Ok(matches)
    }

    async fn set_add(&self, key: &str, member: &str, ttl: Duration) -> Result<bool, StoreError> {
        self.before_call().await?;
        let mut entries = self.entries.lock();
        if live(&mut entries, key).is_none() {
            entries.insert(
                key.to_string(),
                Entry {
                    value: Value::Set(BTreeSet::new()),
                    expires_at: Instant::now() + ttl,
                },
            );
        }
        let entry = entries
            .get_mut(key)
            .ok_or_else(|| StoreError::Unavailable("entry vanished".into()))?;
        match &mut entry.value {
            Value::Set(members) => {
                entry.expires_at = Instant::now() + ttl;
                Ok(members.insert(member.to_string()))
            }
            _ => Err(StoreError::WrongType(key.to_string())),
        }
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>, StoreError> {
        self.before_call().await?;
        let mut entries = self.entries.lock();
        match live(&mut entries, key).map(|e| &e.value) {
            None => Ok(Vec::new()),
            Some(Value::Set(members)) => Ok(members.iter().cloned().collect()),
            Some(_) => Err(StoreError::WrongType(key.to_string())),
        }
    }

    async fn set_card(&self, key: &str) -> Result<u64, StoreError> {
        self.before_call().await?;
        let mut entries = self.entries.lock();
        match live(&mut entries, key).map(|e| &e.value) {
            None => Ok(0),
            Some(Value::Set(members)) => Ok(members.len() as u64),
            Some(_) => Err(StoreError::WrongType(key.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(60);

    #[tokio::test]
    async fn test_incr_batch_is_all_or_nothing() {
        let store = MemoryCounterStore::new();
        store.set_ex("text", "hello", TTL).await.unwrap();

        let result = store
            .incr_batch(&[Increment::new("a", 5, TTL), Increment::new("text", 1, TTL)])
            .await;
        assert_eq!(result, Err(StoreError::WrongType("text".into())));
        assert_eq!(store.counter_value("a"), None);

        let values = store
            .incr_batch(&[Increment::new("a", 5, TTL), Increment::new("b", 7, TTL)])
            .await
            .unwrap();
        assert_eq!(values, vec![5, 7]);
        assert_eq!(store.incr_by("a", 1, TTL).await.unwrap(), 6);
    }

    #[tokio::test]
    async fn test_values_expire() {
        let store = MemoryCounterStore::new();
        store
            .incr_by("short", 1, Duration::from_millis(20))
            .await
            .unwrap();
        assert_eq!(store.get("short").await.unwrap(), Some("1".into()));
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(store.get("short").await.unwrap(), None);
        assert_eq!(
            store
                .incr_by("short", 1, Duration::from_millis(20))
                .await
                .unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn test_lock_primitives() {
        let store = MemoryCounterStore::new();
        assert!(store.set_nx_ex("lock", "owner-a", TTL).await.unwrap());
        assert!(!store.set_nx_ex("lock", "owner-b", TTL).await.unwrap());
        assert!(!store.delete_if_eq("lock", "owner-b").await.unwrap());
        assert!(store.delete_if_eq("lock", "owner-a").await.unwrap());
        assert!(store.set_nx_ex("lock", "owner-b", TTL).await.unwrap());
    }

    #[tokio::test]
    async fn test_sets() {
        let store = MemoryCounterStore::new();
        assert!(store.set_add("s", "x", TTL).await.unwrap());
        assert!(!store.set_add("s", "x", TTL).await.unwrap());
        assert!(store.set_add("s", "y", TTL).await.unwrap());
        assert_eq!(store.set_card("s").await.unwrap(), 2);
        assert_eq!(store.set_members("s").await.unwrap(), vec!["x", "y"]);
        assert_eq!(store.set_card("missing").await.unwrap(), 0);
        assert!(matches!(
            store.incr_by("s", 1, TTL).await,
            Err(StoreError::WrongType(_))
        ));
    }

    #[tokio::test]
    async fn test_injected_outage() {
        let store = MemoryCounterStore::new();
        store.set_unavailable(true);
        assert!(matches!(
            store.incr_by("a", 1, TTL).await,
            Err(StoreError::Unavailable(_))
        ));
        store.set_unavailable(false);
        assert_eq!(store.incr_by("a", 1, TTL).await.unwrap(), 1);
        assert_eq!(store.call_count(), 2);
    }
}

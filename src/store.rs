// Single shared key-value store backing both the response cache and the
// rate-limit counter. Semantics follow Redis so a networked backend can be
// swapped in behind the same trait.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Error talking to the key-value store.
#[derive(Debug, Clone)]
pub struct StoreError(pub String);

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "store error: {}", self.0)
    }
}

impl std::error::Error for StoreError {}

/// Shared key-value store with per-entry expiration.
///
/// `incr` on a missing or expired key starts a fresh counter at 1 and,
/// like Redis, does not touch the TTL of an existing one. `ttl` returns
/// -2 for a missing key and -1 for a key with no expiry.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), StoreError>;

    async fn incr(&self, key: &str) -> Result<i64, StoreError>;

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), StoreError>;

    async fn ttl(&self, key: &str) -> Result<i64, StoreError>;
}

struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| at <= Instant::now())
    }
}

/// In-process `KvStore` used for tests and single-instance deployments.
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(entry) if entry.is_expired() => {
                entries.remove(key);
                Ok(None)
            }
            Some(entry) => Ok(Some(entry.value.clone())),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), StoreError> {
        let mut entries = self.entries.lock();
        entries.insert(
            key.to_string(),
            Entry {
                value,
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn incr(&self, key: &str) -> Result<i64, StoreError> {
        let mut entries = self.entries.lock();

        let next = match entries.get(key) {
            Some(entry) if !entry.is_expired() => {
                let current: i64 = entry
                    .value
                    .parse()
                    .map_err(|_| StoreError(format!("value at '{}' is not an integer", key)))?;
                current + 1
            }
            _ => 1,
        };

        // Keep the existing expiry; a fresh counter has none until expire() is called.
        let expires_at = entries
            .get(key)
            .filter(|entry| !entry.is_expired())
            .and_then(|entry| entry.expires_at);

        entries.insert(
            key.to_string(),
            Entry {
                value: next.to_string(),
                expires_at,
            },
        );

        Ok(next)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), StoreError> {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get_mut(key) {
            if !entry.is_expired() {
                entry.expires_at = Some(Instant::now() + ttl);
            }
        }
        Ok(())
    }

    async fn ttl(&self, key: &str) -> Result<i64, StoreError> {
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(entry) if entry.is_expired() => {
                entries.remove(key);
                Ok(-2)
            }
            Some(entry) => match entry.expires_at {
                Some(at) => {
                    let remaining = at.saturating_duration_since(Instant::now());
                    Ok(remaining.as_secs_f64().ceil() as i64)
                }
                None => Ok(-1),
            },
            None => Ok(-2),
        }
    }
}

use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors produced by persistent cache implementations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CacheError {
    /// Requested key does not exist.
    #[error("entry not found: {namespace}/{key}")]
    NotFound { namespace: Namespace, key: String },
    /// Writing would exceed the configured storage quota.
    #[error("storage quota exceeded: {requested} bytes requested, {available} available")]
    QuotaExceeded { requested: u64, available: u64 },
    /// Underlying storage failure.
    #[error("storage failure: {reason}")]
    Storage { reason: String },
}

/// Independently addressable object stores inside one cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Namespace {
    Patients,
    Doctors,
    SyncQueue,
    Settings,
    Backups,
}

impl Namespace {
    pub const ALL: [Namespace; 5] = [
        Namespace::Patients,
        Namespace::Doctors,
        Namespace::SyncQueue,
        Namespace::Settings,
        Namespace::Backups,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Namespace::Patients => "patients",
            Namespace::Doctors => "doctors",
            Namespace::SyncQueue => "sync_queue",
            Namespace::Settings => "settings",
            Namespace::Backups => "backups",
        }
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Used/total/available byte estimates for the backing storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageEstimate {
    pub used: u64,
    pub quota: u64,
    pub available: u64,
}

impl StorageEstimate {
    pub fn new(used: u64, quota: u64) -> Self {
        Self {
            used,
            quota,
            available: quota.saturating_sub(used),
        }
    }

    /// Fraction of the quota in use, 0.0 when no quota is known.
    pub fn usage_ratio(&self) -> f64 {
        if self.quota == 0 {
            return 0.0;
        }
        self.used as f64 / self.quota as f64
    }
}

/// Best-effort persistent object store used by the secure store and the sync queue.
///
/// Implementations make no promise that entries survive eviction by the host;
/// callers treat it as a durable cache, not a replicated database.
#[async_trait]
pub trait PersistentCache: Send + Sync {
    /// Persist a value under a key, overwriting any existing entry.
    async fn put(&self, namespace: Namespace, key: &str, value: &[u8]) -> Result<(), CacheError>;

    /// Retrieve the value for a key.
    async fn get(&self, namespace: Namespace, key: &str) -> Result<Vec<u8>, CacheError>;

    /// Remove a key and its value (idempotent).
    async fn delete(&self, namespace: Namespace, key: &str) -> Result<(), CacheError>;

    /// All keys in a namespace, sorted ascending.
    async fn keys(&self, namespace: Namespace) -> Result<Vec<String>, CacheError>;

    /// Remove every entry in a namespace.
    async fn clear(&self, namespace: Namespace) -> Result<(), CacheError>;

    /// Current usage against the quota.
    async fn estimate(&self) -> Result<StorageEstimate, CacheError>;

    /// Ask the host to keep this storage out of eviction. Returns whether it was granted.
    async fn request_persistence(&self) -> Result<bool, CacheError>;
}

/// Convenience: read a key and treat a missing entry as `None`.
pub async fn get_optional<C: PersistentCache + ?Sized>(
    cache: &C,
    namespace: Namespace,
    key: &str,
) -> Result<Option<Vec<u8>>, CacheError> {
    match cache.get(namespace, key).await {
        Ok(bytes) => Ok(Some(bytes)),
        Err(CacheError::NotFound { .. }) => Ok(None),
        Err(err) => Err(err),
    }
}

/// Default quota for caches that are not told otherwise (50 MiB).
pub const DEFAULT_QUOTA_BYTES: u64 = 50 * 1024 * 1024;

/// In-memory cache for tests and ephemeral sessions. Nothing survives the process.
#[derive(Debug, Clone)]
pub struct InMemoryCache {
    inner: Arc<Mutex<HashMap<Namespace, BTreeMap<String, Vec<u8>>>>>,
    quota: u64,
}

impl Default for InMemoryCache {
    fn default() -> Self {
        Self::with_quota(DEFAULT_QUOTA_BYTES)
    }
}

impl InMemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_quota(quota: u64) -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
            quota,
        }
    }

    fn lock(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, HashMap<Namespace, BTreeMap<String, Vec<u8>>>>, CacheError>
    {
        self.inner.lock().map_err(|err| CacheError::Storage {
            reason: format!("lock poisoned: {err}"),
        })
    }

    fn used(map: &HashMap<Namespace, BTreeMap<String, Vec<u8>>>) -> u64 {
        map.values()
            .flat_map(|entries| entries.iter())
            .map(|(key, value)| (key.len() + value.len()) as u64)
            .sum()
    }
}

#[async_trait]
impl PersistentCache for InMemoryCache {
    async fn put(&self, namespace: Namespace, key: &str, value: &[u8]) -> Result<(), CacheError> {
        let mut map = self.lock()?;
        let replaced = map
            .get(&namespace)
            .and_then(|entries| entries.get(key))
            .map(|old| (key.len() + old.len()) as u64)
            .unwrap_or(0);
        let used = Self::used(&map) - replaced;
        let requested = (key.len() + value.len()) as u64;
        let available = self.quota.saturating_sub(used);
        if requested > available {
            return Err(CacheError::QuotaExceeded {
                requested,
                available,
            });
        }

        map.entry(namespace)
            .or_default()
            .insert(key.to_string(), value.to_vec());
        Ok(())
    }

    async fn get(&self, namespace: Namespace, key: &str) -> Result<Vec<u8>, CacheError> {
        let map = self.lock()?;
        map.get(&namespace)
            .and_then(|entries| entries.get(key))
            .cloned()
            .ok_or_else(|| CacheError::NotFound {
                namespace,
                key: key.to_string(),
            })
    }

    async fn delete(&self, namespace: Namespace, key: &str) -> Result<(), CacheError> {
        let mut map = self.lock()?;
        if let Some(entries) = map.get_mut(&namespace) {
            entries.remove(key);
        }
        Ok(())
    }

    async fn keys(&self, namespace: Namespace) -> Result<Vec<String>, CacheError> {
        let map = self.lock()?;
        Ok(map
            .get(&namespace)
            .map(|entries| entries.keys().cloned().collect())
            .unwrap_or_default())
    }

    async fn clear(&self, namespace: Namespace) -> Result<(), CacheError> {
        let mut map = self.lock()?;
        map.remove(&namespace);
        Ok(())
    }

    async fn estimate(&self) -> Result<StorageEstimate, CacheError> {
        let map = self.lock()?;
        Ok(StorageEstimate::new(Self::used(&map), self.quota))
    }

    async fn request_persistence(&self) -> Result<bool, CacheError> {
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn namespaces_are_isolated() {
        let cache = InMemoryCache::new();
        cache
            .put(Namespace::Patients, "k", b"patients")
            .await
            .expect("put should succeed");
        cache
            .put(Namespace::Doctors, "k", b"doctors")
            .await
            .expect("put should succeed");

        assert_eq!(cache.get(Namespace::Patients, "k").await.unwrap(), b"patients");
        assert_eq!(cache.get(Namespace::Doctors, "k").await.unwrap(), b"doctors");

        cache.clear(Namespace::Patients).await.expect("clear");
        assert!(cache.get(Namespace::Patients, "k").await.is_err());
        assert!(cache.get(Namespace::Doctors, "k").await.is_ok());
    }

    #[tokio::test]
    async fn delete_is_idempotent_and_removes_data() {
        let cache = InMemoryCache::new();
        cache.put(Namespace::Settings, "k", b"v").await.expect("put should succeed");
        cache.delete(Namespace::Settings, "k").await.expect("delete should succeed");
        cache
            .delete(Namespace::Settings, "k")
            .await
            .expect("delete again should still succeed");

        let err = cache
            .get(Namespace::Settings, "k")
            .await
            .expect_err("get should fail after delete");
        assert!(matches!(err, CacheError::NotFound { .. }));
        assert_eq!(get_optional(&cache, Namespace::Settings, "k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn keys_are_sorted() {
        let cache = InMemoryCache::new();
        for key in ["003", "001", "002"] {
            cache.put(Namespace::SyncQueue, key, b"op").await.expect("put");
        }
        let keys = cache.keys(Namespace::SyncQueue).await.expect("keys");
        assert_eq!(keys, vec!["001", "002", "003"]);
    }

    #[tokio::test]
    async fn quota_is_enforced_and_reported() {
        let cache = InMemoryCache::with_quota(16);
        cache.put(Namespace::Settings, "a", b"12345").await.expect("fits");
        let err = cache
            .put(Namespace::Settings, "b", &[0u8; 32])
            .await
            .expect_err("should exceed quota");
        assert!(matches!(err, CacheError::QuotaExceeded { .. }));

        let estimate = cache.estimate().await.expect("estimate");
        assert_eq!(estimate.used, 6);
        assert_eq!(estimate.available, 10);
        assert!(!cache.request_persistence().await.unwrap());
    }
}

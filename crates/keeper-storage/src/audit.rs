use std::sync::Arc;

use chrono::{DateTime, Utc};
use keeper_core::cache::{get_optional, CacheError, Namespace, PersistentCache};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::warn;
use uuid::Uuid;

const AUDIT_KEY: &str = "audit_log";

/// Entries kept before the oldest are dropped.
pub const DEFAULT_AUDIT_LIMIT: usize = 1_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub action: String,
    pub severity: Severity,
    /// Non-secret details (counts, ids). Never passwords or record contents.
    #[serde(default)]
    pub context: serde_json::Value,
}

/// Append-only compliance log persisted in the settings namespace.
pub struct AuditLog<C: PersistentCache> {
    cache: Arc<C>,
    entries: Mutex<Vec<AuditEntry>>,
    limit: usize,
}

impl<C: PersistentCache> AuditLog<C> {
    pub fn new(cache: Arc<C>, limit: usize) -> Self {
        Self {
            cache,
            entries: Mutex::new(Vec::new()),
            limit: limit.max(1),
        }
    }

    /// Load persisted entries. A corrupted log is started afresh rather than failing.
    pub async fn load(&self) -> Result<(), CacheError> {
        let loaded = match get_optional(self.cache.as_ref(), Namespace::Settings, AUDIT_KEY).await? {
            Some(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|err| {
                warn!("audit log unreadable, starting a new one: {err}");
                Vec::new()
            }),
            None => Vec::new(),
        };
        *self.entries.lock().await = loaded;
        Ok(())
    }

    pub async fn append(
        &self,
        action: &str,
        severity: Severity,
        context: serde_json::Value,
    ) -> Result<AuditEntry, CacheError> {
        let entry = AuditEntry {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            action: action.to_string(),
            severity,
            context,
        };

        let mut entries = self.entries.lock().await;
        entries.push(entry.clone());
        if entries.len() > self.limit {
            let overflow = entries.len() - self.limit;
            entries.drain(..overflow);
        }
        let bytes = serde_json::to_vec(&*entries).map_err(|e| CacheError::Storage {
            reason: format!("audit serialization failed: {e}"),
        })?;
        self.cache.put(Namespace::Settings, AUDIT_KEY, &bytes).await?;
        Ok(entry)
    }

    pub async fn entries(&self) -> Vec<AuditEntry> {
        self.entries.lock().await.clone()
    }

    /// Newest first.
    pub async fn recent(&self, limit: usize) -> Vec<AuditEntry> {
        self.entries
            .lock()
            .await
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect()
    }

    pub async fn by_severity(&self, severity: Severity) -> Vec<AuditEntry> {
        self.entries
            .lock()
            .await
            .iter()
            .filter(|entry| entry.severity >= severity)
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use keeper_core::cache::InMemoryCache;
    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn appends_persist_and_reload() {
        let cache = Arc::new(InMemoryCache::new());
        let log = AuditLog::new(cache.clone(), 10);
        log.append("SAVE_PATIENTS", Severity::Low, json!({"count": 2}))
            .await
            .expect("append");
        log.append("ACCOUNT_LOCKED", Severity::Critical, json!({}))
            .await
            .expect("append");

        let reloaded = AuditLog::new(cache, 10);
        reloaded.load().await.expect("load");
        let entries = reloaded.entries().await;
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].action, "SAVE_PATIENTS");
        assert_eq!(reloaded.recent(1).await[0].action, "ACCOUNT_LOCKED");
        assert_eq!(reloaded.by_severity(Severity::High).await.len(), 1);
    }

    #[tokio::test]
    async fn oldest_entries_drop_past_limit() {
        let log = AuditLog::new(Arc::new(InMemoryCache::new()), 2);
        for action in ["A", "B", "C"] {
            log.append(action, Severity::Low, json!(null)).await.unwrap();
        }
        let actions: Vec<_> = log.entries().await.into_iter().map(|e| e.action).collect();
        assert_eq!(actions, vec!["B", "C"]);
    }

    #[tokio::test]
    async fn corrupted_log_starts_fresh() {
        let cache = Arc::new(InMemoryCache::new());
        cache
            .put(Namespace::Settings, AUDIT_KEY, b"{not json")
            .await
            .unwrap();
        let log = AuditLog::new(cache, 10);
        log.load().await.expect("load tolerates corruption");
        assert!(log.entries().await.is_empty());
    }

    #[test]
    fn severity_serializes_lowercase() {
        assert_eq!(serde_json::to_value(Severity::Critical).unwrap(), "critical");
    }
}

use std::sync::Arc;

use chrono::Utc;
use color_eyre::{eyre::WrapErr, Result};
use keeper_storage::{BackupService, FileCache, SecureStore};
use keeper_sync::{ConnectivityMonitor, OperationType, SyncOperation, SyncQueue, SyncTransport};
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use crate::{config::Config, storage};

/// Explicitly constructed services shared by every command handler.
pub struct App {
    pub config: Config,
    pub store: SecureStore<FileCache>,
    pub backups: BackupService<FileCache>,
    pub queue: Arc<SyncQueue<FileCache>>,
}

impl App {
    pub async fn open(config: Config, online: bool) -> Result<Self> {
        let cache = Arc::new(storage::cache_from_config(&config)?);
        let transport = config.sync.transport();
        Self::with_cache(config, cache, transport, online).await
    }

    pub async fn with_cache(
        config: Config,
        cache: Arc<FileCache>,
        transport: Arc<dyn SyncTransport>,
        online: bool,
    ) -> Result<Self> {
        let store = SecureStore::new(cache.clone(), &config.security);
        store.init().await.wrap_err("could not load store state")?;
        let backups = BackupService::new(cache.clone(), store.engine().clone(), config.backup.clone());
        let queue = SyncQueue::new(
            cache,
            transport,
            ConnectivityMonitor::new(online),
            config.sync.clone(),
        );
        queue.init().await.wrap_err("could not load the sync queue")?;
        Ok(Self {
            config,
            store,
            backups,
            queue: Arc::new(queue),
        })
    }

    pub async fn unlock(&self, password: Option<&str>) -> Result<()> {
        let password = password.ok_or_else(|| {
            color_eyre::eyre::eyre!("a password is required: pass --password or set KEEPER_PASSWORD")
        })?;
        self.store
            .unlock(password)
            .await
            .wrap_err("could not unlock the store")
    }

    /// Queue a change notification for the sync endpoint. Record contents stay
    /// in the encrypted store; the queue only carries ids.
    pub async fn record_change(
        &self,
        op_type: OperationType,
        entity: &str,
        id: Uuid,
    ) -> Result<SyncOperation> {
        let op = SyncOperation::new(
            op_type,
            entity,
            id.to_string(),
            json!({ "id": id, "changedAt": Utc::now() }),
        );
        Ok(self.queue.queue_operation(op).await?)
    }

    /// Run the auto-backup check and end the session.
    pub async fn finish(&self) {
        match self.store.auto_backup_if_due(&self.backups).await {
            Ok(Some(backup)) => info!(backup_id = %backup.id, "automatic backup created"),
            Ok(None) => {}
            Err(err) => warn!("automatic backup failed: {err}"),
        }
        self.store.teardown().await;
    }
}

#[cfg(test)]
pub async fn test_app(root: &std::path::Path) -> App {
    use keeper_storage::SecurityConfig;
    use keeper_sync::NoopTransport;

    let config = Config {
        data_dir: Some(root.to_path_buf()),
        security: SecurityConfig {
            pbkdf2_iterations: 1_000,
            ..SecurityConfig::default()
        },
        ..Config::default()
    };
    let cache = Arc::new(storage::cache_from_config(&config).expect("cache"));
    App::with_cache(config, cache, Arc::new(NoopTransport), false)
        .await
        .expect("app")
}

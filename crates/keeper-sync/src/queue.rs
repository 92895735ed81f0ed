//! Durable FIFO queue of pending mutations, persisted in the `SyncQueue`
//! namespace of a [`PersistentCache`].
//!
//! The backing cache is best effort: entries can be lost if the host evicts
//! storage. Quota can be inspected and persistence requested, but nothing here
//! replicates the queue elsewhere.

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use chrono::{DateTime, Utc};
use keeper_core::cache::{CacheError, Namespace, PersistentCache, StorageEstimate};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::{
    sync::{watch, Mutex},
    task::JoinHandle,
    time::MissedTickBehavior,
};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::{
    connectivity::ConnectivityMonitor,
    operation::{transition, OperationStatus, SyncEvent, SyncOperation, TransitionError},
    HttpTransport, HttpTransportConfig, NoopTransport, SyncTransport,
};

/// `[sync]` config section.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct SyncConfig {
    /// Base URL of the sync API; without one operations are accepted locally.
    pub endpoint: Option<String>,
    pub token: Option<String>,
    pub auto_sync: bool,
    pub interval_secs: u64,
    pub max_retry_attempts: u32,
    pub storage_quota_mb: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            token: None,
            auto_sync: true,
            interval_secs: 30,
            max_retry_attempts: 3,
            storage_quota_mb: 50,
        }
    }
}

impl SyncConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }

    pub fn storage_quota_bytes(&self) -> u64 {
        self.storage_quota_mb.saturating_mul(1024 * 1024)
    }

    /// HTTP when an endpoint is configured, otherwise a no-op.
    pub fn transport(&self) -> Arc<dyn SyncTransport> {
        match &self.endpoint {
            Some(endpoint) => Arc::new(HttpTransport::new(HttpTransportConfig {
                endpoint: endpoint.clone(),
                token: self.token.clone(),
            })),
            None => Arc::new(NoopTransport),
        }
    }
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error(transparent)]
    Transition(#[from] TransitionError),
    #[error("queue entry serialization failed: {0}")]
    Serialization(String),
    #[error("{} operation(s) exhausted their retries and need manual action", ids.len())]
    Exhausted { ids: Vec<Uuid> },
}

/// Read-only snapshot handed to observers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub is_online: bool,
    pub is_syncing: bool,
    pub pending_count: usize,
    pub failed_count: usize,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Offline,
    AlreadySyncing,
}

/// Outcome of one flush.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub attempted: usize,
    pub completed: Vec<Uuid>,
    /// Failed this round but still pending.
    pub retried: Vec<Uuid>,
    /// Reached the retry bound this round.
    pub failed: Vec<Uuid>,
    /// Left queued because local storage failed around the attempt.
    pub errored: Vec<Uuid>,
    pub skipped: Option<SkipReason>,
    pub last_error: Option<String>,
}

impl SyncReport {
    fn skipped(reason: SkipReason) -> Self {
        Self {
            skipped: Some(reason),
            ..Self::default()
        }
    }

    /// Surface operations that became terminal during this flush.
    pub fn into_result(self) -> Result<SyncReport, SyncError> {
        if self.failed.is_empty() {
            Ok(self)
        } else {
            Err(SyncError::Exhausted { ids: self.failed })
        }
    }
}

enum Attempt {
    Delivered,
    Rejected { reason: String, exhausted: bool },
}

pub struct SyncQueue<C: PersistentCache> {
    cache: Arc<C>,
    transport: Arc<dyn SyncTransport>,
    connectivity: ConnectivityMonitor,
    config: SyncConfig,
    status_tx: watch::Sender<SyncStatus>,
    // held for the duration of a flush; try_lock is the re-entrancy guard
    flush_lock: Mutex<()>,
    next_sequence: AtomicU64,
}

impl<C: PersistentCache> SyncQueue<C> {
    pub fn new(
        cache: Arc<C>,
        transport: Arc<dyn SyncTransport>,
        connectivity: ConnectivityMonitor,
        config: SyncConfig,
    ) -> Self {
        let (status_tx, _) = watch::channel(SyncStatus {
            is_online: connectivity.is_online(),
            is_syncing: false,
            pending_count: 0,
            failed_count: 0,
            last_sync_at: None,
            last_error: None,
        });
        Self {
            cache,
            transport,
            connectivity,
            config,
            status_tx,
            flush_lock: Mutex::new(()),
            next_sequence: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn connectivity(&self) -> &ConnectivityMonitor {
        &self.connectivity
    }

    /// Recover operations left in flight by a previous run and restore the
    /// sequence counter. Call once before use.
    #[instrument(skip_all)]
    pub async fn init(&self) -> Result<SyncStatus, SyncError> {
        let mut next_sequence = 0;
        let mut recovered = 0;
        for (key, op) in self.load_all().await? {
            next_sequence = next_sequence.max(op.sequence + 1);
            if op.status == OperationStatus::Syncing {
                let back = transition(&op, SyncEvent::Interrupted, self.config.max_retry_attempts)?;
                self.persist(&key, &back).await?;
                recovered += 1;
            }
        }
        self.next_sequence.store(next_sequence, Ordering::SeqCst);
        if recovered > 0 {
            info!(recovered, "requeued operations interrupted mid-sync");
        }
        self.refresh_status().await
    }

    /// Persist `op` as a fresh pending operation at the tail of the queue and
    /// flush right away when online with auto-sync on.
    #[instrument(skip_all, fields(entity = %op.entity, op_type = ?op.op_type))]
    pub async fn queue_operation(&self, op: SyncOperation) -> Result<SyncOperation, SyncError> {
        let op = self.enqueue(op).await?;
        debug!(op_id = %op.id, sequence = op.sequence, "operation queued");
        self.refresh_status().await?;

        if self.config.auto_sync && self.connectivity.is_online() {
            match self.sync_pending().await {
                Ok(report) if !report.failed.is_empty() => {
                    warn!(count = report.failed.len(), "operations exhausted their retries");
                }
                Ok(_) => {}
                Err(err) => warn!("flush after enqueue failed: {err}"),
            }
        }
        Ok(op)
    }

    /// Attempt every pending operation once, in enqueue order. One failure
    /// never stops the rest of the flush.
    #[instrument(skip_all)]
    pub async fn sync_pending(&self) -> Result<SyncReport, SyncError> {
        if !self.connectivity.is_online() {
            debug!("offline, flush skipped");
            return Ok(SyncReport::skipped(SkipReason::Offline));
        }
        let Ok(_guard) = self.flush_lock.try_lock() else {
            debug!("flush already running");
            return Ok(SyncReport::skipped(SkipReason::AlreadySyncing));
        };

        self.status_tx.send_modify(|status| status.is_syncing = true);
        let result = self.flush().await;
        self.status_tx.send_modify(|status| {
            status.is_syncing = false;
            match &result {
                Ok(report) => {
                    if report.attempted > 0 {
                        status.last_sync_at = Some(Utc::now());
                    }
                    status.last_error = report.last_error.clone();
                }
                Err(err) => status.last_error = Some(err.to_string()),
            }
        });
        self.refresh_status().await?;

        if let Ok(report) = &result {
            info!(
                attempted = report.attempted,
                completed = report.completed.len(),
                retried = report.retried.len(),
                failed = report.failed.len(),
                errored = report.errored.len(),
                transport = self.transport.name(),
                "flush finished"
            );
        }
        result
    }

    async fn flush(&self) -> Result<SyncReport, SyncError> {
        let max = self.config.max_retry_attempts;
        let mut report = SyncReport::default();

        for (key, mut op) in self.load_all().await? {
            // no other flush can be running, so an in-flight entry is stale
            if op.status == OperationStatus::Syncing {
                op = transition(&op, SyncEvent::Interrupted, max)?;
            }
            if op.status != OperationStatus::Pending {
                continue;
            }
            if !self.connectivity.is_online() {
                debug!("went offline mid-flush, leaving the rest queued");
                break;
            }

            report.attempted += 1;
            match self.attempt(&key, &op).await {
                Ok(Attempt::Delivered) => report.completed.push(op.id),
                Ok(Attempt::Rejected { reason, exhausted }) => {
                    report.last_error = Some(reason);
                    if exhausted {
                        report.failed.push(op.id);
                    } else {
                        report.retried.push(op.id);
                    }
                }
                Err(err) => {
                    warn!(op_id = %op.id, "queue storage failed, operation stays queued: {err}");
                    report.last_error = Some(err.to_string());
                    report.errored.push(op.id);
                }
            }
        }
        Ok(report)
    }

    /// Send one pending operation and record the outcome. A storage error
    /// after `Start` was persisted puts the entry back to pending.
    async fn attempt(&self, key: &str, op: &SyncOperation) -> Result<Attempt, SyncError> {
        let max = self.config.max_retry_attempts;
        let syncing = transition(op, SyncEvent::Start, max)?;
        self.persist(key, &syncing).await?;

        let (outcome, recorded) = match self.transport.send(&syncing).await {
            Ok(()) => {
                transition(&syncing, SyncEvent::Succeeded, max)?;
                let deleted = self.cache.delete(Namespace::SyncQueue, key).await;
                (Attempt::Delivered, deleted.map_err(SyncError::from))
            }
            Err(err) => {
                let reason = format!("{err:#}");
                warn!(op_id = %op.id, retry = syncing.retry_count + 1, "sync attempt failed: {reason}");
                let next = transition(
                    &syncing,
                    SyncEvent::Failed {
                        reason: reason.clone(),
                    },
                    max,
                )?;
                let persisted = self.persist(key, &next).await;
                let exhausted = next.status == OperationStatus::Failed;
                (Attempt::Rejected { reason, exhausted }, persisted)
            }
        };

        if let Err(err) = recorded {
            let back = transition(&syncing, SyncEvent::Interrupted, max)?;
            if let Err(revert) = self.persist(key, &back).await {
                warn!(op_id = %op.id, "could not return operation to pending: {revert}");
            }
            return Err(err);
        }
        Ok(outcome)
    }

    pub fn status(&self) -> SyncStatus {
        self.status_tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SyncStatus> {
        self.status_tx.subscribe()
    }

    /// Recount the queue and publish a fresh snapshot.
    pub async fn refresh_status(&self) -> Result<SyncStatus, SyncError> {
        let ops = self.load_all().await?;
        let pending = ops
            .iter()
            .filter(|(_, op)| matches!(op.status, OperationStatus::Pending | OperationStatus::Syncing))
            .count();
        let failed = ops
            .iter()
            .filter(|(_, op)| op.status == OperationStatus::Failed)
            .count();
        let online = self.connectivity.is_online();
        self.status_tx.send_modify(|status| {
            status.is_online = online;
            status.pending_count = pending;
            status.failed_count = failed;
        });
        Ok(self.status())
    }

    /// Pending and in-flight operations, in enqueue order.
    pub async fn pending_operations(&self) -> Result<Vec<SyncOperation>, SyncError> {
        Ok(self
            .load_all()
            .await?
            .into_iter()
            .map(|(_, op)| op)
            .filter(|op| matches!(op.status, OperationStatus::Pending | OperationStatus::Syncing))
            .collect())
    }

    pub async fn failed_operations(&self) -> Result<Vec<SyncOperation>, SyncError> {
        Ok(self
            .load_all()
            .await?
            .into_iter()
            .map(|(_, op)| op)
            .filter(|op| op.status == OperationStatus::Failed)
            .collect())
    }

    /// Replace each failed operation with a fresh one carrying the same
    /// mutation, queued at the tail. The failed entries are dropped.
    pub async fn retry_failed(&self) -> Result<usize, SyncError> {
        let _guard = self.flush_lock.lock().await;
        let mut count = 0;
        for (key, op) in self.load_all().await? {
            if op.status != OperationStatus::Failed {
                continue;
            }
            let fresh = SyncOperation::new(op.op_type, op.entity, op.entity_id, op.payload);
            let fresh = self.enqueue(fresh).await?;
            self.cache.delete(Namespace::SyncQueue, &key).await?;
            debug!(failed_id = %op.id, op_id = %fresh.id, "failed operation requeued");
            count += 1;
        }
        self.refresh_status().await?;
        Ok(count)
    }

    pub async fn clear_failed(&self) -> Result<usize, SyncError> {
        let _guard = self.flush_lock.lock().await;
        let mut count = 0;
        for (key, op) in self.load_all().await? {
            if op.status == OperationStatus::Failed {
                self.cache.delete(Namespace::SyncQueue, &key).await?;
                count += 1;
            }
        }
        self.refresh_status().await?;
        Ok(count)
    }

    pub async fn clear_all(&self) -> Result<(), SyncError> {
        let _guard = self.flush_lock.lock().await;
        self.cache.clear(Namespace::SyncQueue).await?;
        self.refresh_status().await?;
        Ok(())
    }

    pub async fn storage_estimate(&self) -> Result<StorageEstimate, SyncError> {
        Ok(self.cache.estimate().await?)
    }

    /// Ask the host to exempt queue storage from eviction. Not a durability guarantee.
    pub async fn request_persistent_storage(&self) -> Result<bool, SyncError> {
        let granted = self.cache.request_persistence().await?;
        if !granted {
            warn!("persistent storage not granted; queued operations may be evicted");
        }
        Ok(granted)
    }

    /// Persist a new operation at the tail. Callers hand in fresh operations only.
    async fn enqueue(&self, mut op: SyncOperation) -> Result<SyncOperation, SyncError> {
        op.status = OperationStatus::Pending;
        op.retry_count = 0;
        op.last_error = None;
        op.sequence = self.next_sequence.fetch_add(1, Ordering::SeqCst);
        self.persist(&op.key(), &op).await?;
        Ok(op)
    }

    async fn persist(&self, key: &str, op: &SyncOperation) -> Result<(), SyncError> {
        let bytes =
            serde_json::to_vec(op).map_err(|e| SyncError::Serialization(e.to_string()))?;
        self.cache.put(Namespace::SyncQueue, key, &bytes).await?;
        Ok(())
    }

    async fn load_all(&self) -> Result<Vec<(String, SyncOperation)>, SyncError> {
        let mut ops = Vec::new();
        for key in self.cache.keys(Namespace::SyncQueue).await? {
            let bytes = match self.cache.get(Namespace::SyncQueue, &key).await {
                Ok(bytes) => bytes,
                // removed between listing and reading
                Err(CacheError::NotFound { .. }) => continue,
                Err(err) => return Err(err.into()),
            };
            match serde_json::from_slice::<SyncOperation>(&bytes) {
                Ok(op) => ops.push((key, op)),
                Err(err) => warn!(%key, "skipping unreadable queue entry: {err}"),
            }
        }
        Ok(ops)
    }
}

/// Background flusher: flushes on every offline to online transition and on a
/// fixed interval while online, as long as auto-sync is enabled.
pub struct SyncWorker {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl SyncWorker {
    pub fn spawn<C: PersistentCache + 'static>(queue: Arc<SyncQueue<C>>) -> Self {
        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let mut online_rx = queue.connectivity().subscribe();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(queue.config().interval());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    changed = online_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let online = *online_rx.borrow_and_update();
                        if let Err(err) = queue.refresh_status().await {
                            warn!("status refresh failed: {err}");
                        }
                        if online && queue.config().auto_sync {
                            Self::flush(&queue).await;
                        }
                    }
                    _ = ticker.tick() => {
                        if queue.config().auto_sync && queue.connectivity().is_online() {
                            Self::flush(&queue).await;
                        }
                    }
                }
            }
            debug!("sync worker stopped");
        });

        Self { shutdown, handle }
    }

    async fn flush<C: PersistentCache>(queue: &Arc<SyncQueue<C>>) {
        match queue.sync_pending().await.and_then(SyncReport::into_result) {
            Ok(_) => {}
            Err(SyncError::Exhausted { ids }) => {
                warn!(count = ids.len(), "operations need manual retry or clearing");
            }
            Err(err) => warn!("background flush failed: {err}"),
        }
    }

    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        let _ = self.handle.await;
    }
}

//! Encrypt-on-write / decrypt-on-read access to the patient and doctor
//! collections, gated by an in-memory session.
//!
//! Callers only ever see plaintext domain objects; envelopes never cross this
//! boundary except through [`SecureStore::encrypted_store`]. Corrupted
//! ciphertext degrades to an empty collection on load so the store stays usable.
//!
//! Every write first commits the whole [`EncryptedStore`] document under one
//! settings key, then copies its envelopes into the patient and doctor
//! namespaces and drops the pending document. Reads prefer a pending document,
//! and `init` finishes one left behind by a crash, so both collections always
//! change together.

use std::{sync::Arc, time::Duration as StdDuration};

use chrono::{DateTime, Duration, Utc};
use keeper_core::{
    cache::{get_optional, CacheError, Namespace, PersistentCache},
    records::{Doctor, Patient, RetentionHorizon},
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tokio::{sync::Mutex, task::JoinHandle};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::{
    audit::{AuditLog, Severity, DEFAULT_AUDIT_LIMIT},
    backup::{Backup, BackupError, BackupService, BackupTrigger},
    envelope::{EncryptedStore, EncryptionEngine, Envelope, StoreContents, STORE_VERSION},
    kdf::{CryptoError, DEFAULT_ITERATIONS},
    session::{
        AccessError, FailureOutcome, SecurityStatus, SessionManager, SessionPhase, SessionPolicy,
        SessionSecret, DEFAULT_MAX_FAILED_ATTEMPTS,
    },
};

const ENVELOPE_KEY: &str = "envelope";
const STORE_META_KEY: &str = "store_meta";
const PENDING_STORE_KEY: &str = "pending_store";
const LOCKOUT_KEY: &str = "lockout";

/// Security knobs, loaded from the `[security]` config section.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct SecurityConfig {
    pub pbkdf2_iterations: u32,
    pub max_failed_attempts: u32,
    /// Idle minutes before a session ends; 0 disables expiry.
    pub session_timeout_minutes: u32,
    /// Medical records older than this many days are left out of loads; 0 keeps everything.
    pub retention_days: u32,
    pub audit_log_limit: usize,
    /// Minutes a lockout must last before an unauthenticated reset is accepted.
    pub lockout_cooldown_minutes: u32,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            pbkdf2_iterations: DEFAULT_ITERATIONS,
            max_failed_attempts: DEFAULT_MAX_FAILED_ATTEMPTS,
            session_timeout_minutes: 30,
            retention_days: 90,
            audit_log_limit: DEFAULT_AUDIT_LIMIT,
            lockout_cooldown_minutes: 15,
        }
    }
}

impl SecurityConfig {
    fn session_policy(&self) -> SessionPolicy {
        SessionPolicy {
            max_failed_attempts: self.max_failed_attempts,
            idle_timeout: (self.session_timeout_minutes > 0)
                .then(|| Duration::minutes(i64::from(self.session_timeout_minutes))),
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{operation} requires an active session: {reason}")]
    OperationNotAllowed {
        operation: &'static str,
        reason: AccessError,
    },
    #[error("locked after {attempts} failed attempts; an explicit reset is required")]
    Lockout { attempts: u32 },
    #[error("lockout can be reset after {until}")]
    CooldownActive { until: DateTime<Utc> },
    #[error("authentication failed")]
    Authentication,
    #[error("stored data failed integrity checks: {0}")]
    Integrity(String),
    #[error("record not found: {0}")]
    NotFound(Uuid),
    #[error(transparent)]
    Crypto(CryptoError),
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error(transparent)]
    Backup(#[from] BackupError),
    #[error("background crypto task failed: {0}")]
    Task(String),
}

impl From<CryptoError> for StoreError {
    fn from(err: CryptoError) -> Self {
        match err {
            CryptoError::Authentication => StoreError::Authentication,
            CryptoError::Malformed(reason) => StoreError::Integrity(reason),
            other => StoreError::Crypto(other),
        }
    }
}

/// Failed-attempt bookkeeping, persisted so a lockout outlives the process.
/// Holds no secret material.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LockoutState {
    failed_attempts: u32,
    locked_since: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize, Deserialize)]
struct StoreMeta {
    timestamp: i64,
    version: String,
}

/// A collection the store knows how to persist.
trait StoredRecord: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    const NAMESPACE: Namespace;
    const SAVE_ACTION: &'static str;
    const ADD_ACTION: &'static str;
    const UPDATE_ACTION: &'static str;
    const DELETE_ACTION: &'static str;

    fn id(&self) -> Uuid;
    fn mark_updated(&mut self);

    /// This collection's stringified envelope inside a store document.
    fn sealed(store: &EncryptedStore) -> &str;
    /// A fresh store document with this collection's envelope replaced.
    fn reseal(store: &EncryptedStore, envelope: String) -> EncryptedStore;

    fn apply_retention(_items: &mut [Self], _horizon: RetentionHorizon) -> usize {
        0
    }

    fn restore_hidden(&mut self, _stored: &Self, _horizon: RetentionHorizon) -> usize {
        0
    }
}

impl StoredRecord for Patient {
    const NAMESPACE: Namespace = Namespace::Patients;
    const SAVE_ACTION: &'static str = "SAVE_PATIENTS";
    const ADD_ACTION: &'static str = "ADD_PATIENT";
    const UPDATE_ACTION: &'static str = "UPDATE_PATIENT";
    const DELETE_ACTION: &'static str = "DELETE_PATIENT";

    fn id(&self) -> Uuid {
        self.id
    }

    fn mark_updated(&mut self) {
        self.updated_at = Utc::now();
    }

    fn sealed(store: &EncryptedStore) -> &str {
        store.patients_json()
    }

    fn reseal(store: &EncryptedStore, envelope: String) -> EncryptedStore {
        EncryptedStore::from_parts(
            envelope,
            store.doctors_json().to_string(),
            Utc::now().timestamp_millis(),
            STORE_VERSION.to_string(),
        )
    }

    fn apply_retention(items: &mut [Self], horizon: RetentionHorizon) -> usize {
        horizon.apply(items, Utc::now())
    }

    fn restore_hidden(&mut self, stored: &Self, horizon: RetentionHorizon) -> usize {
        horizon.restore_hidden(self, stored, Utc::now())
    }
}

impl StoredRecord for Doctor {
    const NAMESPACE: Namespace = Namespace::Doctors;
    const SAVE_ACTION: &'static str = "SAVE_DOCTORS";
    const ADD_ACTION: &'static str = "ADD_DOCTOR";
    const UPDATE_ACTION: &'static str = "UPDATE_DOCTOR";
    const DELETE_ACTION: &'static str = "DELETE_DOCTOR";

    fn id(&self) -> Uuid {
        self.id
    }

    fn mark_updated(&mut self) {
        self.updated_at = Utc::now();
    }

    fn sealed(store: &EncryptedStore) -> &str {
        store.doctors_json()
    }

    fn reseal(store: &EncryptedStore, envelope: String) -> EncryptedStore {
        EncryptedStore::from_parts(
            store.patients_json().to_string(),
            envelope,
            Utc::now().timestamp_millis(),
            STORE_VERSION.to_string(),
        )
    }
}

/// Session-gated encrypted store for patients and doctors.
pub struct SecureStore<C: PersistentCache> {
    cache: Arc<C>,
    engine: EncryptionEngine,
    sessions: Mutex<SessionManager>,
    audit: AuditLog<C>,
    retention: Option<RetentionHorizon>,
    lockout_cooldown: Duration,
    // serializes load-modify-save sequences
    write_lock: Mutex<()>,
}

impl<C: PersistentCache> SecureStore<C> {
    pub fn new(cache: Arc<C>, config: &SecurityConfig) -> Self {
        Self {
            engine: EncryptionEngine::with_iterations(config.pbkdf2_iterations),
            sessions: Mutex::new(SessionManager::new(config.session_policy())),
            audit: AuditLog::new(cache.clone(), config.audit_log_limit),
            retention: (config.retention_days > 0).then(|| RetentionHorizon::days(config.retention_days)),
            lockout_cooldown: Duration::minutes(i64::from(config.lockout_cooldown_minutes)),
            write_lock: Mutex::new(()),
            cache,
        }
    }

    /// Load persisted audit history and lockout counters. Call once before use.
    pub async fn init(&self) -> Result<(), StoreError> {
        self.audit.load().await?;
        self.finish_pending_write().await?;
        let lockout = match get_optional(self.cache.as_ref(), Namespace::Settings, LOCKOUT_KEY).await? {
            Some(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|err| {
                warn!("lockout state unreadable, starting clean: {err}");
                LockoutState::default()
            }),
            None => LockoutState::default(),
        };
        self.sessions
            .lock()
            .await
            .restore(lockout.failed_attempts, lockout.locked_since);
        debug!(failed_attempts = lockout.failed_attempts, "secure store initialized");
        Ok(())
    }

    /// End any active session. The store can be dropped afterwards.
    pub async fn teardown(&self) {
        if self.sessions.lock().await.end() {
            self.record("SESSION_TEARDOWN", Severity::Low, json!({})).await;
        }
    }

    pub fn engine(&self) -> &EncryptionEngine {
        &self.engine
    }

    pub fn audit_log(&self) -> &AuditLog<C> {
        &self.audit
    }

    pub async fn security_status(&self) -> SecurityStatus {
        self.sessions.lock().await.status()
    }

    pub async fn subscribe(&self) -> tokio::sync::watch::Receiver<SecurityStatus> {
        self.sessions.lock().await.subscribe()
    }

    pub async fn phase(&self) -> SessionPhase {
        self.sessions.lock().await.phase()
    }

    /// Whether anything has been persisted yet.
    pub async fn is_initialized(&self) -> Result<bool, StoreError> {
        Ok(self.encrypted_store().await?.is_some())
    }

    /// The at-rest representation: a committed but unapplied write if there is
    /// one, otherwise assembled from the patient and doctor namespaces.
    pub async fn encrypted_store(&self) -> Result<Option<EncryptedStore>, StoreError> {
        if let Some(pending) = self.pending_store().await? {
            return Ok(Some(pending));
        }
        let patients = get_optional(self.cache.as_ref(), Namespace::Patients, ENVELOPE_KEY).await?;
        let doctors = get_optional(self.cache.as_ref(), Namespace::Doctors, ENVELOPE_KEY).await?;
        if patients.is_none() && doctors.is_none() {
            return Ok(None);
        }

        let meta = get_optional(self.cache.as_ref(), Namespace::Settings, STORE_META_KEY)
            .await?
            .and_then(|bytes| serde_json::from_slice::<StoreMeta>(&bytes).ok())
            .unwrap_or_else(|| StoreMeta {
                timestamp: 0,
                version: STORE_VERSION.to_string(),
            });

        let text = |bytes: Option<Vec<u8>>| {
            bytes
                .and_then(|b| String::from_utf8(b).ok())
                .unwrap_or_default()
        };
        Ok(Some(EncryptedStore::from_parts(
            text(patients),
            text(doctors),
            meta.timestamp,
            meta.version,
        )))
    }

    /// Verify `password` and start a session. On first use the password
    /// initializes an empty store.
    #[instrument(skip_all)]
    pub async fn unlock(&self, password: &str) -> Result<(), StoreError> {
        {
            let sessions = self.sessions.lock().await;
            if sessions.ensure_unlock_allowed().is_err() {
                return Err(StoreError::Lockout {
                    attempts: sessions.failed_attempts(),
                });
            }
        }

        match self.encrypted_store().await? {
            None => {
                let _guard = self.write_lock.lock().await;
                let store = self
                    .seal_store(StoreContents::default(), password.to_string())
                    .await?;
                self.write_store(&store).await?;
                info!("initialized empty encrypted store");
                self.record("STORE_INITIALIZED", Severity::Medium, json!({})).await;
            }
            Some(store) if store.patients_envelope().is_err() && store.doctors_envelope().is_err() => {
                // Nothing left to verify against; loads will come back empty.
                warn!("persisted store is unreadable; accepting password without verification");
                self.record(
                    "INTEGRITY_FAILURE",
                    Severity::High,
                    json!({"stage": "unlock"}),
                )
                .await;
            }
            Some(store) => {
                let engine = self.engine.clone();
                let candidate = password.to_string();
                let verified = tokio::task::spawn_blocking(move || {
                    engine.verify_password(&store, &candidate)
                })
                .await
                .map_err(|e| StoreError::Task(e.to_string()))?;

                if !verified {
                    let outcome = self.sessions.lock().await.record_failure(Utc::now());
                    self.persist_lockout().await;
                    return Err(match outcome {
                        FailureOutcome::Retry { remaining } => {
                            self.record(
                                "UNLOCK_FAILED",
                                Severity::Medium,
                                json!({"remainingAttempts": remaining}),
                            )
                            .await;
                            StoreError::Authentication
                        }
                        FailureOutcome::LockedOut { attempts } => {
                            warn!(attempts, "failed-attempt threshold reached, locking");
                            self.record(
                                "ACCOUNT_LOCKED",
                                Severity::Critical,
                                json!({"failedAttempts": attempts}),
                            )
                            .await;
                            StoreError::Lockout { attempts }
                        }
                    });
                }
            }
        }

        self.sessions
            .lock()
            .await
            .begin(SessionSecret::new(password), Utc::now());
        self.persist_lockout().await;
        self.record("SESSION_STARTED", Severity::Low, json!({})).await;
        Ok(())
    }

    pub async fn logout(&self) {
        if self.sessions.lock().await.end() {
            self.record("LOGOUT", Severity::Low, json!({})).await;
        }
    }

    /// Leave the locked state. The next unlock starts with a fresh attempt count.
    pub async fn reset_lockout(&self) -> bool {
        let reset = self.sessions.lock().await.reset_lockout();
        if reset {
            self.persist_lockout().await;
            self.record("LOCKOUT_RESET", Severity::High, json!({})).await;
        }
        reset
    }

    /// Reset without a password, but only once the lockout has lasted the
    /// configured cooldown. Refusals are audited.
    pub async fn reset_lockout_after_cooldown(&self, now: DateTime<Utc>) -> Result<bool, StoreError> {
        if let Some(since) = self.security_status().await.locked_since {
            let until = since + self.lockout_cooldown;
            if now < until {
                self.record(
                    "LOCKOUT_RESET_REFUSED",
                    Severity::High,
                    json!({"resetAllowedAt": until}),
                )
                .await;
                return Err(StoreError::CooldownActive { until });
            }
        }
        Ok(self.reset_lockout().await)
    }

    pub async fn save_patients(&self, patients: &[Patient]) -> Result<(), StoreError> {
        self.save_all("save_patients", patients.to_vec()).await
    }

    pub async fn load_patients(&self) -> Result<Vec<Patient>, StoreError> {
        self.load_all("load_patients").await
    }

    pub async fn add_patient(&self, patient: Patient) -> Result<Patient, StoreError> {
        self.add("add_patient", patient).await
    }

    pub async fn update_patient(&self, patient: Patient) -> Result<Patient, StoreError> {
        self.update("update_patient", patient).await
    }

    pub async fn delete_patient(&self, id: Uuid) -> Result<(), StoreError> {
        self.delete::<Patient>("delete_patient", id).await
    }

    pub async fn save_doctors(&self, doctors: &[Doctor]) -> Result<(), StoreError> {
        self.save_all("save_doctors", doctors.to_vec()).await
    }

    pub async fn load_doctors(&self) -> Result<Vec<Doctor>, StoreError> {
        self.load_all("load_doctors").await
    }

    pub async fn add_doctor(&self, doctor: Doctor) -> Result<Doctor, StoreError> {
        self.add("add_doctor", doctor).await
    }

    pub async fn update_doctor(&self, doctor: Doctor) -> Result<Doctor, StoreError> {
        self.update("update_doctor", doctor).await
    }

    pub async fn delete_doctor(&self, id: Uuid) -> Result<(), StoreError> {
        self.delete::<Doctor>("delete_doctor", id).await
    }

    /// Re-encrypt everything under `new_password`. A wrong `old_password`
    /// leaves persisted data untouched.
    #[instrument(skip_all)]
    pub async fn change_password(
        &self,
        old_password: &str,
        new_password: &str,
    ) -> Result<(), StoreError> {
        self.require_active("change_password").await?;
        let _guard = self.write_lock.lock().await;

        let current = self
            .encrypted_store()
            .await?
            .ok_or_else(|| StoreError::Integrity("no persisted store to re-encrypt".to_string()))?;

        let engine = self.engine.clone();
        let (old, new) = (old_password.to_string(), new_password.to_string());
        let rotated = tokio::task::spawn_blocking(move || engine.change_password(&current, &old, &new))
            .await
            .map_err(|e| StoreError::Task(e.to_string()))?;

        let rotated = match rotated {
            Ok(store) => store,
            Err(err) => {
                self.record("PASSWORD_CHANGE_FAILED", Severity::High, json!({})).await;
                return Err(err.into());
            }
        };

        // a failed commit leaves the previous store in place
        self.write_store(&rotated).await?;

        self.sessions
            .lock()
            .await
            .rotate_secret(SessionSecret::new(new_password))
            .map_err(|reason| StoreError::OperationNotAllowed {
                operation: "change_password",
                reason,
            })?;
        info!("store password rotated");
        self.record("PASSWORD_CHANGED", Severity::Critical, json!({})).await;
        Ok(())
    }

    /// Decrypt and structurally check both collections without writing anything.
    pub async fn validate_data_integrity(&self) -> Result<bool, StoreError> {
        let secret = self.require_active("validate_data_integrity").await?;
        let Some(store) = self.encrypted_store().await? else {
            return Ok(true);
        };

        let engine = self.engine.clone();
        let valid = tokio::task::spawn_blocking(move || {
            let timestamp_ok = store.timestamp() >= 0 && !store.version().is_empty();
            timestamp_ok && engine.decrypt_store(&store, secret.expose()).is_ok()
        })
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?;

        if !valid {
            warn!("integrity validation failed");
        }
        Ok(valid)
    }

    /// Replace both collections with empty ones.
    pub async fn clear_all_data(&self) -> Result<(), StoreError> {
        let secret = self.require_active("clear_all_data").await?;
        let _guard = self.write_lock.lock().await;
        let store = self
            .seal_store(StoreContents::default(), secret.expose().to_string())
            .await?;
        self.write_store(&store).await?;
        self.record("DATA_CLEARED", Severity::Critical, json!({})).await;
        Ok(())
    }

    /// Snapshot the live collections into a standalone backup.
    pub async fn create_backup(
        &self,
        backups: &BackupService<C>,
        trigger: BackupTrigger,
    ) -> Result<Backup, StoreError> {
        let secret = self.require_active("create_backup").await?;
        let contents = StoreContents {
            patients: self.open_collection::<Patient>(&secret).await?,
            doctors: self.open_collection::<Doctor>(&secret).await?,
        };
        let backup = backups
            .create_backup(&contents, secret.expose(), trigger)
            .await?;
        self.record(
            "BACKUP_CREATED",
            Severity::Medium,
            json!({"backupId": backup.id, "trigger": trigger}),
        )
        .await;
        Ok(backup)
    }

    /// Decrypt a backup with the session password. Nothing is committed.
    pub async fn open_backup(
        &self,
        backups: &BackupService<C>,
        backup: &Backup,
    ) -> Result<StoreContents, StoreError> {
        let secret = self.require_active("open_backup").await?;
        Ok(backups.restore_backup(backup, secret.expose()).await?)
    }

    /// Commit previously restored contents over the live store.
    pub async fn commit_restore(&self, contents: StoreContents) -> Result<(), StoreError> {
        let secret = self.require_active("commit_restore").await?;
        let _guard = self.write_lock.lock().await;
        let counts = json!({
            "patients": contents.patients.len(),
            "doctors": contents.doctors.len(),
        });
        let store = self
            .seal_store(contents, secret.expose().to_string())
            .await?;
        self.write_store(&store).await?;
        self.record("BACKUP_RESTORED", Severity::High, counts).await;
        Ok(())
    }

    /// Create an automatic backup when the schedule says one is due.
    /// Without an active session there is nothing to back up and `None` is returned.
    pub async fn auto_backup_if_due(
        &self,
        backups: &BackupService<C>,
    ) -> Result<Option<Backup>, StoreError> {
        if self.phase().await != SessionPhase::Active {
            return Ok(None);
        }
        if !backups.is_auto_backup_due(Utc::now()).await? {
            return Ok(None);
        }
        self.create_backup(backups, BackupTrigger::Auto).await.map(Some)
    }

    async fn require_active(&self, operation: &'static str) -> Result<SessionSecret, StoreError> {
        let touched = self.sessions.lock().await.touch(Utc::now());
        match touched {
            Ok(secret) => Ok(secret),
            Err(reason) => {
                if reason == AccessError::Expired {
                    self.record("SESSION_EXPIRED", Severity::Low, json!({})).await;
                }
                Err(StoreError::OperationNotAllowed { operation, reason })
            }
        }
    }

    async fn save_all<T: StoredRecord>(
        &self,
        operation: &'static str,
        items: Vec<T>,
    ) -> Result<(), StoreError> {
        let secret = self.require_active(operation).await?;
        let _guard = self.write_lock.lock().await;
        let count = items.len();
        let items = match self.retention {
            Some(horizon) => {
                let stored: Vec<T> = self.open_collection(&secret).await?;
                items
                    .into_iter()
                    .map(|mut item| {
                        if let Some(previous) = stored.iter().find(|s| s.id() == item.id()) {
                            item.restore_hidden(previous, horizon);
                        }
                        item
                    })
                    .collect()
            }
            None => items,
        };
        self.save_collection(&secret, items).await?;
        self.record(T::SAVE_ACTION, Severity::Low, json!({"count": count})).await;
        Ok(())
    }

    async fn load_all<T: StoredRecord>(&self, operation: &'static str) -> Result<Vec<T>, StoreError> {
        let secret = self.require_active(operation).await?;
        let mut items: Vec<T> = self.open_collection(&secret).await?;
        if let Some(horizon) = self.retention {
            let dropped = T::apply_retention(&mut items, horizon);
            if dropped > 0 {
                debug!(dropped, "records outside the retention horizon filtered");
            }
        }
        Ok(items)
    }

    async fn add<T: StoredRecord>(&self, operation: &'static str, item: T) -> Result<T, StoreError> {
        let secret = self.require_active(operation).await?;
        let _guard = self.write_lock.lock().await;
        let mut items: Vec<T> = self.open_collection(&secret).await?;
        items.push(item.clone());
        self.save_collection(&secret, items).await?;
        self.record(T::ADD_ACTION, Severity::Low, json!({"id": item.id()})).await;
        Ok(item)
    }

    async fn update<T: StoredRecord>(
        &self,
        operation: &'static str,
        mut item: T,
    ) -> Result<T, StoreError> {
        let secret = self.require_active(operation).await?;
        let _guard = self.write_lock.lock().await;
        let mut items: Vec<T> = self.open_collection(&secret).await?;
        let slot = items
            .iter_mut()
            .find(|existing| existing.id() == item.id())
            .ok_or(StoreError::NotFound(item.id()))?;
        if let Some(horizon) = self.retention {
            item.restore_hidden(slot, horizon);
        }
        item.mark_updated();
        *slot = item.clone();
        self.save_collection(&secret, items).await?;
        self.record(T::UPDATE_ACTION, Severity::Low, json!({"id": item.id()})).await;
        Ok(item)
    }

    async fn delete<T: StoredRecord>(&self, operation: &'static str, id: Uuid) -> Result<(), StoreError> {
        let secret = self.require_active(operation).await?;
        let _guard = self.write_lock.lock().await;
        let mut items: Vec<T> = self.open_collection(&secret).await?;
        let before = items.len();
        items.retain(|existing| existing.id() != id);
        if items.len() == before {
            return Err(StoreError::NotFound(id));
        }
        self.save_collection(&secret, items).await?;
        self.record(T::DELETE_ACTION, Severity::Medium, json!({"id": id})).await;
        Ok(())
    }

    /// Decrypt a whole collection, including records a load would filter out.
    async fn open_collection<T: StoredRecord>(
        &self,
        secret: &SessionSecret,
    ) -> Result<Vec<T>, StoreError> {
        let Some(store) = self.encrypted_store().await? else {
            return Ok(Vec::new());
        };

        let engine = self.engine.clone();
        let secret = secret.clone();
        let opened = tokio::task::spawn_blocking(move || -> Result<Vec<T>, CryptoError> {
            let envelope = Envelope::from_json(T::sealed(&store))?;
            engine.decrypt(&envelope, secret.expose())
        })
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?;

        match opened {
            Ok(items) => Ok(items),
            Err(err) => {
                warn!(namespace = %T::NAMESPACE, "stored collection unreadable, returning empty: {err}");
                self.record(
                    "INTEGRITY_FAILURE",
                    Severity::High,
                    json!({"namespace": T::NAMESPACE}),
                )
                .await;
                Ok(Vec::new())
            }
        }
    }

    async fn save_collection<T: StoredRecord>(
        &self,
        secret: &SessionSecret,
        items: Vec<T>,
    ) -> Result<(), StoreError> {
        let current = match self.encrypted_store().await? {
            Some(store) => store,
            None => self.seal_store(StoreContents::default(), secret.expose().to_string()).await?,
        };
        let engine = self.engine.clone();
        let secret = secret.clone();
        let envelope = tokio::task::spawn_blocking(move || engine.encrypt(&items, secret.expose()))
            .await
            .map_err(|e| StoreError::Task(e.to_string()))??;

        let next = T::reseal(&current, envelope.to_json()?);
        self.write_store(&next).await
    }

    async fn seal_store(
        &self,
        contents: StoreContents,
        password: String,
    ) -> Result<EncryptedStore, StoreError> {
        let engine = self.engine.clone();
        let password = SessionSecret::new(password);
        Ok(
            tokio::task::spawn_blocking(move || engine.encrypt_store(&contents, password.expose()))
                .await
                .map_err(|e| StoreError::Task(e.to_string()))??,
        )
    }

    /// Commit `store` with a single put, then spread it over the namespaces.
    /// Once the commit succeeds the write is durable even if applying fails.
    async fn write_store(&self, store: &EncryptedStore) -> Result<(), StoreError> {
        let document = serde_json::to_vec(store).map_err(|e| CacheError::Storage {
            reason: format!("store document serialization failed: {e}"),
        })?;
        self.cache
            .put(Namespace::Settings, PENDING_STORE_KEY, &document)
            .await?;
        if let Err(err) = self.apply_store(store).await {
            warn!("store committed but not applied yet, the next write or init finishes it: {err}");
        }
        Ok(())
    }

    async fn apply_store(&self, store: &EncryptedStore) -> Result<(), StoreError> {
        self.cache
            .put(Namespace::Patients, ENVELOPE_KEY, store.patients_json().as_bytes())
            .await?;
        self.cache
            .put(Namespace::Doctors, ENVELOPE_KEY, store.doctors_json().as_bytes())
            .await?;
        let meta = StoreMeta {
            timestamp: store.timestamp(),
            version: store.version().to_string(),
        };
        let bytes = serde_json::to_vec(&meta).map_err(|e| CacheError::Storage {
            reason: format!("store metadata serialization failed: {e}"),
        })?;
        self.cache.put(Namespace::Settings, STORE_META_KEY, &bytes).await?;
        self.cache.delete(Namespace::Settings, PENDING_STORE_KEY).await?;
        Ok(())
    }

    async fn pending_store(&self) -> Result<Option<EncryptedStore>, StoreError> {
        let Some(bytes) =
            get_optional(self.cache.as_ref(), Namespace::Settings, PENDING_STORE_KEY).await?
        else {
            return Ok(None);
        };
        match serde_json::from_slice(&bytes) {
            Ok(store) => Ok(Some(store)),
            Err(err) => {
                warn!("pending store document unreadable, ignoring it: {err}");
                Ok(None)
            }
        }
    }

    async fn finish_pending_write(&self) -> Result<(), StoreError> {
        if get_optional(self.cache.as_ref(), Namespace::Settings, PENDING_STORE_KEY)
            .await?
            .is_none()
        {
            return Ok(());
        }
        match self.pending_store().await? {
            Some(store) => {
                self.apply_store(&store).await?;
                info!("finished a store write interrupted by a previous run");
                self.record("STORE_WRITE_RECOVERED", Severity::Medium, json!({})).await;
            }
            None => {
                self.cache.delete(Namespace::Settings, PENDING_STORE_KEY).await?;
            }
        }
        Ok(())
    }

    async fn persist_lockout(&self) {
        let status = self.sessions.lock().await.status();
        let state = LockoutState {
            failed_attempts: status.failed_attempts,
            locked_since: status.locked_since,
        };
        let written = match serde_json::to_vec(&state) {
            Ok(bytes) => self
                .cache
                .put(Namespace::Settings, LOCKOUT_KEY, &bytes)
                .await
                .map_err(|e| e.to_string()),
            Err(err) => Err(err.to_string()),
        };
        if let Err(err) = written {
            warn!("could not persist lockout state: {err}");
        }
    }

    /// Audit writes are best effort; a failing log never fails the operation.
    async fn record(&self, action: &str, severity: Severity, context: serde_json::Value) {
        if let Err(err) = self.audit.append(action, severity, context).await {
            warn!(action, "audit append failed: {err}");
        }
    }
}

/// Periodically run [`SecureStore::auto_backup_if_due`] until the task is aborted.
pub fn spawn_auto_backup<C: PersistentCache + 'static>(
    store: Arc<SecureStore<C>>,
    backups: Arc<BackupService<C>>,
    check_every: StdDuration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(check_every);
        loop {
            ticker.tick().await;
            match store.auto_backup_if_due(&backups).await {
                Ok(Some(backup)) => info!(backup_id = %backup.id, "automatic backup created"),
                Ok(None) => {}
                Err(err) => warn!("automatic backup failed: {err}"),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use keeper_core::{cache::InMemoryCache, records::MedicalRecord};

    use super::*;
    use crate::backup::BackupConfig;

    fn config() -> SecurityConfig {
        SecurityConfig {
            pbkdf2_iterations: 1_000,
            max_failed_attempts: 3,
            ..SecurityConfig::default()
        }
    }

    async fn unlocked(cache: Arc<InMemoryCache>) -> SecureStore<InMemoryCache> {
        let store = SecureStore::new(cache, &config());
        store.init().await.expect("init");
        store.unlock("hunter2").await.expect("unlock");
        store
    }

    #[tokio::test]
    async fn operations_require_active_session() {
        let store = SecureStore::new(Arc::new(InMemoryCache::new()), &config());
        let err = store.load_patients().await.expect_err("no session");
        assert!(matches!(
            err,
            StoreError::OperationNotAllowed {
                reason: AccessError::NoSession,
                ..
            }
        ));
        assert!(store.add_doctor(Doctor::new("Dr. Who")).await.is_err());
    }

    #[tokio::test]
    async fn first_use_loads_empty_collections() {
        let store = unlocked(Arc::new(InMemoryCache::new())).await;
        assert!(store.load_patients().await.expect("load").is_empty());
        assert!(store.load_doctors().await.expect("load").is_empty());
        assert!(store.is_initialized().await.unwrap());
    }

    #[tokio::test]
    async fn saved_data_is_encrypted_at_rest_and_round_trips() {
        let cache = Arc::new(InMemoryCache::new());
        let store = unlocked(cache.clone()).await;
        let patient = store
            .add_patient(Patient::new("Ada Lovelace"))
            .await
            .expect("add");
        store.add_doctor(Doctor::new("Dr. Quinn")).await.expect("add");

        let raw = cache.get(Namespace::Patients, ENVELOPE_KEY).await.unwrap();
        assert!(!String::from_utf8_lossy(&raw).contains("Ada Lovelace"));

        let loaded = store.load_patients().await.expect("load");
        assert_eq!(loaded, vec![patient]);
        assert_eq!(store.load_doctors().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn update_and_delete_records() {
        let store = unlocked(Arc::new(InMemoryCache::new())).await;
        let mut patient = store.add_patient(Patient::new("Ada")).await.unwrap();
        patient.allergies.push("penicillin".into());
        store.update_patient(patient.clone()).await.expect("update");
        assert_eq!(store.load_patients().await.unwrap()[0].allergies, vec!["penicillin"]);

        store.delete_patient(patient.id).await.expect("delete");
        assert!(store.load_patients().await.unwrap().is_empty());
        assert!(matches!(
            store.delete_patient(patient.id).await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn retention_horizon_filters_old_records() {
        let store = unlocked(Arc::new(InMemoryCache::new())).await;
        let mut patient = Patient::new("Ada");
        patient
            .records
            .push(MedicalRecord::new("old visit", Utc::now() - Duration::days(100)));
        patient
            .records
            .push(MedicalRecord::new("recent visit", Utc::now() - Duration::days(3)));
        store.save_patients(&[patient]).await.expect("save");

        let loaded = store.load_patients().await.expect("load");
        assert_eq!(loaded[0].records.len(), 1);
        assert_eq!(loaded[0].records[0].title, "recent visit");
    }

    #[tokio::test]
    async fn writes_never_prune_records_hidden_by_retention() {
        let cache = Arc::new(InMemoryCache::new());
        let store = unlocked(cache.clone()).await;
        let backups = BackupService::new(cache.clone(), store.engine().clone(), BackupConfig::default());
        let mut ada = Patient::new("Ada");
        ada.records
            .push(MedicalRecord::new("old visit", Utc::now() - Duration::days(100)));
        ada.records
            .push(MedicalRecord::new("recent visit", Utc::now() - Duration::days(3)));
        store.save_patients(&[ada]).await.expect("save");

        store.add_patient(Patient::new("Grace")).await.expect("unrelated add");
        let mut loaded = store.load_patients().await.unwrap();
        assert_eq!(loaded[0].records.len(), 1);
        loaded[0].notes = Some("edited".into());
        store.update_patient(loaded[0].clone()).await.expect("update");
        store.save_patients(&loaded).await.expect("save filtered list");

        let backup = store
            .create_backup(&backups, BackupTrigger::Manual)
            .await
            .expect("backup");
        let restored = backups.restore_backup(&backup, "hunter2").await.unwrap();
        assert_eq!(restored.patients[0].records.len(), 2);

        let unfiltered = SecureStore::new(
            cache,
            &SecurityConfig {
                retention_days: 0,
                ..config()
            },
        );
        unfiltered.init().await.unwrap();
        unfiltered.unlock("hunter2").await.unwrap();
        let patients = unfiltered.load_patients().await.unwrap();
        assert_eq!(patients.len(), 2);
        assert_eq!(patients[0].notes.as_deref(), Some("edited"));
        assert_eq!(patients[0].records.len(), 2);
    }

    #[tokio::test]
    async fn interrupted_write_is_finished_on_init() {
        let cache = Arc::new(InMemoryCache::new());
        let store = unlocked(cache.clone()).await;
        store.add_patient(Patient::new("Ada")).await.unwrap();
        store.add_doctor(Doctor::new("Dr. Quinn")).await.unwrap();
        let current = store.encrypted_store().await.unwrap().unwrap();
        let rotated = store
            .engine()
            .change_password(&current, "hunter2", "new-secret")
            .unwrap();

        // committed document written, only the patients envelope applied
        cache
            .put(
                Namespace::Settings,
                PENDING_STORE_KEY,
                &serde_json::to_vec(&rotated).unwrap(),
            )
            .await
            .unwrap();
        cache
            .put(Namespace::Patients, ENVELOPE_KEY, rotated.patients_json().as_bytes())
            .await
            .unwrap();

        let reopened = SecureStore::new(cache.clone(), &config());
        reopened.init().await.expect("init finishes the write");
        assert!(get_optional(cache.as_ref(), Namespace::Settings, PENDING_STORE_KEY)
            .await
            .unwrap()
            .is_none());
        let applied = cache.get(Namespace::Doctors, ENVELOPE_KEY).await.unwrap();
        assert_eq!(applied, rotated.doctors_json().as_bytes());

        assert!(matches!(
            reopened.unlock("hunter2").await,
            Err(StoreError::Authentication)
        ));
        reopened.unlock("new-secret").await.expect("rotated password");
        assert_eq!(reopened.load_patients().await.unwrap().len(), 1);
        assert_eq!(reopened.load_doctors().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn corrupted_ciphertext_degrades_to_empty() {
        let cache = Arc::new(InMemoryCache::new());
        let store = unlocked(cache.clone()).await;
        store.add_patient(Patient::new("Ada")).await.unwrap();

        cache
            .put(Namespace::Patients, ENVELOPE_KEY, b"definitely not an envelope")
            .await
            .unwrap();

        assert!(store.load_patients().await.expect("no error").is_empty());
        assert!(!store.validate_data_integrity().await.unwrap());
        // still usable afterwards
        store.add_patient(Patient::new("Grace")).await.expect("add after corruption");
        assert_eq!(store.load_patients().await.unwrap().len(), 1);
        assert!(store.validate_data_integrity().await.unwrap());
    }

    #[tokio::test]
    async fn lockout_rejects_correct_password_until_reset() {
        let cache = Arc::new(InMemoryCache::new());
        let first = unlocked(cache.clone()).await;
        first.logout().await;

        for _ in 0..2 {
            assert!(matches!(
                first.unlock("wrong").await,
                Err(StoreError::Authentication)
            ));
        }
        assert!(matches!(
            first.unlock("wrong").await,
            Err(StoreError::Lockout { attempts: 3 })
        ));
        assert!(matches!(
            first.unlock("hunter2").await,
            Err(StoreError::Lockout { .. })
        ));
        assert!(first.security_status().await.locked);

        assert!(first.reset_lockout().await);
        first.unlock("hunter2").await.expect("unlock after reset");
        let actions: Vec<_> = first
            .audit_log()
            .entries()
            .await
            .into_iter()
            .map(|e| e.action)
            .collect();
        assert!(actions.contains(&"ACCOUNT_LOCKED".to_string()));
        assert!(actions.contains(&"LOCKOUT_RESET".to_string()));
    }

    #[tokio::test]
    async fn lockout_survives_a_new_store_instance() {
        let cache = Arc::new(InMemoryCache::new());
        let first = unlocked(cache.clone()).await;
        first.logout().await;
        for _ in 0..3 {
            let _ = first.unlock("wrong").await;
        }

        let second = SecureStore::new(cache, &config());
        second.init().await.unwrap();
        assert!(matches!(
            second.unlock("hunter2").await,
            Err(StoreError::Lockout { attempts: 3 })
        ));
        assert!(second.reset_lockout().await);
        second.unlock("hunter2").await.expect("unlock after reset");
    }

    #[tokio::test]
    async fn unauthenticated_reset_waits_for_the_cooldown() {
        let cache = Arc::new(InMemoryCache::new());
        let store = unlocked(cache).await;
        store.logout().await;
        for _ in 0..3 {
            let _ = store.unlock("wrong").await;
        }
        let locked_since = store.security_status().await.locked_since.expect("locked");

        assert!(matches!(
            store.reset_lockout_after_cooldown(locked_since).await,
            Err(StoreError::CooldownActive { .. })
        ));
        assert!(store.security_status().await.locked);

        let later = locked_since + Duration::minutes(16);
        assert!(store.reset_lockout_after_cooldown(later).await.unwrap());
        store.unlock("hunter2").await.expect("unlock after cooldown reset");
    }

    #[tokio::test]
    async fn change_password_is_atomic() {
        let cache = Arc::new(InMemoryCache::new());
        let store = unlocked(cache.clone()).await;
        store.add_patient(Patient::new("Ada")).await.unwrap();
        let before = store.encrypted_store().await.unwrap().unwrap();

        assert!(matches!(
            store.change_password("not-it", "new-secret").await,
            Err(StoreError::Authentication)
        ));
        let after_failure = store.encrypted_store().await.unwrap().unwrap();
        assert_eq!(before.patients_json(), after_failure.patients_json());
        assert_eq!(before.doctors_json(), after_failure.doctors_json());

        store
            .change_password("hunter2", "new-secret")
            .await
            .expect("rotate");
        assert_eq!(store.load_patients().await.unwrap().len(), 1);

        let rotated = store.encrypted_store().await.unwrap().unwrap();
        assert!(store.engine().verify_password(&rotated, "new-secret"));
        assert!(!store.engine().verify_password(&rotated, "hunter2"));

        store.logout().await;
        assert!(store.unlock("hunter2").await.is_err());
        store.unlock("new-secret").await.expect("new password unlocks");
    }

    #[tokio::test]
    async fn status_snapshots_reach_subscribers() {
        let store = SecureStore::new(Arc::new(InMemoryCache::new()), &config());
        let rx = store.subscribe().await;
        store.unlock("pw").await.unwrap();
        assert_eq!(rx.borrow().phase, SessionPhase::Active);
        store.teardown().await;
        assert_eq!(rx.borrow().phase, SessionPhase::NoSession);
    }

    #[tokio::test]
    async fn backup_restore_is_committed_only_on_request() {
        let cache = Arc::new(InMemoryCache::new());
        let store = unlocked(cache.clone()).await;
        let backups = BackupService::new(cache.clone(), store.engine().clone(), BackupConfig::default());
        store.add_patient(Patient::new("Ada")).await.unwrap();

        let backup = store
            .create_backup(&backups, BackupTrigger::Manual)
            .await
            .expect("backup");
        store.clear_all_data().await.unwrap();

        let contents = store.open_backup(&backups, &backup).await.expect("open");
        assert_eq!(contents.patients.len(), 1);
        assert!(store.load_patients().await.unwrap().is_empty());

        store.commit_restore(contents).await.expect("commit");
        assert_eq!(store.load_patients().await.unwrap()[0].name, "Ada");
    }

    #[tokio::test]
    async fn auto_backup_fires_on_first_run_then_waits() {
        let cache = Arc::new(InMemoryCache::new());
        let store = unlocked(cache.clone()).await;
        let backups = BackupService::new(cache.clone(), store.engine().clone(), BackupConfig::default());

        let first = store.auto_backup_if_due(&backups).await.unwrap();
        assert!(first.is_some());
        let second = store.auto_backup_if_due(&backups).await.unwrap();
        assert!(second.is_none());
        assert_eq!(backups.history().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn background_task_takes_the_due_backup() {
        let cache = Arc::new(InMemoryCache::new());
        let store = Arc::new(unlocked(cache.clone()).await);
        let backups = Arc::new(BackupService::new(
            cache.clone(),
            store.engine().clone(),
            BackupConfig::default(),
        ));

        let handle = spawn_auto_backup(store.clone(), backups.clone(), StdDuration::from_millis(10));
        for _ in 0..100 {
            if !backups.history().await.unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(StdDuration::from_millis(10)).await;
        }
        handle.abort();

        let history = backups.history().await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].trigger, BackupTrigger::Auto);
    }
}

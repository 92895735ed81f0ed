//! Standalone encrypted snapshots of both collections, with a pruned history,
//! file/JSON export and a simple interval schedule.
//!
//! A backup carries its own envelopes, so it can be restored after the live
//! store has been cleared. Restoring only returns plaintext; committing it over
//! the live store is the caller's call.

use std::{
    fs,
    io::Write,
    path::Path,
    sync::Arc,
};

use chrono::{DateTime, Duration, Utc};
use keeper_core::cache::{get_optional, CacheError, Namespace, PersistentCache};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::{
    envelope::{EncryptionEngine, Envelope, StoreContents},
    kdf::CryptoError,
};

pub const BACKUP_VERSION: &str = "1.0";

const HISTORY_KEY: &str = "backup_history";
const AUTO_BACKUP_KEY: &str = "auto_backup";
// base64 framing plus the envelope's JSON keys, salt and iv
const ENVELOPE_OVERHEAD: u64 = 160;

/// Plaintext produced by a restore, ready to be committed.
pub type RestoredData = StoreContents;

#[derive(Debug, Error)]
pub enum BackupError {
    #[error("backup {0} not found")]
    NotFound(Uuid),
    #[error("invalid backup format: {0}")]
    InvalidFormat(String),
    #[error("unsupported backup version {found}, expected {BACKUP_VERSION}")]
    UnsupportedVersion { found: String },
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error("backup file i/o failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("background crypto task failed: {0}")]
    Task(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupTrigger {
    Manual,
    Auto,
}

impl std::fmt::Display for BackupTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            BackupTrigger::Manual => "manual",
            BackupTrigger::Auto => "auto",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Backup {
    pub id: Uuid,
    pub patients: Envelope,
    pub doctors: Envelope,
    pub created_at: DateTime<Utc>,
    pub trigger: BackupTrigger,
    pub version: String,
}

impl Backup {
    /// Structural checks only; says nothing about whether a password opens it.
    pub fn validate(&self) -> Result<(), BackupError> {
        if self.version != BACKUP_VERSION {
            return Err(BackupError::UnsupportedVersion {
                found: self.version.clone(),
            });
        }
        self.patients
            .validate_shape()
            .map_err(|e| BackupError::InvalidFormat(format!("patients: {e}")))?;
        self.doctors
            .validate_shape()
            .map_err(|e| BackupError::InvalidFormat(format!("doctors: {e}")))?;
        Ok(())
    }

    fn size_estimate(&self) -> u64 {
        (self.patients.ciphertext().len() + self.doctors.ciphertext().len()) as u64
            + 2 * ENVELOPE_OVERHEAD
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupHistoryEntry {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub size_estimate: u64,
    pub trigger: BackupTrigger,
}

/// `[backup]` config section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupConfig {
    pub auto_backup: bool,
    pub interval_hours: u32,
    /// Backups kept in history; at least the newest one is always kept.
    pub max_history: usize,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            auto_backup: true,
            interval_hours: 24,
            max_history: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutoBackupSettings {
    pub enabled: bool,
    pub interval_hours: u32,
    pub last_backup_at: Option<DateTime<Utc>>,
}

/// Due when enabled and either nothing was ever backed up or the interval has
/// elapsed since the last backup of any trigger.
pub fn is_backup_due(settings: &AutoBackupSettings, now: DateTime<Utc>) -> bool {
    if !settings.enabled {
        return false;
    }
    match settings.last_backup_at {
        None => true,
        Some(last) => now - last >= Duration::hours(i64::from(settings.interval_hours)),
    }
}

/// Rough serialized size of a backup of `contents`, in bytes.
pub fn estimate_backup_size(contents: &StoreContents) -> Result<u64, BackupError> {
    let sealed = |plain: usize| -> u64 {
        // AES-GCM appends a 16 byte tag; base64 inflates by 4/3
        let cipher = plain as u64 + 16;
        cipher.div_ceil(3) * 4 + ENVELOPE_OVERHEAD
    };
    let patients = serde_json::to_vec(&contents.patients)
        .map_err(|e| CryptoError::Serialization(e.to_string()))?
        .len();
    let doctors = serde_json::to_vec(&contents.doctors)
        .map_err(|e| CryptoError::Serialization(e.to_string()))?
        .len();
    Ok(sealed(patients) + sealed(doctors))
}

pub fn export_backup_json(backup: &Backup) -> Result<String, BackupError> {
    serde_json::to_string_pretty(backup)
        .map_err(|e| BackupError::InvalidFormat(format!("serialization failed: {e}")))
}

/// Parse and validate an exported backup.
pub fn import_backup_json(json: &str) -> Result<Backup, BackupError> {
    let backup: Backup =
        serde_json::from_str(json).map_err(|e| BackupError::InvalidFormat(e.to_string()))?;
    backup.validate()?;
    Ok(backup)
}

pub fn export_backup_to_file(backup: &Backup, path: &Path) -> Result<(), BackupError> {
    let json = export_backup_json(backup)?;
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent)?;
    let mut tmp = NamedTempFile::new_in(parent)?;
    tmp.write_all(json.as_bytes())?;
    tmp.flush()?;
    tmp.persist(path).map_err(|e| BackupError::Io(e.error))?;
    Ok(())
}

pub fn import_backup_from_file(path: &Path) -> Result<Backup, BackupError> {
    import_backup_json(&fs::read_to_string(path)?)
}

/// Creates, stores and restores backups in the `Backups` namespace.
pub struct BackupService<C: PersistentCache> {
    cache: Arc<C>,
    engine: EncryptionEngine,
    config: BackupConfig,
    // guards history read-modify-write
    history_lock: Mutex<()>,
}

impl<C: PersistentCache> BackupService<C> {
    pub fn new(cache: Arc<C>, engine: EncryptionEngine, config: BackupConfig) -> Self {
        Self {
            cache,
            engine,
            config,
            history_lock: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &BackupConfig {
        &self.config
    }

    #[instrument(skip_all, fields(trigger = %trigger))]
    pub async fn create_backup(
        &self,
        contents: &StoreContents,
        password: &str,
        trigger: BackupTrigger,
    ) -> Result<Backup, BackupError> {
        let engine = self.engine.clone();
        let contents = contents.clone();
        let password = zeroize::Zeroizing::new(password.to_string());
        let (patients, doctors) = tokio::task::spawn_blocking(move || {
            Ok::<_, CryptoError>((
                engine.encrypt(&contents.patients, &password)?,
                engine.encrypt(&contents.doctors, &password)?,
            ))
        })
        .await
        .map_err(|e| BackupError::Task(e.to_string()))??;

        let backup = Backup {
            id: Uuid::new_v4(),
            patients,
            doctors,
            created_at: Utc::now(),
            trigger,
            version: BACKUP_VERSION.to_string(),
        };
        self.store_backup(&backup).await?;
        self.mark_backed_up(backup.created_at).await?;
        info!(backup_id = %backup.id, "backup created");
        Ok(backup)
    }

    /// Decrypt a backup. Nothing is written.
    pub async fn restore_backup(
        &self,
        backup: &Backup,
        password: &str,
    ) -> Result<RestoredData, BackupError> {
        backup.validate()?;
        let engine = self.engine.clone();
        let backup = backup.clone();
        let password = zeroize::Zeroizing::new(password.to_string());
        let restored = tokio::task::spawn_blocking(move || {
            Ok::<_, CryptoError>(StoreContents {
                patients: engine.decrypt(&backup.patients, &password)?,
                doctors: engine.decrypt(&backup.doctors, &password)?,
            })
        })
        .await
        .map_err(|e| BackupError::Task(e.to_string()))??;
        Ok(restored)
    }

    pub async fn get_backup(&self, id: Uuid) -> Result<Backup, BackupError> {
        let bytes = get_optional(self.cache.as_ref(), Namespace::Backups, &id.to_string())
            .await?
            .ok_or(BackupError::NotFound(id))?;
        let backup: Backup = serde_json::from_slice(&bytes)
            .map_err(|e| BackupError::InvalidFormat(e.to_string()))?;
        Ok(backup)
    }

    pub async fn latest_backup(&self) -> Result<Option<Backup>, BackupError> {
        match self.history().await?.first() {
            Some(entry) => self.get_backup(entry.id).await.map(Some),
            None => Ok(None),
        }
    }

    /// Newest first.
    pub async fn history(&self) -> Result<Vec<BackupHistoryEntry>, BackupError> {
        let Some(bytes) = get_optional(self.cache.as_ref(), Namespace::Settings, HISTORY_KEY).await?
        else {
            return Ok(Vec::new());
        };
        Ok(serde_json::from_slice(&bytes).unwrap_or_else(|err| {
            warn!("backup history unreadable, treating as empty: {err}");
            Vec::new()
        }))
    }

    pub async fn delete_backup(&self, id: Uuid) -> Result<(), BackupError> {
        let _guard = self.history_lock.lock().await;
        let mut history = self.history().await?;
        let before = history.len();
        history.retain(|entry| entry.id != id);
        if history.len() == before {
            return Err(BackupError::NotFound(id));
        }
        self.cache.delete(Namespace::Backups, &id.to_string()).await?;
        self.write_history(&history).await
    }

    /// Keep the newest `keep` backups, deleting the rest. Returns how many were removed.
    pub async fn prune_history(&self, keep: usize) -> Result<usize, BackupError> {
        let _guard = self.history_lock.lock().await;
        let mut history = self.history().await?;
        let removed = self.prune_locked(&mut history, keep).await?;
        self.write_history(&history).await?;
        Ok(removed)
    }

    /// Validate and store an externally supplied backup so it shows up in history.
    pub async fn import_backup(&self, backup: Backup) -> Result<Backup, BackupError> {
        backup.validate()?;
        self.store_backup(&backup).await?;
        Ok(backup)
    }

    /// Persisted schedule with `enabled` and `interval_hours` taken from config.
    pub async fn auto_settings(&self) -> Result<AutoBackupSettings, BackupError> {
        let last_backup_at =
            match get_optional(self.cache.as_ref(), Namespace::Settings, AUTO_BACKUP_KEY).await? {
                Some(bytes) => serde_json::from_slice::<AutoBackupSettings>(&bytes)
                    .ok()
                    .and_then(|settings| settings.last_backup_at),
                None => None,
            };
        Ok(AutoBackupSettings {
            enabled: self.config.auto_backup,
            interval_hours: self.config.interval_hours,
            last_backup_at,
        })
    }

    pub async fn is_auto_backup_due(&self, now: DateTime<Utc>) -> Result<bool, BackupError> {
        Ok(is_backup_due(&self.auto_settings().await?, now))
    }

    async fn store_backup(&self, backup: &Backup) -> Result<(), BackupError> {
        let bytes = serde_json::to_vec(backup)
            .map_err(|e| BackupError::InvalidFormat(format!("serialization failed: {e}")))?;
        let _guard = self.history_lock.lock().await;
        self.cache
            .put(Namespace::Backups, &backup.id.to_string(), &bytes)
            .await?;

        // the backup just stored always survives pruning, even when it is older
        // than everything already kept
        let mut history = self.history().await?;
        history.retain(|entry| entry.id != backup.id);
        let keep_others = self.config.max_history.max(1) - 1;
        self.prune_locked(&mut history, keep_others).await?;
        history.push(BackupHistoryEntry {
            id: backup.id,
            timestamp: backup.created_at,
            size_estimate: backup.size_estimate(),
            trigger: backup.trigger,
        });
        history.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        self.write_history(&history).await
    }

    async fn prune_locked(
        &self,
        history: &mut Vec<BackupHistoryEntry>,
        keep: usize,
    ) -> Result<usize, BackupError> {
        if history.len() <= keep {
            return Ok(0);
        }
        let pruned = history.split_off(keep);
        for entry in &pruned {
            self.cache
                .delete(Namespace::Backups, &entry.id.to_string())
                .await?;
        }
        debug!(count = pruned.len(), "pruned old backups");
        Ok(pruned.len())
    }

    async fn write_history(&self, history: &[BackupHistoryEntry]) -> Result<(), BackupError> {
        let bytes = serde_json::to_vec(history)
            .map_err(|e| BackupError::InvalidFormat(format!("serialization failed: {e}")))?;
        self.cache.put(Namespace::Settings, HISTORY_KEY, &bytes).await?;
        Ok(())
    }

    async fn mark_backed_up(&self, at: DateTime<Utc>) -> Result<(), BackupError> {
        let mut settings = self.auto_settings().await?;
        settings.last_backup_at = Some(at);
        let bytes = serde_json::to_vec(&settings)
            .map_err(|e| BackupError::InvalidFormat(format!("serialization failed: {e}")))?;
        self.cache.put(Namespace::Settings, AUTO_BACKUP_KEY, &bytes).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use keeper_core::{
        cache::InMemoryCache,
        records::{Doctor, Patient},
    };

    use super::*;

    fn service(max_history: usize) -> BackupService<InMemoryCache> {
        BackupService::new(
            Arc::new(InMemoryCache::new()),
            EncryptionEngine::with_iterations(1_000),
            BackupConfig {
                max_history,
                ..BackupConfig::default()
            },
        )
    }

    fn contents() -> StoreContents {
        StoreContents {
            patients: vec![Patient::new("Ada")],
            doctors: vec![Doctor::new("Dr. Quinn")],
        }
    }

    #[tokio::test]
    async fn create_then_restore_round_trip() {
        let backups = service(10);
        let backup = backups
            .create_backup(&contents(), "pw", BackupTrigger::Manual)
            .await
            .expect("create");
        let restored = backups.restore_backup(&backup, "pw").await.expect("restore");
        assert_eq!(restored, contents());

        let err = backups.restore_backup(&backup, "nope").await.expect_err("wrong pw");
        assert!(matches!(err, BackupError::Crypto(CryptoError::Authentication)));
    }

    #[tokio::test]
    async fn history_is_newest_first_and_pruned() {
        let backups = service(2);
        let mut ids = Vec::new();
        for _ in 0..3 {
            let backup = backups
                .create_backup(&contents(), "pw", BackupTrigger::Auto)
                .await
                .unwrap();
            ids.push(backup.id);
        }
        let history = backups.history().await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].id, ids[2]);
        assert!(matches!(
            backups.get_backup(ids[0]).await,
            Err(BackupError::NotFound(_))
        ));
        assert_eq!(backups.latest_backup().await.unwrap().unwrap().id, ids[2]);

        assert_eq!(backups.prune_history(1).await.unwrap(), 1);
        backups.delete_backup(ids[2]).await.expect("delete");
        assert!(backups.latest_backup().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn imported_older_backup_survives_full_history() {
        let source = service(10);
        let older = source
            .create_backup(&contents(), "pw", BackupTrigger::Manual)
            .await
            .unwrap();

        let backups = service(2);
        for _ in 0..2 {
            backups
                .create_backup(&contents(), "pw", BackupTrigger::Auto)
                .await
                .unwrap();
        }
        let imported = backups.import_backup(older.clone()).await.expect("import");

        let history = backups.history().await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].id, older.id);
        assert_eq!(backups.get_backup(imported.id).await.unwrap(), older);
    }

    #[tokio::test]
    async fn zero_history_limit_still_keeps_the_new_backup() {
        let backups = service(0);
        let backup = backups
            .create_backup(&contents(), "pw", BackupTrigger::Manual)
            .await
            .unwrap();
        assert_eq!(backups.history().await.unwrap().len(), 1);
        assert!(backups.get_backup(backup.id).await.is_ok());
    }

    #[tokio::test]
    async fn export_import_via_file() {
        let backups = service(10);
        let backup = backups
            .create_backup(&contents(), "pw", BackupTrigger::Manual)
            .await
            .unwrap();
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("backup.json");
        export_backup_to_file(&backup, &path).expect("export");
        let imported = import_backup_from_file(&path).expect("import");
        assert_eq!(imported, backup);
    }

    #[test]
    fn import_rejects_bad_shapes() {
        assert!(matches!(
            import_backup_json("{\"id\": 1}"),
            Err(BackupError::InvalidFormat(_))
        ));
    }

    #[tokio::test]
    async fn import_rejects_unknown_version() {
        let backups = service(10);
        let mut backup = backups
            .create_backup(&contents(), "pw", BackupTrigger::Manual)
            .await
            .unwrap();
        backup.version = "9.9".into();
        let json = serde_json::to_string(&backup).unwrap();
        assert!(matches!(
            import_backup_json(&json),
            Err(BackupError::UnsupportedVersion { .. })
        ));
    }

    #[test]
    fn schedule_respects_interval() {
        let now = Utc::now();
        let mut settings = AutoBackupSettings {
            enabled: true,
            interval_hours: 24,
            last_backup_at: None,
        };
        assert!(is_backup_due(&settings, now));
        settings.last_backup_at = Some(now - Duration::hours(2));
        assert!(!is_backup_due(&settings, now));
        settings.last_backup_at = Some(now - Duration::hours(25));
        assert!(is_backup_due(&settings, now));
        settings.enabled = false;
        assert!(!is_backup_due(&settings, now));
    }

    #[tokio::test]
    async fn any_backup_resets_the_schedule() {
        let backups = service(10);
        assert!(backups.is_auto_backup_due(Utc::now()).await.unwrap());
        backups
            .create_backup(&contents(), "pw", BackupTrigger::Manual)
            .await
            .unwrap();
        assert!(!backups.is_auto_backup_due(Utc::now()).await.unwrap());
    }

    #[test]
    fn size_estimate_grows_with_contents() {
        let empty = estimate_backup_size(&StoreContents::default()).unwrap();
        let full = estimate_backup_size(&contents()).unwrap();
        assert!(full > empty);
    }
}

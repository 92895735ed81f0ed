use std::{
    fs::{self, File},
    io::{Read, Write},
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use keeper_core::cache::{CacheError, Namespace, PersistentCache, StorageEstimate, DEFAULT_QUOTA_BYTES};
use tempfile::NamedTempFile;
use tracing::{debug, info, instrument};

/// Current on-disk layout version.
pub const SCHEMA_VERSION: u32 = 1;

const SCHEMA_FILE: &str = "SCHEMA_VERSION";

/// Called once on open when the stored layout version is older than
/// [`SCHEMA_VERSION`]. `from` is 0 for a fresh directory.
pub type UpgradeHook = fn(root: &Path, from: u32, to: u32) -> Result<(), CacheError>;

/// Default hook: creates the namespace directories.
pub fn create_namespaces(root: &Path, _from: u32, _to: u32) -> Result<(), CacheError> {
    for namespace in Namespace::ALL {
        fs::create_dir_all(root.join(namespace.as_str())).map_err(storage_err)?;
    }
    Ok(())
}

/// File-backed persistent cache: one directory per namespace, one file per key.
/// Writes go through a temp file and an atomic rename so a crash never leaves a
/// half-written value behind.
#[derive(Debug, Clone)]
pub struct FileCache {
    root: PathBuf,
    quota: u64,
}

impl FileCache {
    /// Open (creating if needed) a cache rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, CacheError> {
        Self::open_with(root, DEFAULT_QUOTA_BYTES, create_namespaces)
    }

    pub fn open_with(
        root: impl Into<PathBuf>,
        quota: u64,
        upgrade: UpgradeHook,
    ) -> Result<Self, CacheError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(storage_err)?;

        let stored = read_schema_version(&root)?;
        if stored < SCHEMA_VERSION {
            info!(from = stored, to = SCHEMA_VERSION, ?root, "upgrading cache schema");
            upgrade(&root, stored, SCHEMA_VERSION)?;
            write_atomic(&root.join(SCHEMA_FILE), SCHEMA_VERSION.to_string().as_bytes())?;
        } else if stored > SCHEMA_VERSION {
            return Err(CacheError::Storage {
                reason: format!(
                    "cache schema {stored} is newer than supported {SCHEMA_VERSION}"
                ),
            });
        }

        Ok(Self { root, quota })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn namespace_dir(&self, namespace: Namespace) -> PathBuf {
        self.root.join(namespace.as_str())
    }

    fn path_for(&self, namespace: Namespace, key: &str) -> PathBuf {
        self.namespace_dir(namespace).join(sanitize_key(key))
    }

    fn used_bytes(&self) -> Result<u64, CacheError> {
        let mut used = 0;
        for namespace in Namespace::ALL {
            let dir = self.namespace_dir(namespace);
            if !dir.exists() {
                continue;
            }
            for entry in fs::read_dir(&dir).map_err(storage_err)? {
                let entry = entry.map_err(storage_err)?;
                used += entry.metadata().map_err(storage_err)?.len();
            }
        }
        Ok(used)
    }
}

#[async_trait]
impl PersistentCache for FileCache {
    #[instrument(skip_all, fields(namespace = %namespace, key = %key))]
    async fn put(&self, namespace: Namespace, key: &str, value: &[u8]) -> Result<(), CacheError> {
        let path = self.path_for(namespace, key);
        let replaced = fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
        let available = self
            .quota
            .saturating_sub(self.used_bytes()?.saturating_sub(replaced));
        let requested = value.len() as u64;
        if requested > available {
            return Err(CacheError::QuotaExceeded {
                requested,
                available,
            });
        }
        write_atomic(&path, value)
    }

    #[instrument(skip_all, fields(namespace = %namespace, key = %key))]
    async fn get(&self, namespace: Namespace, key: &str) -> Result<Vec<u8>, CacheError> {
        let path = self.path_for(namespace, key);
        let mut file = File::open(&path).map_err(|err| {
            if err.kind() == std::io::ErrorKind::NotFound {
                CacheError::NotFound {
                    namespace,
                    key: key.to_string(),
                }
            } else {
                storage_err(err)
            }
        })?;

        let mut buf = Vec::new();
        file.read_to_end(&mut buf).map_err(storage_err)?;
        Ok(buf)
    }

    #[instrument(skip_all, fields(namespace = %namespace, key = %key))]
    async fn delete(&self, namespace: Namespace, key: &str) -> Result<(), CacheError> {
        match fs::remove_file(self.path_for(namespace, key)) {
            Ok(_) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(storage_err(err)),
        }
    }

    async fn keys(&self, namespace: Namespace) -> Result<Vec<String>, CacheError> {
        let dir = self.namespace_dir(namespace);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut keys = Vec::new();
        for entry in fs::read_dir(&dir).map_err(storage_err)? {
            let entry = entry.map_err(storage_err)?;
            let name = entry.file_name();
            // stray temp files and foreign names are not ours
            if let Some(key) = name.to_str().and_then(unsanitize_key) {
                keys.push(key);
            }
        }
        keys.sort();
        Ok(keys)
    }

    #[instrument(skip_all, fields(namespace = %namespace))]
    async fn clear(&self, namespace: Namespace) -> Result<(), CacheError> {
        let dir = self.namespace_dir(namespace);
        match fs::remove_dir_all(&dir) {
            Ok(_) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(storage_err(err)),
        }
        fs::create_dir_all(&dir).map_err(storage_err)
    }

    async fn estimate(&self) -> Result<StorageEstimate, CacheError> {
        Ok(StorageEstimate::new(self.used_bytes()?, self.quota))
    }

    async fn request_persistence(&self) -> Result<bool, CacheError> {
        // Local files are not subject to host eviction; nothing to negotiate.
        debug!(root = ?self.root, "persistence requested for file cache");
        Ok(true)
    }
}

fn read_schema_version(root: &Path) -> Result<u32, CacheError> {
    match fs::read_to_string(root.join(SCHEMA_FILE)) {
        Ok(contents) => contents.trim().parse().map_err(|e| CacheError::Storage {
            reason: format!("invalid schema version file: {e}"),
        }),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(0),
        Err(err) => Err(storage_err(err)),
    }
}

fn write_atomic(path: &Path, value: &[u8]) -> Result<(), CacheError> {
    let parent = path.parent().ok_or_else(|| CacheError::Storage {
        reason: "invalid storage path".to_string(),
    })?;
    fs::create_dir_all(parent).map_err(storage_err)?;

    let mut tmp = NamedTempFile::new_in(parent).map_err(storage_err)?;
    tmp.write_all(value).map_err(storage_err)?;
    tmp.flush().map_err(storage_err)?;
    tmp.persist(path).map_err(|e| storage_err(e.error))?;
    Ok(())
}

fn sanitize_key(key: &str) -> String {
    format!("k_{}", URL_SAFE_NO_PAD.encode(key))
}

fn unsanitize_key(name: &str) -> Option<String> {
    let encoded = name.strip_prefix("k_")?;
    let bytes = URL_SAFE_NO_PAD.decode(encoded).ok()?;
    String::from_utf8(bytes).ok()
}

fn storage_err<E: ToString>(err: E) -> CacheError {
    CacheError::Storage {
        reason: err.to_string(),
    }
}

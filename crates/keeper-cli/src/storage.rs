use std::path::PathBuf;

use color_eyre::Result;
use dirs::data_dir;
use keeper_storage::{file_cache, FileCache};
use tracing::debug;

use crate::config::Config;

/// Resolve the default data directory.
pub fn default_data_dir() -> Result<PathBuf> {
    let base = data_dir().ok_or_else(|| color_eyre::eyre::eyre!("no data dir available"))?;
    Ok(base.join("health-keeper"))
}

/// Open the file-backed cache, honouring the config's data dir and quota.
pub fn cache_from_config(config: &Config) -> Result<FileCache> {
    let root = match &config.data_dir {
        Some(root) => root.clone(),
        None => default_data_dir()?,
    };
    debug!(?root, "opening data directory");
    Ok(FileCache::open_with(
        root,
        config.sync.storage_quota_bytes(),
        file_cache::create_namespaces,
    )?)
}

#[cfg(test)]
mod tests {
    use keeper_core::cache::{Namespace, PersistentCache};

    use super::*;

    #[tokio::test]
    async fn respects_data_dir_override() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = Config {
            data_dir: Some(dir.path().join("data")),
            ..Config::default()
        };
        let cache = cache_from_config(&config).expect("open");
        cache.put(Namespace::Settings, "probe", b"ok").await.unwrap();
        assert!(dir.path().join("data").join("settings").is_dir());
        assert_eq!(
            cache.estimate().await.unwrap().quota,
            50 * 1024 * 1024
        );
    }
}

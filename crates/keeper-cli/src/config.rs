use std::{
    fs,
    path::{Path, PathBuf},
};

use color_eyre::Result;
use dirs::config_dir;
use keeper_storage::{BackupConfig, SecurityConfig};
use keeper_sync::SyncConfig;
use serde::{Deserialize, Serialize};

/// User-level configuration loaded from `~/.config/health-keeper/config.toml`
/// (platform-specific). Never holds the store password.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    /// Override for the data directory.
    pub data_dir: Option<PathBuf>,
    pub security: SecurityConfig,
    pub backup: BackupConfig,
    pub sync: SyncConfig,
}

/// Load config from the default path; if missing, return defaults.
pub fn load() -> Result<Config> {
    let path = default_path()?;
    load_from_path(path)
}

/// Load config from a given path; if missing or empty, return defaults.
pub fn load_from_path(path: impl AsRef<Path>) -> Result<Config> {
    let path = path.as_ref();
    if !path.exists() {
        return Ok(Config::default());
    }
    let contents = fs::read_to_string(path)?;
    if contents.trim().is_empty() {
        return Ok(Config::default());
    }
    let cfg: Config = toml::from_str(&contents)?;
    Ok(cfg)
}

/// Resolve the default config path (platform aware).
pub fn default_path() -> Result<PathBuf> {
    let base = config_dir().ok_or_else(|| color_eyre::eyre::eyre!("no config dir available"))?;
    Ok(base.join("health-keeper").join("config.toml"))
}

/// Write `config` to the default path unless a file is already there.
pub fn write_default_if_missing(config: &Config) -> Result<PathBuf> {
    write_to_path_if_missing(config, &default_path()?)
}

fn write_to_path_if_missing(config: &Config, path: &Path) -> Result<PathBuf> {
    if path.exists() {
        return Ok(path.to_path_buf());
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let body = toml::to_string_pretty(config)?;
    fs::write(path, body)?;
    Ok(path.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn returns_default_when_missing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cfg = load_from_path(dir.path().join("config.toml")).expect("load");
        assert_eq!(cfg, Config::default());
        assert_eq!(cfg.security.pbkdf2_iterations, 100_000);
        assert_eq!(cfg.security.retention_days, 90);
        assert_eq!(cfg.sync.max_retry_attempts, 3);
        assert_eq!(cfg.backup.interval_hours, 24);
    }

    #[test]
    fn parses_partial_sections() {
        let contents = r#"
            data_dir = "/tmp/keeper-data"
            [security]
            max_failed_attempts = 3
            session_timeout_minutes = 0
            [sync]
            endpoint = "https://sync.example/api"
            token = "t0k"
            interval_secs = 120
        "#;
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.toml");
        fs::write(&path, contents).expect("write temp config");

        let cfg = load_from_path(&path).expect("load");
        assert_eq!(cfg.data_dir, Some(PathBuf::from("/tmp/keeper-data")));
        assert_eq!(
            cfg.security,
            SecurityConfig {
                max_failed_attempts: 3,
                session_timeout_minutes: 0,
                ..SecurityConfig::default()
            }
        );
        assert_eq!(cfg.backup, BackupConfig::default());
        assert_eq!(cfg.sync.endpoint.as_deref(), Some("https://sync.example/api"));
        assert_eq!(cfg.sync.interval_secs, 120);
        assert!(cfg.sync.auto_sync);
    }

    #[test]
    fn write_default_creates_file_once() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("config.toml");
        let cfg = Config {
            data_dir: Some(PathBuf::from("/tmp/keeper-data")),
            ..Config::default()
        };

        write_to_path_if_missing(&cfg, &path).expect("write should succeed");
        let other = Config::default();
        let second = write_to_path_if_missing(&other, &path).expect("second write ok");
        assert_eq!(second, path);
        assert_eq!(load_from_path(&path).expect("reload"), cfg);
    }
}

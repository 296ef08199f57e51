use std::{env, fmt, fs, path::PathBuf, str::FromStr};

use anyhow::Context;
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::logger::LogConfig;

pub const LOG_LEVEL_KEY: &str = "APPMANAGER_LOG_LEVEL";
pub const LOG_DIR_KEY: &str = "APPMANAGER_LOG_DIR";
pub const WORKER_THREADS_KEY: &str = "APPMANAGER_WORKER_THREADS";

/// A key/value configuration source.
#[async_trait]
pub trait ConfigManagerType: Send + Sync {
    async fn as_vec(&self) -> Vec<(String, String)> {
        let mut config = vec![];
        for key in self.keys().await {
            if let Some(value) = self.get(&key).await {
                config.push((key, value));
            }
        }
        config
    }
    async fn keys(&self) -> Vec<String>;
    async fn get(&self, key: &str) -> Option<String>;
    async fn del(&self, key: &str);
    async fn set(&self, key: &str, value: &str) -> anyhow::Result<()>;
    fn clone_box(&self) -> Box<dyn ConfigManagerType>;
    fn name(&self) -> String;
}

pub struct ConfigManager(pub Box<dyn ConfigManagerType>);

impl ConfigManager {
    pub fn into_inner(self) -> Box<dyn ConfigManagerType> {
        self.0
    }

    /// Typed lookup. Missing keys and unparsable values give `None`, the
    /// latter with a warning.
    pub async fn parsed<T: FromStr>(&self, key: &str) -> Option<T> {
        let raw = self.0.get(key).await?;
        match raw.trim().parse() {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(%key, value = %raw, "ignoring unparsable setting");
                None
            }
        }
    }
}

impl Clone for ConfigManager {
    fn clone(&self) -> Self {
        ConfigManager(self.0.clone_box())
    }
}

impl fmt::Debug for ConfigManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.name())
    }
}

/// Process environment, seeded from a `.env` file when one exists.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EnvConfigManager {
    env_file: PathBuf,
}

impl EnvConfigManager {
    pub fn new(env_file: PathBuf) -> Box<Self> {
        if env_file.exists() {
            match dotenvy::from_path(&env_file) {
                Ok(()) => info!("loaded settings from {}", env_file.display()),
                Err(e) => warn!("cannot read {}: {e}", env_file.display()),
            }
        } else {
            debug!("no {} found, using the environment only", env_file.display());
        }
        Box::new(Self { env_file })
    }

    /// Rewrite the `.env` file with `key` set to `value`, or removed.
    fn rewrite_env_file(&self, key: &str, value: Option<&str>) -> anyhow::Result<()> {
        let content = fs::read_to_string(&self.env_file).unwrap_or_default();
        let mut found = false;
        let mut lines: Vec<String> = Vec::new();
        for line in content.lines() {
            let is_key = line
                .split_once('=')
                .is_some_and(|(k, _)| k.trim() == key);
            if !is_key {
                lines.push(line.to_string());
                continue;
            }
            found = true;
            if let Some(value) = value {
                lines.push(format!("{key}={value}"));
            }
        }
        if let (false, Some(value)) = (found, value) {
            lines.push(format!("{key}={value}"));
        }
        fs::write(&self.env_file, lines.join("\n"))
            .with_context(|| format!("cannot write {}", self.env_file.display()))
    }
}

#[async_trait]
impl ConfigManagerType for EnvConfigManager {
    async fn keys(&self) -> Vec<String> {
        env::vars().map(|(k, _)| k).collect()
    }

    async fn get(&self, key: &str) -> Option<String> {
        env::var(key).ok()
    }

    async fn set(&self, key: &str, value: &str) -> anyhow::Result<()> {
        unsafe {
            env::set_var(key, value);
        };
        self.rewrite_env_file(key, Some(value))
    }

    async fn del(&self, key: &str) {
        unsafe {
            env::remove_var(key);
        };
        if self.env_file.exists() {
            if let Err(e) = self.rewrite_env_file(key, None) {
                warn!("{e:#}");
            }
        }
    }

    fn clone_box(&self) -> Box<dyn ConfigManagerType> {
        Box::new(self.clone())
    }

    fn name(&self) -> String {
        format!("EnvConfigManager({})", self.env_file.display())
    }
}

/// In-memory settings.
#[derive(Debug, Clone, Default)]
pub struct MapConfigManager {
    map: DashMap<String, String>,
}

impl MapConfigManager {
    pub fn new() -> Box<Self> {
        Box::new(Self::default())
    }

    pub fn with(self: Box<Self>, key: &str, value: &str) -> Box<Self> {
        self.map.insert(key.to_string(), value.to_string());
        self
    }
}

#[async_trait]
impl ConfigManagerType for MapConfigManager {
    async fn keys(&self) -> Vec<String> {
        self.map.iter().map(|entry| entry.key().clone()).collect()
    }

    async fn get(&self, key: &str) -> Option<String> {
        self.map.get(key).map(|v| v.clone())
    }

    async fn set(&self, key: &str, value: &str) -> anyhow::Result<()> {
        self.map.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn del(&self, key: &str) {
        self.map.remove(key);
    }

    fn clone_box(&self) -> Box<dyn ConfigManagerType> {
        Box::new(self.clone())
    }

    fn name(&self) -> String {
        format!("MapConfigManager({} entries)", self.map.len())
    }
}

/// Runtime settings of the `appmanager` binary.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppSettings {
    pub log: LogConfig,
    /// `None` lets tokio pick one thread per core.
    pub worker_threads: Option<usize>,
}

impl AppSettings {
    pub async fn load(config: &ConfigManager) -> Self {
        let defaults = Self::default();
        let level = config
            .0
            .get(LOG_LEVEL_KEY)
            .await
            .filter(|l| !l.trim().is_empty())
            .unwrap_or(defaults.log.level);
        let dir = config
            .0
            .get(LOG_DIR_KEY)
            .await
            .filter(|d| !d.trim().is_empty())
            .map(PathBuf::from);
        let worker_threads = config
            .parsed::<usize>(WORKER_THREADS_KEY)
            .await
            .filter(|n| *n > 0);

        Self {
            log: LogConfig::new(level, dir),
            worker_threads,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::write;
    use tempfile::tempdir;

    #[tokio::test]
    async fn map_config_set_get_del() {
        let mgr = MapConfigManager::new();

        mgr.set("foo", "bar").await.unwrap();
        assert_eq!(mgr.get("foo").await, Some("bar".to_string()));
        mgr.set("foo", "baz").await.unwrap();
        assert_eq!(mgr.get("foo").await, Some("baz".to_string()));
        assert_eq!(mgr.keys().await, vec!["foo".to_string()]);

        mgr.del("foo").await;
        assert_eq!(mgr.get("foo").await, None);
    }

    #[tokio::test]
    async fn map_config_as_vec() {
        let mgr = MapConfigManager::new().with("a", "1").with("b", "2");
        let mut config = mgr.as_vec().await;
        config.sort();
        assert_eq!(
            config,
            vec![
                ("a".to_string(), "1".to_string()),
                ("b".to_string(), "2".to_string())
            ]
        );
    }

    #[tokio::test]
    async fn env_config_reads_dotenv_file() {
        let dir = tempdir().unwrap();
        let env_path = dir.path().join(".env");
        write(&env_path, "APPMANAGER_TEST_DOTENV=abc123\n").unwrap();

        let mgr = EnvConfigManager::new(env_path);
        assert_eq!(
            mgr.get("APPMANAGER_TEST_DOTENV").await,
            Some("abc123".to_string())
        );
    }

    #[tokio::test]
    async fn env_config_set_and_delete_update_the_file() {
        let key = "APPMANAGER_TEST_SET_DEL";
        let dir = tempdir().unwrap();
        let env_path = dir.path().join(".env");
        write(&env_path, "OTHER=1\n").unwrap();

        let mgr = EnvConfigManager::new(env_path.clone());
        mgr.set(key, "on").await.unwrap();
        assert_eq!(std::env::var(key).ok(), Some("on".to_string()));
        assert!(fs::read_to_string(&env_path).unwrap().contains("APPMANAGER_TEST_SET_DEL=on"));

        mgr.del(key).await;
        assert_eq!(std::env::var(key).ok(), None);
        let content = fs::read_to_string(&env_path).unwrap();
        assert!(!content.contains(key));
        assert!(content.contains("OTHER=1"));
    }

    #[tokio::test]
    async fn settings_fall_back_to_defaults() {
        let config = ConfigManager(MapConfigManager::new());
        assert_eq!(AppSettings::load(&config).await, AppSettings::default());
    }

    #[tokio::test]
    async fn settings_are_read_from_config() {
        let config = ConfigManager(
            MapConfigManager::new()
                .with(LOG_LEVEL_KEY, "debug")
                .with(LOG_DIR_KEY, "/tmp/appmanager")
                .with(WORKER_THREADS_KEY, "2"),
        );
        let settings = AppSettings::load(&config).await;
        assert_eq!(settings.log.level, "debug");
        assert_eq!(settings.log.dir, Some(PathBuf::from("/tmp/appmanager")));
        assert_eq!(settings.worker_threads, Some(2));
    }

    #[tokio::test]
    async fn bad_worker_count_is_ignored() {
        let config = ConfigManager(MapConfigManager::new().with(WORKER_THREADS_KEY, "many"));
        assert_eq!(AppSettings::load(&config).await.worker_threads, None);
    }
}

use arc_swap::ArcSwap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast;

use super::AppConfig;
use crate::error::{AppError, Result};

/// Configuration store backed by a TOML file
///
/// Uses `ArcSwap` for lock-free reads; the capture loop and renderer read
/// configuration on every tick.
#[derive(Clone)]
pub struct ConfigStore {
    path: Option<PathBuf>,
    cache: Arc<ArcSwap<AppConfig>>,
    change_tx: broadcast::Sender<ConfigChange>,
}

/// Configuration change event
#[derive(Debug, Clone)]
pub struct ConfigChange {
    pub key: String,
}

impl ConfigStore {
    /// Load configuration from `path`, writing defaults if the file is missing
    pub async fn load(path: &Path) -> Result<Self> {
        let config = match tokio::fs::read_to_string(path).await {
            Ok(text) => toml::from_str(&text)
                .map_err(|e| AppError::Config(format!("{}: {}", path.display(), e)))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let config = AppConfig::default();
                Self::save_to_file(path, &config).await?;
                config
            }
            Err(e) => return Err(e.into()),
        };

        Ok(Self::with_path(Some(path.to_path_buf()), config))
    }

    fn with_path(path: Option<PathBuf>, config: AppConfig) -> Self {
        let (change_tx, _) = broadcast::channel(16);
        Self {
            path,
            cache: Arc::new(ArcSwap::from_pointee(config)),
            change_tx,
        }
    }

    async fn save_to_file(path: &Path, config: &AppConfig) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let text = toml::to_string_pretty(config)
            .map_err(|e| AppError::Config(format!("Failed to serialize config: {}", e)))?;
        tokio::fs::write(path, text).await?;
        Ok(())
    }

    async fn persist(&self, config: &AppConfig) -> Result<()> {
        match &self.path {
            Some(path) => Self::save_to_file(path, config).await,
            None => Ok(()),
        }
    }

    /// Get current configuration (lock-free)
    pub fn get(&self) -> Arc<AppConfig> {
        self.cache.load_full()
    }

    /// Update configuration with a closure
    ///
    /// Read-modify-write; concurrent updates are last-write-wins.
    pub async fn update<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut AppConfig),
    {
        let current = self.cache.load();
        let mut config = (**current).clone();
        f(&mut config);

        self.persist(&config).await?;
        self.cache.store(Arc::new(config));

        let _ = self.change_tx.send(ConfigChange {
            key: "app_config".to_string(),
        });

        Ok(())
    }

    /// Apply overrides to the cached configuration without persisting them
    pub fn override_with<F>(&self, f: F)
    where
        F: FnOnce(&mut AppConfig),
    {
        let mut config = (**self.cache.load()).clone();
        f(&mut config);
        self.cache.store(Arc::new(config));
    }

    /// Subscribe to configuration changes
    pub fn subscribe(&self) -> broadcast::Receiver<ConfigChange> {
        self.change_tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_config_store() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("vision-link.toml");

        let store = ConfigStore::load(&path).await.unwrap();
        assert!(path.exists());
        assert_eq!(store.get().capture.period_ms, 200);

        let mut changes = store.subscribe();
        store
            .update(|c| {
                c.capture.period_ms = 250;
                c.camera.device = Some("/dev/video2".to_string());
            })
            .await
            .unwrap();
        assert_eq!(changes.recv().await.unwrap().key, "app_config");

        let config = store.get();
        assert_eq!(config.capture.period_ms, 250);

        // Reload and verify persistence
        let store2 = ConfigStore::load(&path).await.unwrap();
        let config = store2.get();
        assert_eq!(config.capture.period_ms, 250);
        assert_eq!(config.camera.device.as_deref(), Some("/dev/video2"));
    }

    #[tokio::test]
    async fn test_overrides_are_not_persisted() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let store = ConfigStore::load(&path).await.unwrap();
        store.override_with(|c| c.server.base_url = "http://10.1.1.1:9000".to_string());
        assert_eq!(store.get().server.base_url, "http://10.1.1.1:9000");

        let reloaded = ConfigStore::load(&path).await.unwrap();
        assert_eq!(reloaded.get().server.base_url, "http://127.0.0.1:8000");
    }

    #[tokio::test]
    async fn test_invalid_file_is_config_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        tokio::fs::write(&path, "capture = 3").await.unwrap();

        let result = ConfigStore::load(&path).await;
        assert!(matches!(result, Err(AppError::Config(_))));
    }
}

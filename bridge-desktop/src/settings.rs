//! Settings Source backed by a JSON file

use async_trait::async_trait;
use bridge_traits::{
    error::{BridgeError, Result},
    settings::{
        LocalSettings, ProjectSyncSettings, SettingsDocument, SettingsSource, SystemSyncSettings,
    },
};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Reads sync settings from a JSON document on disk.
///
/// The file holds the three settings layers:
///
/// ```json
/// {
///   "system": { "enabled": true, "sites": { "gdrive": { "provider": "gdrive" } } },
///   "projects": { "P1": { "enabled": true, "config": { "remote_site": "gdrive" } } },
///   "local": { "default": { "active_site": "local" } }
/// }
/// ```
///
/// The file is re-read on every call; callers own caching.
pub struct JsonSettingsSource {
    path: PathBuf,
}

impl JsonSettingsSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `<config dir>/site-sync/settings.json`
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| {
                dirs::home_dir()
                    .unwrap_or_else(|| PathBuf::from("."))
                    .join(".config")
            })
            .join("site-sync")
            .join("settings.json")
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load(&self) -> Result<SettingsDocument> {
        let raw = match tokio::fs::read(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = ?self.path, "Settings file missing, using empty settings");
                return Ok(SettingsDocument::default());
            }
            Err(e) => return Err(BridgeError::Io(e)),
        };

        serde_json::from_slice(&raw).map_err(|e| {
            BridgeError::Settings(format!("Invalid settings file {}: {}", self.path.display(), e))
        })
    }
}

#[async_trait]
impl SettingsSource for JsonSettingsSource {
    async fn system_settings(&self) -> Result<SystemSyncSettings> {
        Ok(self.load().await?.system)
    }

    async fn project_names(&self) -> Result<Vec<String>> {
        Ok(self.load().await?.projects.into_keys().collect())
    }

    async fn project_settings(&self, project: &str) -> Result<Option<ProjectSyncSettings>> {
        Ok(self.load().await?.projects.remove(project))
    }

    async fn local_settings(&self) -> Result<LocalSettings> {
        Ok(self.load().await?.local)
    }
}

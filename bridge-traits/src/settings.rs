//! Sync Settings Surface
//!
//! Settings documents consumed by the sync engine and the [`SettingsSource`]
//! contract used to read them. Three layers exist:
//!
//! - **system**: studio-wide switch plus the catalogue of sites and their
//!   provider settings
//! - **project**: per-project switch, site overrides (roots) and loop config
//! - **local**: per-machine overrides (active/remote site, root remaps)
//!
//! Resolution and caching happen in the engine; a source only reads.

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Logical name of the studio's primary site.
pub const DEFAULT_SITE: &str = "studio";

/// Alias meaning "this machine's local site id".
pub const LOCAL_SITE_ALIAS: &str = "local";

/// Provider code of plain disk storage.
pub const LOCAL_DRIVE_PROVIDER: &str = "local_drive";

fn default_provider() -> String {
    LOCAL_DRIVE_PROVIDER.to_string()
}

fn default_site() -> String {
    DEFAULT_SITE.to_string()
}

fn default_retry_cnt() -> u32 {
    3
}

fn default_loop_delay() -> u64 {
    60
}

fn default_true() -> bool {
    true
}

/// Studio-wide sync settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SystemSyncSettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub sites: BTreeMap<String, SiteConfig>,
}

/// Configuration of one site.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SiteConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Root name to physical path.
    #[serde(default)]
    pub root: BTreeMap<String, String>,
    /// Sites sharing the same physical storage under another name.
    #[serde(default)]
    pub alternative_sites: Vec<String>,
    /// Provider specific keys (credentials, folders, ...).
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl Default for SiteConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            enabled: true,
            root: BTreeMap::new(),
            alternative_sites: Vec::new(),
            extra: BTreeMap::new(),
        }
    }
}

impl SiteConfig {
    pub fn local_drive(root: BTreeMap<String, String>) -> Self {
        Self {
            root,
            ..Self::default()
        }
    }

    /// Overlay `other` onto `self`; non-empty values of `other` win.
    pub fn merge(&mut self, other: &SiteConfig) {
        if other.provider != LOCAL_DRIVE_PROVIDER || self.provider.is_empty() {
            self.provider = other.provider.clone();
        }
        self.enabled = self.enabled && other.enabled;
        for (name, path) in &other.root {
            self.root.insert(name.clone(), path.clone());
        }
        for alternative in &other.alternative_sites {
            if !self.alternative_sites.contains(alternative) {
                self.alternative_sites.push(alternative.clone());
            }
        }
        for (key, value) in &other.extra {
            self.extra.insert(key.clone(), value.clone());
        }
    }
}

/// Loop and site selection settings of one project.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectSyncConfig {
    #[serde(default = "default_site")]
    pub active_site: String,
    #[serde(default = "default_site")]
    pub remote_site: String,
    #[serde(default = "default_retry_cnt")]
    pub retry_cnt: u32,
    /// Seconds between two iterations for this project.
    #[serde(default = "default_loop_delay")]
    pub loop_delay: u64,
    /// Sites every newly published representation is attached to.
    #[serde(default)]
    pub always_accessible_on: Vec<String>,
}

impl Default for ProjectSyncConfig {
    fn default() -> Self {
        Self {
            active_site: default_site(),
            remote_site: default_site(),
            retry_cnt: default_retry_cnt(),
            loop_delay: default_loop_delay(),
            always_accessible_on: Vec::new(),
        }
    }
}

/// Per-project sync settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProjectSyncSettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub config: ProjectSyncConfig,
    #[serde(default)]
    pub sites: BTreeMap<String, SiteConfig>,
    /// Project anatomy roots, used by the synthesized `studio` site.
    #[serde(default)]
    pub roots: BTreeMap<String, String>,
}

/// Machine-local overrides for one project.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LocalProjectOverrides {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_site: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_site: Option<String>,
    /// Site name to root remapping.
    #[serde(default)]
    pub roots: BTreeMap<String, BTreeMap<String, String>>,
}

/// Machine-local settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LocalSettings {
    /// Overrides applied to every project.
    #[serde(default)]
    pub default: LocalProjectOverrides,
    #[serde(default)]
    pub projects: BTreeMap<String, LocalProjectOverrides>,
}

impl LocalSettings {
    /// Effective overrides for `project`, project values winning over defaults.
    pub fn for_project(&self, project: &str) -> LocalProjectOverrides {
        let mut merged = self.default.clone();
        if let Some(overrides) = self.projects.get(project) {
            if overrides.active_site.is_some() {
                merged.active_site = overrides.active_site.clone();
            }
            if overrides.remote_site.is_some() {
                merged.remote_site = overrides.remote_site.clone();
            }
            for (site, roots) in &overrides.roots {
                merged
                    .roots
                    .entry(site.clone())
                    .or_default()
                    .extend(roots.clone());
            }
        }
        merged
    }
}

/// Read access to the settings layers.
#[async_trait]
pub trait SettingsSource: Send + Sync {
    async fn system_settings(&self) -> Result<SystemSyncSettings>;

    /// Names of every known project, enabled or not.
    async fn project_names(&self) -> Result<Vec<String>>;

    /// Settings of `project`, `None` when the project is unknown.
    async fn project_settings(&self, project: &str) -> Result<Option<ProjectSyncSettings>>;

    async fn local_settings(&self) -> Result<LocalSettings>;
}

/// All settings layers held in memory.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SettingsDocument {
    #[serde(default)]
    pub system: SystemSyncSettings,
    #[serde(default)]
    pub projects: BTreeMap<String, ProjectSyncSettings>,
    #[serde(default)]
    pub local: LocalSettings,
}

#[async_trait]
impl SettingsSource for SettingsDocument {
    async fn system_settings(&self) -> Result<SystemSyncSettings> {
        Ok(self.system.clone())
    }

    async fn project_names(&self) -> Result<Vec<String>> {
        Ok(self.projects.keys().cloned().collect())
    }

    async fn project_settings(&self, project: &str) -> Result<Option<ProjectSyncSettings>> {
        Ok(self.projects.get(project).cloned())
    }

    async fn local_settings(&self) -> Result<LocalSettings> {
        Ok(self.local.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_project_settings_defaults() {
        let settings: ProjectSyncSettings =
            serde_json::from_str(r#"{"enabled": true}"#).unwrap();

        assert!(settings.enabled);
        assert_eq!(settings.config.active_site, "studio");
        assert_eq!(settings.config.remote_site, "studio");
        assert_eq!(settings.config.retry_cnt, 3);
        assert_eq!(settings.config.loop_delay, 60);
        assert!(settings.sites.is_empty());
    }

    #[test]
    fn test_site_config_keeps_provider_keys() {
        let site: SiteConfig = serde_json::from_str(
            r#"{
                "provider": "gdrive",
                "credentials_url": "/secrets/gdrive.json",
                "root": {"work": "/Projects"},
                "alternative_sites": ["sftp"]
            }"#,
        )
        .unwrap();

        assert_eq!(site.provider, "gdrive");
        assert!(site.enabled);
        assert_eq!(site.root.get("work").unwrap(), "/Projects");
        assert_eq!(site.alternative_sites, vec!["sftp".to_string()]);
        assert_eq!(
            site.extra.get("credentials_url").unwrap(),
            &serde_json::json!("/secrets/gdrive.json")
        );
    }

    #[test]
    fn test_site_config_merge_overlays_roots() {
        let mut base = SiteConfig {
            provider: "sftp".to_string(),
            alternative_sites: vec!["studio".to_string()],
            ..SiteConfig::default()
        };
        let mut project = SiteConfig::default();
        project.root.insert("work".to_string(), "/srv/work".to_string());

        base.merge(&project);

        assert_eq!(base.provider, "sftp");
        assert_eq!(base.root.get("work").unwrap(), "/srv/work");
        assert_eq!(base.alternative_sites, vec!["studio".to_string()]);
    }

    #[test]
    fn test_local_overrides_project_wins() {
        let local: LocalSettings = serde_json::from_str(
            r#"{
                "default": {"active_site": "local", "roots": {"local": {"work": "C:/work"}}},
                "projects": {"P1": {"active_site": "studio", "roots": {"local": {"publish": "C:/pub"}}}}
            }"#,
        )
        .unwrap();

        let p1 = local.for_project("P1");
        assert_eq!(p1.active_site.as_deref(), Some("studio"));
        let roots = p1.roots.get("local").unwrap();
        assert_eq!(roots.get("work").unwrap(), "C:/work");
        assert_eq!(roots.get("publish").unwrap(), "C:/pub");

        let other = local.for_project("P2");
        assert_eq!(other.active_site.as_deref(), Some("local"));
    }

    #[tokio::test]
    async fn test_settings_document_source() {
        let mut document = SettingsDocument::default();
        document
            .projects
            .insert("P1".to_string(), ProjectSyncSettings::default());

        assert_eq!(document.project_names().await.unwrap(), vec!["P1"]);
        assert!(document.project_settings("P1").await.unwrap().is_some());
        assert!(document.project_settings("missing").await.unwrap().is_none());
    }
}

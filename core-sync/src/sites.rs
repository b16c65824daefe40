//! # Site Configuration Resolver
//!
//! Turns the three settings layers (system, project, local) into the sites a
//! project syncs between and the provider settings of each site.
//!
//! ## Overview
//!
//! Settings are read through a [`SettingsSource`] and cached as one snapshot
//! owned by the resolver. The snapshot expires after `ttl` or when
//! [`SiteResolver::invalidate`] is called.
//!
//! Missing or incomplete settings resolve to empty results (or the `studio`
//! default) instead of errors. Only a failing settings source surfaces as
//! [`SyncError::Settings`], which the loop treats as retryable.

use crate::model::SiteSkeleton;
use crate::{Result, SyncError};
use bridge_traits::settings::{
    LocalSettings, ProjectSyncConfig, ProjectSyncSettings, SettingsSource, SiteConfig,
    SystemSyncSettings, DEFAULT_SITE, LOCAL_SITE_ALIAS,
};
use bridge_traits::Clock;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Site name to the set of sites sharing its physical storage.
pub type AlternateSites = BTreeMap<String, BTreeSet<String>>;

/// Cached copy of every settings layer.
#[derive(Debug)]
struct SettingsSnapshot {
    loaded_at: Instant,
    system: SystemSyncSettings,
    local: LocalSettings,
    projects: BTreeMap<String, ProjectSyncSettings>,
}

impl SettingsSnapshot {
    fn project_enabled(&self, project: &str) -> Option<&ProjectSyncSettings> {
        if !self.system.enabled {
            return None;
        }
        self.projects.get(project).filter(|settings| settings.enabled)
    }
}

/// Fully resolved sync settings of one enabled project.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedProject {
    pub name: String,
    /// Active site with the `local` alias already substituted
    pub active_site: String,
    /// Remote site with the `local` alias already substituted
    pub remote_site: String,
    pub config: ProjectSyncConfig,
    /// Every enabled site with merged provider settings
    pub sites: BTreeMap<String, SiteConfig>,
}

impl ResolvedProject {
    pub fn loop_delay(&self) -> Duration {
        Duration::from_secs(self.config.loop_delay.max(1))
    }

    pub fn site(&self, name: &str) -> Option<&SiteConfig> {
        self.sites.get(name)
    }

    pub fn is_configured(&self, name: &str) -> bool {
        self.sites.contains_key(name)
    }

    pub fn alternate_sites(&self) -> AlternateSites {
        alternate_site_pairs(&self.sites)
    }
}

/// Resolves project sync settings with a TTL cache.
pub struct SiteResolver {
    source: Arc<dyn SettingsSource>,
    local_site_id: String,
    clock: Arc<dyn Clock>,
    ttl: Duration,
    cache: RwLock<Option<Arc<SettingsSnapshot>>>,
}

impl SiteResolver {
    pub fn new(
        source: Arc<dyn SettingsSource>,
        local_site_id: impl Into<String>,
        clock: Arc<dyn Clock>,
        ttl: Duration,
    ) -> Self {
        Self {
            source,
            local_site_id: local_site_id.into(),
            clock,
            ttl,
            cache: RwLock::new(None),
        }
    }

    /// Site id of this machine.
    pub fn local_site_id(&self) -> &str {
        &self.local_site_id
    }

    /// Drop the cached snapshot; the next call re-reads every layer.
    pub async fn invalidate(&self) {
        *self.cache.write().await = None;
        debug!("Settings cache invalidated");
    }

    async fn snapshot(&self) -> Result<Arc<SettingsSnapshot>> {
        if let Some(snapshot) = self.cache.read().await.as_ref() {
            if snapshot.loaded_at.elapsed() < self.ttl {
                return Ok(Arc::clone(snapshot));
            }
        }

        let mut cache = self.cache.write().await;
        if let Some(snapshot) = cache.as_ref() {
            if snapshot.loaded_at.elapsed() < self.ttl {
                return Ok(Arc::clone(snapshot));
            }
        }

        let snapshot = Arc::new(self.load().await?);
        *cache = Some(Arc::clone(&snapshot));
        Ok(snapshot)
    }

    async fn load(&self) -> Result<SettingsSnapshot> {
        let settings_error = |e: bridge_traits::BridgeError| SyncError::Settings(e.to_string());

        let system = self.source.system_settings().await.map_err(settings_error)?;
        let local = self.source.local_settings().await.map_err(settings_error)?;

        let mut projects = BTreeMap::new();
        for name in self.source.project_names().await.map_err(settings_error)? {
            match self.source.project_settings(&name).await.map_err(settings_error)? {
                Some(settings) => {
                    projects.insert(name, settings);
                }
                None => warn!(project = %name, "Project listed without settings"),
            }
        }

        debug!(
            enabled = system.enabled,
            projects = projects.len(),
            "Loaded sync settings"
        );

        Ok(SettingsSnapshot {
            loaded_at: Instant::now(),
            system,
            local,
            projects,
        })
    }

    fn normalize(&self, site: &str) -> String {
        if site == LOCAL_SITE_ALIAS {
            self.local_site_id.clone()
        } else {
            site.to_string()
        }
    }

    // ========================================================================
    // Site selection
    // ========================================================================

    /// Site this machine treats as the source of truth for `project`.
    ///
    /// Local overrides win over project config. Projects without enabled
    /// sync resolve to `studio`.
    pub async fn get_active_site(&self, project: &str) -> Result<String> {
        let snapshot = self.snapshot().await?;
        Ok(self.active_site_of(&snapshot, project))
    }

    /// Sync target of `project`, resolved like [`Self::get_active_site`].
    pub async fn get_remote_site(&self, project: &str) -> Result<String> {
        let snapshot = self.snapshot().await?;
        Ok(self.remote_site_of(&snapshot, project))
    }

    fn active_site_of(&self, snapshot: &SettingsSnapshot, project: &str) -> String {
        let Some(settings) = snapshot.project_enabled(project) else {
            return DEFAULT_SITE.to_string();
        };
        let overrides = snapshot.local.for_project(project);
        let site = overrides
            .active_site
            .unwrap_or_else(|| settings.config.active_site.clone());
        self.normalize(&site)
    }

    fn remote_site_of(&self, snapshot: &SettingsSnapshot, project: &str) -> String {
        let Some(settings) = snapshot.project_enabled(project) else {
            return DEFAULT_SITE.to_string();
        };
        let overrides = snapshot.local.for_project(project);
        let site = overrides
            .remote_site
            .unwrap_or_else(|| settings.config.remote_site.clone());
        self.normalize(&site)
    }

    /// Whether studio and project both enable sync for `project`.
    pub async fn is_project_enabled(&self, project: &str) -> Result<bool> {
        let snapshot = self.snapshot().await?;
        Ok(snapshot.project_enabled(project).is_some())
    }

    /// Projects with sync enabled, empty when studio sync is off.
    pub async fn get_enabled_projects(&self) -> Result<Vec<String>> {
        let snapshot = self.snapshot().await?;
        Ok(snapshot
            .projects
            .keys()
            .filter(|name| snapshot.project_enabled(name).is_some())
            .cloned()
            .collect())
    }

    /// Resolved settings of an enabled project.
    pub async fn get_sync_project_setting(&self, project: &str) -> Result<Option<ResolvedProject>> {
        let snapshot = self.snapshot().await?;
        let Some(settings) = snapshot.project_enabled(project) else {
            return Ok(None);
        };

        let mut config = settings.config.clone();
        config.always_accessible_on = config
            .always_accessible_on
            .iter()
            .map(|site| self.normalize(site.trim()))
            .collect();

        Ok(Some(ResolvedProject {
            name: project.to_string(),
            active_site: self.active_site_of(&snapshot, project),
            remote_site: self.remote_site_of(&snapshot, project),
            config,
            sites: self.site_configs_of(&snapshot, Some(project)),
        }))
    }

    // ========================================================================
    // Site catalogue
    // ========================================================================

    /// Merged provider settings of every enabled site.
    ///
    /// Always contains a synthesized `studio` disk site using the project
    /// anatomy roots, and this machine's local site.
    pub async fn get_all_site_configs(
        &self,
        project: Option<&str>,
    ) -> Result<BTreeMap<String, SiteConfig>> {
        let snapshot = self.snapshot().await?;
        Ok(self.site_configs_of(&snapshot, project))
    }

    fn site_configs_of(
        &self,
        snapshot: &SettingsSnapshot,
        project: Option<&str>,
    ) -> BTreeMap<String, SiteConfig> {
        let project_settings = project.and_then(|name| snapshot.projects.get(name));
        let anatomy_roots = project_settings
            .map(|settings| settings.roots.clone())
            .unwrap_or_default();

        let mut sites = BTreeMap::new();
        sites.insert(
            DEFAULT_SITE.to_string(),
            SiteConfig::local_drive(anatomy_roots.clone()),
        );
        sites.insert(
            self.local_site_id.clone(),
            SiteConfig::local_drive(anatomy_roots),
        );

        for (name, config) in &snapshot.system.sites {
            sites
                .entry(self.normalize(name))
                .and_modify(|site: &mut SiteConfig| site.merge(config))
                .or_insert_with(|| config.clone());
        }

        if let Some(settings) = project_settings {
            for (name, config) in &settings.sites {
                sites
                    .entry(self.normalize(name))
                    .and_modify(|site: &mut SiteConfig| site.merge(config))
                    .or_insert_with(|| config.clone());
            }
        }

        let overrides = match project {
            Some(project) => snapshot.local.for_project(project),
            None => snapshot.local.default.clone(),
        };
        for (name, roots) in overrides.roots {
            if let Some(site) = sites.get_mut(&self.normalize(&name)) {
                site.root.extend(roots);
            }
        }

        for site in sites.values_mut() {
            site.alternative_sites = site
                .alternative_sites
                .iter()
                .map(|alternative| self.normalize(alternative))
                .collect();
        }

        sites.retain(|_, site| site.enabled);
        sites
    }

    /// Names of every enabled site of `project`.
    pub async fn get_configured_sites(&self, project: &str) -> Result<BTreeSet<String>> {
        Ok(self
            .get_all_site_configs(Some(project))
            .await?
            .into_keys()
            .collect())
    }

    /// Sites this machine can act as: `studio` and its own site id.
    pub async fn get_active_sites(&self, project: &str) -> Result<Vec<String>> {
        let mut sites = vec![DEFAULT_SITE.to_string()];
        if self.is_project_enabled(project).await? && self.local_site_id != DEFAULT_SITE {
            sites.push(self.local_site_id.clone());
        }
        Ok(sites)
    }

    /// Sites usable as a sync target: every configured site except the
    /// machine-local ones.
    pub async fn get_remote_sites(&self, project: &str) -> Result<Vec<String>> {
        if !self.is_project_enabled(project).await? {
            return Ok(vec![DEFAULT_SITE.to_string()]);
        }
        let configured = self.get_configured_sites(project).await?;
        let mut sites: Vec<String> = configured
            .into_iter()
            .filter(|site| site != &self.local_site_id)
            .collect();
        // studio first
        sites.sort_by_key(|site| (site.as_str() != DEFAULT_SITE, site.clone()));
        Ok(sites)
    }

    /// Site records to attach to a newly published representation.
    ///
    /// The active site and its alternates are marked created; the remote
    /// site, its alternates and `always_accessible_on` sites are attached
    /// empty. Without enabled sync only `studio` is attached.
    pub async fn compute_resource_sync_sites(&self, project: &str) -> Result<Vec<SiteSkeleton>> {
        let now = self.clock.now();
        let Some(resolved) = self.get_sync_project_setting(project).await? else {
            return Ok(vec![SiteSkeleton {
                name: DEFAULT_SITE.to_string(),
                created_dt: Some(now),
            }]);
        };

        let alternates = resolved.alternate_sites();
        let mut skeletons: Vec<SiteSkeleton> = Vec::new();
        let mut push = |name: &str, created: bool| {
            if !skeletons.iter().any(|skeleton| skeleton.name == name) {
                skeletons.push(SiteSkeleton {
                    name: name.to_string(),
                    created_dt: created.then_some(now),
                });
            }
        };

        push(&resolved.active_site, true);
        for alternate in alternates.get(&resolved.active_site).into_iter().flatten() {
            push(alternate, true);
        }

        if resolved.remote_site != resolved.active_site {
            push(&resolved.remote_site, false);
            for alternate in alternates.get(&resolved.remote_site).into_iter().flatten() {
                push(alternate, false);
            }
        }

        for site in &resolved.config.always_accessible_on {
            if !site.is_empty() {
                push(site, false);
            }
        }

        Ok(skeletons)
    }
}

/// Symmetric, transitive closure of `alternative_sites`.
///
/// If A lists B then B is an alternate of A and A of B, and every alternate
/// of either is an alternate of both. A site is never its own alternate.
pub fn alternate_site_pairs(sites: &BTreeMap<String, SiteConfig>) -> AlternateSites {
    let mut edges: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
    for (name, config) in sites {
        for alternative in &config.alternative_sites {
            if alternative == name {
                continue;
            }
            edges
                .entry(name.as_str())
                .or_default()
                .insert(alternative.as_str());
            edges
                .entry(alternative.as_str())
                .or_default()
                .insert(name.as_str());
        }
    }

    let mut pairs = AlternateSites::new();
    for &start in edges.keys() {
        let mut visited: BTreeSet<&str> = BTreeSet::from([start]);
        let mut queue: VecDeque<&str> = VecDeque::from([start]);

        while let Some(site) = queue.pop_front() {
            for &next in edges.get(site).into_iter().flatten() {
                if visited.insert(next) {
                    queue.push_back(next);
                }
            }
        }

        visited.remove(start);
        pairs.insert(
            start.to_string(),
            visited.into_iter().map(str::to_string).collect(),
        );
    }
    pairs
}

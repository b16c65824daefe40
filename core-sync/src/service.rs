//! # Site Sync Facade
//!
//! Management operations on site records and the running server, as used
//! by hosts, the REST control surface and publishing tools.
//!
//! Site names accept the `local` alias everywhere; it resolves to this
//! machine's site id.

use crate::model::{FileId, Representation, RepresentationId, SiteRecord, SiteSkeleton};
use crate::repository::{RepresentationRepository, SiteTarget, SiteUpdate};
use crate::server::SyncServer;
use crate::sites::SiteResolver;
use crate::{Result, SyncError};
use bridge_traits::provider::fill_roots;
use bridge_traits::LOCAL_SITE_ALIAS;
use core_runtime::config::{MAX_PRIORITY, MIN_PRIORITY};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Which site of a project's pair an operation addresses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SiteSelector {
    /// The project's active site
    Local,
    /// The project's remote site
    Remote,
    /// A site by name
    Named(String),
}

impl SiteSelector {
    /// Parse `local` / `remote` sides, anything else is a site name.
    pub fn parse(value: &str) -> Self {
        match value {
            "local" => SiteSelector::Local,
            "remote" => SiteSelector::Remote,
            other => SiteSelector::Named(other.to_string()),
        }
    }
}

/// Entry point for everything that manipulates sync state.
pub struct SiteSync {
    repository: Arc<dyn RepresentationRepository>,
    resolver: Arc<SiteResolver>,
    server: Arc<SyncServer>,
}

impl SiteSync {
    pub fn new(
        repository: Arc<dyn RepresentationRepository>,
        resolver: Arc<SiteResolver>,
        server: Arc<SyncServer>,
    ) -> Self {
        Self {
            repository,
            resolver,
            server,
        }
    }

    pub fn server(&self) -> &Arc<SyncServer> {
        &self.server
    }

    pub fn resolver(&self) -> &Arc<SiteResolver> {
        &self.resolver
    }

    fn site_name(&self, site: &str) -> String {
        if site == LOCAL_SITE_ALIAS {
            self.resolver.local_site_id().to_string()
        } else {
            site.to_string()
        }
    }

    async fn select_site(&self, project: &str, selector: &SiteSelector) -> Result<String> {
        match selector {
            SiteSelector::Local => self.resolver.get_active_site(project).await,
            SiteSelector::Remote => self.resolver.get_remote_site(project).await,
            SiteSelector::Named(site) => Ok(self.site_name(site)),
        }
    }

    // ========================================================================
    // Representations
    // ========================================================================

    /// Store a newly published representation, attaching the project's
    /// initial site records to every file that lacks them.
    #[instrument(skip(self, representation), fields(project = %representation.project))]
    pub async fn add_representation(&self, mut representation: Representation) -> Result<Representation> {
        let skeletons: Vec<SiteSkeleton> = self
            .resolver
            .compute_resource_sync_sites(&representation.project)
            .await?;

        for file in &mut representation.files {
            for skeleton in &skeletons {
                if file.site(&skeleton.name).is_none() {
                    file.sites.push(SiteRecord::from(skeleton.clone()));
                }
            }
        }

        self.repository.insert(&representation).await?;
        debug!(id = %representation.id, sites = skeletons.len(), "Representation registered");
        Ok(representation)
    }

    pub async fn get_representation(
        &self,
        project: &str,
        id: &RepresentationId,
    ) -> Result<Representation> {
        self.repository
            .find_by_id(project, id)
            .await?
            .ok_or_else(|| SyncError::RepresentationNotFound {
                id: id.to_string(),
                project: project.to_string(),
            })
    }

    // ========================================================================
    // Site records
    // ========================================================================

    /// Attach `site` to one file or every file of a representation.
    ///
    /// # Errors
    ///
    /// `SiteAlreadyPresent` when a record exists and `force` is not set.
    /// With `force` the existing record is reset so the file syncs again.
    pub async fn add_site(
        &self,
        project: &str,
        representation_id: &RepresentationId,
        site: &str,
        file_id: Option<&FileId>,
        force: bool,
    ) -> Result<()> {
        let target = SiteTarget::new(
            project,
            representation_id.clone(),
            file_id.cloned(),
            self.site_name(site),
        );
        self.repository.add_site(&target, force).await?;
        info!(project = %project, site = %target.site, force, "Site added to representation");
        Ok(())
    }

    /// Detach `site` from every file of a representation.
    ///
    /// With `remove_local_files` and `site` being this machine, the physical
    /// files under the site's roots are deleted too, after the records are
    /// gone. Nothing is touched on disk when the site is not attached.
    pub async fn remove_site(
        &self,
        project: &str,
        representation_id: &RepresentationId,
        site: &str,
        remove_local_files: bool,
    ) -> Result<()> {
        let site = self.site_name(site);
        let representation = self.get_representation(project, representation_id).await?;
        if !representation.files.iter().any(|file| file.site(&site).is_some()) {
            return Err(SyncError::SiteNotFound { site });
        }

        let target = SiteTarget::new(project, representation_id.clone(), None, site.as_str());
        let removed = self.repository.remove_site(&target).await?;
        info!(project = %project, site = %site, removed, "Site removed from representation");

        if remove_local_files && site == self.resolver.local_site_id() {
            self.remove_local_files(project, &representation, &site)
                .await?;
        }
        Ok(())
    }

    async fn remove_local_files(
        &self,
        project: &str,
        representation: &Representation,
        site: &str,
    ) -> Result<()> {
        let sites = self.resolver.get_all_site_configs(Some(project)).await?;
        let roots = sites
            .get(site)
            .map(|config| config.root.clone())
            .unwrap_or_default();

        for file in &representation.files {
            let path = fill_roots(&file.path, &roots, site)?;
            match tokio::fs::remove_file(&path).await {
                Ok(()) => debug!(path = %path, "Removed local file"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    warn!(path = %path, error = %e, "Failed to remove local file");
                    return Err(SyncError::Provider(e.into()));
                }
            }
        }
        Ok(())
    }

    /// Remove `site` from every representation of `project`.
    pub async fn clear_project(&self, project: &str, site: &str) -> Result<u64> {
        let site = self.site_name(site);
        let removed = self
            .repository
            .remove_site_from_project(project, &site)
            .await?;
        info!(project = %project, site = %site, removed, "Site cleared from project");
        Ok(removed)
    }

    /// Clear availability and failures so the file is synced again.
    pub async fn reset_site_on_representation(
        &self,
        project: &str,
        representation_id: &RepresentationId,
        selector: &SiteSelector,
        file_id: Option<&FileId>,
    ) -> Result<()> {
        let site = self.select_site(project, selector).await?;
        let target = SiteTarget::new(project, representation_id.clone(), file_id.cloned(), site);
        let reset = self.repository.reset_site(&target).await?;
        info!(project = %project, site = %target.site, reset, "Site reset");
        self.server.reset_timer();
        Ok(())
    }

    /// Override the sync priority of one file or of every file.
    ///
    /// `None` restores the project default.
    pub async fn set_priority(
        &self,
        project: &str,
        representation_id: &RepresentationId,
        site: &str,
        file_id: Option<&FileId>,
        priority: Option<i64>,
    ) -> Result<()> {
        if let Some(value) = priority {
            if !(MIN_PRIORITY..=MAX_PRIORITY).contains(&value) {
                return Err(SyncError::InvalidArgument(format!(
                    "Priority {} outside {}..={}",
                    value, MIN_PRIORITY, MAX_PRIORITY
                )));
            }
        }

        let target = SiteTarget::new(
            project,
            representation_id.clone(),
            file_id.cloned(),
            self.site_name(site),
        );
        self.repository
            .apply_site_update(&target, SiteUpdate::Priority(priority))
            .await?;
        Ok(())
    }

    pub async fn pause_representation(
        &self,
        project: &str,
        representation_id: &RepresentationId,
        site: Option<&str>,
    ) -> Result<()> {
        self.set_representation_paused(project, representation_id, site, true)
            .await
    }

    pub async fn unpause_representation(
        &self,
        project: &str,
        representation_id: &RepresentationId,
        site: Option<&str>,
    ) -> Result<()> {
        self.set_representation_paused(project, representation_id, site, false)
            .await
    }

    async fn set_representation_paused(
        &self,
        project: &str,
        representation_id: &RepresentationId,
        site: Option<&str>,
        paused: bool,
    ) -> Result<()> {
        let site = site.map(|site| self.site_name(site));
        self.repository
            .set_site_paused(project, representation_id, site.as_deref(), paused)
            .await?;
        info!(
            project = %project,
            representation_id = %representation_id,
            site = site.as_deref().unwrap_or("*"),
            paused,
            "Representation pause changed"
        );
        Ok(())
    }

    // ========================================================================
    // Server control
    // ========================================================================

    pub fn pause_project(&self, project: &str) {
        self.server.pause_project(project);
    }

    pub fn unpause_project(&self, project: &str) {
        self.server.unpause_project(project);
    }

    pub fn is_project_paused(&self, project: &str) -> bool {
        self.server.is_project_paused(project)
    }

    pub fn pause_server(&self) {
        self.server.pause_server();
    }

    pub fn unpause_server(&self) {
        self.server.unpause_server();
    }

    pub fn is_paused(&self) -> bool {
        self.server.is_paused()
    }

    pub fn reset_timer(&self) {
        self.server.reset_timer();
    }

    pub fn add_before_loop_cmd(&self, command: Vec<String>) -> Result<()> {
        self.server.add_before_loop_cmd(command)
    }
}

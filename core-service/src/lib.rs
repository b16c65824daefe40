//! Core service façade and bootstrap helpers.
//!
//! This crate wires host-provided bridge implementations (settings source,
//! storage providers) and the SQLite database into the sync engine. Desktop
//! and render-farm hosts enable the `desktop-shims` feature, which registers
//! the disk provider from `bridge-desktop` and reads settings from a JSON
//! file.
//!
//! ```ignore
//! use core_runtime::config::CoreConfig;
//! use core_service::CoreService;
//!
//! let config = CoreConfig::builder()
//!     .database_path("sync.db")
//!     .local_site_id("ws-01")
//!     .build()?;
//! let core = CoreService::bootstrap(config).await?;
//! core.start()?;
//! // ...
//! core.shutdown().await?;
//! ```

pub mod api;
pub mod db;
pub mod error;

pub use error::{CoreError, Result};

use axum::Router;
use core_runtime::config::CoreConfig;
use core_runtime::events::EventBus;
use core_sync::{
    EngineOptions, ProviderRegistry, SiteResolver, SiteSync, SqliteRepresentationRepository,
    SyncError, SyncServer,
};
use sqlx::SqlitePool;
use std::sync::Arc;
use tracing::info;

/// Transfers one iteration may schedule against a disk site.
pub const LOCAL_DRIVE_BATCH_LIMIT: usize = 10;

/// Providers available on this build.
pub fn default_providers() -> ProviderRegistry {
    #[allow(unused_mut)]
    let mut registry = ProviderRegistry::new();

    #[cfg(feature = "desktop-shims")]
    registry.register(
        bridge_traits::LOCAL_DRIVE_PROVIDER,
        LOCAL_DRIVE_BATCH_LIMIT,
        |site, config| {
            Ok(Arc::new(bridge_desktop::LocalDriveProvider::new(
                site,
                config.root.clone(),
            )) as Arc<dyn bridge_traits::SiteProvider>)
        },
    );

    registry
}

/// Primary façade exposed to host applications.
#[derive(Clone)]
pub struct CoreService {
    config: CoreConfig,
    pool: SqlitePool,
    events: EventBus,
    sync: Arc<SiteSync>,
}

impl CoreService {
    /// Open the database and assemble the engine with [`default_providers`].
    pub async fn bootstrap(config: CoreConfig) -> Result<Self> {
        Self::bootstrap_with_providers(config, default_providers()).await
    }

    /// Open the database and assemble the engine with custom providers.
    pub async fn bootstrap_with_providers(
        config: CoreConfig,
        providers: ProviderRegistry,
    ) -> Result<Self> {
        config.validate()?;

        let pool = db::create_pool(&config.database_path).await?;
        let repository = Arc::new(SqliteRepresentationRepository::new(pool.clone()));
        repository.initialize().await?;

        let events = EventBus::default();
        let resolver = Arc::new(SiteResolver::new(
            Arc::clone(&config.settings_source),
            config.local_site_id.clone(),
            Arc::clone(&config.clock),
            config.settings_ttl,
        ));
        let server = Arc::new(SyncServer::new(
            repository.clone(),
            Arc::clone(&resolver),
            Arc::new(providers),
            events.clone(),
            Arc::clone(&config.clock),
            EngineOptions::from_config(&config),
        ));
        let sync = Arc::new(SiteSync::new(repository, resolver, server));

        info!(
            local_site = %config.local_site_id,
            database = %config.database_path.display(),
            workers = config.worker_threads,
            "Core service ready"
        );

        Ok(Self {
            config,
            pool,
            events,
            sync,
        })
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn sync(&self) -> &Arc<SiteSync> {
        &self.sync
    }

    /// REST control surface bound to this service.
    pub fn router(&self) -> Router {
        api::router(Arc::clone(&self.sync))
    }

    /// Start the sync loop.
    pub fn start(&self) -> Result<()> {
        self.sync.server().start()?;
        Ok(())
    }

    /// Stop the sync loop if running and close the database.
    pub async fn shutdown(&self) -> Result<()> {
        match self.sync.server().stop().await {
            Ok(()) | Err(SyncError::NotRunning) => {}
            Err(e) => return Err(e.into()),
        }
        self.pool.close().await;
        info!("Core service shut down");
        Ok(())
    }
}

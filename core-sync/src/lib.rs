//! # Site Sync Engine
//!
//! Keeps the files of published representations available on every site
//! that needs them.
//!
//! ## Overview
//!
//! Each file of a representation carries one site record per site (studio
//! storage, an artist workstation, a cloud drive). The engine compares the
//! records of a project's active and remote site, transfers the files that
//! are missing on one side and writes the outcome back to the records.
//!
//! ## Components
//!
//! - **Model** (`model`): Representations, files and site records
//! - **Status** (`status`): Per-file upload/download decision
//! - **Query** (`query`): Filter selecting representations that need work
//! - **Repository** (`repository`): SQLite persistence with per-record updates
//! - **Sites** (`sites`): Settings resolution, alternate sites, TTL cache
//! - **Providers** (`providers`): Registry of storage provider constructors
//! - **Transfer** (`transfer`): Bounded worker pool for blocking transfers
//! - **Persist** (`persist`): Outcome and progress writers
//! - **Server** (`server`): The sync loop and its lifecycle
//! - **Service** (`service`): Site management facade

pub mod error;
pub mod model;
pub mod persist;
pub mod providers;
pub mod query;
pub mod repository;
pub mod server;
pub mod service;
pub mod sites;
pub mod status;
pub mod transfer;

pub use error::{Result, SyncError};
pub use model::{
    FileId, FileTarget, RepreFile, Representation, RepresentationId, SiteRecord, SiteSkeleton,
};
pub use providers::{ProviderFactory, ProviderRegistry};
pub use query::SyncQuery;
pub use repository::{
    RepresentationRepository, SiteTarget, SiteUpdate, SqliteRepresentationRepository,
};
pub use server::{EngineOptions, IterationReport, ServerState, SyncServer};
pub use service::{SiteSelector, SiteSync};
pub use sites::{alternate_site_pairs, AlternateSites, ResolvedProject, SiteResolver};
pub use status::{check_status, StatusConfig, SyncStatus};
pub use transfer::{TransferExecutor, TransferJob};

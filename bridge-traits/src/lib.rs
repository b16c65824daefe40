//! # Host Bridge Traits
//!
//! Contracts between the sync engine and its external collaborators.
//!
//! ## Overview
//!
//! The engine never talks to a storage backend or a settings store directly.
//! Each collaborator is described by a trait defined here and implemented per
//! host (see `bridge-desktop` for the desktop implementations).
//!
//! ## Traits
//!
//! ### Storage
//! - [`SiteProvider`](provider::SiteProvider) - Folder creation, upload, download
//!   and path resolution for one site
//! - [`TransferProgress`](provider::TransferProgress) - Progress sink for long transfers
//!
//! ### Settings
//! - [`SettingsSource`](settings::SettingsSource) - System, project and local sync settings
//!
//! ### Utilities
//! - [`Clock`](time::Clock) - Time source for deterministic testing
//!
//! ## Error Handling
//!
//! All bridge traits use [`BridgeError`](error::BridgeError). Implementations
//! should convert backend errors into it and keep the failing path or site in
//! the message; the engine persists that message on the file's site record.
//!
//! ## Thread Safety
//!
//! All bridge traits require `Send + Sync`. Providers are shared between the
//! worker threads that run transfers.

pub mod error;
pub mod provider;
pub mod settings;
pub mod time;

pub use error::BridgeError;

// Re-export commonly used types
pub use provider::{fill_roots, FolderTree, NoProgress, RootsConfig, SiteProvider, TransferProgress};
pub use settings::{
    LocalProjectOverrides, LocalSettings, ProjectSyncConfig, ProjectSyncSettings, SettingsDocument,
    SettingsSource, SiteConfig, SystemSyncSettings, DEFAULT_SITE, LOCAL_DRIVE_PROVIDER,
    LOCAL_SITE_ALIAS,
};
pub use time::{Clock, FixedClock, LogLevel, SystemClock};

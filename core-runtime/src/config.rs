//! # Core Configuration Module
//!
//! Provides configuration management for the sync engine.
//!
//! ## Overview
//!
//! The configuration system uses a builder pattern to construct a `CoreConfig`
//! instance that holds the engine's dependencies and tuning knobs. It enforces
//! fail-fast validation so that a misconfigured host never starts a sync loop.
//!
//! ## Required Settings
//!
//! - `database_path` - SQLite database holding representations and site records
//! - `local_site_id` - This machine's site identity
//! - `SettingsSource` - Sync settings (desktop default: JSON file)
//!
//! When the `desktop-shims` feature is enabled, a `JsonSettingsSource` reading
//! `settings_path` (or the platform default location) is injected when no
//! source is provided.
//!
//! ## Usage
//!
//! ```ignore
//! use core_runtime::config::CoreConfig;
//!
//! let config = CoreConfig::builder()
//!     .database_path("/var/lib/site-sync/sync.db")
//!     .settings_path("/etc/site-sync/settings.json")
//!     .local_site_id("artist-ws-042")
//!     .worker_threads(4)
//!     .build()
//!     .expect("Failed to build config");
//! ```

use crate::error::{Error, Result};
use bridge_traits::{Clock, SettingsSource, SystemClock, LOCAL_SITE_ALIAS};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Transfer worker pool size.
pub const DEFAULT_WORKER_THREADS: usize = 3;

/// Representations fetched per project and iteration.
pub const DEFAULT_REPRESENTATION_LIMIT: usize = 100;

/// Priority used when no site record carries an override.
pub const DEFAULT_PRIORITY: i64 = 50;

/// Lowest accepted priority override.
pub const MIN_PRIORITY: i64 = 1;

/// Highest accepted priority override.
pub const MAX_PRIORITY: i64 = 1000;

pub const DEFAULT_SETTINGS_TTL: Duration = Duration::from_secs(60);
pub const DEFAULT_SHUTDOWN_POLL: Duration = Duration::from_millis(500);
pub const DEFAULT_PROGRESS_INTERVAL: Duration = Duration::from_secs(5);

/// Core configuration for the sync engine.
///
/// Use [`CoreConfigBuilder`] to construct instances.
#[derive(Clone)]
pub struct CoreConfig {
    /// Path to the SQLite database file
    pub database_path: PathBuf,

    /// Path of the settings document, when settings come from a file
    pub settings_path: Option<PathBuf>,

    /// Sync settings provider (required)
    pub settings_source: Arc<dyn SettingsSource>,

    /// Identity of this machine's local site
    pub local_site_id: String,

    /// Time source for site record timestamps
    pub clock: Arc<dyn Clock>,

    /// Maximum number of transfers running at once
    pub worker_threads: usize,

    /// Maximum representations fetched per project and iteration
    pub representation_limit: usize,

    /// Priority assigned to representations without an override
    pub default_priority: i64,

    /// Lifetime of cached settings
    pub settings_ttl: Duration,

    /// How often a sleeping loop checks for a stop request
    pub shutdown_poll_interval: Duration,

    /// Minimum delay between two progress writes for one file
    pub progress_interval: Duration,

    /// Address of the REST control surface, disabled when `None`
    pub api_bind: Option<SocketAddr>,
}

impl std::fmt::Debug for CoreConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoreConfig")
            .field("database_path", &self.database_path)
            .field("settings_path", &self.settings_path)
            .field("settings_source", &"SettingsSource { ... }")
            .field("local_site_id", &self.local_site_id)
            .field("worker_threads", &self.worker_threads)
            .field("representation_limit", &self.representation_limit)
            .field("default_priority", &self.default_priority)
            .field("settings_ttl", &self.settings_ttl)
            .field("shutdown_poll_interval", &self.shutdown_poll_interval)
            .field("progress_interval", &self.progress_interval)
            .field("api_bind", &self.api_bind)
            .finish()
    }
}

impl CoreConfig {
    /// Creates a new builder for constructing a `CoreConfig`.
    pub fn builder() -> CoreConfigBuilder {
        CoreConfigBuilder::default()
    }

    /// Validates the configuration and returns an error if invalid.
    ///
    /// This checks:
    /// - Database path is not empty
    /// - Local site id is set and is not the `local` alias
    /// - Worker pool size is within 1..=64
    /// - Default priority is within the accepted priority range
    /// - Intervals are non-zero
    pub fn validate(&self) -> Result<()> {
        if self.database_path.as_os_str().is_empty() {
            return Err(Error::Config("Database path cannot be empty".to_string()));
        }

        if self.local_site_id.trim().is_empty() {
            return Err(Error::Config("Local site id cannot be empty".to_string()));
        }

        if self.local_site_id == LOCAL_SITE_ALIAS {
            return Err(Error::Config(format!(
                "Local site id cannot be the '{}' alias; use a machine specific id",
                LOCAL_SITE_ALIAS
            )));
        }

        if self.worker_threads == 0 || self.worker_threads > 64 {
            return Err(Error::Config(
                "Worker threads must be between 1 and 64".to_string(),
            ));
        }

        if self.representation_limit == 0 {
            return Err(Error::Config(
                "Representation limit must be greater than 0".to_string(),
            ));
        }

        if !(MIN_PRIORITY..=MAX_PRIORITY).contains(&self.default_priority) {
            return Err(Error::Config(format!(
                "Default priority must be between {} and {}",
                MIN_PRIORITY, MAX_PRIORITY
            )));
        }

        if self.shutdown_poll_interval.is_zero() || self.progress_interval.is_zero() {
            return Err(Error::Config(
                "Shutdown poll and progress intervals must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(not(feature = "desktop-shims"))]
fn settings_source_missing_error() -> Error {
    Error::CapabilityMissing {
        capability: "SettingsSource".to_string(),
        message: "SettingsSource implementation is required to read sync settings. \
                 Desktop: ensure the 'desktop-shims' feature is enabled to use the default JsonSettingsSource. \
                 Embedded hosts: inject a source backed by the studio settings service."
            .to_string(),
    }
}

#[cfg(feature = "desktop-shims")]
fn provide_default_settings_source(settings_path: Option<&PathBuf>) -> Result<Arc<dyn SettingsSource>> {
    use bridge_desktop::JsonSettingsSource;

    let path = settings_path
        .cloned()
        .unwrap_or_else(JsonSettingsSource::default_path);
    let source: Arc<dyn SettingsSource> = Arc::new(JsonSettingsSource::new(path));
    Ok(source)
}

#[cfg(not(feature = "desktop-shims"))]
fn provide_default_settings_source(
    _settings_path: Option<&PathBuf>,
) -> Result<Arc<dyn SettingsSource>> {
    Err(settings_source_missing_error())
}

/// Builder for constructing [`CoreConfig`] instances.
#[derive(Default)]
pub struct CoreConfigBuilder {
    database_path: Option<PathBuf>,
    settings_path: Option<PathBuf>,
    settings_source: Option<Arc<dyn SettingsSource>>,
    local_site_id: Option<String>,
    clock: Option<Arc<dyn Clock>>,
    worker_threads: Option<usize>,
    representation_limit: Option<usize>,
    default_priority: Option<i64>,
    settings_ttl: Option<Duration>,
    shutdown_poll_interval: Option<Duration>,
    progress_interval: Option<Duration>,
    api_bind: Option<SocketAddr>,
}

impl CoreConfigBuilder {
    /// Sets the database path.
    ///
    /// # Examples
    ///
    /// ```
    /// use core_runtime::config::CoreConfig;
    ///
    /// let builder = CoreConfig::builder()
    ///     .database_path("/path/to/sync.db");
    /// ```
    pub fn database_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.database_path = Some(path.into());
        self
    }

    /// Sets the settings document path used by the default settings source.
    pub fn settings_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.settings_path = Some(path.into());
        self
    }

    /// Sets the settings source implementation.
    ///
    /// If not provided, the desktop default (JSON file) is used when the
    /// `desktop-shims` feature is enabled.
    pub fn settings_source(mut self, source: Arc<dyn SettingsSource>) -> Self {
        self.settings_source = Some(source);
        self
    }

    /// Sets this machine's local site id (required).
    pub fn local_site_id(mut self, site: impl Into<String>) -> Self {
        self.local_site_id = Some(site.into());
        self
    }

    /// Sets the clock used for record timestamps.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Sets the transfer worker pool size.
    ///
    /// Default: 3
    pub fn worker_threads(mut self, threads: usize) -> Self {
        self.worker_threads = Some(threads);
        self
    }

    /// Sets the per-iteration representation limit.
    ///
    /// Default: 100
    pub fn representation_limit(mut self, limit: usize) -> Self {
        self.representation_limit = Some(limit);
        self
    }

    /// Sets the default representation priority.
    ///
    /// Default: 50
    pub fn default_priority(mut self, priority: i64) -> Self {
        self.default_priority = Some(priority);
        self
    }

    pub fn settings_ttl(mut self, ttl: Duration) -> Self {
        self.settings_ttl = Some(ttl);
        self
    }

    pub fn shutdown_poll_interval(mut self, interval: Duration) -> Self {
        self.shutdown_poll_interval = Some(interval);
        self
    }

    pub fn progress_interval(mut self, interval: Duration) -> Self {
        self.progress_interval = Some(interval);
        self
    }

    /// Enables the REST control surface on `addr`.
    pub fn api_bind(mut self, addr: SocketAddr) -> Self {
        self.api_bind = Some(addr);
        self
    }

    /// Builds the configuration, returning an error if validation fails.
    ///
    /// # Errors
    ///
    /// - `Error::Config` if the database path or local site id is missing, or
    ///   validation fails
    /// - `Error::CapabilityMissing` if no settings source is available
    pub fn build(self) -> Result<CoreConfig> {
        let database_path = self.database_path.ok_or_else(|| {
            Error::Config("Database path is required. Call database_path() on the builder.".to_string())
        })?;

        let local_site_id = self.local_site_id.ok_or_else(|| {
            Error::Config("Local site id is required. Call local_site_id() on the builder.".to_string())
        })?;

        let settings_source = match self.settings_source {
            Some(source) => source,
            None => provide_default_settings_source(self.settings_path.as_ref())?,
        };

        let config = CoreConfig {
            database_path,
            settings_path: self.settings_path,
            settings_source,
            local_site_id,
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
            worker_threads: self.worker_threads.unwrap_or(DEFAULT_WORKER_THREADS),
            representation_limit: self
                .representation_limit
                .unwrap_or(DEFAULT_REPRESENTATION_LIMIT),
            default_priority: self.default_priority.unwrap_or(DEFAULT_PRIORITY),
            settings_ttl: self.settings_ttl.unwrap_or(DEFAULT_SETTINGS_TTL),
            shutdown_poll_interval: self
                .shutdown_poll_interval
                .unwrap_or(DEFAULT_SHUTDOWN_POLL),
            progress_interval: self.progress_interval.unwrap_or(DEFAULT_PROGRESS_INTERVAL),
            api_bind: self.api_bind,
        };

        config.validate()?;
        Ok(config)
    }
}

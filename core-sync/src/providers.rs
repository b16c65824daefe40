//! Provider registry.
//!
//! Maps a provider code (`local_drive`, `gdrive`, ...) to a constructor and
//! the number of transfers one iteration may schedule against it. Hosts
//! register their providers once at startup and inject the registry into the
//! sync server.

use crate::{Result, SyncError};
use bridge_traits::settings::SiteConfig;
use bridge_traits::SiteProvider;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Builds a provider session for `(site name, site config)`.
pub type ProviderFactory =
    Arc<dyn Fn(&str, &SiteConfig) -> Result<Arc<dyn SiteProvider>> + Send + Sync>;

struct RegisteredProvider {
    factory: ProviderFactory,
    batch_limit: usize,
}

#[derive(Default)]
pub struct ProviderRegistry {
    providers: HashMap<String, RegisteredProvider>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `code`, replacing any previous registration.
    pub fn register<F>(&mut self, code: impl Into<String>, batch_limit: usize, factory: F)
    where
        F: Fn(&str, &SiteConfig) -> Result<Arc<dyn SiteProvider>> + Send + Sync + 'static,
    {
        let code = code.into();
        debug!(provider = %code, batch_limit, "Registered provider");
        self.providers.insert(
            code,
            RegisteredProvider {
                factory: Arc::new(factory),
                batch_limit: batch_limit.max(1),
            },
        );
    }

    pub fn is_registered(&self, code: &str) -> bool {
        self.providers.contains_key(code)
    }

    /// Provider codes in no particular order.
    pub fn codes(&self) -> impl Iterator<Item = &str> {
        self.providers.keys().map(String::as_str)
    }

    /// Create a provider session for `site`.
    ///
    /// # Errors
    ///
    /// `UnknownProvider` when the site's provider code is not registered,
    /// otherwise whatever the factory returns.
    pub fn create(&self, site: &str, config: &SiteConfig) -> Result<Arc<dyn SiteProvider>> {
        let registered = self
            .providers
            .get(&config.provider)
            .ok_or_else(|| SyncError::UnknownProvider(config.provider.clone()))?;
        (registered.factory)(site, config)
    }

    /// Transfers one iteration may schedule against `code`.
    pub fn batch_limit(&self, code: &str) -> Result<usize> {
        self.providers
            .get(code)
            .map(|registered| registered.batch_limit)
            .ok_or_else(|| SyncError::UnknownProvider(code.to_string()))
    }
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut codes: Vec<_> = self.codes().collect();
        codes.sort_unstable();
        f.debug_struct("ProviderRegistry")
            .field("providers", &codes)
            .finish()
    }
}

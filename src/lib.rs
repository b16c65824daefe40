//! Workspace umbrella crate.
//!
//! Re-exports [`core_service`] behind the workspace feature flags so host
//! applications can depend on `site-sync-workspace` with `desktop-shims`
//! (disk provider and JSON settings) or `embedded` (host-injected bridges)
//! without wiring each crate individually.

#[cfg(any(feature = "desktop-shims", feature = "embedded"))]
pub use core_service::*;

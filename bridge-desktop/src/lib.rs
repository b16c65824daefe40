//! # Desktop Bridge Implementations
//!
//! Default implementations of bridge traits for desktop and render-farm hosts
//! (macOS, Windows, Linux).
//!
//! ## Overview
//!
//! - `SiteProvider` for disk storage using `std::fs` ([`LocalDriveProvider`])
//! - `SettingsSource` reading a JSON settings file with `tokio::fs`
//!   ([`JsonSettingsSource`])
//!
//! ## Usage
//!
//! ```ignore
//! use bridge_desktop::{JsonSettingsSource, LocalDriveProvider};
//! use bridge_traits::{SettingsSource, SiteProvider};
//!
//! #[tokio::main]
//! async fn main() {
//!     let settings = JsonSettingsSource::new(JsonSettingsSource::default_path());
//!     let system = settings.system_settings().await.unwrap();
//!     let studio = LocalDriveProvider::new("studio", Default::default());
//!     // Hand both to the sync engine
//! }
//! ```

mod local_drive;
mod settings;

pub use local_drive::LocalDriveProvider;
pub use settings::JsonSettingsSource;

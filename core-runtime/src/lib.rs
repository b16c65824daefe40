//! # Core Runtime Module
//!
//! Foundational runtime infrastructure for the sync engine:
//! - Logging and tracing infrastructure
//! - Configuration management
//! - Event bus system
//!
//! ## Overview
//!
//! This crate holds the utilities every other engine crate depends on. It
//! establishes the logging conventions, the configuration builder and the
//! event broadcasting used by the sync loop.

pub mod config;
pub mod error;
pub mod events;
pub mod logging;

pub use error::{Error, Result};

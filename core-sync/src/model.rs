//! # Representation Data Model
//!
//! Published representations, their files, and the per-site sync state of
//! each file.
//!
//! ```text
//! Representation ──< RepreFile ──< SiteRecord
//!   id, project        id, path      name, created_dt, id,
//!   parent_id          size, hash    progress, error, tries,
//!                                    last_failed_dt, paused, priority
//! ```
//!
//! A site record with `created_dt` set means the file is fully available on
//! that site. At most one record exists per (file, site name).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ============================================================================
// ID Types
// ============================================================================

/// Unique identifier of a representation
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RepresentationId(String);

impl RepresentationId {
    /// Create a new random representation ID
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Wrap an existing identifier, as assigned by the publisher
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RepresentationId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RepresentationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier of a file inside a representation
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileId(String);

impl FileId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for FileId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for FileId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Site Records
// ============================================================================

/// Synchronization state of one file on one site.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SiteRecord {
    pub name: String,
    /// Set once the file is fully available on the site
    pub created_dt: Option<DateTime<Utc>>,
    /// Identifier assigned by the site's provider
    #[serde(rename = "id")]
    pub provider_file_id: Option<String>,
    /// Transfer progress in `0.0..=1.0` while running
    pub progress: Option<f32>,
    pub error: Option<String>,
    pub last_failed_dt: Option<DateTime<Utc>>,
    /// Failed attempts; `None` means never attempted
    pub tries: Option<u32>,
    #[serde(default)]
    pub paused: bool,
    /// Priority override (1..=1000), higher is more urgent
    pub priority: Option<i64>,
}

impl SiteRecord {
    /// Empty record: the file is expected on `name` but not there yet.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            created_dt: None,
            provider_file_id: None,
            progress: None,
            error: None,
            last_failed_dt: None,
            tries: None,
            paused: false,
            priority: None,
        }
    }

    /// Record of a file already available on `name`.
    pub fn created(name: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            created_dt: Some(at),
            ..Self::new(name)
        }
    }

    pub fn is_available(&self) -> bool {
        self.created_dt.is_some()
    }

    /// Failed attempts so far, treating "never attempted" as zero.
    pub fn tries_count(&self) -> u32 {
        self.tries.unwrap_or(0)
    }
}

/// Site entry attached to a newly published representation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SiteSkeleton {
    pub name: String,
    pub created_dt: Option<DateTime<Utc>>,
}

impl From<SiteSkeleton> for SiteRecord {
    fn from(skeleton: SiteSkeleton) -> Self {
        Self {
            created_dt: skeleton.created_dt,
            ..SiteRecord::new(skeleton.name)
        }
    }
}

// ============================================================================
// Representations
// ============================================================================

/// One physical file of a representation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepreFile {
    #[serde(rename = "_id")]
    pub id: FileId,
    /// Rootless path template, e.g. `{root[work]}/P1/asset/v001/a.ma`
    pub path: String,
    pub size: u64,
    pub hash: Option<String>,
    #[serde(default)]
    pub sites: Vec<SiteRecord>,
}

impl RepreFile {
    pub fn new(path: impl Into<String>, size: u64) -> Self {
        Self {
            id: FileId::new(),
            path: path.into(),
            size,
            hash: None,
            sites: Vec::new(),
        }
    }

    pub fn with_site(mut self, record: SiteRecord) -> Self {
        self.sites.retain(|site| site.name != record.name);
        self.sites.push(record);
        self
    }

    pub fn site(&self, name: &str) -> Option<&SiteRecord> {
        self.sites.iter().find(|site| site.name == name)
    }
}

/// A published deliverable and its files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Representation {
    #[serde(rename = "_id")]
    pub id: RepresentationId,
    pub project: String,
    /// Version this representation belongs to
    pub parent_id: Option<String>,
    pub name: String,
    /// Archived representations are never synced
    #[serde(default)]
    pub archived: bool,
    #[serde(default)]
    pub files: Vec<RepreFile>,
    /// Effective priority, filled in by sync queries only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<i64>,
}

impl Representation {
    pub fn new(project: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: RepresentationId::new(),
            project: project.into(),
            parent_id: None,
            name: name.into(),
            archived: false,
            files: Vec::new(),
            priority: None,
        }
    }

    pub fn with_file(mut self, file: RepreFile) -> Self {
        self.files.push(file);
        self
    }

    pub fn file(&self, id: &FileId) -> Option<&RepreFile> {
        self.files.iter().find(|file| &file.id == id)
    }

    /// Document type string used for storage and query filtering.
    pub fn doc_type(&self) -> &'static str {
        if self.archived {
            ARCHIVED_REPRESENTATION_TYPE
        } else {
            REPRESENTATION_TYPE
        }
    }
}

pub const REPRESENTATION_TYPE: &str = "representation";
pub const ARCHIVED_REPRESENTATION_TYPE: &str = "archived_representation";

/// Address of one file on one representation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FileTarget {
    pub representation_id: RepresentationId,
    pub file_id: FileId,
}

//! # Representation Repository
//!
//! Persistence of representations and their per-file site records.
//!
//! ## Overview
//!
//! Representations are owned by the publishing pipeline; the sync engine
//! reads them and applies narrow updates to single site records. Every write
//! is addressed by (project, representation id, optional file id, site name)
//! and touches only the matching `file_sites` rows, so concurrent writers
//! updating other files or sites of the same representation never overwrite
//! each other.
//!
//! ## Schema
//!
//! ```text
//! representations       (id, project, parent_id, name, doc_type)
//! representation_files  (representation_id, id, position, path, size, hash)
//! file_sites            (representation_id, file_id, name, provider_file_id,
//!                        created_dt, progress, error, last_failed_dt, tries,
//!                        paused, priority)
//! ```
//!
//! `file_sites` is keyed by `(representation_id, file_id, name)`, so a file
//! can never hold two records for the same site. Timestamps are stored as
//! epoch milliseconds.

use crate::error::db_error;
use crate::model::{FileId, RepreFile, Representation, RepresentationId, SiteRecord};
use crate::query::SyncQuery;
use crate::{Result, SyncError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, SqlitePool};
use std::collections::HashMap;
use tracing::{debug, instrument};

// ============================================================================
// Update Types
// ============================================================================

/// Site records addressed by an update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SiteTarget {
    pub project: String,
    pub representation_id: RepresentationId,
    /// Single file, or every file of the representation when `None`
    pub file_id: Option<FileId>,
    pub site: String,
}

impl SiteTarget {
    pub fn new(
        project: impl Into<String>,
        representation_id: RepresentationId,
        file_id: Option<FileId>,
        site: impl Into<String>,
    ) -> Self {
        Self {
            project: project.into(),
            representation_id,
            file_id,
            site: site.into(),
        }
    }

    fn file_id(&self) -> Option<&str> {
        self.file_id.as_ref().map(FileId::as_str)
    }
}

/// Outcome written to the addressed site records.
#[derive(Debug, Clone, PartialEq)]
pub enum SiteUpdate {
    /// File is available on the site; clears failure bookkeeping.
    Success {
        provider_file_id: Option<String>,
        at: DateTime<Utc>,
    },
    /// Attempt failed; increments `tries`.
    Failure { error: String, at: DateTime<Utc> },
    /// Transfer progress only.
    Progress(f32),
    /// Priority override, `None` restores the default.
    Priority(Option<i64>),
}

// ============================================================================
// Repository Trait
// ============================================================================

/// Repository trait for representation persistence
#[async_trait]
pub trait RepresentationRepository: Send + Sync {
    /// Store a newly published representation with its files and site records
    ///
    /// # Errors
    ///
    /// Returns an error if the id is already taken or the database operation fails
    async fn insert(&self, representation: &Representation) -> Result<()>;

    /// Load one representation of `project`
    async fn find_by_id(
        &self,
        project: &str,
        id: &RepresentationId,
    ) -> Result<Option<Representation>>;

    /// Representations with at least one file needing a transfer, ordered by
    /// priority descending then id ascending
    async fn find_sync_representations(&self, query: &SyncQuery) -> Result<Vec<Representation>>;

    /// Apply one outcome to the addressed site records
    ///
    /// Success and failure create the record when the file has none yet.
    /// Progress is best effort and never fails on a missing record.
    ///
    /// # Errors
    ///
    /// - `RepresentationNotFound` / `FileNotFound` when the address is unknown
    /// - `SiteNotFound` for a priority update on a missing record
    async fn apply_site_update(&self, target: &SiteTarget, update: SiteUpdate) -> Result<u64>;

    /// Attach an empty record for the target site
    ///
    /// With `force` an existing record is reset instead of rejected.
    async fn add_site(&self, target: &SiteTarget, force: bool) -> Result<()>;

    /// Delete the target site's records
    async fn remove_site(&self, target: &SiteTarget) -> Result<u64>;

    /// Clear availability and failure bookkeeping so the file is synced again
    async fn reset_site(&self, target: &SiteTarget) -> Result<u64>;

    /// Pause or resume one site, or every site when `site` is `None`
    async fn set_site_paused(
        &self,
        project: &str,
        id: &RepresentationId,
        site: Option<&str>,
        paused: bool,
    ) -> Result<u64>;

    /// Delete `site` from every file of every representation of `project`
    async fn remove_site_from_project(&self, project: &str, site: &str) -> Result<u64>;

    /// Delete a representation with its files and site records
    ///
    /// Returns `false` when nothing was stored under `id`.
    async fn delete(&self, project: &str, id: &RepresentationId) -> Result<bool>;
}

// ============================================================================
// SQLite Implementation
// ============================================================================

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS representations (
        id TEXT PRIMARY KEY NOT NULL,
        project TEXT NOT NULL,
        parent_id TEXT,
        name TEXT NOT NULL,
        doc_type TEXT NOT NULL DEFAULT 'representation'
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_representations_project
        ON representations(project, doc_type)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS representation_files (
        representation_id TEXT NOT NULL REFERENCES representations(id) ON DELETE CASCADE,
        id TEXT NOT NULL,
        position INTEGER NOT NULL,
        path TEXT NOT NULL,
        size INTEGER NOT NULL DEFAULT 0,
        hash TEXT,
        PRIMARY KEY (representation_id, id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS file_sites (
        representation_id TEXT NOT NULL,
        file_id TEXT NOT NULL,
        name TEXT NOT NULL,
        provider_file_id TEXT,
        created_dt INTEGER,
        progress REAL,
        error TEXT,
        last_failed_dt INTEGER,
        tries INTEGER,
        paused INTEGER NOT NULL DEFAULT 0,
        priority INTEGER,
        PRIMARY KEY (representation_id, file_id, name),
        FOREIGN KEY (representation_id, file_id)
            REFERENCES representation_files(representation_id, id) ON DELETE CASCADE
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_file_sites_name ON file_sites(name, created_dt)
    "#,
];

/// SQLite implementation of RepresentationRepository
pub struct SqliteRepresentationRepository {
    pool: SqlitePool,
}

impl SqliteRepresentationRepository {
    /// Create a new SQLite representation repository
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create tables and indexes when missing
    pub async fn initialize(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(db_error)?;
        }
        debug!("Representation schema ready");
        Ok(())
    }

    /// Distinguish an unknown representation from an unknown file.
    async fn missing_target(&self, target: &SiteTarget) -> Result<SyncError> {
        let exists: Option<(String,)> =
            sqlx::query_as("SELECT id FROM representations WHERE id = ? AND project = ?")
                .bind(target.representation_id.as_str())
                .bind(&target.project)
                .fetch_optional(&self.pool)
                .await
                .map_err(db_error)?;

        Ok(match (exists, &target.file_id) {
            (None, _) => SyncError::RepresentationNotFound {
                id: target.representation_id.to_string(),
                project: target.project.clone(),
            },
            (Some(_), Some(file_id)) => SyncError::FileNotFound {
                representation_id: target.representation_id.to_string(),
                file_id: file_id.to_string(),
            },
            (Some(_), None) => SyncError::SiteNotFound {
                site: target.site.clone(),
            },
        })
    }

    async fn load(&self, row: RepresentationRow) -> Result<Representation> {
        let files = sqlx::query_as::<_, FileRow>(
            r#"
            SELECT id, path, size, hash
            FROM representation_files
            WHERE representation_id = ?
            ORDER BY position ASC
            "#,
        )
        .bind(&row.id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;

        let sites = sqlx::query_as::<_, SiteRow>(
            r#"
            SELECT file_id, name, provider_file_id, created_dt, progress, error,
                   last_failed_dt, tries, paused, priority
            FROM file_sites
            WHERE representation_id = ?
            ORDER BY rowid ASC
            "#,
        )
        .bind(&row.id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;

        let mut sites_by_file: HashMap<String, Vec<SiteRecord>> = HashMap::new();
        for site in sites {
            let file_id = site.file_id.clone();
            sites_by_file.entry(file_id).or_default().push(site.into());
        }

        let files = files
            .into_iter()
            .map(|file| RepreFile {
                sites: sites_by_file.remove(&file.id).unwrap_or_default(),
                id: FileId::from_string(file.id),
                path: file.path,
                size: file.size.max(0) as u64,
                hash: file.hash,
            })
            .collect();

        Ok(Representation {
            archived: row.doc_type != crate::model::REPRESENTATION_TYPE,
            id: RepresentationId::from_string(row.id),
            project: row.project,
            parent_id: row.parent_id,
            name: row.name,
            files,
            priority: None,
        })
    }
}

fn to_millis(at: Option<DateTime<Utc>>) -> Option<i64> {
    at.map(|at| at.timestamp_millis())
}

fn from_millis(millis: Option<i64>) -> Option<DateTime<Utc>> {
    millis.and_then(DateTime::from_timestamp_millis)
}

/// Database row of a representation
#[derive(Debug, FromRow)]
struct RepresentationRow {
    id: String,
    project: String,
    parent_id: Option<String>,
    name: String,
    doc_type: String,
}

#[derive(Debug, FromRow)]
struct FileRow {
    id: String,
    path: String,
    size: i64,
    hash: Option<String>,
}

#[derive(Debug, FromRow)]
struct SiteRow {
    file_id: String,
    name: String,
    provider_file_id: Option<String>,
    created_dt: Option<i64>,
    progress: Option<f64>,
    error: Option<String>,
    last_failed_dt: Option<i64>,
    tries: Option<i64>,
    paused: bool,
    priority: Option<i64>,
}

impl From<SiteRow> for SiteRecord {
    fn from(row: SiteRow) -> Self {
        SiteRecord {
            name: row.name,
            created_dt: from_millis(row.created_dt),
            provider_file_id: row.provider_file_id,
            progress: row.progress.map(|p| p as f32),
            error: row.error,
            last_failed_dt: from_millis(row.last_failed_dt),
            tries: row.tries.map(|t| t.max(0) as u32),
            paused: row.paused,
            priority: row.priority,
        }
    }
}

/// Rows of `representation_files` selected by a target.
const TARGET_FILES: &str = r#"
    FROM representation_files f
    JOIN representations r ON r.id = f.representation_id
    WHERE r.project = ?1
      AND f.representation_id = ?2
      AND (?3 IS NULL OR f.id = ?3)
"#;

/// Rows of `file_sites` selected by a target.
const TARGET_SITES: &str = r#"
    WHERE name = ?4
      AND representation_id = ?2
      AND (?3 IS NULL OR file_id = ?3)
      AND representation_id IN (SELECT id FROM representations WHERE project = ?1)
"#;

#[async_trait]
impl RepresentationRepository for SqliteRepresentationRepository {
    #[instrument(skip(self, representation), fields(id = %representation.id, project = %representation.project))]
    async fn insert(&self, representation: &Representation) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(db_error)?;

        sqlx::query(
            r#"
            INSERT INTO representations (id, project, parent_id, name, doc_type)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(representation.id.as_str())
        .bind(&representation.project)
        .bind(&representation.parent_id)
        .bind(&representation.name)
        .bind(representation.doc_type())
        .execute(&mut *tx)
        .await
        .map_err(db_error)?;

        for (position, file) in representation.files.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO representation_files (representation_id, id, position, path, size, hash)
                VALUES (?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(representation.id.as_str())
            .bind(file.id.as_str())
            .bind(position as i64)
            .bind(&file.path)
            .bind(file.size as i64)
            .bind(&file.hash)
            .execute(&mut *tx)
            .await
            .map_err(db_error)?;

            for site in &file.sites {
                sqlx::query(
                    r#"
                    INSERT INTO file_sites (
                        representation_id, file_id, name, provider_file_id, created_dt,
                        progress, error, last_failed_dt, tries, paused, priority
                    ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                    "#,
                )
                .bind(representation.id.as_str())
                .bind(file.id.as_str())
                .bind(&site.name)
                .bind(&site.provider_file_id)
                .bind(to_millis(site.created_dt))
                .bind(site.progress.map(f64::from))
                .bind(&site.error)
                .bind(to_millis(site.last_failed_dt))
                .bind(site.tries.map(i64::from))
                .bind(site.paused)
                .bind(site.priority)
                .execute(&mut *tx)
                .await
                .map_err(db_error)?;
            }
        }

        tx.commit().await.map_err(db_error)?;
        debug!(files = representation.files.len(), "Inserted representation");
        Ok(())
    }

    async fn find_by_id(
        &self,
        project: &str,
        id: &RepresentationId,
    ) -> Result<Option<Representation>> {
        let row = sqlx::query_as::<_, RepresentationRow>(
            r#"
            SELECT id, project, parent_id, name, doc_type
            FROM representations
            WHERE id = ? AND project = ?
            "#,
        )
        .bind(id.as_str())
        .bind(project)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?;

        match row {
            Some(row) => Ok(Some(self.load(row).await?)),
            None => Ok(None),
        }
    }

    #[instrument(skip(self, query), fields(project = %query.project, active = %query.active_site, remote = %query.remote_site))]
    async fn find_sync_representations(&self, query: &SyncQuery) -> Result<Vec<Representation>> {
        let matches: Vec<(String, i64)> = sqlx::query_as(&query.sql())
            .bind(query.default_priority)
            .bind(&query.project)
            .bind(&query.active_site)
            .bind(&query.remote_site)
            .bind(query.sql_limit())
            .fetch_all(&self.pool)
            .await
            .map_err(db_error)?;

        let mut representations = Vec::with_capacity(matches.len());
        for (id, priority) in matches {
            let id = RepresentationId::from_string(id);
            // deleted between the two queries
            let Some(mut representation) = self.find_by_id(&query.project, &id).await? else {
                continue;
            };
            representation.priority = Some(priority);
            representations.push(representation);
        }

        debug!(count = representations.len(), "Fetched representations to sync");
        Ok(representations)
    }

    #[instrument(skip(self, update), fields(site = %target.site, representation_id = %target.representation_id))]
    async fn apply_site_update(&self, target: &SiteTarget, update: SiteUpdate) -> Result<u64> {
        let affected = match update {
            SiteUpdate::Success {
                provider_file_id,
                at,
            } => {
                let sql = format!(
                    r#"
                    INSERT INTO file_sites (representation_id, file_id, name, provider_file_id, created_dt, paused)
                    SELECT f.representation_id, f.id, ?4, ?5, ?6, 0
                    {TARGET_FILES}
                    ON CONFLICT(representation_id, file_id, name) DO UPDATE SET
                        provider_file_id = excluded.provider_file_id,
                        created_dt = excluded.created_dt,
                        error = NULL,
                        tries = NULL,
                        progress = NULL,
                        last_failed_dt = NULL
                    "#
                );
                sqlx::query(&sql)
                    .bind(&target.project)
                    .bind(target.representation_id.as_str())
                    .bind(target.file_id())
                    .bind(&target.site)
                    .bind(provider_file_id)
                    .bind(at.timestamp_millis())
                    .execute(&self.pool)
                    .await
                    .map_err(db_error)?
                    .rows_affected()
            }
            SiteUpdate::Failure { error, at } => {
                let sql = format!(
                    r#"
                    INSERT INTO file_sites (representation_id, file_id, name, error, last_failed_dt, tries, paused)
                    SELECT f.representation_id, f.id, ?4, ?5, ?6, 1, 0
                    {TARGET_FILES}
                    ON CONFLICT(representation_id, file_id, name) DO UPDATE SET
                        error = excluded.error,
                        last_failed_dt = excluded.last_failed_dt,
                        tries = COALESCE(file_sites.tries, 0) + 1,
                        progress = NULL
                    "#
                );
                sqlx::query(&sql)
                    .bind(&target.project)
                    .bind(target.representation_id.as_str())
                    .bind(target.file_id())
                    .bind(&target.site)
                    .bind(error)
                    .bind(at.timestamp_millis())
                    .execute(&self.pool)
                    .await
                    .map_err(db_error)?
                    .rows_affected()
            }
            SiteUpdate::Progress(progress) => {
                let sql = format!("UPDATE file_sites SET progress = ?5 {TARGET_SITES}");
                return sqlx::query(&sql)
                    .bind(&target.project)
                    .bind(target.representation_id.as_str())
                    .bind(target.file_id())
                    .bind(&target.site)
                    .bind(f64::from(progress.clamp(0.0, 1.0)))
                    .execute(&self.pool)
                    .await
                    .map(|result| result.rows_affected())
                    .map_err(db_error);
            }
            SiteUpdate::Priority(priority) => {
                let sql = format!("UPDATE file_sites SET priority = ?5 {TARGET_SITES}");
                let affected = sqlx::query(&sql)
                    .bind(&target.project)
                    .bind(target.representation_id.as_str())
                    .bind(target.file_id())
                    .bind(&target.site)
                    .bind(priority)
                    .execute(&self.pool)
                    .await
                    .map_err(db_error)?
                    .rows_affected();
                if affected == 0 {
                    return Err(SyncError::SiteNotFound {
                        site: target.site.clone(),
                    });
                }
                affected
            }
        };

        if affected == 0 {
            return Err(self.missing_target(target).await?);
        }
        Ok(affected)
    }

    #[instrument(skip(self), fields(site = %target.site, representation_id = %target.representation_id))]
    async fn add_site(&self, target: &SiteTarget, force: bool) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(db_error)?;

        let count_sql = format!("SELECT COUNT(*) FROM file_sites {TARGET_SITES}");
        let (existing,): (i64,) = sqlx::query_as(&count_sql)
            .bind(&target.project)
            .bind(target.representation_id.as_str())
            .bind(target.file_id())
            .bind(&target.site)
            .fetch_one(&mut *tx)
            .await
            .map_err(db_error)?;

        if existing > 0 {
            if !force {
                return Err(SyncError::SiteAlreadyPresent {
                    site: target.site.clone(),
                });
            }

            let reset_sql = format!(
                r#"
                UPDATE file_sites SET
                    created_dt = NULL,
                    provider_file_id = NULL,
                    progress = NULL,
                    error = NULL,
                    last_failed_dt = NULL,
                    tries = NULL,
                    paused = 0
                {TARGET_SITES}
                "#
            );
            sqlx::query(&reset_sql)
                .bind(&target.project)
                .bind(target.representation_id.as_str())
                .bind(target.file_id())
                .bind(&target.site)
                .execute(&mut *tx)
                .await
                .map_err(db_error)?;
        }

        let insert_sql = format!(
            r#"
            INSERT INTO file_sites (representation_id, file_id, name, paused)
            SELECT f.representation_id, f.id, ?4, 0
            {TARGET_FILES}
            ON CONFLICT(representation_id, file_id, name) DO NOTHING
            "#
        );
        let inserted = sqlx::query(&insert_sql)
            .bind(&target.project)
            .bind(target.representation_id.as_str())
            .bind(target.file_id())
            .bind(&target.site)
            .execute(&mut *tx)
            .await
            .map_err(db_error)?
            .rows_affected();

        if existing == 0 && inserted == 0 {
            drop(tx);
            return Err(self.missing_target(target).await?);
        }

        tx.commit().await.map_err(db_error)?;
        debug!(existing, inserted, force, "Site added");
        Ok(())
    }

    async fn remove_site(&self, target: &SiteTarget) -> Result<u64> {
        let sql = format!("DELETE FROM file_sites {TARGET_SITES}");
        let removed = sqlx::query(&sql)
            .bind(&target.project)
            .bind(target.representation_id.as_str())
            .bind(target.file_id())
            .bind(&target.site)
            .execute(&self.pool)
            .await
            .map_err(db_error)?
            .rows_affected();

        if removed == 0 {
            return Err(SyncError::SiteNotFound {
                site: target.site.clone(),
            });
        }
        Ok(removed)
    }

    async fn reset_site(&self, target: &SiteTarget) -> Result<u64> {
        let sql = format!(
            r#"
            UPDATE file_sites SET
                created_dt = NULL,
                provider_file_id = NULL,
                progress = NULL,
                error = NULL,
                last_failed_dt = NULL,
                tries = NULL
            {TARGET_SITES}
            "#
        );
        let reset = sqlx::query(&sql)
            .bind(&target.project)
            .bind(target.representation_id.as_str())
            .bind(target.file_id())
            .bind(&target.site)
            .execute(&self.pool)
            .await
            .map_err(db_error)?
            .rows_affected();

        if reset == 0 {
            return Err(SyncError::SiteNotFound {
                site: target.site.clone(),
            });
        }
        Ok(reset)
    }

    async fn set_site_paused(
        &self,
        project: &str,
        id: &RepresentationId,
        site: Option<&str>,
        paused: bool,
    ) -> Result<u64> {
        let updated = sqlx::query(
            r#"
            UPDATE file_sites SET paused = ?1
            WHERE representation_id = ?2
              AND (?3 IS NULL OR name = ?3)
              AND representation_id IN (SELECT id FROM representations WHERE project = ?4)
            "#,
        )
        .bind(paused)
        .bind(id.as_str())
        .bind(site)
        .bind(project)
        .execute(&self.pool)
        .await
        .map_err(db_error)?
        .rows_affected();

        if updated == 0 {
            return Err(match site {
                Some(site) => SyncError::SiteNotFound {
                    site: site.to_string(),
                },
                None => SyncError::RepresentationNotFound {
                    id: id.to_string(),
                    project: project.to_string(),
                },
            });
        }
        Ok(updated)
    }

    #[instrument(skip(self))]
    async fn remove_site_from_project(&self, project: &str, site: &str) -> Result<u64> {
        let removed = sqlx::query(
            r#"
            DELETE FROM file_sites
            WHERE name = ?
              AND representation_id IN (SELECT id FROM representations WHERE project = ?)
            "#,
        )
        .bind(site)
        .bind(project)
        .execute(&self.pool)
        .await
        .map_err(db_error)?
        .rows_affected();

        debug!(removed, "Cleared site from project");
        Ok(removed)
    }

    async fn delete(&self, project: &str, id: &RepresentationId) -> Result<bool> {
        let mut tx = self.pool.begin().await.map_err(db_error)?;

        let owned: Option<(String,)> =
            sqlx::query_as("SELECT id FROM representations WHERE id = ? AND project = ?")
                .bind(id.as_str())
                .bind(project)
                .fetch_optional(&mut *tx)
                .await
                .map_err(db_error)?;
        if owned.is_none() {
            return Ok(false);
        }

        for statement in [
            "DELETE FROM file_sites WHERE representation_id = ?",
            "DELETE FROM representation_files WHERE representation_id = ?",
            "DELETE FROM representations WHERE id = ?",
        ] {
            sqlx::query(statement)
                .bind(id.as_str())
                .execute(&mut *tx)
                .await
                .map_err(db_error)?;
        }

        tx.commit().await.map_err(db_error)?;
        debug!(representation_id = %id, "Deleted representation");
        Ok(true)
    }
}

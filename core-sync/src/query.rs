//! # Sync Representation Query
//!
//! Filter selecting the representations that have at least one file needing
//! a transfer between an active and a remote site.
//!
//! A file matches when both sites carry a record for it and either
//!
//! - the active record is available, the remote one is not, the remote one
//!   is not paused and its retry counter is in the retry set, or
//! - the symmetric case with active and remote swapped.
//!
//! The retry set is `{0, 1, .., retry_cnt - 1, never attempted}`.
//!
//! Matching representations carry an effective priority taken over every
//! file of the representation, not only the files that need a transfer: per
//! file the active record's override, else the remote record's override,
//! else the default; the maximum wins. Results are ordered by that priority
//! descending, then by representation id ascending.

use crate::model::REPRESENTATION_TYPE;

/// Parameters of one sync query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncQuery {
    pub project: String,
    pub active_site: String,
    pub remote_site: String,
    pub retry_cnt: u32,
    pub default_priority: i64,
    /// Maximum representations returned, `None` for all
    pub limit: Option<usize>,
}

impl SyncQuery {
    pub fn new(
        project: impl Into<String>,
        active_site: impl Into<String>,
        remote_site: impl Into<String>,
        retry_cnt: u32,
    ) -> Self {
        Self {
            project: project.into(),
            active_site: active_site.into(),
            remote_site: remote_site.into(),
            retry_cnt,
            default_priority: core_runtime::config::DEFAULT_PRIORITY,
            limit: Some(core_runtime::config::DEFAULT_REPRESENTATION_LIMIT),
        }
    }

    pub fn with_default_priority(mut self, priority: i64) -> Self {
        self.default_priority = priority;
        self
    }

    pub fn with_limit(mut self, limit: Option<usize>) -> Self {
        self.limit = limit;
        self
    }

    /// Accepted values of `tries`; `None` stands for "never attempted".
    pub fn retry_set(&self) -> Vec<Option<u32>> {
        (0..self.retry_cnt)
            .map(Some)
            .chain(std::iter::once(None))
            .collect()
    }

    /// SQL selecting `(id, priority)` of matching representations.
    ///
    /// Parameters: `?1` default priority, `?2` project, `?3` active site,
    /// `?4` remote site, `?5` limit (`-1` for unlimited).
    pub fn sql(&self) -> String {
        let active_retry = retry_clause("a", &self.retry_set());
        let remote_retry = retry_clause("rm", &self.retry_set());

        format!(
            r#"
            SELECT r.id AS id,
                   (SELECT MAX(COALESCE(pa.priority, pr.priority, ?1))
                    FROM representation_files pf
                    LEFT JOIN file_sites pa
                        ON pa.representation_id = pf.representation_id
                       AND pa.file_id = pf.id AND pa.name = ?3
                    LEFT JOIN file_sites pr
                        ON pr.representation_id = pf.representation_id
                       AND pr.file_id = pf.id AND pr.name = ?4
                    WHERE pf.representation_id = r.id) AS priority
            FROM representations r
            WHERE r.project = ?2
              AND r.doc_type = '{doc_type}'
              AND EXISTS (
                SELECT 1
                FROM representation_files f
                JOIN file_sites a
                    ON a.representation_id = f.representation_id
                   AND a.file_id = f.id AND a.name = ?3
                JOIN file_sites rm
                    ON rm.representation_id = f.representation_id
                   AND rm.file_id = f.id AND rm.name = ?4
                WHERE f.representation_id = r.id
                  AND (
                        (a.created_dt IS NOT NULL
                         AND rm.created_dt IS NULL
                         AND rm.paused = 0
                         AND {remote_retry})
                     OR (a.created_dt IS NULL
                         AND a.paused = 0
                         AND {active_retry}
                         AND rm.created_dt IS NOT NULL)
                  )
              )
            ORDER BY priority DESC, r.id ASC
            LIMIT ?5
            "#,
            doc_type = REPRESENTATION_TYPE,
        )
    }

    /// Value bound to the `LIMIT` placeholder.
    pub fn sql_limit(&self) -> i64 {
        self.limit.map_or(-1, |limit| limit as i64)
    }
}

fn retry_clause(alias: &str, retry_set: &[Option<u32>]) -> String {
    let counts: Vec<String> = retry_set
        .iter()
        .flatten()
        .map(|tries| tries.to_string())
        .collect();

    if counts.is_empty() {
        format!("{alias}.tries IS NULL")
    } else {
        format!("({alias}.tries IS NULL OR {alias}.tries IN ({}))", counts.join(", "))
    }
}

//! # Sync Status Evaluation
//!
//! Decides, for one file and a (local, remote) site pair, whether this
//! machine should upload it, download it, or leave it alone.
//!
//! The decision is directional: a file missing on the remote side is uploaded
//! first; only once the remote copy exists is a missing local copy
//! downloaded. Files whose retry counter reached the project ceiling are
//! skipped until their record is reset.

use crate::model::{RepreFile, SiteRecord};
use serde::{Deserialize, Serialize};

/// Action required for one file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    DoNothing,
    DoUpload,
    DoDownload,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::DoNothing => "do_nothing",
            SyncStatus::DoUpload => "do_upload",
            SyncStatus::DoDownload => "do_download",
        }
    }

    pub fn is_actionable(&self) -> bool {
        !matches!(self, SyncStatus::DoNothing)
    }
}

/// Inputs of [`check_status`] that come from configuration.
#[derive(Debug, Clone, Copy)]
pub struct StatusConfig<'a> {
    /// This machine's site id
    pub local_site_id: &'a str,
    /// Failed attempts after which a file is skipped
    pub retry_cnt: u32,
}

/// Evaluate what this machine has to do for `file`.
///
/// Only a machine owning one of the two sites transfers anything. Paused
/// records are never acted on, and a file is only uploaded when the local
/// site actually holds it.
pub fn check_status(
    file: &RepreFile,
    local_site: &str,
    remote_site: &str,
    config: &StatusConfig<'_>,
) -> SyncStatus {
    if local_site != config.local_site_id && remote_site != config.local_site_id {
        return SyncStatus::DoNothing;
    }
    if local_site == remote_site {
        return SyncStatus::DoNothing;
    }

    let local = file.site(local_site);
    let remote = file.site(remote_site);

    if !remote.is_some_and(SiteRecord::is_available) {
        let local_available = local.is_some_and(SiteRecord::is_available);
        if local_available && is_eligible(remote, config.retry_cnt) {
            return SyncStatus::DoUpload;
        }
        return SyncStatus::DoNothing;
    }

    if !local.is_some_and(SiteRecord::is_available) && is_eligible(local, config.retry_cnt) {
        return SyncStatus::DoDownload;
    }

    SyncStatus::DoNothing
}

fn is_eligible(record: Option<&SiteRecord>, retry_cnt: u32) -> bool {
    match record {
        None => retry_cnt > 0,
        Some(record) => !record.paused && record.tries_count() < retry_cnt,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    const LOCAL_ID: &str = "ws-01";

    fn config(retry_cnt: u32) -> StatusConfig<'static> {
        StatusConfig {
            local_site_id: LOCAL_ID,
            retry_cnt,
        }
    }

    fn failed(name: &str, tries: u32) -> SiteRecord {
        SiteRecord {
            tries: Some(tries),
            error: Some("boom".to_string()),
            ..SiteRecord::new(name)
        }
    }

    #[test]
    fn test_upload_when_only_local_record() {
        let file = RepreFile::new("{root}/a.ma", 1).with_site(SiteRecord::created(LOCAL_ID, Utc::now()));

        let status = check_status(&file, LOCAL_ID, "gdrive", &config(3));
        assert_eq!(status, SyncStatus::DoUpload);
    }

    #[test]
    fn test_upload_until_retry_ceiling() {
        for tries in 0..3 {
            let file = RepreFile::new("{root}/a.ma", 1)
                .with_site(SiteRecord::created(LOCAL_ID, Utc::now()))
                .with_site(failed("gdrive", tries));
            assert_eq!(
                check_status(&file, LOCAL_ID, "gdrive", &config(3)),
                SyncStatus::DoUpload,
                "tries = {}",
                tries
            );
        }

        let exhausted = RepreFile::new("{root}/a.ma", 1)
            .with_site(SiteRecord::created(LOCAL_ID, Utc::now()))
            .with_site(failed("gdrive", 3));
        assert_eq!(
            check_status(&exhausted, LOCAL_ID, "gdrive", &config(3)),
            SyncStatus::DoNothing
        );
    }

    #[test]
    fn test_download_when_remote_present() {
        let file = RepreFile::new("{root}/a.ma", 1)
            .with_site(SiteRecord::created("gdrive", Utc::now()))
            .with_site(SiteRecord::new(LOCAL_ID));
        assert_eq!(
            check_status(&file, LOCAL_ID, "gdrive", &config(3)),
            SyncStatus::DoDownload
        );

        let without_local = RepreFile::new("{root}/a.ma", 1)
            .with_site(SiteRecord::created("gdrive", Utc::now()));
        assert_eq!(
            check_status(&without_local, LOCAL_ID, "gdrive", &config(3)),
            SyncStatus::DoDownload
        );

        let exhausted = RepreFile::new("{root}/a.ma", 1)
            .with_site(SiteRecord::created("gdrive", Utc::now()))
            .with_site(failed(LOCAL_ID, 3));
        assert_eq!(
            check_status(&exhausted, LOCAL_ID, "gdrive", &config(3)),
            SyncStatus::DoNothing
        );
    }

    #[test]
    fn test_nothing_when_both_present() {
        let file = RepreFile::new("{root}/a.ma", 1)
            .with_site(SiteRecord::created("gdrive", Utc::now()))
            .with_site(SiteRecord::created(LOCAL_ID, Utc::now()));
        assert_eq!(
            check_status(&file, LOCAL_ID, "gdrive", &config(3)),
            SyncStatus::DoNothing
        );
    }

    #[test]
    fn test_foreign_site_pair_is_ignored() {
        let file = RepreFile::new("{root}/a.ma", 1)
            .with_site(SiteRecord::created("studio", Utc::now()));
        assert_eq!(
            check_status(&file, "studio", "gdrive", &config(3)),
            SyncStatus::DoNothing
        );
    }

    #[test]
    fn test_studio_machine_uploads() {
        let studio = StatusConfig {
            local_site_id: "studio",
            retry_cnt: 3,
        };
        let mut file = RepreFile::new("{root}/a.ma", 1);
        assert_eq!(
            check_status(&file, "studio", "gdrive", &studio),
            SyncStatus::DoNothing
        );

        file = file.with_site(SiteRecord::created("studio", Utc::now()));
        assert_eq!(
            check_status(&file, "studio", "gdrive", &studio),
            SyncStatus::DoUpload
        );

        file = file.with_site(failed("gdrive", 3));
        assert_eq!(
            check_status(&file, "studio", "gdrive", &studio),
            SyncStatus::DoNothing
        );
    }

    #[test]
    fn test_paused_records_are_skipped() {
        let mut remote = SiteRecord::new("gdrive");
        remote.paused = true;
        let file = RepreFile::new("{root}/a.ma", 1)
            .with_site(SiteRecord::created(LOCAL_ID, Utc::now()))
            .with_site(remote);
        assert_eq!(
            check_status(&file, LOCAL_ID, "gdrive", &config(3)),
            SyncStatus::DoNothing
        );

        let mut local = SiteRecord::new(LOCAL_ID);
        local.paused = true;
        let file = RepreFile::new("{root}/a.ma", 1)
            .with_site(SiteRecord::created("gdrive", Utc::now()))
            .with_site(local);
        assert_eq!(
            check_status(&file, LOCAL_ID, "gdrive", &config(3)),
            SyncStatus::DoNothing
        );
    }

    #[test]
    fn test_status_strings() {
        assert_eq!(SyncStatus::DoUpload.as_str(), "do_upload");
        assert!(SyncStatus::DoDownload.is_actionable());
        assert!(!SyncStatus::DoNothing.is_actionable());
    }
}

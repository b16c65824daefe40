//! Integration tests for the sync loop
//!
//! These tests drive complete iterations against an in-memory database and
//! disk-backed sites in a temporary directory:
//! - Upload and download of missing files
//! - Retry ceiling and failure bookkeeping
//! - Shared paths, batch limits and priorities
//! - Alternate site mirroring and paused records
//! - Server lifecycle with timer resets
//! - Shutdown with transfers in flight and per-project fault isolation

use bridge_desktop::LocalDriveProvider;
use bridge_traits::settings::{ProjectSyncSettings, SettingsDocument, SiteConfig};
use bridge_traits::provider::{FolderTree, RootsConfig, TransferProgress};
use bridge_traits::{Clock, SiteProvider, SystemClock};
use core_runtime::events::{CoreEvent, EventBus, SyncEvent};
use core_sync::{
    EngineOptions, ProviderRegistry, RepreFile, Representation, RepresentationRepository,
    SiteRecord, SiteResolver, SiteSelector, SiteSync, SqliteRepresentationRepository, SyncServer,
};
use sqlx::sqlite::SqlitePoolOptions;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tempfile::TempDir;

// ============================================================================
// Harness
// ============================================================================

struct Harness {
    _dir: TempDir,
    local_root: PathBuf,
    studio_root: PathBuf,
    nas_root: PathBuf,
    repository: Arc<SqliteRepresentationRepository>,
    events: EventBus,
    sync: SiteSync,
    before_upload: UploadHookSlot,
}

type UploadHook = Arc<dyn Fn(&str) + Send + Sync>;
type UploadHookSlot = Arc<RwLock<Option<UploadHook>>>;

/// Disk provider that runs the harness hook before every upload.
struct HookedDrive {
    inner: LocalDriveProvider,
    before_upload: UploadHookSlot,
}

impl SiteProvider for HookedDrive {
    fn code(&self) -> &str {
        self.inner.code()
    }

    fn site_name(&self) -> &str {
        self.inner.site_name()
    }

    fn is_active(&self) -> bool {
        self.inner.is_active()
    }

    fn get_roots_config(&self) -> RootsConfig {
        self.inner.get_roots_config()
    }

    fn get_tree(&self) -> bridge_traits::error::Result<FolderTree> {
        self.inner.get_tree()
    }

    fn create_folder(&self, path: &str) -> bridge_traits::error::Result<Option<String>> {
        self.inner.create_folder(path)
    }

    fn upload_file(
        &self,
        source: &Path,
        target: &str,
        overwrite: bool,
        progress: &dyn TransferProgress,
    ) -> bridge_traits::error::Result<String> {
        let hook = self.before_upload.read().unwrap().clone();
        if let Some(hook) = hook {
            hook(target);
        }
        self.inner.upload_file(source, target, overwrite, progress)
    }

    fn download_file(
        &self,
        source: &str,
        target: &Path,
        overwrite: bool,
        progress: &dyn TransferProgress,
    ) -> bridge_traits::error::Result<String> {
        self.inner.download_file(source, target, overwrite, progress)
    }

    fn file_exists(&self, path: &str) -> bridge_traits::error::Result<bool> {
        self.inner.file_exists(path)
    }

    fn resolve_path(&self, rootless: &str) -> bridge_traits::error::Result<String> {
        self.inner.resolve_path(rootless)
    }
}

fn roots(path: &Path) -> BTreeMap<String, String> {
    let mut roots = BTreeMap::new();
    roots.insert("work".to_string(), path.to_string_lossy().into_owned());
    roots
}

fn settings(dir: &Path, retry_cnt: u32) -> SettingsDocument {
    let mut document = SettingsDocument::default();
    document.system.enabled = true;
    document.system.sites.insert(
        "nas".to_string(),
        SiteConfig {
            root: roots(&dir.join("nas")),
            alternative_sites: vec!["studio".to_string()],
            ..SiteConfig::default()
        },
    );

    let mut project = ProjectSyncSettings {
        enabled: true,
        roots: roots(&dir.join("studio")),
        ..ProjectSyncSettings::default()
    };
    project.config.active_site = "local".to_string();
    project.config.remote_site = "studio".to_string();
    project.config.retry_cnt = retry_cnt;
    project.config.loop_delay = 3600;
    document.projects.insert("P1".to_string(), project);

    document
        .local
        .default
        .roots
        .insert("local".to_string(), roots(&dir.join("local")));
    document
}

async fn harness_with(retry_cnt: u32, batch_limit: usize) -> Harness {
    harness_configured(retry_cnt, batch_limit, |_, _| {}).await
}

async fn harness_configured(
    retry_cnt: u32,
    batch_limit: usize,
    configure: impl FnOnce(&Path, &mut SettingsDocument),
) -> Harness {
    let dir = TempDir::new().unwrap();
    let mut document = settings(dir.path(), retry_cnt);
    configure(dir.path(), &mut document);

    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    let repository = Arc::new(SqliteRepresentationRepository::new(pool));
    repository.initialize().await.unwrap();

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let resolver = Arc::new(SiteResolver::new(
        Arc::new(document),
        "ws-01",
        Arc::clone(&clock),
        Duration::from_secs(60),
    ));

    let before_upload: UploadHookSlot = Arc::new(RwLock::new(None));
    let hook_slot = Arc::clone(&before_upload);
    let mut providers = ProviderRegistry::new();
    providers.register("local_drive", batch_limit, move |site, config| {
        Ok(Arc::new(HookedDrive {
            inner: LocalDriveProvider::new(site, config.root.clone()),
            before_upload: Arc::clone(&hook_slot),
        }) as Arc<dyn SiteProvider>)
    });

    let events = EventBus::new(256);
    let server = Arc::new(SyncServer::new(
        repository.clone(),
        Arc::clone(&resolver),
        Arc::new(providers),
        events.clone(),
        clock,
        EngineOptions {
            shutdown_poll_interval: Duration::from_millis(10),
            ..EngineOptions::default()
        },
    ));
    let sync = SiteSync::new(repository.clone(), resolver, server);

    Harness {
        local_root: dir.path().join("local"),
        studio_root: dir.path().join("studio"),
        nas_root: dir.path().join("nas"),
        _dir: dir,
        repository,
        events,
        sync,
        before_upload,
    }
}

async fn harness() -> Harness {
    harness_with(3, 10).await
}

fn write(root: &Path, relative: &str, contents: &str) {
    let path = root.join(relative);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, contents).unwrap();
}

/// Representation available on this machine only.
fn local_only(relative: &str) -> Representation {
    Representation::new("P1", "modelMain").with_file(
        RepreFile::new(format!("{{root[work]}}/{}", relative), 1)
            .with_site(SiteRecord::created("ws-01", chrono::Utc::now()))
            .with_site(SiteRecord::new("studio")),
    )
}

impl Harness {
    async fn record(&self, repre: &Representation, site: &str) -> Option<SiteRecord> {
        let stored = self
            .repository
            .find_by_id("P1", &repre.id)
            .await
            .unwrap()
            .unwrap();
        stored.files[0].site(site).cloned()
    }

    /// Run `hook` with the physical target path before each upload starts.
    fn on_upload(&self, hook: impl Fn(&str) + Send + Sync + 'static) {
        *self.before_upload.write().unwrap() = Some(Arc::new(hook));
    }
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn test_upload_missing_remote_file() {
    let h = harness().await;
    write(&h.local_root, "P1/a.ma", "scene");
    let repre = local_only("P1/a.ma");
    h.repository.insert(&repre).await.unwrap();

    let report = h.sync.server().sync_project_once("P1").await.unwrap();
    assert_eq!(report.scheduled, 1);
    assert_eq!(report.failed, 0);

    assert_eq!(
        fs::read_to_string(h.studio_root.join("P1/a.ma")).unwrap(),
        "scene"
    );
    let studio = h.record(&repre, "studio").await.unwrap();
    assert!(studio.is_available());
    assert!(studio.tries.is_none());

    // nothing left to do
    let report = h.sync.server().sync_project_once("P1").await.unwrap();
    assert_eq!(report.scheduled, 0);
}

#[tokio::test]
async fn test_download_missing_local_file() {
    let h = harness().await;
    write(&h.studio_root, "P1/tex.png", "pixels");
    let repre = Representation::new("P1", "textures").with_file(
        RepreFile::new("{root[work]}/P1/tex.png", 6)
            .with_site(SiteRecord::new("ws-01"))
            .with_site(SiteRecord::created("studio", chrono::Utc::now())),
    );
    h.repository.insert(&repre).await.unwrap();

    let report = h.sync.server().sync_project_once("P1").await.unwrap();
    assert_eq!(report.scheduled, 1);

    assert_eq!(
        fs::read_to_string(h.local_root.join("P1/tex.png")).unwrap(),
        "pixels"
    );
    assert!(h.record(&repre, "ws-01").await.unwrap().is_available());
}

#[tokio::test]
async fn test_failures_stop_at_retry_ceiling() {
    let h = harness_with(2, 10).await;
    let repre = local_only("P1/missing.ma");
    h.repository.insert(&repre).await.unwrap();

    for expected in 1..=2 {
        let report = h.sync.server().sync_project_once("P1").await.unwrap();
        assert_eq!(report.scheduled, 1);
        assert_eq!(report.failed, 1);
        let studio = h.record(&repre, "studio").await.unwrap();
        assert_eq!(studio.tries, Some(expected));
        assert!(studio.error.is_some());
        assert!(studio.last_failed_dt.is_some());
    }

    let report = h.sync.server().sync_project_once("P1").await.unwrap();
    assert_eq!(report.scheduled, 0);

    // a reset makes the file eligible again
    h.sync
        .reset_site_on_representation("P1", &repre.id, &SiteSelector::Remote, None)
        .await
        .unwrap();
    write(&h.local_root, "P1/missing.ma", "found");
    let report = h.sync.server().sync_project_once("P1").await.unwrap();
    assert_eq!((report.scheduled, report.failed), (1, 0));
}

#[tokio::test]
async fn test_shared_path_is_transferred_once() {
    let h = harness().await;
    write(&h.local_root, "P1/shared.png", "tex");
    let first = local_only("P1/shared.png");
    let second = local_only("P1/shared.png");
    h.repository.insert(&first).await.unwrap();
    h.repository.insert(&second).await.unwrap();

    let report = h.sync.server().sync_project_once("P1").await.unwrap();
    assert_eq!(report.scheduled, 1);
    assert!(h.record(&first, "studio").await.unwrap().is_available());
    assert!(h.record(&second, "studio").await.unwrap().is_available());
}

#[tokio::test]
async fn test_batch_limit_and_priority() {
    let h = harness_with(3, 1).await;
    let mut repres = Vec::new();
    for name in ["a", "b", "c"] {
        let relative = format!("P1/{}.ma", name);
        write(&h.local_root, &relative, name);
        let repre = local_only(&relative);
        h.repository.insert(&repre).await.unwrap();
        repres.push(repre);
    }
    h.sync
        .set_priority("P1", &repres[2].id, "studio", None, Some(900))
        .await
        .unwrap();

    let report = h.sync.server().sync_project_once("P1").await.unwrap();
    assert_eq!(report.scheduled, 1);
    assert!(h.record(&repres[2], "studio").await.unwrap().is_available());
    assert!(!h.record(&repres[0], "studio").await.unwrap().is_available());

    for _ in 0..2 {
        h.sync.server().sync_project_once("P1").await.unwrap();
    }
    for repre in &repres {
        assert!(h.record(repre, "studio").await.unwrap().is_available());
    }

    assert!(h
        .sync
        .set_priority("P1", &repres[0].id, "studio", None, Some(0))
        .await
        .is_err());
}

#[tokio::test]
async fn test_upload_mirrors_alternate_site() {
    let h = harness().await;
    write(&h.local_root, "P1/a.ma", "scene");
    let repre = local_only("P1/a.ma");
    h.repository.insert(&repre).await.unwrap();

    h.sync.server().sync_project_once("P1").await.unwrap();

    let nas = h.record(&repre, "nas").await.unwrap();
    assert!(nas.is_available());
    assert!(!h.nas_root.join("P1/a.ma").exists());
}

#[tokio::test]
async fn test_paused_records_and_projects_are_skipped() {
    let h = harness().await;
    write(&h.local_root, "P1/a.ma", "scene");
    let repre = local_only("P1/a.ma");
    h.repository.insert(&repre).await.unwrap();

    h.sync
        .pause_representation("P1", &repre.id, Some("studio"))
        .await
        .unwrap();
    assert_eq!(h.sync.server().sync_project_once("P1").await.unwrap().scheduled, 0);

    h.sync
        .unpause_representation("P1", &repre.id, None)
        .await
        .unwrap();
    h.sync.pause_project("P1");
    assert_eq!(h.sync.server().sync_project_once("P1").await.unwrap().scheduled, 0);

    h.sync.unpause_project("P1");
    h.sync.pause_server();
    assert_eq!(h.sync.server().sync_project_once("P1").await.unwrap().scheduled, 0);

    h.sync.unpause_server();
    assert_eq!(h.sync.server().sync_project_once("P1").await.unwrap().scheduled, 1);
}

#[tokio::test]
async fn test_add_representation_and_remove_local_files() {
    let h = harness().await;
    write(&h.local_root, "P1/b.ma", "scene");
    let repre = Representation::new("P1", "modelMain")
        .with_file(RepreFile::new("{root[work]}/P1/b.ma", 5));

    let stored = h.sync.add_representation(repre).await.unwrap();
    let names: Vec<_> = stored.files[0]
        .sites
        .iter()
        .map(|site| (site.name.as_str(), site.is_available()))
        .collect();
    assert_eq!(names, vec![("ws-01", true), ("studio", false), ("nas", false)]);

    h.sync
        .remove_site("P1", &stored.id, "local", true)
        .await
        .unwrap();
    assert!(!h.local_root.join("P1/b.ma").exists());
    assert!(h.record(&stored, "ws-01").await.is_none());

    h.sync
        .add_site("P1", &stored.id, "local", None, false)
        .await
        .unwrap();
    assert!(h
        .sync
        .add_site("P1", &stored.id, "local", None, false)
        .await
        .is_err());
    assert_eq!(h.sync.clear_project("P1", "nas").await.unwrap(), 1);
}

#[tokio::test]
async fn test_running_server_syncs_on_reset_timer() {
    let h = harness().await;
    let mut events = h.events.subscribe();
    h.sync.server().start().unwrap();

    write(&h.local_root, "P1/late.ma", "late");
    let repre = local_only("P1/late.ma");
    h.repository.insert(&repre).await.unwrap();
    h.sync.reset_timer();

    let finished = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if let CoreEvent::Sync(SyncEvent::TransferFinished { site, .. }) =
                events.recv().await.unwrap()
            {
                return site;
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(finished, "studio");

    h.sync.server().stop().await.unwrap();
    assert!(!h.sync.server().is_running());
    assert!(h.record(&repre, "studio").await.unwrap().is_available());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_deleted_representation_does_not_abort_iteration() {
    let h = harness().await;
    write(&h.local_root, "P1/doomed.ma", "doomed");
    write(&h.local_root, "P1/keep.ma", "keep");
    let doomed = local_only("P1/doomed.ma");
    let keep = local_only("P1/keep.ma");
    h.repository.insert(&doomed).await.unwrap();
    h.repository.insert(&keep).await.unwrap();
    h.sync
        .set_priority("P1", &doomed.id, "studio", None, Some(900))
        .await
        .unwrap();

    // the representation disappears while its file is being uploaded
    let repository = h.repository.clone();
    let runtime = tokio::runtime::Handle::current();
    let doomed_id = doomed.id.clone();
    h.on_upload(move |target| {
        if target.ends_with("doomed.ma") {
            assert!(runtime.block_on(repository.delete("P1", &doomed_id)).unwrap());
        }
    });

    let report = h.sync.server().sync_project_once("P1").await.unwrap();
    assert_eq!((report.scheduled, report.failed), (2, 1));

    assert!(h.repository.find_by_id("P1", &doomed.id).await.unwrap().is_none());
    assert!(h.record(&keep, "studio").await.unwrap().is_available());
    assert!(h.record(&keep, "nas").await.unwrap().is_available());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stop_waits_for_running_transfers() {
    let h = harness().await;
    let mut repres = Vec::new();
    for name in ["a", "b", "c"] {
        let relative = format!("P1/{}.ma", name);
        write(&h.local_root, &relative, name);
        let repre = local_only(&relative);
        h.repository.insert(&repre).await.unwrap();
        repres.push(repre);
    }
    h.on_upload(|_| std::thread::sleep(Duration::from_millis(300)));

    let server = h.sync.server();
    server.start().unwrap();
    tokio::time::timeout(Duration::from_secs(10), async {
        while server.active_transfers() < repres.len() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    server.stop().await.unwrap();
    assert!(!server.is_running());
    assert_eq!(server.active_transfers(), 0);
    for (repre, name) in repres.iter().zip(["a", "b", "c"]) {
        assert!(h.record(repre, "studio").await.unwrap().is_available());
        assert_eq!(
            fs::read_to_string(h.studio_root.join(format!("P1/{}.ma", name))).unwrap(),
            name
        );
    }
}

#[tokio::test]
async fn test_misconfigured_project_does_not_block_others() {
    let h = harness_configured(3, 10, |dir, document| {
        let mut project = ProjectSyncSettings {
            enabled: true,
            roots: roots(&dir.join("vault")),
            ..ProjectSyncSettings::default()
        };
        project.config.active_site = "local".to_string();
        project.config.remote_site = "vault".to_string();
        project.config.loop_delay = 3600;
        project.sites.insert(
            "vault".to_string(),
            SiteConfig {
                provider: "tape_robot".to_string(),
                root: roots(&dir.join("vault")),
                ..SiteConfig::default()
            },
        );
        document.projects.insert("P2".to_string(), project);
    })
    .await;
    write(&h.local_root, "P1/a.ma", "scene");
    let repre = local_only("P1/a.ma");
    h.repository.insert(&repre).await.unwrap();

    let mut events = h.events.subscribe();
    h.sync.server().start().unwrap();

    let message = tokio::time::timeout(Duration::from_secs(10), async {
        let mut failure = None;
        let mut synced = false;
        loop {
            match events.recv().await.unwrap() {
                CoreEvent::Sync(SyncEvent::ProjectFailed {
                    project, message, ..
                }) if project == "P2" => failure = Some(message),
                CoreEvent::Sync(SyncEvent::TransferFinished { project, .. }) if project == "P1" => {
                    synced = true
                }
                _ => {}
            }
            if synced {
                if let Some(message) = failure.take() {
                    return message;
                }
            }
        }
    })
    .await
    .unwrap();

    h.sync.server().stop().await.unwrap();
    assert!(message.contains("tape_robot"));
    assert!(h.record(&repre, "studio").await.unwrap().is_available());
}

#[tokio::test]
async fn test_remove_unattached_site_keeps_local_files() {
    let h = harness().await;
    write(&h.local_root, "P1/c.ma", "scene");
    let repre = Representation::new("P1", "modelMain").with_file(
        RepreFile::new("{root[work]}/P1/c.ma", 5)
            .with_site(SiteRecord::created("studio", chrono::Utc::now())),
    );
    h.repository.insert(&repre).await.unwrap();

    let err = h
        .sync
        .remove_site("P1", &repre.id, "local", true)
        .await
        .unwrap_err();
    assert!(matches!(err, core_sync::SyncError::SiteNotFound { .. }));
    assert!(h.local_root.join("P1/c.ma").exists());
    assert!(h.record(&repre, "studio").await.unwrap().is_available());
}

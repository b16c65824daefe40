//! Local Drive Provider
//!
//! Serves a site backed by a locally mounted file system (local disk, NAS
//! share, mapped network drive).

use bridge_traits::{
    error::{BridgeError, Result},
    provider::{FolderTree, RootsConfig, SiteProvider, TransferProgress},
    settings::LOCAL_DRIVE_PROVIDER,
};
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, warn};

const COPY_CHUNK_SIZE: usize = 1024 * 1024;

/// Disk-backed site provider.
///
/// Uploads and downloads are plain file copies. Data is first written to a
/// `.part` sibling and renamed into place once complete, so readers never
/// observe a half-written file.
pub struct LocalDriveProvider {
    site_name: String,
    roots: RootsConfig,
    tree: Mutex<FolderTree>,
}

impl LocalDriveProvider {
    pub fn new(site_name: impl Into<String>, roots: RootsConfig) -> Self {
        Self {
            site_name: site_name.into(),
            roots,
            tree: Mutex::new(FolderTree::new()),
        }
    }

    fn remember_folder(&self, path: &str) {
        if let Ok(mut tree) = self.tree.lock() {
            tree.insert(path.to_string(), path.to_string());
        }
    }

    fn copy_file(
        &self,
        source: &Path,
        target: &Path,
        overwrite: bool,
        progress: &dyn TransferProgress,
    ) -> Result<String> {
        if !source.is_file() {
            return Err(BridgeError::NotFound(source.display().to_string()));
        }
        if target.exists() && !overwrite {
            return Err(BridgeError::AlreadyExists(target.display().to_string()));
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }

        let total = fs::metadata(source)?.len();
        let partial = partial_path(target);
        let mut reader = fs::File::open(source)?;
        let writer = fs::File::create(&partial)?;

        let copied = match write_partial(&mut reader, writer, total, progress)
            .and_then(|copied| fs::rename(&partial, target).map(|_| copied).map_err(BridgeError::from))
        {
            Ok(copied) => copied,
            Err(e) => {
                if let Err(cleanup) = fs::remove_file(&partial) {
                    warn!(path = %partial.display(), error = %cleanup, "Failed to remove partial file");
                }
                return Err(e);
            }
        };
        progress.report(1.0);

        debug!(
            site = %self.site_name,
            source = %source.display(),
            target = %target.display(),
            bytes = copied,
            "Copied file"
        );

        Ok(target
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| target.display().to_string()))
    }
}

/// Stream `reader` into `writer` in chunks, checking for cancellation
/// between chunks. Returns the number of bytes written.
fn write_partial(
    reader: &mut impl Read,
    mut writer: fs::File,
    total: u64,
    progress: &dyn TransferProgress,
) -> Result<u64> {
    let mut buffer = vec![0u8; COPY_CHUNK_SIZE];
    let mut copied: u64 = 0;

    loop {
        if progress.is_cancelled() {
            return Err(BridgeError::Cancelled);
        }

        let read = reader.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        writer.write_all(&buffer[..read])?;
        copied += read as u64;

        if total > 0 {
            progress.report(copied as f32 / total as f32);
        }
    }

    writer.flush()?;
    Ok(copied)
}

fn partial_path(target: &Path) -> PathBuf {
    let mut name = target
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".part");
    target.with_file_name(name)
}

impl SiteProvider for LocalDriveProvider {
    fn code(&self) -> &str {
        LOCAL_DRIVE_PROVIDER
    }

    fn site_name(&self) -> &str {
        &self.site_name
    }

    fn is_active(&self) -> bool {
        true
    }

    fn get_roots_config(&self) -> RootsConfig {
        self.roots.clone()
    }

    fn get_tree(&self) -> Result<FolderTree> {
        self.tree
            .lock()
            .map(|tree| tree.clone())
            .map_err(|_| BridgeError::OperationFailed("Folder tree lock poisoned".to_string()))
    }

    fn create_folder(&self, path: &str) -> Result<Option<String>> {
        if path.is_empty() {
            return Ok(None);
        }
        fs::create_dir_all(path)?;
        self.remember_folder(path);
        Ok(Some(path.to_string()))
    }

    fn upload_file(
        &self,
        source: &Path,
        target: &str,
        overwrite: bool,
        progress: &dyn TransferProgress,
    ) -> Result<String> {
        self.copy_file(source, Path::new(target), overwrite, progress)
    }

    fn download_file(
        &self,
        source: &str,
        target: &Path,
        overwrite: bool,
        progress: &dyn TransferProgress,
    ) -> Result<String> {
        self.copy_file(Path::new(source), target, overwrite, progress)
    }

    fn file_exists(&self, path: &str) -> Result<bool> {
        match fs::metadata(path) {
            Ok(meta) => Ok(meta.is_file()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => {
                warn!(site = %self.site_name, path, error = %e, "Failed to stat file");
                Err(BridgeError::Io(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bridge_traits::provider::NoProgress;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tempfile::TempDir;

    struct CountingProgress {
        reports: AtomicUsize,
        cancel: AtomicBool,
    }

    impl TransferProgress for CountingProgress {
        fn report(&self, _progress: f32) {
            self.reports.fetch_add(1, Ordering::SeqCst);
        }

        fn is_cancelled(&self) -> bool {
            self.cancel.load(Ordering::SeqCst)
        }
    }

    fn provider(dir: &TempDir) -> LocalDriveProvider {
        let mut roots = RootsConfig::new();
        roots.insert(
            "work".to_string(),
            dir.path().join("remote").to_string_lossy().into_owned(),
        );
        LocalDriveProvider::new("nas", roots)
    }

    #[test]
    fn test_upload_creates_parents_and_reports_progress() {
        let dir = TempDir::new().unwrap();
        let provider = provider(&dir);
        let source = dir.path().join("a.txt");
        fs::write(&source, b"hello").unwrap();

        let target = provider.resolve_path("{root[work]}/shot/a.txt").unwrap();
        let progress = CountingProgress {
            reports: AtomicUsize::new(0),
            cancel: AtomicBool::new(false),
        };
        let id = provider
            .upload_file(&source, &target, false, &progress)
            .unwrap();

        assert_eq!(id, "a.txt");
        assert_eq!(fs::read(&target).unwrap(), b"hello");
        assert!(progress.reports.load(Ordering::SeqCst) >= 1);
        assert!(provider.file_exists(&target).unwrap());
    }

    #[test]
    fn test_upload_refuses_overwrite() {
        let dir = TempDir::new().unwrap();
        let provider = provider(&dir);
        let source = dir.path().join("a.txt");
        fs::write(&source, b"new").unwrap();
        let target = dir.path().join("existing.txt");
        fs::write(&target, b"old").unwrap();

        let err = provider
            .upload_file(&source, target.to_str().unwrap(), false, &NoProgress)
            .unwrap_err();
        assert!(matches!(err, BridgeError::AlreadyExists(_)));

        provider
            .upload_file(&source, target.to_str().unwrap(), true, &NoProgress)
            .unwrap();
        assert_eq!(fs::read(&target).unwrap(), b"new");
    }

    #[test]
    fn test_download_missing_source() {
        let dir = TempDir::new().unwrap();
        let provider = provider(&dir);
        let missing = dir.path().join("nope.bin");

        let err = provider
            .download_file(
                missing.to_str().unwrap(),
                &dir.path().join("out.bin"),
                true,
                &NoProgress,
            )
            .unwrap_err();
        assert!(matches!(err, BridgeError::NotFound(_)));
    }

    #[test]
    fn test_cancelled_copy_leaves_no_partial_file() {
        let dir = TempDir::new().unwrap();
        let provider = provider(&dir);
        let source = dir.path().join("big.bin");
        fs::write(&source, vec![7u8; 16]).unwrap();
        let target = dir.path().join("copy.bin");
        let progress = CountingProgress {
            reports: AtomicUsize::new(0),
            cancel: AtomicBool::new(true),
        };

        let err = provider
            .upload_file(&source, target.to_str().unwrap(), true, &progress)
            .unwrap_err();

        assert!(matches!(err, BridgeError::Cancelled));
        assert!(!target.exists());
        assert!(!partial_path(&target).exists());
    }

    #[test]
    fn test_failed_rename_leaves_no_partial_file() {
        let dir = TempDir::new().unwrap();
        let provider = provider(&dir);
        let source = dir.path().join("a.txt");
        fs::write(&source, b"hello").unwrap();
        let target = dir.path().join("occupied");
        fs::create_dir_all(target.join("inner")).unwrap();

        let err = provider
            .upload_file(&source, target.to_str().unwrap(), true, &NoProgress)
            .unwrap_err();

        assert!(matches!(err, BridgeError::Io(_)));
        assert!(target.join("inner").is_dir());
        assert!(!partial_path(&target).exists());
    }

    #[test]
    fn test_create_folder_tracks_tree() {
        let dir = TempDir::new().unwrap();
        let provider = provider(&dir);
        let folder = dir.path().join("x/y/z");
        let folder = folder.to_str().unwrap();

        let id = provider.create_folder(folder).unwrap();

        assert_eq!(id.as_deref(), Some(folder));
        assert!(Path::new(folder).is_dir());
        assert!(provider.get_tree().unwrap().contains_key(folder));
        assert_eq!(provider.create_folder("").unwrap(), None);
    }
}

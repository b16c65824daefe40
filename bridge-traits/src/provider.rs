//! Storage Provider Abstraction
//!
//! Contract for the storage backends that sit behind a sync site (local or
//! network disk, cloud drives, remote file systems). The engine assumes no
//! capability beyond what is declared here.
//!
//! Provider calls are blocking; the transfer executor runs them on a worker
//! pool so the coordinating loop never waits on I/O.

use crate::error::{BridgeError, Result};
use std::collections::BTreeMap;
use std::path::Path;

/// Snapshot of the folder structure known to a provider session, keyed by
/// folder path with the provider's folder id as value.
pub type FolderTree = BTreeMap<String, String>;

/// Root name to physical path mapping (e.g. `work` -> `/mnt/projects`).
pub type RootsConfig = BTreeMap<String, String>;

/// Progress sink handed to a running transfer.
pub trait TransferProgress: Send + Sync {
    /// Report completion in the range `0.0..=1.0`.
    fn report(&self, progress: f32);

    /// Whether the transfer should abort before writing more data.
    fn is_cancelled(&self) -> bool {
        false
    }
}

/// Progress sink that drops every report.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProgress;

impl TransferProgress for NoProgress {
    fn report(&self, _progress: f32) {}
}

/// Storage backend of a single site.
///
/// # Example
///
/// ```ignore
/// use bridge_traits::provider::{NoProgress, SiteProvider};
///
/// fn push(provider: &dyn SiteProvider) -> bridge_traits::error::Result<String> {
///     let target = provider.resolve_path("{root[work]}/shot010/plate.exr")?;
///     provider.upload_file("/tmp/plate.exr".as_ref(), &target, true, &NoProgress)
/// }
/// ```
pub trait SiteProvider: Send + Sync {
    /// Provider code this instance was created for (e.g. `local_drive`).
    fn code(&self) -> &str;

    /// Name of the site served by this instance.
    fn site_name(&self) -> &str;

    /// Whether credentials and configuration are usable.
    fn is_active(&self) -> bool;

    /// Root mapping used to resolve rootless paths for this site.
    fn get_roots_config(&self) -> RootsConfig;

    /// Cached folder structure snapshot.
    fn get_tree(&self) -> Result<FolderTree>;

    /// Create `path` including missing parents. Returns the folder id when
    /// the backend assigns one.
    fn create_folder(&self, path: &str) -> Result<Option<String>>;

    /// Copy the local `source` to `target` on this site.
    fn upload_file(
        &self,
        source: &Path,
        target: &str,
        overwrite: bool,
        progress: &dyn TransferProgress,
    ) -> Result<String>;

    /// Copy `source` on this site to the local `target`.
    fn download_file(
        &self,
        source: &str,
        target: &Path,
        overwrite: bool,
        progress: &dyn TransferProgress,
    ) -> Result<String>;

    /// Whether `path` exists on this site.
    fn file_exists(&self, path: &str) -> Result<bool>;

    /// Resolve a rootless template against this site's roots.
    fn resolve_path(&self, rootless: &str) -> Result<String> {
        fill_roots(rootless, &self.get_roots_config(), self.site_name())
    }
}

/// Replace `{root[name]}` and bare `{root}` placeholders with physical roots.
///
/// A bare `{root}` resolves to the only configured root, or to `work` when
/// several roots exist.
pub fn fill_roots(template: &str, roots: &RootsConfig, site: &str) -> Result<String> {
    let mut output = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("{root") {
        output.push_str(&rest[..start]);
        let tail = &rest[start..];
        let end = tail.find('}').ok_or_else(|| {
            BridgeError::OperationFailed(format!("Unterminated root placeholder in '{}'", template))
        })?;
        let placeholder = &tail[..=end];

        let value = if placeholder == "{root}" {
            default_root(roots).ok_or_else(|| BridgeError::MissingRoot {
                root: "root".to_string(),
                site: site.to_string(),
            })?
        } else if let Some(name) = placeholder
            .strip_prefix("{root[")
            .and_then(|inner| inner.strip_suffix("]}"))
        {
            roots.get(name).ok_or_else(|| BridgeError::MissingRoot {
                root: name.to_string(),
                site: site.to_string(),
            })?
        } else {
            return Err(BridgeError::OperationFailed(format!(
                "Unsupported root placeholder '{}'",
                placeholder
            )));
        };

        output.push_str(value.trim_end_matches(['/', '\\']));
        rest = &tail[end + 1..];
    }

    output.push_str(rest);
    Ok(output)
}

fn default_root(roots: &RootsConfig) -> Option<&String> {
    if roots.len() == 1 {
        return roots.values().next();
    }
    roots.get("work")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roots() -> RootsConfig {
        let mut roots = RootsConfig::new();
        roots.insert("work".to_string(), "/mnt/work/".to_string());
        roots.insert("publish".to_string(), "/mnt/publish".to_string());
        roots
    }

    #[test]
    fn test_fill_named_roots() {
        let path = fill_roots("{root[publish]}/proj/a.ma", &roots(), "studio").unwrap();
        assert_eq!(path, "/mnt/publish/proj/a.ma");

        let path = fill_roots("{root[work]}/proj/a.ma", &roots(), "studio").unwrap();
        assert_eq!(path, "/mnt/work/proj/a.ma");
    }

    #[test]
    fn test_fill_bare_root_prefers_work() {
        let path = fill_roots("{root}/proj/a.ma", &roots(), "studio").unwrap();
        assert_eq!(path, "/mnt/work/proj/a.ma");

        let mut single = RootsConfig::new();
        single.insert("main".to_string(), "D:/data".to_string());
        let path = fill_roots("{root}/a.ma", &single, "local").unwrap();
        assert_eq!(path, "D:/data/a.ma");
    }

    #[test]
    fn test_missing_root_reports_site() {
        let err = fill_roots("{root[render]}/a.exr", &roots(), "gdrive").unwrap_err();
        match err {
            BridgeError::MissingRoot { root, site } => {
                assert_eq!(root, "render");
                assert_eq!(site, "gdrive");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    struct RootsOnly;

    impl SiteProvider for RootsOnly {
        fn code(&self) -> &str {
            "test"
        }

        fn site_name(&self) -> &str {
            "sftp"
        }

        fn is_active(&self) -> bool {
            true
        }

        fn get_roots_config(&self) -> RootsConfig {
            roots()
        }

        fn get_tree(&self) -> Result<FolderTree> {
            Ok(FolderTree::new())
        }

        fn create_folder(&self, _path: &str) -> Result<Option<String>> {
            Ok(None)
        }

        fn upload_file(
            &self,
            _source: &Path,
            target: &str,
            _overwrite: bool,
            _progress: &dyn TransferProgress,
        ) -> Result<String> {
            Ok(target.to_string())
        }

        fn download_file(
            &self,
            source: &str,
            _target: &Path,
            _overwrite: bool,
            _progress: &dyn TransferProgress,
        ) -> Result<String> {
            Ok(source.to_string())
        }

        fn file_exists(&self, _path: &str) -> Result<bool> {
            Ok(false)
        }
    }

    #[test]
    fn test_default_resolve_path_uses_provider_roots() {
        let resolved = RootsOnly.resolve_path("{root[work]}/shot/a.exr").unwrap();
        assert_eq!(resolved, "/mnt/work/shot/a.exr");
    }

    #[test]
    fn test_template_without_placeholder_is_unchanged() {
        let path = fill_roots("/abs/path/file.txt", &roots(), "studio").unwrap();
        assert_eq!(path, "/abs/path/file.txt");
    }
}

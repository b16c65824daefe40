//! # Transfer Executor
//!
//! Runs the byte transfers scheduled by one loop iteration.
//!
//! ## Overview
//!
//! Provider calls are blocking, so every transfer runs on tokio's blocking
//! pool. A semaphore caps how many transfers run at once (`worker_threads`);
//! the coordinating task only awaits the results.
//!
//! Preparing the destination folder mutates the provider's folder tree and
//! is serialized behind one lock shared by all transfers. The copy itself
//! runs without the lock.
//!
//! ## Cancellation
//!
//! A transfer still waiting for a worker slot is abandoned when the
//! cancellation token fires and reports [`SyncError::Cancelled`]. A transfer
//! that already holds a slot always runs to completion.

use crate::{Result, SyncError};
use bridge_traits::provider::{fill_roots, RootsConfig, SiteProvider, TransferProgress};
use core_runtime::events::TransferDirection;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

/// One file transfer between this machine and a provider.
pub struct TransferJob {
    pub direction: TransferDirection,
    /// Path template with `{root[..]}` placeholders
    pub rootless_path: String,
    /// Provider of the remote site
    pub provider: Arc<dyn SiteProvider>,
    /// Roots of the active site as mounted on this machine
    pub local_roots: RootsConfig,
    /// Active site name, used in missing-root errors
    pub local_site: String,
    pub progress: Arc<dyn TransferProgress>,
}

impl std::fmt::Debug for TransferJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferJob")
            .field("direction", &self.direction)
            .field("rootless_path", &self.rootless_path)
            .field("remote_site", &self.provider.site_name())
            .field("local_site", &self.local_site)
            .finish()
    }
}

/// Bounded pool for blocking provider transfers.
#[derive(Debug, Clone)]
pub struct TransferExecutor {
    permits: Arc<Semaphore>,
    workers: usize,
    folder_lock: Arc<Mutex<()>>,
}

impl TransferExecutor {
    pub fn new(workers: usize) -> Self {
        let workers = workers.max(1);
        Self {
            permits: Arc::new(Semaphore::new(workers)),
            workers,
            folder_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Transfers currently holding a worker slot.
    pub fn active(&self) -> usize {
        self.workers - self.permits.available_permits()
    }

    /// Run one transfer and return the identifier reported by the
    /// destination (provider file id for uploads, local path for downloads).
    #[instrument(skip(self, job, cancel), fields(direction = %job.direction, path = %job.rootless_path))]
    pub async fn execute(&self, job: TransferJob, cancel: &CancellationToken) -> Result<String> {
        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(SyncError::Cancelled),
            permit = Arc::clone(&self.permits).acquire_owned() => {
                permit.map_err(|_| SyncError::Cancelled)?
            }
        };

        let folder_lock = Arc::clone(&self.folder_lock);
        let result = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            match job.direction {
                TransferDirection::Upload => upload(&job, &folder_lock),
                TransferDirection::Download => download(&job, &folder_lock),
            }
        })
        .await
        .map_err(|e| SyncError::Internal(format!("Transfer worker failed: {}", e)))?;

        if let Ok(id) = &result {
            debug!(id = %id, "Transfer finished");
        }
        result
    }

    /// Run every job concurrently and collect each outcome in job order.
    ///
    /// One failure never cancels its siblings.
    pub async fn run_all(
        &self,
        jobs: Vec<TransferJob>,
        cancel: &CancellationToken,
    ) -> Vec<Result<String>> {
        futures::future::join_all(jobs.into_iter().map(|job| self.execute(job, cancel))).await
    }
}

fn lock_folders(lock: &Mutex<()>) -> Result<std::sync::MutexGuard<'_, ()>> {
    lock.lock()
        .map_err(|_| SyncError::Internal("Folder lock poisoned".to_string()))
}

fn parent_of(path: &str) -> Option<&str> {
    Path::new(path)
        .parent()
        .and_then(|parent| parent.to_str())
        .filter(|parent| !parent.is_empty())
}

fn upload(job: &TransferJob, folder_lock: &Mutex<()>) -> Result<String> {
    let source = fill_roots(&job.rootless_path, &job.local_roots, &job.local_site)?;
    let target = job.provider.resolve_path(&job.rootless_path)?;

    if !Path::new(&source).is_file() {
        return Err(SyncError::Transfer(format!("Local file {} does not exist", source)));
    }

    if let Some(folder) = parent_of(&target) {
        let _guard = lock_folders(folder_lock)?;
        job.provider.create_folder(folder)?;
    }

    debug!(source = %source, target = %target, "Uploading");
    Ok(job
        .provider
        .upload_file(Path::new(&source), &target, true, job.progress.as_ref())?)
}

fn download(job: &TransferJob, folder_lock: &Mutex<()>) -> Result<String> {
    let source = job.provider.resolve_path(&job.rootless_path)?;
    let target = fill_roots(&job.rootless_path, &job.local_roots, &job.local_site)?;

    if let Some(folder) = Path::new(&target).parent() {
        let _guard = lock_folders(folder_lock)?;
        std::fs::create_dir_all(folder).map_err(bridge_traits::BridgeError::from)?;
    }

    debug!(source = %source, target = %target, "Downloading");
    job.provider
        .download_file(&source, Path::new(&target), true, job.progress.as_ref())?;
    Ok(target)
}

//! # Sync Server
//!
//! The long-running loop that keeps site records and physical files in step.
//!
//! ## Overview
//!
//! One coordinating task per [`SyncServer`] walks every enabled project,
//! schedules the transfers its files need and persists the outcomes. Byte
//! transfers run on the [`TransferExecutor`] pool; the coordinator only
//! queries, evaluates and writes.
//!
//! ```text
//! Stopped -> Running: QUERY -> SCHEDULE -> AWAIT -> PERSIST -> SLEEP -> QUERY ...
//! ```
//!
//! Each project keeps its own next-due instant derived from its
//! `loop_delay`. A failure inside one project is logged, reported as
//! [`SyncEvent::ProjectFailed`] and does not affect the others.
//!
//! ## Shutdown
//!
//! [`SyncServer::stop`] cancels the coordinator. Transfers already holding a
//! worker slot finish and are persisted; transfers still waiting for a slot
//! are dropped without touching their records.

use crate::model::FileTarget;
use crate::persist::{OutcomeWriter, ProgressChannel, TransferOutcome};
use crate::providers::ProviderRegistry;
use crate::query::SyncQuery;
use crate::repository::{RepresentationRepository, SiteTarget};
use crate::sites::{ResolvedProject, SiteResolver};
use crate::status::{check_status, StatusConfig, SyncStatus};
use crate::transfer::{TransferExecutor, TransferJob};
use crate::{Result, SyncError};
use bridge_traits::Clock;
use core_runtime::config::{
    CoreConfig, DEFAULT_PRIORITY, DEFAULT_PROGRESS_INTERVAL, DEFAULT_REPRESENTATION_LIMIT,
    DEFAULT_SHUTDOWN_POLL, DEFAULT_WORKER_THREADS,
};
use core_runtime::events::{CoreEvent, EventBus, ServerEvent, SyncEvent, TransferDirection};
use futures::FutureExt;
use serde::Serialize;
use std::collections::{HashMap, HashSet, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Wait used when nothing is scheduled or a project could not be resolved.
const IDLE_DELAY: Duration = Duration::from_secs(60);

// ============================================================================
// Options and state
// ============================================================================

/// Tuning knobs of the loop, taken from [`CoreConfig`].
#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub worker_threads: usize,
    pub representation_limit: usize,
    pub default_priority: i64,
    pub shutdown_poll_interval: Duration,
    pub progress_interval: Duration,
}

impl EngineOptions {
    pub fn from_config(config: &CoreConfig) -> Self {
        Self {
            worker_threads: config.worker_threads,
            representation_limit: config.representation_limit,
            default_priority: config.default_priority,
            shutdown_poll_interval: config.shutdown_poll_interval,
            progress_interval: config.progress_interval,
        }
    }
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            worker_threads: DEFAULT_WORKER_THREADS,
            representation_limit: DEFAULT_REPRESENTATION_LIMIT,
            default_priority: DEFAULT_PRIORITY,
            shutdown_poll_interval: DEFAULT_SHUTDOWN_POLL,
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerState {
    Stopped,
    Running,
}

impl ServerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServerState::Stopped => "stopped",
            ServerState::Running => "running",
        }
    }
}

/// Flags and queues shared between the coordinator and its controllers.
#[derive(Default)]
struct Control {
    paused: AtomicBool,
    paused_projects: RwLock<HashSet<String>>,
    wake: Notify,
    before_loop: Mutex<VecDeque<Vec<String>>>,
}

enum Wake {
    Due,
    Reset,
    Stop,
}

/// Summary of one project iteration.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct IterationReport {
    pub scheduled: usize,
    pub failed: usize,
}

struct Running {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

// ============================================================================
// Engine
// ============================================================================

struct Engine {
    repository: Arc<dyn RepresentationRepository>,
    resolver: Arc<SiteResolver>,
    providers: Arc<ProviderRegistry>,
    events: EventBus,
    executor: TransferExecutor,
    writer: OutcomeWriter,
    options: EngineOptions,
    control: Control,
}

impl Engine {
    async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let _ = self
            .events
            .emit(CoreEvent::Server(ServerEvent::Started {
                local_site: self.resolver.local_site_id().to_string(),
            }));
        info!(local_site = %self.resolver.local_site_id(), "Sync server started");

        let outcome = AssertUnwindSafe(self.run_loop(&cancel)).catch_unwind().await;
        let event = match outcome {
            Ok(Ok(())) => {
                info!("Sync server stopped");
                ServerEvent::Stopped
            }
            Ok(Err(e)) => {
                error!(error = %e, "Sync loop terminated");
                ServerEvent::Crashed {
                    message: e.to_string(),
                }
            }
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                error!(panic = %message, "Sync loop panicked");
                ServerEvent::Crashed { message }
            }
        };
        let _ = self.events.emit(CoreEvent::Server(event));
    }

    async fn run_loop(&self, cancel: &CancellationToken) -> Result<()> {
        let mut next_due: HashMap<String, Instant> = HashMap::new();

        loop {
            if cancel.is_cancelled() {
                return Ok(());
            }

            self.run_before_loop_commands().await;

            let projects = match self.resolver.get_enabled_projects().await {
                Ok(projects) => projects,
                Err(e) if e.is_retryable() => {
                    warn!(error = %e, "Could not read sync settings, retrying later");
                    match self.sleep_until(Instant::now() + IDLE_DELAY, cancel).await {
                        Wake::Stop => return Ok(()),
                        Wake::Reset => self.resolver.invalidate().await,
                        Wake::Due => {}
                    }
                    continue;
                }
                Err(e) => return Err(e),
            };

            for project in &projects {
                if cancel.is_cancelled() {
                    return Ok(());
                }
                if next_due
                    .get(project)
                    .is_some_and(|due| *due > Instant::now())
                {
                    continue;
                }

                let delay = match self.process_project(project, cancel).await {
                    Ok(delay) => delay,
                    Err(e) => {
                        error!(project = %project, error = %e, "Project sync failed");
                        let _ = self.events.emit(CoreEvent::Sync(SyncEvent::ProjectFailed {
                            project: project.clone(),
                            message: e.to_string(),
                            retryable: e.is_retryable(),
                        }));
                        IDLE_DELAY
                    }
                };
                next_due.insert(project.clone(), Instant::now() + delay);
            }

            next_due.retain(|project, _| projects.contains(project));
            let wake_at = next_due
                .values()
                .min()
                .copied()
                .unwrap_or_else(|| Instant::now() + IDLE_DELAY);

            match self.sleep_until(wake_at, cancel).await {
                Wake::Stop => return Ok(()),
                Wake::Reset => {
                    debug!("Timer reset, running every project now");
                    next_due.clear();
                    self.resolver.invalidate().await;
                }
                Wake::Due => {}
            }
        }
    }

    /// Sleep in `shutdown_poll_interval` slices until `deadline`.
    async fn sleep_until(&self, deadline: Instant, cancel: &CancellationToken) -> Wake {
        loop {
            let now = Instant::now();
            if now >= deadline {
                return Wake::Due;
            }
            let slice = (deadline - now).min(self.options.shutdown_poll_interval);
            tokio::select! {
                _ = cancel.cancelled() => return Wake::Stop,
                _ = self.control.wake.notified() => return Wake::Reset,
                _ = tokio::time::sleep(slice) => {}
            }
        }
    }

    async fn run_before_loop_commands(&self) {
        let commands: Vec<Vec<String>> = match self.control.before_loop.lock() {
            Ok(mut queue) => queue.drain(..).collect(),
            Err(_) => return,
        };

        for command in commands {
            let Some((program, args)) = command.split_first() else {
                continue;
            };
            match tokio::process::Command::new(program).args(args).status().await {
                Ok(status) if status.success() => {
                    debug!(command = ?command, "Before-loop command finished")
                }
                Ok(status) => {
                    warn!(command = ?command, status = %status, "Before-loop command failed")
                }
                Err(e) => warn!(command = ?command, error = %e, "Before-loop command not started"),
            }
        }
    }

    /// Run one iteration for `project` and return the delay until the next.
    #[instrument(skip(self, cancel))]
    async fn process_project(&self, project: &str, cancel: &CancellationToken) -> Result<Duration> {
        let Some(resolved) = self.resolver.get_sync_project_setting(project).await? else {
            return Ok(IDLE_DELAY);
        };
        let delay = resolved.loop_delay();

        if self.control.paused.load(Ordering::SeqCst) {
            debug!("Server paused, skipping");
            return Ok(delay);
        }
        if self.is_project_paused(project) {
            debug!("Project paused, skipping");
            return Ok(delay);
        }

        self.sync_project(&resolved, cancel).await?;
        Ok(delay)
    }

    fn is_project_paused(&self, project: &str) -> bool {
        self.control
            .paused_projects
            .read()
            .map(|paused| paused.contains(project))
            .unwrap_or(false)
    }

    async fn sync_project(
        &self,
        resolved: &ResolvedProject,
        cancel: &CancellationToken,
    ) -> Result<IterationReport> {
        let project = resolved.name.as_str();
        let active = resolved.active_site.as_str();
        let remote = resolved.remote_site.as_str();
        let local_site_id = self.resolver.local_site_id();

        if active == remote {
            debug!(site = %active, "Active and remote site are the same, nothing to sync");
            return Ok(IterationReport::default());
        }
        if active != local_site_id && remote != local_site_id {
            debug!(active = %active, remote = %remote, "Machine not involved in this pair");
            return Ok(IterationReport::default());
        }
        let (Some(active_config), Some(remote_config)) = (resolved.site(active), resolved.site(remote))
        else {
            warn!(active = %active, remote = %remote, "Site not configured, skipping project");
            return Ok(IterationReport::default());
        };

        let remote_provider = self.providers.create(remote, remote_config)?;
        let active_provider = self.providers.create(active, active_config)?;
        if !remote_provider.is_active() || !active_provider.is_active() {
            warn!(active = %active, remote = %remote, "Provider not active, skipping project");
            return Ok(IterationReport::default());
        }
        let mut budget = self.providers.batch_limit(&remote_config.provider)?;

        let _ = self.events.emit(CoreEvent::Sync(SyncEvent::LoopStarted {
            project: project.to_string(),
            active_site: active.to_string(),
            remote_site: remote.to_string(),
        }));
        let started = Instant::now();

        let query = SyncQuery::new(project, active, remote, resolved.config.retry_cnt)
            .with_default_priority(self.options.default_priority)
            .with_limit(Some(self.options.representation_limit));
        let representations = self.repository.find_sync_representations(&query).await?;

        let status_config = StatusConfig {
            local_site_id,
            retry_cnt: resolved.config.retry_cnt,
        };
        let progress = ProgressChannel::spawn(Arc::clone(&self.repository), self.events.clone());
        let mut scheduled: Vec<(TransferDirection, String, Vec<FileTarget>)> = Vec::new();
        let mut claimed: HashMap<&str, usize> = HashMap::new();
        let mut jobs = Vec::new();

        for representation in &representations {
            for file in &representation.files {
                let status = check_status(file, active, remote, &status_config);
                let (direction, site) = match status {
                    SyncStatus::DoUpload => (TransferDirection::Upload, remote),
                    SyncStatus::DoDownload => (TransferDirection::Download, active),
                    SyncStatus::DoNothing => continue,
                };
                let target = FileTarget {
                    representation_id: representation.id.clone(),
                    file_id: file.id.clone(),
                };

                // same physical file on several representations
                if let Some(&index) = claimed.get(file.path.as_str()) {
                    if scheduled[index].0 == direction {
                        scheduled[index].2.push(target);
                    }
                    continue;
                }
                if budget == 0 {
                    continue;
                }
                budget -= 1;

                let reporter = progress.reporter(
                    SiteTarget::new(
                        project,
                        representation.id.clone(),
                        Some(file.id.clone()),
                        site,
                    ),
                    self.options.progress_interval,
                );
                jobs.push(TransferJob {
                    direction,
                    rootless_path: file.path.clone(),
                    provider: Arc::clone(&remote_provider),
                    local_roots: active_config.root.clone(),
                    local_site: active.to_string(),
                    progress: reporter,
                });
                claimed.insert(file.path.as_str(), scheduled.len());
                scheduled.push((direction, site.to_string(), vec![target]));
            }
        }

        debug!(
            representations = representations.len(),
            scheduled = scheduled.len(),
            "Transfers scheduled"
        );

        let results = self.executor.run_all(jobs, cancel).await;
        progress.finish().await;

        let alternates = resolved.alternate_sites();
        let mut report = IterationReport {
            scheduled: scheduled.len(),
            failed: 0,
        };
        let mut interrupted = None;
        for ((direction, site, targets), result) in scheduled.into_iter().zip(results) {
            if matches!(result, Err(SyncError::Cancelled)) {
                continue;
            }
            let representation_id = targets.first().map(|t| t.representation_id.to_string());
            let outcome = TransferOutcome {
                project: project.to_string(),
                direction,
                site: site.clone(),
                targets,
                result,
            };
            match self.writer.persist(outcome, &alternates).await {
                Ok(true) => {}
                Ok(false) => report.failed += 1,
                Err(e) if e.is_retryable() => {
                    warn!(site = %site, error = %e, "Outcome not recorded, store unavailable");
                    report.failed += 1;
                    interrupted.get_or_insert(e);
                }
                Err(e) => {
                    warn!(
                        site = %site,
                        representation_id = ?representation_id,
                        error = %e,
                        "Outcome not recorded"
                    );
                    report.failed += 1;
                }
            }
        }
        if let Some(e) = interrupted {
            return Err(e);
        }

        let duration_ms = started.elapsed().as_millis() as u64;
        info!(
            scheduled = report.scheduled,
            failed = report.failed,
            duration_ms,
            "Sync iteration finished"
        );
        let _ = self.events.emit(CoreEvent::Sync(SyncEvent::LoopFinished {
            project: project.to_string(),
            scheduled: report.scheduled,
            failed: report.failed,
            duration_ms,
        }));
        Ok(report)
    }
}

// ============================================================================
// Public handle
// ============================================================================

/// Handle owning the sync loop of this machine.
///
/// # Example
///
/// ```ignore
/// let server = SyncServer::new(repository, resolver, providers, events, clock, options);
/// server.start()?;
/// server.reset_timer();
/// server.stop().await?;
/// ```
pub struct SyncServer {
    engine: Arc<Engine>,
    running: Mutex<Option<Running>>,
}

impl SyncServer {
    pub fn new(
        repository: Arc<dyn RepresentationRepository>,
        resolver: Arc<SiteResolver>,
        providers: Arc<ProviderRegistry>,
        events: EventBus,
        clock: Arc<dyn Clock>,
        options: EngineOptions,
    ) -> Self {
        let writer = OutcomeWriter::new(Arc::clone(&repository), events.clone(), clock);
        Self {
            engine: Arc::new(Engine {
                repository,
                resolver,
                providers,
                events,
                executor: TransferExecutor::new(options.worker_threads),
                writer,
                options,
                control: Control::default(),
            }),
            running: Mutex::new(None),
        }
    }

    fn running(&self) -> Result<std::sync::MutexGuard<'_, Option<Running>>> {
        self.running
            .lock()
            .map_err(|_| SyncError::Internal("Server state lock poisoned".to_string()))
    }

    /// Spawn the coordinator on the current tokio runtime.
    ///
    /// # Errors
    ///
    /// `AlreadyRunning` when a coordinator is alive, `Internal` outside a
    /// tokio runtime.
    pub fn start(&self) -> Result<()> {
        let mut running = self.running()?;
        if running
            .as_ref()
            .is_some_and(|current| !current.handle.is_finished())
        {
            return Err(SyncError::AlreadyRunning);
        }

        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| SyncError::Internal(format!("No tokio runtime: {}", e)))?;
        let cancel = CancellationToken::new();
        let handle = runtime.spawn(Arc::clone(&self.engine).run(cancel.clone()));
        *running = Some(Running { cancel, handle });
        Ok(())
    }

    /// Request a graceful stop and wait for the coordinator to exit.
    ///
    /// # Errors
    ///
    /// `NotRunning` when the server was never started or already stopped.
    pub async fn stop(&self) -> Result<()> {
        let running = self.running()?.take().ok_or(SyncError::NotRunning)?;
        info!("Stopping sync server");
        running.cancel.cancel();
        running
            .handle
            .await
            .map_err(|e| SyncError::Internal(format!("Sync coordinator failed: {}", e)))
    }

    pub fn state(&self) -> ServerState {
        match self.running.lock() {
            Ok(running) if running.as_ref().is_some_and(|r| !r.handle.is_finished()) => {
                ServerState::Running
            }
            _ => ServerState::Stopped,
        }
    }

    pub fn is_running(&self) -> bool {
        self.state() == ServerState::Running
    }

    /// Run every project on the next wake-up instead of waiting for its delay.
    pub fn reset_timer(&self) {
        debug!("Sync timer reset requested");
        self.engine.control.wake.notify_one();
    }

    /// Queue an external command to run before the next loop body.
    pub fn add_before_loop_cmd(&self, command: Vec<String>) -> Result<()> {
        if command.first().map_or(true, |program| program.trim().is_empty()) {
            return Err(SyncError::InvalidArgument(
                "Command must name a program".to_string(),
            ));
        }
        self.engine
            .control
            .before_loop
            .lock()
            .map_err(|_| SyncError::Internal("Command queue lock poisoned".to_string()))?
            .push_back(command);
        Ok(())
    }

    pub fn pause_server(&self) {
        self.set_server_paused(true);
    }

    pub fn unpause_server(&self) {
        self.set_server_paused(false);
    }

    fn set_server_paused(&self, paused: bool) {
        let previous = self.engine.control.paused.swap(paused, Ordering::SeqCst);
        if previous != paused {
            info!(paused, "Sync server pause changed");
            let _ = self
                .engine
                .events
                .emit(CoreEvent::Server(ServerEvent::PauseChanged { paused }));
        }
    }

    pub fn is_paused(&self) -> bool {
        self.engine.control.paused.load(Ordering::SeqCst)
    }

    pub fn pause_project(&self, project: &str) {
        if let Ok(mut paused) = self.engine.control.paused_projects.write() {
            paused.insert(project.to_string());
            info!(project = %project, "Project paused");
        }
    }

    pub fn unpause_project(&self, project: &str) {
        if let Ok(mut paused) = self.engine.control.paused_projects.write() {
            paused.remove(project);
            info!(project = %project, "Project unpaused");
        }
    }

    pub fn is_project_paused(&self, project: &str) -> bool {
        self.engine.is_project_paused(project)
    }

    /// Transfers currently running on the worker pool.
    pub fn active_transfers(&self) -> usize {
        self.engine.executor.active()
    }

    /// Run one iteration of `project` immediately, outside the loop.
    ///
    /// Honours pause flags like the loop does.
    pub async fn sync_project_once(&self, project: &str) -> Result<IterationReport> {
        let resolved = self
            .engine
            .resolver
            .get_sync_project_setting(project)
            .await?
            .ok_or_else(|| SyncError::ProjectNotConfigured(project.to_string()))?;
        if self.is_paused() || self.is_project_paused(project) {
            return Ok(IterationReport::default());
        }
        self.engine
            .sync_project(&resolved, &CancellationToken::new())
            .await
    }
}

impl Drop for SyncServer {
    fn drop(&mut self) {
        if let Ok(mut running) = self.running.lock() {
            if let Some(running) = running.take() {
                running.cancel.cancel();
            }
        }
    }
}

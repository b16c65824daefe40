//! Writing transfer outcomes back to site records.
//!
//! Outcomes of one iteration are persisted together once every scheduled
//! transfer has finished. Progress is the exception: it is written while a
//! transfer runs, throttled per file, through a [`ProgressChannel`] that is
//! drained before the final outcomes land.

use crate::model::FileTarget;
use crate::repository::{RepresentationRepository, SiteTarget, SiteUpdate};
use crate::sites::AlternateSites;
use crate::Result;
use bridge_traits::{Clock, TransferProgress};
use core_runtime::events::{CoreEvent, EventBus, SyncEvent, TransferDirection};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Result of one scheduled transfer.
#[derive(Debug)]
pub struct TransferOutcome {
    pub project: String,
    pub direction: TransferDirection,
    /// Site that received (or failed to receive) the file
    pub site: String,
    /// File that was transferred, followed by files sharing its path
    pub targets: Vec<FileTarget>,
    pub result: Result<String>,
}

/// Applies transfer outcomes to the repository and reports them as events.
#[derive(Clone)]
pub struct OutcomeWriter {
    repository: Arc<dyn RepresentationRepository>,
    events: EventBus,
    clock: Arc<dyn Clock>,
}

impl OutcomeWriter {
    pub fn new(
        repository: Arc<dyn RepresentationRepository>,
        events: EventBus,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            repository,
            events,
            clock,
        }
    }

    /// Persist one outcome. Returns whether the transfer succeeded.
    ///
    /// A success is written to every target and mirrored to the alternates
    /// of the receiving site. A failure increments `tries` on the
    /// transferred file only.
    pub async fn persist(&self, outcome: TransferOutcome, alternates: &AlternateSites) -> Result<bool> {
        let at = self.clock.now();
        let Some(primary) = outcome.targets.first() else {
            return Ok(outcome.result.is_ok());
        };

        match outcome.result {
            Ok(provider_file_id) => {
                for target in &outcome.targets {
                    let site_target = SiteTarget::new(
                        outcome.project.clone(),
                        target.representation_id.clone(),
                        Some(target.file_id.clone()),
                        outcome.site.clone(),
                    );
                    self.repository
                        .apply_site_update(
                            &site_target,
                            SiteUpdate::Success {
                                provider_file_id: Some(provider_file_id.clone()),
                                at,
                            },
                        )
                        .await?;
                    self.handle_alternate_site(&site_target, &provider_file_id, alternates)
                        .await?;
                }

                debug!(
                    project = %outcome.project,
                    site = %outcome.site,
                    file_id = %primary.file_id,
                    copies = outcome.targets.len(),
                    "Transfer persisted"
                );
                let _ = self.events.emit(CoreEvent::Sync(SyncEvent::TransferFinished {
                    project: outcome.project,
                    representation_id: primary.representation_id.to_string(),
                    file_id: primary.file_id.to_string(),
                    site: outcome.site,
                    direction: outcome.direction,
                }));
                Ok(true)
            }
            Err(error) => {
                let message = error.to_string();
                warn!(
                    project = %outcome.project,
                    site = %outcome.site,
                    file_id = %primary.file_id,
                    error = %message,
                    "Transfer failed"
                );
                let site_target = SiteTarget::new(
                    outcome.project.clone(),
                    primary.representation_id.clone(),
                    Some(primary.file_id.clone()),
                    outcome.site.clone(),
                );
                self.repository
                    .apply_site_update(
                        &site_target,
                        SiteUpdate::Failure {
                            error: message.clone(),
                            at,
                        },
                    )
                    .await?;

                let _ = self.events.emit(CoreEvent::Sync(SyncEvent::TransferFailed {
                    project: outcome.project,
                    representation_id: primary.representation_id.to_string(),
                    file_id: primary.file_id.to_string(),
                    site: outcome.site,
                    direction: outcome.direction,
                    message,
                }));
                Ok(false)
            }
        }
    }

    /// Mark the file available on every site sharing storage with
    /// `target.site`. Missing records are created.
    pub async fn handle_alternate_site(
        &self,
        target: &SiteTarget,
        provider_file_id: &str,
        alternates: &AlternateSites,
    ) -> Result<()> {
        let at = self.clock.now();
        for alternate in alternates.get(&target.site).into_iter().flatten() {
            let alternate_target = SiteTarget {
                site: alternate.clone(),
                ..target.clone()
            };
            self.repository
                .apply_site_update(
                    &alternate_target,
                    SiteUpdate::Success {
                        provider_file_id: Some(provider_file_id.to_string()),
                        at,
                    },
                )
                .await?;
            debug!(site = %target.site, alternate = %alternate, "Mirrored to alternate site");
        }
        Ok(())
    }
}

// ============================================================================
// Progress
// ============================================================================

#[derive(Debug)]
struct ProgressUpdate {
    target: SiteTarget,
    progress: f32,
}

/// Background writer for progress-only updates of one iteration.
pub struct ProgressChannel {
    sender: mpsc::UnboundedSender<ProgressUpdate>,
    handle: JoinHandle<()>,
}

impl ProgressChannel {
    /// Start the writer task.
    pub fn spawn(repository: Arc<dyn RepresentationRepository>, events: EventBus) -> Self {
        let (sender, mut receiver) = mpsc::unbounded_channel::<ProgressUpdate>();
        let handle = tokio::spawn(async move {
            while let Some(update) = receiver.recv().await {
                if let Err(e) = repository
                    .apply_site_update(&update.target, SiteUpdate::Progress(update.progress))
                    .await
                {
                    warn!(error = %e, "Failed to record transfer progress");
                    continue;
                }
                let _ = events.emit(CoreEvent::Sync(SyncEvent::TransferProgress {
                    project: update.target.project.clone(),
                    file_id: update
                        .target
                        .file_id
                        .as_ref()
                        .map(ToString::to_string)
                        .unwrap_or_default(),
                    site: update.target.site,
                    progress: update.progress,
                }));
            }
        });
        Self { sender, handle }
    }

    /// Progress sink for one transfer, reporting at most once per `interval`.
    pub fn reporter(&self, target: SiteTarget, interval: Duration) -> Arc<dyn TransferProgress> {
        Arc::new(ProgressReporter {
            sender: self.sender.clone(),
            target,
            interval,
            last_sent: Mutex::new(None),
        })
    }

    /// Wait until every queued update is written. Reporters still alive keep
    /// the writer running, so call this after the transfers are done.
    pub async fn finish(self) {
        drop(self.sender);
        if let Err(e) = self.handle.await {
            warn!(error = %e, "Progress writer stopped unexpectedly");
        }
    }
}

struct ProgressReporter {
    sender: mpsc::UnboundedSender<ProgressUpdate>,
    target: SiteTarget,
    interval: Duration,
    last_sent: Mutex<Option<Instant>>,
}

impl TransferProgress for ProgressReporter {
    fn report(&self, progress: f32) {
        let Ok(mut last_sent) = self.last_sent.lock() else {
            return;
        };
        if last_sent.is_some_and(|sent| sent.elapsed() < self.interval) {
            return;
        }
        *last_sent = Some(Instant::now());

        let _ = self.sender.send(ProgressUpdate {
            target: self.target.clone(),
            progress,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{RepreFile, Representation, SiteRecord};
    use crate::repository::SqliteRepresentationRepository;
    use crate::SyncError;
    use bridge_traits::FixedClock;
    use chrono::{TimeZone, Utc};
    use sqlx::sqlite::SqlitePoolOptions;
    use std::collections::{BTreeMap, BTreeSet};

    async fn setup() -> (Arc<SqliteRepresentationRepository>, OutcomeWriter, EventBus) {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let repository = Arc::new(SqliteRepresentationRepository::new(pool));
        repository.initialize().await.unwrap();
        let events = EventBus::new(64);
        let clock = FixedClock(Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap());
        let writer = OutcomeWriter::new(repository.clone(), events.clone(), Arc::new(clock));
        (repository, writer, events)
    }

    fn representation() -> Representation {
        Representation::new("P1", "modelMain").with_file(
            RepreFile::new("{root[work]}/P1/a.ma", 10)
                .with_site(SiteRecord::created("ws-01", Utc::now()))
                .with_site(SiteRecord::new("nas")),
        )
    }

    fn target(repre: &Representation) -> FileTarget {
        FileTarget {
            representation_id: repre.id.clone(),
            file_id: repre.files[0].id.clone(),
        }
    }

    #[tokio::test]
    async fn test_success_mirrors_to_alternates() {
        let (repository, writer, events) = setup().await;
        let mut rx = events.subscribe();
        let repre = representation();
        repository.insert(&repre).await.unwrap();

        let mut alternates = BTreeMap::new();
        alternates.insert("nas".to_string(), BTreeSet::from(["studio".to_string()]));

        let outcome = TransferOutcome {
            project: "P1".to_string(),
            direction: TransferDirection::Upload,
            site: "nas".to_string(),
            targets: vec![target(&repre)],
            result: Ok("nas-id".to_string()),
        };
        assert!(writer.persist(outcome, &alternates).await.unwrap());

        let stored = repository.find_by_id("P1", &repre.id).await.unwrap().unwrap();
        let file = &stored.files[0];
        assert!(file.site("nas").unwrap().is_available());
        let studio = file.site("studio").unwrap();
        assert!(studio.is_available());
        assert_eq!(studio.provider_file_id.as_deref(), Some("nas-id"));

        match rx.recv().await.unwrap() {
            CoreEvent::Sync(SyncEvent::TransferFinished { site, .. }) => assert_eq!(site, "nas"),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_success_covers_shared_paths() {
        let (repository, writer, _events) = setup().await;
        let first = representation();
        let second = representation();
        repository.insert(&first).await.unwrap();
        repository.insert(&second).await.unwrap();

        let outcome = TransferOutcome {
            project: "P1".to_string(),
            direction: TransferDirection::Upload,
            site: "nas".to_string(),
            targets: vec![target(&first), target(&second)],
            result: Ok("id".to_string()),
        };
        writer.persist(outcome, &AlternateSites::new()).await.unwrap();

        for repre in [&first, &second] {
            let stored = repository.find_by_id("P1", &repre.id).await.unwrap().unwrap();
            assert!(stored.files[0].site("nas").unwrap().is_available());
        }
    }

    #[tokio::test]
    async fn test_failure_increments_tries_on_primary_only() {
        let (repository, writer, _events) = setup().await;
        let first = representation();
        let second = representation();
        repository.insert(&first).await.unwrap();
        repository.insert(&second).await.unwrap();

        let outcome = TransferOutcome {
            project: "P1".to_string(),
            direction: TransferDirection::Upload,
            site: "nas".to_string(),
            targets: vec![target(&first), target(&second)],
            result: Err(SyncError::Transfer("disk full".to_string())),
        };
        assert!(!writer.persist(outcome, &AlternateSites::new()).await.unwrap());

        let stored = repository.find_by_id("P1", &first.id).await.unwrap().unwrap();
        let record = stored.files[0].site("nas").unwrap();
        assert_eq!(record.tries, Some(1));
        assert!(record.error.as_deref().unwrap().contains("disk full"));

        let untouched = repository.find_by_id("P1", &second.id).await.unwrap().unwrap();
        assert!(untouched.files[0].site("nas").unwrap().tries.is_none());
    }

    #[tokio::test]
    async fn test_progress_is_throttled_and_written() {
        let (repository, _writer, events) = setup().await;
        let repre = representation();
        repository.insert(&repre).await.unwrap();

        let channel = ProgressChannel::spawn(repository.clone(), events.clone());
        let site_target = SiteTarget::new(
            "P1",
            repre.id.clone(),
            Some(repre.files[0].id.clone()),
            "nas",
        );
        let reporter = channel.reporter(site_target, Duration::from_secs(3600));
        reporter.report(0.25);
        reporter.report(0.75);
        drop(reporter);
        channel.finish().await;

        let stored = repository.find_by_id("P1", &repre.id).await.unwrap().unwrap();
        let record = stored.files[0].site("nas").unwrap();
        assert!((record.progress.unwrap() - 0.25).abs() < f32::EPSILON);
        assert!(!record.is_available());
    }
}

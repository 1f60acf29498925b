//! Discovery runs.
//!
//! The [`DiscoveryCoordinator`] owns everything run-level: the mode, the
//! folder diff, the checkpoint and the progress counters. Folder work is
//! fanned out to a [`WorkerPool`]; the coordinator itself stays on one task
//! and reacts to unit reports and control requests as they arrive.
//!
//! ```text
//! idle ──▶ running ──▶ completed
//!            │  ▲  └──▶ stopped
//!            ▼  │  └──▶ error
//!           paused
//! ```

mod cleanup;
mod control;

pub use self::cleanup::{MediaCleanup, NoopCleanup};
pub use self::control::DiscoveryControl;
use crate::aggregator::{SiteAggregator, Validation};
use crate::context::Context;
use crate::error::{ErrorKind, Result};
use crate::events::{DiscoveryError, DiscoveryEvent, EventBus};
use crate::models::{Checkpoint, DiscoveryStatus, DiscoveryType, Document};
use crate::persist::{Persistence, ROOT_INVENTORY};
use crate::pool::{Signal, UnitOutcome, UnitReport, WorkerPool};
use crate::scanner::{ChangeCounts, FolderScan, FolderScanner};
use crate::tracker::{DiscoveryStats, ProgressRecord, ProgressTracker};
use exn::ResultExt;
use serde::Serialize;
use sitescan_cache::ProgressStore;
use sitescan_storage::{BackendHandle, Entry};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use time::OffsetDateTime;
use tokio::sync::{Mutex, broadcast, watch};

/// How long a stop waits for units to reach a suspension point before
/// aborting them.
const STOP_GRACE: Duration = Duration::from_secs(5);

/// What the caller asks for. [`Auto`](Self::Auto) picks for itself.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DiscoveryMode {
    /// Resume an interrupted run, else go incremental when a completed run
    /// left inventories behind, else run a full discovery.
    #[default]
    Auto,
    Full,
    Incremental,
}

/// Folder-level changes found by an incremental run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IncrementalDiff {
    pub has_changes: bool,
    pub new_folders: Vec<String>,
    pub deleted_folders: Vec<String>,
    /// Document-level changes summed over every merged folder.
    pub changes: ChangeCounts,
}

#[derive(Debug, Clone)]
pub struct DiscoveryOutcome {
    pub status: DiscoveryStatus,
    pub mode: DiscoveryType,
    /// The run continued an interrupted one.
    pub resumed: bool,
    pub stats: DiscoveryStats,
    pub diff: Option<IncrementalDiff>,
    pub duration: Duration,
    /// Inventories the final aggregation could not read.
    pub files_with_errors: Vec<String>,
}

/// Persisted state of a repository namespace, for status queries.
#[derive(Debug, Clone)]
pub struct StatusReport {
    pub status: DiscoveryStatus,
    pub checkpoint: Option<Checkpoint>,
    pub progress: Option<ProgressRecord>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Plan {
    mode: DiscoveryType,
    resume: bool,
}

fn plan(
    requested: DiscoveryMode,
    record: Option<&ProgressRecord>,
    checkpoint: Option<&Checkpoint>,
    inventories: &[String],
) -> Plan {
    let fresh = |mode| Plan { mode, resume: false };
    match requested {
        DiscoveryMode::Full => fresh(DiscoveryType::Full),
        DiscoveryMode::Incremental => fresh(DiscoveryType::Incremental),
        DiscoveryMode::Auto => match record {
            Some(record) if record.status.is_unfinished() => Plan {
                mode: record.mode,
                resume: true,
            },
            _ if checkpoint.is_some_and(|c| c.status == DiscoveryStatus::Completed) && !inventories.is_empty() => {
                fresh(DiscoveryType::Incremental)
            },
            _ => fresh(DiscoveryType::Full),
        },
    }
}

/// Top-level folders present now but not persisted, and the reverse.
fn folder_diff(inventories: &[String], folders: &[String]) -> (Vec<String>, Vec<String>) {
    let persisted: BTreeSet<&str> =
        inventories.iter().map(String::as_str).filter(|name| *name != ROOT_INVENTORY).collect();
    let current: BTreeSet<&str> = folders.iter().map(String::as_str).collect();
    let new = current.difference(&persisted).map(|s| (*s).to_string()).collect();
    let deleted = persisted.difference(&current).map(|s| (*s).to_string()).collect();
    (new, deleted)
}

#[derive(Debug, Default)]
struct TopLevel {
    folders: Vec<String>,
    files: Vec<Entry>,
    reserved: bool,
}

pub struct DiscoveryCoordinator {
    backend: BackendHandle,
    ctx: Arc<Context>,
    persistence: Persistence,
    scanner: FolderScanner,
    aggregator: SiteAggregator,
    store: ProgressStore,
    cleanup: Arc<dyn MediaCleanup>,
    events: EventBus,
    signal: Arc<watch::Sender<Signal>>,
    status: watch::Sender<DiscoveryStatus>,
    // One run at a time; overlapping runs over the same inventories would
    // race each other's writes.
    lock: Mutex<()>,
}
impl DiscoveryCoordinator {
    pub fn new(backend: BackendHandle, ctx: Context, store: ProgressStore) -> Self {
        let ctx = Arc::new(ctx);
        let persistence = Persistence::new(backend.clone());
        let (signal, _) = watch::channel(Signal::Run);
        let (status, _) = watch::channel(DiscoveryStatus::Idle);
        Self {
            scanner: FolderScanner::new(backend.clone(), persistence.clone(), ctx.clone()),
            aggregator: SiteAggregator::new(persistence.clone(), ctx.clone()),
            backend,
            ctx,
            persistence,
            store,
            cleanup: Arc::new(NoopCleanup),
            events: EventBus::default(),
            signal: Arc::new(signal),
            status,
            lock: Mutex::new(()),
        }
    }

    pub fn with_cleanup(mut self, cleanup: Arc<dyn MediaCleanup>) -> Self {
        self.cleanup = cleanup;
        self
    }

    pub fn context(&self) -> &Context {
        &self.ctx
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DiscoveryEvent> {
        self.events.subscribe()
    }

    pub fn control(&self) -> DiscoveryControl {
        DiscoveryControl {
            signal: self.signal.clone(),
            status: self.status.subscribe(),
        }
    }

    /// Rebuild the site structure from the persisted inventories and check it.
    pub async fn validate(&self) -> Result<Validation> {
        self.aggregator.validate().await.or_raise(|| ErrorKind::Persistence)
    }

    /// Checkpoint file and progress mirror as currently persisted.
    pub async fn status_report(&self) -> Result<StatusReport> {
        let checkpoint = self.persistence.read_checkpoint().await.or_raise(|| ErrorKind::Persistence)?;
        let progress = ProgressTracker::new(self.store.clone(), &self.ctx.namespace).load().await?;
        Ok(StatusReport {
            status: *self.status.borrow(),
            checkpoint,
            progress,
        })
    }

    /// Forget the progress mirror and the checkpoint file so the next
    /// [`Auto`](DiscoveryMode::Auto) run starts with a full discovery.
    /// Inventories are kept.
    pub async fn reset(&self) -> Result<()> {
        let Ok(_guard) = self.lock.try_lock() else {
            exn::bail!(ErrorKind::AlreadyRunning);
        };
        ProgressTracker::new(self.store.clone(), &self.ctx.namespace).reset().await?;
        self.persistence.clear_checkpoint().await.or_raise(|| ErrorKind::Persistence)?;
        self.transition(DiscoveryStatus::Idle);
        Ok(())
    }

    fn transition(&self, status: DiscoveryStatus) {
        tracing::debug!(%status, "Discovery status");
        self.status.send_replace(status);
    }

    /// Run one discovery to completion, stop, or fatal error.
    ///
    /// Per-folder failures never fail the run: they are counted, reported as
    /// non-fatal [`DiscoveryEvent::Error`]s, and the run still completes.
    #[tracing::instrument(name = "discovery", skip(self), fields(namespace = %self.ctx.namespace.prefix()))]
    pub async fn run(&self, requested: DiscoveryMode) -> Result<DiscoveryOutcome> {
        let Ok(_guard) = self.lock.try_lock() else {
            exn::bail!(ErrorKind::AlreadyRunning);
        };
        self.signal.send_replace(Signal::Run);
        let mut signals = self.signal.subscribe();
        let mut tracker = ProgressTracker::new(self.store.clone(), &self.ctx.namespace);
        let mut began = false;

        let result = self.execute(requested, &mut tracker, &mut signals, &mut began).await;
        if let Err(e) = &result {
            tracing::error!(error = ?e, "Discovery failed");
            // A run that never started leaves the mirror of the previous run alone.
            if began && let Err(mirror) = tracker.set_status(DiscoveryStatus::Error).await {
                tracing::warn!(error = ?mirror, "Could not record failure in progress mirror");
            }
            self.transition(DiscoveryStatus::Error);
            self.events.emit(DiscoveryEvent::Error(DiscoveryError {
                folder: None,
                message: (**e).to_string(),
                fatal: true,
            }));
        }
        result
    }

    async fn execute(
        &self,
        requested: DiscoveryMode,
        tracker: &mut ProgressTracker,
        signals: &mut watch::Receiver<Signal>,
        began: &mut bool,
    ) -> Result<DiscoveryOutcome> {
        let clock = Instant::now();
        let now = OffsetDateTime::now_utc();
        self.persistence.ensure_layout().await.or_raise(|| ErrorKind::Persistence)?;
        let record = tracker.hydrate().await?.cloned();
        let checkpoint = match self.persistence.read_checkpoint().await {
            Ok(checkpoint) => checkpoint,
            Err(e) => {
                tracing::warn!(error = ?e, "Ignoring unreadable checkpoint");
                None
            },
        };
        let inventories = self.persistence.list_inventories().await.or_raise(|| ErrorKind::Persistence)?;
        let plan = plan(requested, record.as_ref(), checkpoint.as_ref(), &inventories);

        let listing = self.backend.list_path(None).await.or_raise(|| ErrorKind::Listing)?;
        let top = self.partition(listing);
        let total_folders = top.folders.len() as u64 + 1;
        tracing::info!(mode = %plan.mode, resume = plan.resume, folders = total_folders, "Starting discovery");

        let started_at = match (&record, plan.resume) {
            (Some(record), true) => {
                tracker.resume(total_folders).await?;
                record.started_at
            },
            _ => {
                if plan.mode == DiscoveryType::Full {
                    tracker.reset().await?;
                    self.persistence.clear_checkpoint().await.or_raise(|| ErrorKind::Persistence)?;
                }
                let run_id = format!("{:x}", now.unix_timestamp_nanos());
                tracker.begin(run_id, plan.mode, total_folders).await?;
                now
            },
        };
        *began = true;
        let mut checkpoint = Checkpoint::started(plan.mode, total_folders, started_at);
        self.persistence.write_checkpoint(&checkpoint).await.or_raise(|| ErrorKind::Persistence)?;
        self.transition(DiscoveryStatus::Running);
        self.events.emit(DiscoveryEvent::Started {
            mode: plan.mode,
            resumed: plan.resume,
            total_folders,
        });

        if top.reserved {
            tracker.record_error().await?;
            self.events.emit(DiscoveryEvent::Error(DiscoveryError {
                folder: Some(ROOT_INVENTORY.to_string()),
                message: format!("a top-level folder named `{ROOT_INVENTORY}` collides with the root inventory"),
                fatal: false,
            }));
        }

        let mut changes = ChangeCounts::default();
        let mut diff = None;
        match plan.mode {
            DiscoveryType::Incremental => {
                let (new_folders, deleted_folders) = folder_diff(&inventories, &top.folders);
                tracing::info!(new = ?new_folders, deleted = ?deleted_folders, "Folder diff");
                diff = Some(IncrementalDiff {
                    new_folders,
                    deleted_folders,
                    ..IncrementalDiff::default()
                });
            },
            DiscoveryType::Full if !plan.resume => {
                let current: BTreeSet<&str> = top.folders.iter().map(String::as_str).collect();
                for stale in inventories.iter().filter(|n| *n != ROOT_INVENTORY && !current.contains(n.as_str())) {
                    if let Err(e) = self.persistence.delete_inventory(stale).await {
                        tracing::warn!(inventory = %stale, error = ?e, "Could not remove stale inventory");
                    }
                }
            },
            DiscoveryType::Full => {},
        }

        // Loose files at the root are handled inline, before any folder is dispatched.
        if !tracker.record().is_some_and(|r| r.is_done(ROOT_INVENTORY)) {
            let scan = self.scanner.scan_root(&top.files, plan.mode).await;
            self.record_scan(tracker, scan, &mut changes).await?;
        }
        if let Some(diff) = &diff {
            for folder in &diff.deleted_folders {
                self.sweep(folder, tracker, &mut changes).await?;
            }
        }

        let mut pool = WorkerPool::new(self.ctx.concurrency);
        for folder in &top.folders {
            if tracker.record().is_some_and(|r| r.is_done(folder)) {
                tracing::debug!(%folder, "Already completed, skipping");
                continue;
            }
            let scanner = self.scanner.clone();
            let folder = folder.clone();
            let mode = plan.mode;
            pool.assign(folder.clone(), move |unit| async move { scanner.scan_folder(unit, folder, mode).await });
        }

        loop {
            tokio::select! {
                report = pool.next() => {
                    let Some(report) = report else { break };
                    self.record_report(tracker, report, &mut changes).await?;
                },
                Ok(()) = signals.changed() => {
                    let signal = *signals.borrow_and_update();
                    match signal {
                        Signal::Pause => {
                            pool.broadcast(Signal::Pause);
                            tracker.set_status(DiscoveryStatus::Paused).await?;
                            self.transition(DiscoveryStatus::Paused);
                            self.events.emit(DiscoveryEvent::Paused(tracker.stats()));
                        },
                        Signal::Run => {
                            pool.broadcast(Signal::Run);
                            tracker.set_status(DiscoveryStatus::Running).await?;
                            self.transition(DiscoveryStatus::Running);
                            self.events.emit(DiscoveryEvent::Resumed(tracker.stats()));
                        },
                        Signal::Stop => {
                            // Units that already persisted their inventory still have to be counted.
                            for report in pool.cancel_all(STOP_GRACE).await {
                                self.record_report(tracker, report, &mut changes).await?;
                            }
                            tracker.set_status(DiscoveryStatus::Stopped).await?;
                            let stats = tracker.stats();
                            tracing::info!(completed = stats.completed_folders, total = stats.total_folders, "Discovery stopped");
                            self.transition(DiscoveryStatus::Stopped);
                            self.events.emit(DiscoveryEvent::Stopped(stats));
                            return Ok(DiscoveryOutcome {
                                status: DiscoveryStatus::Stopped,
                                mode: plan.mode,
                                resumed: plan.resume,
                                stats,
                                diff: diff.map(|d| finish_diff(d, changes)),
                                duration: clock.elapsed(),
                                files_with_errors: Vec::new(),
                            });
                        },
                    }
                },
            }
        }

        let aggregate = self.aggregator.rebuild().await.or_raise(|| ErrorKind::Persistence)?;
        let stats = tracker.stats();
        checkpoint.completed_folders = stats.completed_folders;
        checkpoint.total_folders = stats.total_folders;
        checkpoint.total_documents = stats.total_documents;
        checkpoint.status = DiscoveryStatus::Completed;
        checkpoint.discovery_end_time = Some(OffsetDateTime::now_utc());
        self.persistence.write_checkpoint(&checkpoint).await.or_raise(|| ErrorKind::Persistence)?;
        tracker.set_status(DiscoveryStatus::Completed).await?;

        let duration = clock.elapsed();
        tracing::info!(
            folders = stats.completed_folders,
            documents = stats.total_documents,
            errors = stats.errors,
            ?duration,
            "Discovery complete"
        );
        self.transition(DiscoveryStatus::Completed);
        self.events.emit(DiscoveryEvent::Complete {
            stats,
            duration,
            site_structure: Arc::new(aggregate.structure),
        });
        Ok(DiscoveryOutcome {
            status: DiscoveryStatus::Completed,
            mode: plan.mode,
            resumed: plan.resume,
            stats,
            diff: diff.map(|d| finish_diff(d, changes)),
            duration,
            files_with_errors: aggregate.files_with_errors,
        })
    }

    fn partition(&self, listing: Vec<Entry>) -> TopLevel {
        let mut top = TopLevel::default();
        for entry in listing {
            let name = entry.file_name();
            if name.starts_with('.') {
                continue;
            }
            let excluded = match self.ctx.namespace.absolute(&entry.path) {
                Ok(path) => self.ctx.filter.is_excluded(&self.ctx.namespace, &path),
                Err(e) => {
                    tracing::warn!(path = %entry.path.display(), error = ?e, "Skipping unrepresentable path");
                    true
                },
            };
            match (excluded, entry.is_folder()) {
                (true, _) => tracing::debug!(%name, "Excluded at top level"),
                (false, true) if name == ROOT_INVENTORY => {
                    tracing::warn!(%name, "Skipping folder whose name is reserved for the root inventory");
                    top.reserved = true;
                },
                (false, true) => top.folders.push(name),
                (false, false) => top.files.push(entry),
            }
        }
        top.folders.sort();
        top
    }

    async fn record_report(
        &self,
        tracker: &mut ProgressTracker,
        report: UnitReport<FolderScan>,
        changes: &mut ChangeCounts,
    ) -> Result<()> {
        match report.outcome {
            UnitOutcome::Finished(scan) if scan.interrupted => Ok(()),
            UnitOutcome::Finished(scan) => self.record_scan(tracker, scan, changes).await,
            UnitOutcome::Cancelled => Ok(()),
            UnitOutcome::Panicked => {
                let scan = FolderScan {
                    folder: report.id.folder().to_string(),
                    error: Some("folder scan panicked".to_string()),
                    ..FolderScan::default()
                };
                self.record_scan(tracker, scan, changes).await
            },
        }
    }

    async fn record_scan(
        &self,
        tracker: &mut ProgressTracker,
        scan: FolderScan,
        changes: &mut ChangeCounts,
    ) -> Result<()> {
        *changes += scan.changes;
        let live = scan.live_documents();
        match &scan.error {
            Some(message) => {
                tracker.folder_failed(&scan.folder, live).await?;
                self.events.emit(DiscoveryEvent::Error(DiscoveryError {
                    folder: Some(scan.folder.clone()),
                    message: message.clone(),
                    fatal: false,
                }));
            },
            None => tracker.folder_completed(&scan.folder, live).await?,
        }
        self.events.emit(DiscoveryEvent::DocumentsDiscovered {
            folder: scan.folder.clone(),
            documents: Arc::from(scan.documents),
        });
        self.events.emit(DiscoveryEvent::FolderComplete {
            folder: scan.folder,
            documents: live,
            changes: scan.changes,
        });
        self.events.emit(DiscoveryEvent::Progress(tracker.stats()));
        Ok(())
    }

    /// Tombstone every document of a folder that disappeared, tell the media
    /// cleanup, then drop the folder's inventory.
    ///
    /// Failures are counted and reported but never fail the run. The inventory
    /// is only removed once cleanup succeeded, so a failed sweep is retried by
    /// the next incremental run.
    async fn sweep(&self, folder: &str, tracker: &mut ProgressTracker, changes: &mut ChangeCounts) -> Result<()> {
        let report = |message: String| {
            self.events.emit(DiscoveryEvent::Error(DiscoveryError {
                folder: Some(folder.to_string()),
                message,
                fatal: false,
            }))
        };
        let mut documents = match self.persistence.read_inventory(folder).await {
            Ok(documents) => documents,
            Err(e) => {
                tracing::warn!(%folder, error = ?e, "Could not read inventory of removed folder");
                tracker.record_error().await?;
                report(format!("reading inventory of removed folder failed: {}", *e));
                return Ok(());
            },
        };
        let now = OffsetDateTime::now_utc();
        changes.deleted += documents.iter().filter(|d| !d.is_deleted()).count() as u64;
        documents.iter_mut().for_each(|d| d.tombstone(now));
        let paths: Vec<String> = documents.iter().map(|d| d.path.clone()).collect();
        if let Err(e) = self.persistence.write_inventory(folder, &documents).await {
            tracing::warn!(%folder, error = ?e, "Could not persist tombstones");
            tracker.record_error().await?;
            report(format!("persisting tombstones failed: {}", *e));
            return Ok(());
        }
        self.events.emit(DiscoveryEvent::DocumentsDiscovered {
            folder: folder.to_string(),
            documents: Arc::<[Document]>::from(documents),
        });
        if !paths.is_empty()
            && let Err(e) =
                self.cleanup.cleanup_media_for_deleted_documents(&paths).await.or_raise(|| ErrorKind::Cleanup)
        {
            tracing::warn!(%folder, error = ?e, "Media cleanup failed, keeping inventory for a retry");
            tracker.record_error().await?;
            report((*e).to_string());
            return Ok(());
        }
        if let Err(e) = self.persistence.delete_inventory(folder).await {
            tracing::warn!(%folder, error = ?e, "Could not remove inventory of removed folder");
            tracker.record_error().await?;
            report(format!("removing inventory failed: {}", *e));
            return Ok(());
        }
        tracing::info!(%folder, documents = paths.len(), "Removed folder swept");
        Ok(())
    }
}

fn finish_diff(mut diff: IncrementalDiff, changes: ChangeCounts) -> IncrementalDiff {
    diff.changes = changes;
    diff.has_changes = !diff.new_folders.is_empty() || !diff.deleted_folders.is_empty() || changes.has_changes();
    diff
}

use async_trait::async_trait;
use futures::Stream;
use sitescan_cache::{Database, ProgressStore};
use sitescan_discovery::error::ErrorKind;
use sitescan_discovery::{
    Context, DiscoveryControl, DiscoveryCoordinator, DiscoveryEvent, DiscoveryMode, DiscoveryStatus, DiscoveryType,
    Document, EntryStatus, MediaCleanup, Namespace, Persistence,
};
use sitescan_storage::backend::{MockBackend, RepositoryBackend};
use sitescan_storage::error::{ErrorKind as StorageErrorKind, Result as StorageResult};
use sitescan_storage::{BackendHandle, Entry};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use time::OffsetDateTime;
use time::macros::datetime;
use tokio::sync::{broadcast, watch};

const T1: OffsetDateTime = datetime!(2024-01-01 0:00 UTC);
const T2: OffsetDateTime = datetime!(2024-03-01 0:00 UTC);
const WAIT: Duration = Duration::from_secs(10);

#[derive(Default)]
struct RecordingCleanup {
    calls: Mutex<Vec<Vec<String>>>,
}
#[async_trait]
impl MediaCleanup for RecordingCleanup {
    async fn cleanup_media_for_deleted_documents(&self, paths: &[String]) -> sitescan_discovery::error::Result<()> {
        self.calls.lock().unwrap().push(paths.to_vec());
        Ok(())
    }
}

struct FailingCleanup;
#[async_trait]
impl MediaCleanup for FailingCleanup {
    async fn cleanup_media_for_deleted_documents(&self, _paths: &[String]) -> sitescan_discovery::error::Result<()> {
        exn::bail!(ErrorKind::Cleanup)
    }
}

/// Wraps the mock so one folder's listing can be held back and the root
/// listing can be made to fail.
struct Gated {
    inner: Arc<MockBackend>,
    slow: PathBuf,
    gate: watch::Receiver<bool>,
    fail_root: bool,
}
#[async_trait]
impl RepositoryBackend for Gated {
    fn name(&self) -> &str {
        "gated"
    }

    async fn list_path(&self, folder: Option<&Path>) -> StorageResult<Vec<Entry>> {
        match folder {
            None if self.fail_root => exn::bail!(StorageErrorKind::Network("unavailable".into())),
            Some(f) if f == self.slow.as_path() => {
                let mut gate = self.gate.clone();
                let _ = gate.wait_for(|open| *open).await;
            },
            _ => {},
        }
        self.inner.list_path(folder).await
    }

    fn entries<'a>(&'a self, folder: Option<&'a Path>) -> Pin<Box<dyn Stream<Item = StorageResult<Entry>> + Send + 'a>> {
        self.inner.entries(folder)
    }

    async fn exists(&self, path: &Path) -> StorageResult<bool> {
        self.inner.exists(path).await
    }

    async fn read(&self, path: &Path) -> StorageResult<Vec<u8>> {
        self.inner.read(path).await
    }

    async fn write(&self, path: &Path, data: &[u8]) -> StorageResult<()> {
        self.inner.write(path, data).await
    }

    async fn delete(&self, path: &Path) -> StorageResult<()> {
        self.inner.delete(path).await
    }

    async fn rename(&self, from: &Path, to: &Path) -> StorageResult<()> {
        self.inner.rename(from, to).await
    }

    async fn ensure_folder(&self, path: &Path) -> StorageResult<()> {
        self.inner.ensure_folder(path).await
    }
}

/// Requests a stop the moment one inventory has been moved into place, while
/// another folder's listing is held back so the run cannot finish first.
struct StopAfterPersist {
    inner: Arc<MockBackend>,
    persisted: PathBuf,
    held: PathBuf,
    gate: watch::Receiver<bool>,
    control: Mutex<Option<DiscoveryControl>>,
}
#[async_trait]
impl RepositoryBackend for StopAfterPersist {
    fn name(&self) -> &str {
        "stop-after-persist"
    }

    async fn list_path(&self, folder: Option<&Path>) -> StorageResult<Vec<Entry>> {
        if folder == Some(self.held.as_path()) {
            let mut gate = self.gate.clone();
            let _ = gate.wait_for(|open| *open).await;
        }
        self.inner.list_path(folder).await
    }

    fn entries<'a>(&'a self, folder: Option<&'a Path>) -> Pin<Box<dyn Stream<Item = StorageResult<Entry>> + Send + 'a>> {
        self.inner.entries(folder)
    }

    async fn exists(&self, path: &Path) -> StorageResult<bool> {
        self.inner.exists(path).await
    }

    async fn read(&self, path: &Path) -> StorageResult<Vec<u8>> {
        self.inner.read(path).await
    }

    async fn write(&self, path: &Path, data: &[u8]) -> StorageResult<()> {
        self.inner.write(path, data).await
    }

    async fn delete(&self, path: &Path) -> StorageResult<()> {
        self.inner.delete(path).await
    }

    async fn rename(&self, from: &Path, to: &Path) -> StorageResult<()> {
        self.inner.rename(from, to).await?;
        if to == self.persisted.as_path()
            && let Some(control) = self.control.lock().unwrap().take()
        {
            control.stop();
        }
        Ok(())
    }

    async fn ensure_folder(&self, path: &Path) -> StorageResult<()> {
        self.inner.ensure_folder(path).await
    }
}

fn site() -> Arc<MockBackend> {
    Arc::new(MockBackend::with_dated_files([
        ("root.html", "", T1),
        ("robots.txt", "", T1),
        ("a/one.html", "", T1),
        ("a/sub/two.html", "", T1),
        ("a/sub/logo.png", "", T1),
        ("b/three.html", "", T1),
    ]))
}

fn context() -> Context {
    Context::new(Namespace::new("acme", "website")).with_concurrency(2)
}

async fn coordinator(backend: BackendHandle, ctx: Context) -> DiscoveryCoordinator {
    let db = Database::connect_in_memory().await.unwrap();
    DiscoveryCoordinator::new(backend, ctx, ProgressStore::from(&db))
}

fn paths(documents: &[Document]) -> Vec<&str> {
    documents.iter().map(|d| d.path.as_str()).collect()
}

async fn first_entry_status(persistence: &Persistence, folder: &str) -> Option<EntryStatus> {
    persistence.read_inventory(folder).await.unwrap()[0].entry_status
}

fn drain(events: &mut broadcast::Receiver<DiscoveryEvent>) -> Vec<DiscoveryEvent> {
    std::iter::from_fn(|| events.try_recv().ok()).collect()
}

async fn wait_for_folders(events: &mut broadcast::Receiver<DiscoveryEvent>, folders: &[&str]) {
    let mut pending: HashSet<String> = folders.iter().map(|f| f.to_string()).collect();
    tokio::time::timeout(WAIT, async {
        while !pending.is_empty() {
            if let Ok(DiscoveryEvent::FolderComplete { folder, .. }) = events.recv().await {
                pending.remove(&folder);
            }
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn full_discovery_persists_one_inventory_per_folder() {
    let mock = site();
    let coordinator = coordinator(mock.clone(), context()).await;
    let outcome = coordinator.run(DiscoveryMode::Auto).await.unwrap();

    assert_eq!(outcome.status, DiscoveryStatus::Completed);
    assert_eq!(outcome.mode, DiscoveryType::Full);
    assert!(outcome.diff.is_none());
    assert_eq!(outcome.stats.total_folders, 3);
    assert_eq!(outcome.stats.completed_folders, 3);
    assert_eq!(outcome.stats.total_documents, 4);
    assert_eq!(outcome.stats.errors, 0);

    let persistence = Persistence::new(mock.clone());
    let root = persistence.read_inventory("root").await.unwrap();
    assert_eq!(paths(&root), ["/acme/website/root.html"]);
    assert!(root[0].entry_status.is_none());
    assert_eq!(
        paths(&persistence.read_inventory("a").await.unwrap()),
        ["/acme/website/a/one.html", "/acme/website/a/sub/two.html"]
    );
    assert_eq!(paths(&persistence.read_inventory("b").await.unwrap()), ["/acme/website/b/three.html"]);

    let checkpoint = persistence.read_checkpoint().await.unwrap().unwrap();
    assert_eq!(checkpoint.total_folders, 3);
    assert_eq!(checkpoint.completed_folders, 3);
    assert_eq!(checkpoint.total_documents, 4);
    assert_eq!(checkpoint.status, DiscoveryStatus::Completed);
    assert_eq!(checkpoint.discovery_type, DiscoveryType::Full);
    assert!(checkpoint.discovery_end_time.is_some());

    let structure = persistence.read_site_structure().await.unwrap().unwrap();
    assert_eq!(structure.stats.total_files, 4);
    assert_eq!(structure.stats.deepest_nesting, 2);
    assert_eq!(coordinator.control().status(), DiscoveryStatus::Completed);
}

#[tokio::test]
async fn incremental_discovery_diffs_folders_and_documents() {
    let mock = site();
    let cleanup = Arc::new(RecordingCleanup::default());
    let coordinator = coordinator(mock.clone(), context()).await.with_cleanup(cleanup.clone());
    coordinator.run(DiscoveryMode::Full).await.unwrap();

    mock.remove_tree("b").await;
    mock.put("c/four.html", "", T1).await;
    mock.put("a/one.html", "", T2).await;
    let outcome = coordinator.run(DiscoveryMode::Auto).await.unwrap();

    assert_eq!(outcome.mode, DiscoveryType::Incremental);
    let diff = outcome.diff.unwrap();
    assert!(diff.has_changes);
    assert_eq!(diff.new_folders, ["c"]);
    assert_eq!(diff.deleted_folders, ["b"]);
    assert_eq!(diff.changes.new, 1);
    assert_eq!(diff.changes.updated, 1);
    assert_eq!(diff.changes.unchanged, 2);
    assert_eq!(diff.changes.deleted, 1);

    let persistence = Persistence::new(mock.clone());
    assert!(!mock.exists(Path::new(".media/.pages/b.json")).await.unwrap());
    assert_eq!(*cleanup.calls.lock().unwrap(), [vec!["/acme/website/b/three.html".to_string()]]);

    let a = persistence.read_inventory("a").await.unwrap();
    let status = |path: &str| a.iter().find(|d| d.path == path).and_then(|d| d.entry_status);
    assert_eq!(status("/acme/website/a/one.html"), Some(EntryStatus::Updated));
    assert_eq!(status("/acme/website/a/sub/two.html"), Some(EntryStatus::Unchanged));
    let c = persistence.read_inventory("c").await.unwrap();
    assert_eq!(c[0].entry_status, Some(EntryStatus::New));

    let structure = persistence.read_site_structure().await.unwrap().unwrap();
    assert!(structure.root.folder(["b"]).is_none());
    assert!(structure.root.folder(["c"]).is_some());
    assert_eq!(outcome.stats.total_folders, 3);
    assert_eq!(outcome.stats.total_documents, 4);
}

#[tokio::test]
async fn unchanged_tree_rediscovers_identically() {
    let mock = site();
    let coordinator = coordinator(mock.clone(), context()).await;
    let persistence = Persistence::new(mock.clone());
    let normalize = |mut documents: Vec<Document>| {
        documents.iter_mut().for_each(|d| d.discovered_at = T1);
        documents
    };

    let first = coordinator.run(DiscoveryMode::Full).await.unwrap();
    let before = normalize(persistence.read_inventory("a").await.unwrap());
    let second = coordinator.run(DiscoveryMode::Full).await.unwrap();
    let after = normalize(persistence.read_inventory("a").await.unwrap());

    assert_eq!(before, after);
    assert_eq!(first.stats, second.stats);
}

#[tokio::test]
async fn failing_folder_is_isolated() {
    let mock = site();
    mock.fail_on("b");
    let coordinator = coordinator(mock.clone(), context()).await;
    let mut events = coordinator.subscribe();
    let outcome = coordinator.run(DiscoveryMode::Full).await.unwrap();

    assert_eq!(outcome.status, DiscoveryStatus::Completed);
    assert_eq!(outcome.stats.completed_folders, 3);
    assert_eq!(outcome.stats.errors, 1);
    let persistence = Persistence::new(mock.clone());
    assert_eq!(persistence.read_inventory("a").await.unwrap().len(), 2);
    assert_eq!(persistence.read_inventory("root").await.unwrap().len(), 1);

    let errors: Vec<_> = drain(&mut events)
        .into_iter()
        .filter_map(|e| match e {
            DiscoveryEvent::Error(error) => Some(error),
            _ => None,
        })
        .collect();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].folder.as_deref(), Some("b"));
    assert!(!errors[0].fatal);
}

#[tokio::test]
async fn progress_never_goes_backwards() {
    let mock = site();
    for i in 0..12 {
        mock.put(format!("f{i:02}/page.html"), "", T1).await;
    }
    let coordinator = coordinator(mock, context().with_concurrency(4)).await;
    let mut events = coordinator.subscribe();
    coordinator.run(DiscoveryMode::Full).await.unwrap();

    let mut last = 0;
    let mut seen = 0;
    for event in drain(&mut events) {
        if let DiscoveryEvent::Progress(stats) = event {
            assert!(stats.completed_folders >= last);
            assert!(stats.completed_folders <= stats.total_folders);
            last = stats.completed_folders;
            seen += 1;
        }
    }
    assert_eq!(seen, 15);
    assert_eq!(last, 15);
}

#[tokio::test]
async fn excluded_and_reserved_folders_are_skipped() {
    let mock = site();
    mock.put("root/clash.html", "", T1).await;
    let ctx = context().with_exclusions(["/b/*", "/a/sub/two.html"]);
    let coordinator = coordinator(mock.clone(), ctx).await;
    let outcome = coordinator.run(DiscoveryMode::Full).await.unwrap();

    assert_eq!(outcome.stats.total_folders, 2);
    assert_eq!(outcome.stats.errors, 1);
    assert_eq!(outcome.stats.total_documents, 2);
    let persistence = Persistence::new(mock);
    assert_eq!(persistence.list_inventories().await.unwrap(), ["a", "root"]);
    assert_eq!(paths(&persistence.read_inventory("root").await.unwrap()), ["/acme/website/root.html"]);
}

#[tokio::test]
async fn unreadable_root_is_fatal() {
    let (_open, gate) = watch::channel(true);
    let backend = Arc::new(Gated {
        inner: site(),
        slow: PathBuf::from("never"),
        gate,
        fail_root: true,
    });
    let coordinator = coordinator(backend.clone(), context()).await;
    let mut events = coordinator.subscribe();
    let err = coordinator.run(DiscoveryMode::Auto).await.unwrap_err();

    assert!(matches!(&*err, ErrorKind::Listing));
    assert_eq!(coordinator.control().status(), DiscoveryStatus::Error);
    assert!(Persistence::new(backend).read_checkpoint().await.unwrap().is_none());
    assert!(
        drain(&mut events)
            .iter()
            .any(|e| matches!(e, DiscoveryEvent::Error(error) if error.fatal && error.folder.is_none()))
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn overlapping_runs_are_refused_and_pause_resumes() {
    let mock = site();
    mock.put("slow/page.html", "", T1).await;
    let (open, gate) = watch::channel(false);
    let backend = Arc::new(Gated {
        inner: mock,
        slow: PathBuf::from("slow"),
        gate,
        fail_root: false,
    });
    let coordinator = Arc::new(coordinator(backend, context().with_concurrency(4)).await);
    let mut control = coordinator.control();
    let mut events = coordinator.subscribe();

    let running = tokio::spawn({
        let coordinator = coordinator.clone();
        async move { coordinator.run(DiscoveryMode::Full).await }
    });
    wait_for_folders(&mut events, &["root", "a", "b"]).await;

    let err = coordinator.run(DiscoveryMode::Full).await.unwrap_err();
    assert!(matches!(&*err, ErrorKind::AlreadyRunning));

    control.pause();
    assert_eq!(control.wait_for(|s| *s == DiscoveryStatus::Paused).await, DiscoveryStatus::Paused);
    control.resume();
    assert_eq!(control.wait_for(|s| *s == DiscoveryStatus::Running).await, DiscoveryStatus::Running);
    open.send_replace(true);

    let outcome = tokio::time::timeout(WAIT, running).await.unwrap().unwrap().unwrap();
    assert_eq!(outcome.status, DiscoveryStatus::Completed);
    assert_eq!(outcome.stats.completed_folders, 4);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stopped_run_resumes_where_it_left_off() {
    let mock = site();
    mock.put("slow/page.html", "", T1).await;
    let (open, gate) = watch::channel(false);
    let backend = Arc::new(Gated {
        inner: mock.clone(),
        slow: PathBuf::from("slow"),
        gate,
        fail_root: false,
    });
    let coordinator = Arc::new(coordinator(backend, context().with_concurrency(4)).await);
    let control = coordinator.control();
    let mut events = coordinator.subscribe();

    let running = tokio::spawn({
        let coordinator = coordinator.clone();
        async move { coordinator.run(DiscoveryMode::Full).await }
    });
    wait_for_folders(&mut events, &["root", "a", "b"]).await;
    control.stop();
    let stopped = tokio::time::timeout(WAIT, running).await.unwrap().unwrap().unwrap();
    assert_eq!(stopped.status, DiscoveryStatus::Stopped);
    assert_eq!(stopped.stats.completed_folders, 3);

    let report = coordinator.status_report().await.unwrap();
    let progress = report.progress.unwrap();
    assert_eq!(progress.status, DiscoveryStatus::Stopped);
    assert!(!progress.is_done("slow"));
    assert_eq!(report.checkpoint.unwrap().status, DiscoveryStatus::Running);
    assert!(!mock.exists(Path::new(".media/.pages/slow.json")).await.unwrap());

    open.send_replace(true);
    let mut events = coordinator.subscribe();
    let resumed = coordinator.run(DiscoveryMode::Auto).await.unwrap();
    assert!(resumed.resumed);
    assert_eq!(resumed.mode, DiscoveryType::Full);
    assert_eq!(resumed.status, DiscoveryStatus::Completed);
    assert_eq!(resumed.stats.completed_folders, 4);
    assert_eq!(resumed.stats.total_folders, 4);

    let scanned: Vec<String> = drain(&mut events)
        .into_iter()
        .filter_map(|e| match e {
            DiscoveryEvent::FolderComplete { folder, .. } => Some(folder),
            _ => None,
        })
        .collect();
    assert_eq!(scanned, ["slow"]);
}

#[tokio::test]
async fn validation_reports_unreadable_inventories() {
    let mock = site();
    let coordinator = coordinator(mock.clone(), context()).await;
    coordinator.run(DiscoveryMode::Full).await.unwrap();
    assert!(coordinator.validate().await.unwrap().is_valid);

    mock.fail_on(".media/.pages/a.json");
    let validation = coordinator.validate().await.unwrap();
    assert!(!validation.is_valid);
    assert_eq!(validation.files_with_errors, [".media/.pages/a.json"]);
}

#[tokio::test]
async fn reset_forgets_progress_and_forces_a_full_run() {
    let mock = site();
    let coordinator = coordinator(mock.clone(), context()).await;
    coordinator.run(DiscoveryMode::Full).await.unwrap();
    let report = coordinator.status_report().await.unwrap();
    assert!(report.checkpoint.is_some());
    assert!(report.progress.is_some());

    coordinator.reset().await.unwrap();
    let report = coordinator.status_report().await.unwrap();
    assert_eq!(report.status, DiscoveryStatus::Idle);
    assert!(report.checkpoint.is_none());
    assert!(report.progress.is_none());
    // Inventories survive a reset.
    assert_eq!(Persistence::new(mock.clone()).read_inventory("a").await.unwrap().len(), 2);

    let outcome = coordinator.run(DiscoveryMode::Auto).await.unwrap();
    assert_eq!(outcome.mode, DiscoveryType::Full);
}

#[tokio::test]
async fn stop_after_an_inventory_is_persisted_still_counts_that_folder() {
    let mock = site();
    mock.put("slow/page.html", "", T1).await;
    let (open, gate) = watch::channel(true);
    let backend = Arc::new(StopAfterPersist {
        inner: mock.clone(),
        persisted: PathBuf::from(".media/.pages/slow.json"),
        held: PathBuf::from("b"),
        gate,
        control: Mutex::new(None),
    });
    let coordinator = coordinator(backend.clone(), context().with_concurrency(4)).await;
    coordinator.run(DiscoveryMode::Full).await.unwrap();

    mock.put("slow/page.html", "", T2).await;
    open.send_replace(false);
    *backend.control.lock().unwrap() = Some(coordinator.control());
    let stopped = tokio::time::timeout(WAIT, coordinator.run(DiscoveryMode::Auto)).await.unwrap().unwrap();
    assert_eq!(stopped.status, DiscoveryStatus::Stopped);
    assert_eq!(stopped.mode, DiscoveryType::Incremental);

    let persistence = Persistence::new(mock.clone());
    assert_eq!(first_entry_status(&persistence, "slow").await, Some(EntryStatus::Updated));
    let progress = coordinator.status_report().await.unwrap().progress.unwrap();
    assert!(progress.is_done("slow"));
    assert!(!progress.is_done("b"));

    open.send_replace(true);
    let mut events = coordinator.subscribe();
    let resumed = coordinator.run(DiscoveryMode::Auto).await.unwrap();
    assert!(resumed.resumed);
    assert_eq!(resumed.status, DiscoveryStatus::Completed);
    let scanned: Vec<String> = drain(&mut events)
        .into_iter()
        .filter_map(|e| match e {
            DiscoveryEvent::FolderComplete { folder, .. } => Some(folder),
            _ => None,
        })
        .collect();
    assert!(scanned.contains(&"b".to_string()));
    assert!(!scanned.contains(&"slow".to_string()));
    assert_eq!(first_entry_status(&persistence, "slow").await, Some(EntryStatus::Updated));
}

#[tokio::test]
async fn failed_media_cleanup_keeps_tombstones_until_a_later_run() {
    let mock = site();
    let store = ProgressStore::from(&Database::connect_in_memory().await.unwrap());
    let coordinator = DiscoveryCoordinator::new(mock.clone(), context(), store.clone());
    coordinator.run(DiscoveryMode::Full).await.unwrap();

    mock.remove_tree("b").await;
    let failing =
        DiscoveryCoordinator::new(mock.clone(), context(), store.clone()).with_cleanup(Arc::new(FailingCleanup));
    let mut events = failing.subscribe();
    let outcome = failing.run(DiscoveryMode::Incremental).await.unwrap();
    assert_eq!(outcome.status, DiscoveryStatus::Completed);
    assert_eq!(outcome.stats.errors, 1);
    assert_eq!(outcome.diff.unwrap().deleted_folders, ["b"]);

    let persistence = Persistence::new(mock.clone());
    let kept = persistence.read_inventory("b").await.unwrap();
    assert_eq!(paths(&kept), ["/acme/website/b/three.html"]);
    assert!(kept.iter().all(Document::is_deleted));
    assert!(drain(&mut events).iter().any(|e| matches!(
        e,
        DiscoveryEvent::Error(error) if error.folder.as_deref() == Some("b") && error.message == "media cleanup failed"
    )));

    let cleanup = Arc::new(RecordingCleanup::default());
    let retrying = DiscoveryCoordinator::new(mock.clone(), context(), store).with_cleanup(cleanup.clone());
    let outcome = retrying.run(DiscoveryMode::Incremental).await.unwrap();
    assert_eq!(outcome.stats.errors, 0);
    assert_eq!(*cleanup.calls.lock().unwrap(), [vec!["/acme/website/b/three.html".to_string()]]);
    assert!(!mock.exists(Path::new(".media/.pages/b.json")).await.unwrap());
}

#[tokio::test]
async fn failed_checkpoint_write_is_fatal() {
    let mock = site();
    mock.fail_on(".media/.processing/discovery-checkpoint.json.tmp");
    let coordinator = coordinator(mock.clone(), context()).await;
    let mut events = coordinator.subscribe();
    let err = coordinator.run(DiscoveryMode::Full).await.unwrap_err();

    assert!(matches!(&*err, ErrorKind::Persistence));
    assert_eq!(coordinator.control().status(), DiscoveryStatus::Error);
    let progress = coordinator.status_report().await.unwrap().progress.unwrap();
    assert_eq!(progress.status, DiscoveryStatus::Error);
    assert!(Persistence::new(mock).list_inventories().await.unwrap().is_empty());
    assert!(
        drain(&mut events)
            .iter()
            .any(|e| matches!(e, DiscoveryEvent::Error(error) if error.fatal))
    );
}

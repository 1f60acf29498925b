//! In-memory repository backend for testing.

use super::EntryStream;
use crate::RepositoryBackend;
use crate::error::{ErrorKind, Result};
use crate::models::Entry;
use crate::path::{validate as validate_path, validate_folder};
use async_stream::stream;
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::sync::RwLock as SyncRwLock;
use time::OffsetDateTime;
use tokio::sync::RwLock;

/// In-memory repository backend for testing.
///
/// Files are stored in a `BTreeMap` behind a [`RwLock`], so all trait methods
/// can operate on `&self` without external synchronisation. Folders exist
/// implicitly as parents of files, or explicitly via
/// [`ensure_folder`](RepositoryBackend::ensure_folder).
///
/// Individual paths can be made to fail with [`fail_on`](Self::fail_on),
/// which affects listing that folder as well as reading or writing that file.
///
/// # Examples
///
/// ```
/// use sitescan_storage::backend::{MockBackend, RepositoryBackend};
/// use std::path::Path;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let backend = MockBackend::with_files([
///     ("blog/post.html", "<html>...</html>"),
/// ]);
/// assert!(backend.exists(Path::new("blog/post.html")).await?);
/// assert_eq!(backend.list_path(Some(Path::new("blog"))).await?.len(), 1);
/// # Ok(())
/// # }
/// ```
pub struct MockBackend {
    name: String,
    storage: RwLock<BTreeMap<PathBuf, (OffsetDateTime, Vec<u8>)>>,
    folders: RwLock<BTreeSet<PathBuf>>,
    failures: SyncRwLock<HashSet<PathBuf>>,
    atomic_writes: bool,
}

impl MockBackend {
    /// Create a mock backend pre-populated with files, all sharing the same
    /// modification time.
    ///
    /// Panics if any path fails validation (e.g. path traversal). If test
    /// setup is wrong, then test should not pass.
    pub fn with_files(files: impl IntoIterator<Item = (impl Into<PathBuf>, impl Into<Vec<u8>>)>) -> Self {
        let now = OffsetDateTime::now_utc();
        Self::with_dated_files(files.into_iter().map(|(p, d)| (p, d, now)))
    }

    /// Create a mock backend pre-populated with files with explicit
    /// modification times.
    pub fn with_dated_files(
        files: impl IntoIterator<Item = (impl Into<PathBuf>, impl Into<Vec<u8>>, OffsetDateTime)>,
    ) -> Self {
        let mut map = BTreeMap::new();
        for (path, data, modified) in files {
            map.insert(Self::checked(path), (modified, data.into()));
        }
        Self {
            name: "mock".to_string(),
            storage: RwLock::new(map),
            folders: RwLock::new(BTreeSet::new()),
            failures: SyncRwLock::new(HashSet::new()),
            atomic_writes: false,
        }
    }

    /// Change the name of the mock backend.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Advertise atomic writes, like a backend whose uploads replace a file
    /// in one request.
    pub fn with_atomic_writes(mut self) -> Self {
        self.atomic_writes = true;
        self
    }

    /// Make every operation on `path` fail with [`ErrorKind::Injected`].
    pub fn fail_on(&self, path: impl Into<PathBuf>) {
        let path = Self::checked(path);
        if let Ok(mut failures) = self.failures.write() {
            failures.insert(path);
        }
    }

    /// Undo [`fail_on`](Self::fail_on).
    pub fn heal(&self, path: impl AsRef<Path>) {
        if let Ok(mut failures) = self.failures.write() {
            failures.remove(path.as_ref());
        }
    }

    /// Insert or replace a file with an explicit modification time.
    pub async fn put(&self, path: impl Into<PathBuf>, data: impl Into<Vec<u8>>, modified: OffsetDateTime) {
        self.storage.write().await.insert(Self::checked(path), (modified, data.into()));
    }

    /// Remove every file (and explicit folder) at or below `prefix`.
    pub async fn remove_tree(&self, prefix: impl AsRef<Path>) {
        let prefix = prefix.as_ref();
        self.storage.write().await.retain(|path, _| !path.starts_with(prefix));
        self.folders.write().await.retain(|path| !path.starts_with(prefix));
    }

    /// Snapshot of every stored file path, sorted.
    pub async fn paths(&self) -> Vec<PathBuf> {
        self.storage.read().await.keys().cloned().collect()
    }

    fn checked(path: impl Into<PathBuf>) -> PathBuf {
        let path = path.into();
        let Ok(validated) = validate_path(&path) else {
            // The panic here is DELIBERATE. MockBackend is intended to be
            // used in tests; panics are expected. There is no error result.
            panic!("MockBackend: invalid path {}", path.display());
        };
        validated
    }

    fn check_failure(&self, path: &Path) -> Result<()> {
        let failing = self.failures.read().map(|f| f.contains(path)).unwrap_or(false);
        if failing {
            exn::bail!(ErrorKind::Injected(path.to_path_buf()));
        }
        Ok(())
    }

    /// Collect the immediate children of `folder` from the flat key space.
    async fn children(&self, folder: Option<&Path>) -> Vec<Entry> {
        let base = folder.unwrap_or(Path::new(""));
        let mut files = Vec::new();
        let mut folders = BTreeSet::new();
        let mut consider = |path: &Path, modified: Option<OffsetDateTime>| {
            let Ok(rest) = path.strip_prefix(base) else { return };
            let mut components = rest.components();
            let Some(first) = components.next() else { return };
            let child = base.join(first);
            match components.next() {
                Some(_) => {
                    folders.insert(child);
                },
                None => match modified {
                    Some(m) => files.push(Entry::file(child, Some(m))),
                    None => {
                        folders.insert(child);
                    },
                },
            }
        };
        {
            let guard = self.storage.read().await;
            for (path, (modified, _)) in guard.iter() {
                consider(path, Some(*modified));
            }
        }
        {
            let guard = self.folders.read().await;
            for path in guard.iter() {
                consider(path, None);
            }
        }
        folders.into_iter().map(Entry::folder).chain(files).collect()
    }
}
impl Default for MockBackend {
    fn default() -> Self {
        let files: [(&str, &str); 0] = [];
        Self::with_files(files)
    }
}

#[async_trait]
impl RepositoryBackend for MockBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn atomic_writes(&self) -> bool {
        self.atomic_writes
    }

    fn entries<'a>(&'a self, folder: Option<&'a Path>) -> EntryStream<'a> {
        let folder = match validate_folder(folder) {
            Ok(folder) => folder,
            Err(e) => return Box::pin(futures::stream::once(async { Err(e) })),
        };
        Box::pin(stream! {
            if let Some(f) = &folder
                && let Err(e) = self.check_failure(f)
            {
                yield Err(e);
                return;
            }
            // Snapshot under the read locks, then yield without holding them.
            for entry in self.children(folder.as_deref()).await {
                yield Ok(entry);
            }
        })
    }

    async fn exists(&self, path: &Path) -> Result<bool> {
        let path = validate_path(path)?;
        self.check_failure(&path)?;
        Ok(self.storage.read().await.contains_key(&path))
    }

    async fn read(&self, path: &Path) -> Result<Vec<u8>> {
        let path = validate_path(path)?;
        self.check_failure(&path)?;
        let (_modified, data) =
            self.storage.read().await.get(&path).cloned().ok_or_else(|| exn::Exn::from(ErrorKind::NotFound(path)))?;
        Ok(data)
    }

    async fn write(&self, path: &Path, data: &[u8]) -> Result<()> {
        let path = validate_path(path)?;
        self.check_failure(&path)?;
        self.storage.write().await.insert(path, (OffsetDateTime::now_utc(), data.to_vec()));
        Ok(())
    }

    async fn delete(&self, path: &Path) -> Result<()> {
        let path = validate_path(path)?;
        self.check_failure(&path)?;
        self.storage.write().await.remove(&path).map(|_| ()).ok_or_else(|| exn::Exn::from(ErrorKind::NotFound(path)))
    }

    async fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        let from = validate_path(from)?;
        let to = validate_path(to)?;
        self.check_failure(&from)?;
        self.check_failure(&to)?;
        let mut guard = self.storage.write().await;
        let data = guard.remove(&from).ok_or_else(|| exn::Exn::from(ErrorKind::NotFound(from)))?;
        guard.insert(to, data);
        Ok(())
    }

    async fn ensure_folder(&self, path: &Path) -> Result<()> {
        let path = validate_path(path)?;
        self.check_failure(&path)?;
        self.folders.write().await.insert(path);
        Ok(())
    }
}

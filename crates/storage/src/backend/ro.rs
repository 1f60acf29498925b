//! Dry-run repository backend.
//!
//! Wraps another backend and prevents write operations from executing, while
//! still indicating success on return. Discovery can then be run against a
//! live repository without touching its `.media` folder.

use async_trait::async_trait;
use std::path::Path;

use crate::{BackendHandle, RepositoryBackend, backend::EntryStream, error::Result};

/// Read-only repository backend.
///
/// Wraps another backend and silently drops all write operations, logging an
/// [`info event`](tracing::Event).
#[derive(Clone)]
pub struct ReadOnlyBackend {
    inner: BackendHandle,
}
impl ReadOnlyBackend {
    pub fn new(inner: BackendHandle) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl RepositoryBackend for ReadOnlyBackend {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn atomic_writes(&self) -> bool {
        self.inner.atomic_writes()
    }

    fn entries<'a>(&'a self, folder: Option<&'a Path>) -> EntryStream<'a> {
        self.inner.entries(folder)
    }

    async fn exists(&self, path: &Path) -> Result<bool> {
        self.inner.exists(path).await
    }

    async fn read(&self, path: &Path) -> Result<Vec<u8>> {
        self.inner.read(path).await
    }

    async fn write(&self, path: &Path, data: &[u8]) -> Result<()> {
        tracing::info!(path = %path.display(), bytes = data.len(), "Skipping write during dry run");
        Ok(())
    }

    async fn delete(&self, path: &Path) -> Result<()> {
        tracing::info!(path = %path.display(), "Skipping delete during dry run");
        Ok(())
    }

    async fn rename(&self, from: &Path, _to: &Path) -> Result<()> {
        tracing::info!(path = %from.display(), "Skipping rename during dry run");
        Ok(())
    }

    async fn ensure_folder(&self, path: &Path) -> Result<()> {
        tracing::debug!(path = %path.display(), "Skipping folder creation during dry run");
        Ok(())
    }
}

#[cfg(all(test, feature = "mock"))]
mod tests {
    use super::*;
    use crate::backend::MockBackend;
    use std::sync::Arc;

    #[tokio::test]
    async fn writes_are_dropped_reads_pass_through() {
        let inner = Arc::new(MockBackend::with_files([("index.html", "<html/>")]));
        let backend = ReadOnlyBackend::new(inner.clone());
        backend.write(Path::new(".media/.pages/root.json"), b"{}").await.unwrap();
        assert!(!inner.exists(Path::new(".media/.pages/root.json")).await.unwrap());
        backend.delete(Path::new("index.html")).await.unwrap();
        assert_eq!(backend.read(Path::new("index.html")).await.unwrap(), b"<html/>");
        assert_eq!(backend.list_path(None).await.unwrap().len(), 1);
    }

    #[test]
    fn atomic_writes_follow_the_wrapped_backend() {
        assert!(!ReadOnlyBackend::new(Arc::new(MockBackend::default())).atomic_writes());
        assert!(ReadOnlyBackend::new(Arc::new(MockBackend::default().with_atomic_writes())).atomic_writes());
    }
}

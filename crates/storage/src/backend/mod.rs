//! Repository backend trait and implementations.
//!
//! This module defines the [`RepositoryBackend`] trait, a unified interface
//! over wherever the content repository lives (a directory on disk, a remote
//! admin API over HTTP, or memory during tests).

#[cfg(feature = "http")]
mod http;
mod local;
#[cfg(feature = "mock")]
mod mock;
mod ro;

#[cfg(feature = "http")]
pub use self::http::{HttpBackend, HttpOptions};
pub use self::local::LocalBackend;
#[cfg(feature = "mock")]
pub use self::mock::MockBackend;
pub use self::ro::ReadOnlyBackend;
use crate::error::Result;
use crate::models::Entry;
use async_trait::async_trait;
use futures::{Stream, TryStreamExt};
use std::path::Path;
use std::pin::Pin;

pub(crate) type EntryStream<'a> = Pin<Box<dyn Stream<Item = Result<Entry>> + Send + 'a>>;

/// Unified interface for repository backends.
///
/// All operations are asynchronous; every one of them is a suspension point
/// for the discovery engine, which awaits them from many concurrent folder
/// scans at once.
///
/// # Path Handling
/// All paths are relative to the repository root and must be validated using
/// [`validate_path`](crate::validate_path) before use. Implementations should
/// enforce this validation.
///
/// # Examples
///
/// ```
/// use std::path::Path;
/// use sitescan_storage::{backend::RepositoryBackend, error::Result};
///
/// async fn count_pages(backend: &dyn RepositoryBackend, folder: &Path) -> Result<usize> {
///     let entries = backend.list_path(Some(folder)).await?;
///     Ok(entries.iter().filter(|e| e.has_ext("html")).count())
/// }
/// ```
#[async_trait]
pub trait RepositoryBackend: Send + Sync {
    /// Name of the configured backend (used for logging only).
    fn name(&self) -> &str;

    /// List the immediate children of one folder.
    ///
    /// Default implementation of this method is to collect all the results
    /// from [`entries()`](Self::entries) into a [`Vec`] before returning.
    async fn list_path(&self, folder: Option<&Path>) -> Result<Vec<Entry>> {
        self.entries(folder).try_collect().await
    }

    /// Stream the immediate children (files and folders) of one folder.
    ///
    /// `None` lists the repository root. Listing a folder that does not exist
    /// yields an empty stream rather than an error, which is how remote
    /// listing APIs behave.
    ///
    /// # Examples
    ///
    /// ```
    /// use futures::TryStreamExt;
    /// use std::path::Path;
    /// # use sitescan_storage::{backend::RepositoryBackend, error::Result};
    /// # async fn example(backend: &dyn RepositoryBackend) -> Result<()> {
    /// let mut stream = backend.entries(Some(Path::new("blog")));
    /// while let Some(entry) = stream.try_next().await? {
    ///     println!("{} ({:?})", entry.path.display(), entry.kind);
    /// }
    /// # Ok(())
    /// # }
    /// ```
    fn entries<'a>(&'a self, folder: Option<&'a Path>) -> EntryStream<'a>;

    /// Check if a file exists.
    async fn exists(&self, path: &Path) -> Result<bool>;

    /// Read file contents (the content fetch API).
    ///
    /// Returns [`NotFound`](crate::error::ErrorKind::NotFound) if the file
    /// does not exist.
    async fn read(&self, path: &Path) -> Result<Vec<u8>>;

    /// Fetch a document as text.
    ///
    /// Invalid UTF-8 is replaced rather than rejected; page content is only
    /// ever inspected, never written back.
    async fn fetch_page_content(&self, path: &Path) -> Result<String> {
        let bytes = self.read(path).await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Write file contents.
    ///
    /// Creates a new file or overwrites an existing file with the provided data.
    ///
    /// # Notes
    /// - Implementations should create parent folders as needed.
    async fn write(&self, path: &Path, data: &[u8]) -> Result<()>;

    /// Delete a file.
    ///
    /// Returns [`NotFound`](crate::error::ErrorKind::NotFound) if the file
    /// does not exist.
    async fn delete(&self, path: &Path) -> Result<()>;

    /// Whether one [`write()`](Self::write) replaces a file all at once, so
    /// that readers see either the old or the new content and never a
    /// truncated file. Callers that need atomic replacement can skip the
    /// write-to-temporary-then-rename dance when this is `true`.
    fn atomic_writes(&self) -> bool {
        false
    }

    /// Rename/move a file within the same backend.
    ///
    /// # Notes
    /// - Implementations should create parent folders as needed
    /// - If the destination already exists, it will be overwritten
    /// - For non-atomic backends: warn but don't fail when the delete operation fails
    async fn rename(&self, from: &Path, to: &Path) -> Result<()>;

    /// Make sure a folder exists. Idempotent.
    async fn ensure_folder(&self, path: &Path) -> Result<()>;
}

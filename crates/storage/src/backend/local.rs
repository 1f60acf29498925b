//! Local filesystem repository backend.
//!
//! Serves a repository that has been checked out (or synced) into a local
//! directory. Files are accessed via `tokio::fs` for async I/O.

use crate::backend::EntryStream;
use crate::error::ErrorKind;
use crate::models::Entry;
use crate::path::{validate as validate_path, validate_folder};
use crate::{RepositoryBackend, error::Result};
use async_stream::stream;
use async_trait::async_trait;
use exn::ResultExt;
use std::fs::{Metadata, create_dir_all as sync_create_dir};
use std::path::{Path, PathBuf};
use tokio::fs::{self, DirEntry};

/// Local filesystem repository backend.
///
/// All paths are relative to the configured root directory.
///
/// # Examples
///
/// ```no_run
/// use sitescan_storage::backend::LocalBackend;
///
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let backend = LocalBackend::new("local", "/srv/content/acme/website")?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct LocalBackend {
    name: String,
    /// Root directory of the repository
    root: PathBuf,
}
impl LocalBackend {
    /// Create a new local filesystem backend.
    ///
    /// # Errors
    ///
    /// Returns an error if the path is not absolute, or exists but is not a
    /// directory.
    pub fn new(name: impl Into<String>, root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        if !root.is_absolute() {
            exn::bail!(ErrorKind::InvalidPath(root));
        }
        if root.exists() {
            if !root.is_dir() {
                exn::bail!(ErrorKind::InvalidPath(root));
            }
        } else {
            // Use non-async here; it'll only happen once on startup and it's
            // not worth the hassle of making the constructor async.
            sync_create_dir(&root).map_err(|e| Self::map_io_error(e, &root))?;
        }
        Ok(Self { name: name.into(), root })
    }

    /// Validates the path and joins it with the root directory.
    fn absolute_path(&self, path: impl AsRef<Path>) -> Result<PathBuf> {
        let validated = validate_path(path.as_ref())?;
        Ok(self.root.join(validated))
    }

    /// Strips the root prefix from an absolute path.
    fn relative_path(&self, absolute: impl AsRef<Path>) -> Result<PathBuf> {
        let absolute = absolute.as_ref();
        let relative = absolute.strip_prefix(&self.root).or_raise(|| {
            ErrorKind::BackendError(format!("path `{:?}` is not within root `{:?}`", absolute, self.root))
        })?;
        validate_path(relative)
    }

    fn map_io_error(e: std::io::Error, path: &Path) -> ErrorKind {
        match e.kind() {
            std::io::ErrorKind::NotFound => ErrorKind::NotFound(path.to_path_buf()),
            std::io::ErrorKind::PermissionDenied => ErrorKind::PermissionDenied(path.to_path_buf()),
            _ => ErrorKind::Io(e),
        }
    }

    fn to_entry(relative: PathBuf, metadata: &Metadata) -> Option<Entry> {
        if metadata.is_dir() {
            return Some(Entry::folder(relative));
        }
        if metadata.is_file() {
            let modified = metadata.modified().ok().map(Into::into);
            return Some(Entry::file(relative, modified));
        }
        // Note: silently drop what is most likely a broken symlink.
        None
    }

    async fn process_entry(&self, entry: DirEntry) -> Result<Option<Entry>> {
        let path = entry.path();
        let metadata = entry.metadata().await.map_err(|e| Self::map_io_error(e, &path))?;
        let relative = self.relative_path(&path)?;
        Ok(Self::to_entry(relative, &metadata))
    }
}

#[async_trait]
impl RepositoryBackend for LocalBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn entries<'a>(&'a self, folder: Option<&'a Path>) -> EntryStream<'a> {
        let directory = match validate_folder(folder) {
            Ok(Some(relative)) => self.root.join(relative),
            Ok(None) => self.root.clone(),
            Err(e) => return Box::pin(futures::stream::once(async { Result::Err(e) })),
        };

        Box::pin(stream! {
            let mut entries = match fs::read_dir(&directory).await {
                Ok(entries) => entries,
                // Asking for the contents of a folder that doesn't exist
                // results in an empty list, not an error.
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => return,
                Err(err) => {
                    yield Err(exn::Exn::from(Self::map_io_error(err, &directory)));
                    return;
                }
            };
            loop {
                let entry = match entries.next_entry().await {
                    Ok(Some(entry)) => entry,
                    Ok(None) => break,
                    Err(e) => { yield Err(exn::Exn::from(Self::map_io_error(e, &directory))); continue; },
                };
                match self.process_entry(entry).await {
                    Ok(Some(entry)) => yield Ok(entry),
                    Ok(None) => {},
                    Err(e) => yield Err(e),
                }
            }
        })
    }

    async fn exists(&self, path: &Path) -> Result<bool> {
        let abs_path = self.absolute_path(path)?;
        Ok(fs::try_exists(&abs_path).await.map_err(ErrorKind::Io)?)
    }

    async fn read(&self, path: &Path) -> Result<Vec<u8>> {
        let abs_path = self.absolute_path(path)?;
        Ok(fs::read(&abs_path).await.map_err(|e| Self::map_io_error(e, path))?)
    }

    async fn write(&self, path: &Path, data: &[u8]) -> Result<()> {
        let abs_path = self.absolute_path(path)?;
        if let Some(parent) = abs_path.parent() {
            fs::create_dir_all(parent).await.map_err(|e| Self::map_io_error(e, path))?;
        }
        Ok(fs::write(&abs_path, data).await.map_err(|e| Self::map_io_error(e, path))?)
    }

    async fn delete(&self, path: &Path) -> Result<()> {
        let abs_path = self.absolute_path(path)?;
        Ok(fs::remove_file(&abs_path).await.map_err(|e| Self::map_io_error(e, path))?)
    }

    async fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        let from_path = self.absolute_path(from)?;
        let to_path = self.absolute_path(to)?;
        if let Some(parent) = to_path.parent() {
            fs::create_dir_all(parent).await.map_err(|e| Self::map_io_error(e, to))?;
        }
        Ok(fs::rename(&from_path, &to_path).await.map_err(|e| Self::map_io_error(e, from))?)
    }

    async fn ensure_folder(&self, path: &Path) -> Result<()> {
        let abs_path = self.absolute_path(path)?;
        Ok(fs::create_dir_all(&abs_path).await.map_err(|e| Self::map_io_error(e, path))?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::EntryKind;

    fn backend() -> (tempfile::TempDir, LocalBackend) {
        let temp_dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new("local", temp_dir.path()).unwrap();
        (temp_dir, backend)
    }

    #[test]
    fn test_new_requires_absolute_path() {
        let temp_dir = tempfile::tempdir().unwrap();
        assert!(LocalBackend::new("name", temp_dir.path()).is_ok());
        assert!(LocalBackend::new("name", "relative/path").is_err());
    }

    #[test]
    fn test_absolute_path_prevents_traversal() {
        let (temp_dir, backend) = backend();
        let expected = temp_dir.path().join("blog/post.html");
        assert_eq!(backend.absolute_path(Path::new("blog/post.html")).unwrap(), expected);
        assert!(backend.absolute_path(Path::new("../etc/passwd")).is_err());
    }

    #[tokio::test]
    async fn test_list_path_is_not_recursive() {
        let (_tmp, backend) = backend();
        backend.write(Path::new("index.html"), b"<html/>").await.unwrap();
        backend.write(Path::new("blog/post.html"), b"<html/>").await.unwrap();
        backend.write(Path::new("blog/2024/deep.html"), b"<html/>").await.unwrap();

        let mut root = backend.list_path(None).await.unwrap();
        root.sort_by(|a, b| a.path.cmp(&b.path));
        assert_eq!(root.len(), 2);
        assert_eq!(root[0].path, Path::new("blog"));
        assert_eq!(root[0].kind, EntryKind::Folder);
        assert_eq!(root[1].path, Path::new("index.html"));
        assert!(root[1].last_modified.is_some());

        let blog = backend.list_path(Some(Path::new("/blog"))).await.unwrap();
        assert_eq!(blog.len(), 2);
    }

    #[tokio::test]
    async fn test_list_missing_folder_is_empty() {
        let (_tmp, backend) = backend();
        let entries = backend.list_path(Some(Path::new("nowhere"))).await.unwrap();
        assert!(entries.is_empty());
    }

    #[tokio::test]
    async fn test_write_read_delete() {
        let (_tmp, backend) = backend();
        backend.write(Path::new(".media/.pages/a.json"), b"{}").await.unwrap();
        assert_eq!(backend.read(Path::new(".media/.pages/a.json")).await.unwrap(), b"{}");
        backend.delete(Path::new(".media/.pages/a.json")).await.unwrap();
        assert!(!backend.exists(Path::new(".media/.pages/a.json")).await.unwrap());
        let err = backend.delete(Path::new(".media/.pages/a.json")).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::NotFound(_)));
    }

    #[tokio::test]
    async fn test_rename_overwrites_destination() {
        let (_tmp, backend) = backend();
        backend.write(Path::new("a.json"), b"old").await.unwrap();
        backend.write(Path::new("a.json.tmp"), b"new").await.unwrap();
        backend.rename(Path::new("a.json.tmp"), Path::new("a.json")).await.unwrap();
        assert_eq!(backend.read(Path::new("a.json")).await.unwrap(), b"new");
        assert!(!backend.exists(Path::new("a.json.tmp")).await.unwrap());
    }

    #[tokio::test]
    async fn test_ensure_folder_is_idempotent() {
        let (tmp, backend) = backend();
        backend.ensure_folder(Path::new(".media/.processing")).await.unwrap();
        backend.ensure_folder(Path::new(".media/.processing")).await.unwrap();
        assert!(tmp.path().join(".media/.processing").is_dir());
    }

    #[tokio::test]
    async fn test_fetch_page_content() {
        let (_tmp, backend) = backend();
        backend.write(Path::new("index.html"), b"<main>hi</main>").await.unwrap();
        let text = backend.fetch_page_content(Path::new("index.html")).await.unwrap();
        assert_eq!(text, "<main>hi</main>");
    }
}

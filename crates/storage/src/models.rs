//! Storage models.
//!
//! These types mirror one row of the repository listing API
//! (`{name, path, ext, lastModified}`).

use std::path::PathBuf;
use time::OffsetDateTime;

/// Whether a listed entry is a leaf file or a folder that can be descended into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryKind {
    File,
    Folder,
}

/// One item of a folder listing returned by a [`RepositoryBackend`](crate::RepositoryBackend).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    /// Final path component, without extension for files.
    pub name: String,
    /// Relative path from the repository root
    pub path: PathBuf,
    /// Lower-cased file extension (`None` for folders and extension-less files)
    pub ext: Option<String>,
    /// Last modified timestamp, when the backend reports one
    pub last_modified: Option<OffsetDateTime>,
    pub kind: EntryKind,
}
impl Entry {
    /// Create a file entry, deriving `name` and `ext` from the path.
    pub fn file(path: impl Into<PathBuf>, last_modified: Option<OffsetDateTime>) -> Self {
        let path = path.into();
        let ext = path.extension().and_then(|e| e.to_str()).map(str::to_ascii_lowercase);
        let name = path.file_stem().map(|s| s.to_string_lossy().into_owned()).unwrap_or_default();
        Self {
            name,
            path,
            ext,
            last_modified,
            kind: EntryKind::File,
        }
    }

    /// Create a folder entry.
    pub fn folder(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let name = path.file_name().map(|s| s.to_string_lossy().into_owned()).unwrap_or_default();
        Self {
            name,
            path,
            ext: None,
            last_modified: None,
            kind: EntryKind::Folder,
        }
    }

    pub fn is_folder(&self) -> bool {
        self.kind == EntryKind::Folder
    }

    pub fn has_ext(&self, ext: &str) -> bool {
        self.kind == EntryKind::File && self.ext.as_deref().is_some_and(|e| e.eq_ignore_ascii_case(ext))
    }

    /// File name including extension, as shown in the listing.
    pub fn file_name(&self) -> String {
        self.path.file_name().map(|s| s.to_string_lossy().into_owned()).unwrap_or_else(|| self.name.clone())
    }
}

//! Path validation and security utilities.
//!
//! Every backend resolves paths relative to the repository root. This module
//! makes sure a path can never resolve outside of it.

use std::path::{Component, Path, PathBuf};

use crate::error::{ErrorKind, Result};

/// Validates a repository path for security and correctness.
/// Ensures that paths don't escape the repository root (no `..` traversal).
///
/// > **Note:** This does **not** normalize backslashes, non-UTF8 bytes, or
/// >           platform-specific weirdness. Null bytes are explicitly rejected.
///
/// A leading `/` is accepted and stripped: the repository listing API hands
/// out absolute-looking paths that are still relative to the repository.
///
/// # Examples
///
/// ```
/// use std::path::Path;
/// use sitescan_storage::validate_path;
/// // Valid paths
/// assert!(validate_path("blog/post.html").is_ok());
/// assert!(validate_path("/blog/post.html").is_ok());
/// assert!(validate_path("a/../post.html").is_ok()); // (never leaves repository root)
/// // Invalid paths
/// assert!(validate_path("../secrets.json").is_err());
/// assert!(validate_path("a/../../b").is_err());
/// assert!(validate_path("a\0b").is_err());
/// // Paths get resolved
/// assert_eq!(
///     validate_path("drafts/.././.media//.pages/").unwrap(),
///     Path::new(".media/.pages")
/// );
/// ```
pub fn validate(path: impl AsRef<Path>) -> Result<PathBuf> {
    let mut components = Vec::new();
    for component in path.as_ref().components() {
        match component {
            Component::Normal(s) => {
                // Null bytes pass through Path::components() on Unix but cause
                // truncation in C-based syscalls; reject them explicitly.
                if s.as_encoded_bytes().contains(&0) {
                    exn::bail!(ErrorKind::InvalidPath(path.as_ref().to_path_buf()));
                }
                components.push(s)
            },
            Component::CurDir | Component::RootDir => {},
            Component::Prefix(_) => exn::bail!(ErrorKind::InvalidPath(path.as_ref().to_path_buf())),
            Component::ParentDir => {
                if components.pop().is_none() {
                    exn::bail!(ErrorKind::InvalidPath(path.as_ref().to_path_buf()));
                }
            },
        }
    }
    match components.is_empty() {
        true => exn::bail!(ErrorKind::InvalidPath(path.as_ref().to_path_buf())),
        false => Ok(components.into_iter().collect()),
    }
}

/// Validates a path that may also refer to the repository root itself.
///
/// Listing the root is legitimate (`None`, `""`, `"/"`), so unlike
/// [`validate`] an empty result is not an error here.
pub fn validate_folder(path: Option<&Path>) -> Result<Option<PathBuf>> {
    match path {
        None => Ok(None),
        Some(p) if p.components().all(|c| matches!(c, Component::RootDir | Component::CurDir)) => Ok(None),
        Some(p) => validate(p).map(Some),
    }
}

/// Render a validated path with forward slashes, the way the listing API and
/// persisted inventories spell them.
pub fn to_slash(path: impl AsRef<Path>) -> Result<String> {
    let path = path.as_ref();
    let parts = path
        .components()
        .map(|c| c.as_os_str().to_str().ok_or_else(|| exn::Exn::from(ErrorKind::InvalidPath(path.to_path_buf()))))
        .collect::<Result<Vec<_>>>()?;
    Ok(parts.join("/"))
}

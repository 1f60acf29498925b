//! Exclusion patterns.
//!
//! A pattern is either an exact repository path (`/fragments/nav.html`) or a
//! prefix ending in `/*` (`/drafts/*`), which excludes the folder itself and
//! everything below it. Patterns are OR-combined.

use crate::context::Namespace;

/// Returns `true` if `path` is excluded by any of `patterns`.
///
/// `path` must already be relative to the repository (no `/org/repo` prefix),
/// with a leading slash.
///
/// ```
/// use sitescan_discovery::matches;
///
/// let patterns = vec!["/drafts/*".to_string(), "/nav.html".to_string()];
/// assert!(matches("/drafts", &patterns));
/// assert!(matches("/drafts/2024/post.html", &patterns));
/// assert!(matches("/nav.html", &patterns));
/// assert!(!matches("/drafts-old/post.html", &patterns));
/// ```
pub fn matches(path: &str, patterns: &[String]) -> bool {
    patterns.iter().any(|pattern| match pattern.strip_suffix("/*") {
        Some(prefix) => path == prefix || path.strip_prefix(prefix).is_some_and(|rest| rest.starts_with('/')),
        None => path == pattern,
    })
}

/// Exclusion patterns bound to one repository namespace.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExclusionFilter {
    patterns: Vec<String>,
}
impl ExclusionFilter {
    pub fn new(patterns: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            patterns: patterns.into_iter().map(Into::into).collect(),
        }
    }

    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }

    /// Number of patterns that exclude a whole folder.
    pub fn excluded_folders(&self) -> usize {
        self.patterns.iter().filter(|p| p.ends_with("/*")).count()
    }

    /// Check an absolute document path (`/org/repo/...`).
    pub fn is_excluded(&self, namespace: &Namespace, path: &str) -> bool {
        !self.patterns.is_empty() && matches(namespace.strip(path), &self.patterns)
    }
}

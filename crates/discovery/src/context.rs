use crate::filter::ExclusionFilter;
use sitescan_config::{Config, DEFAULT_CONCURRENCY};
use sitescan_storage::error::Result as StorageResult;
use sitescan_storage::to_slash;
use std::path::Path;

/// Key under which discovery progress is mirrored, per namespace.
pub const CHECKPOINT_KEY: &str = "discovery-checkpoint";

/// The `/org/repo` namespace every document path lives under.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Namespace {
    org: String,
    repo: String,
    prefix: String,
}
impl Namespace {
    pub fn new(org: impl Into<String>, repo: impl Into<String>) -> Self {
        let (org, repo) = (org.into(), repo.into());
        let prefix = format!("/{org}/{repo}");
        Self { org, repo, prefix }
    }

    pub fn org(&self) -> &str {
        &self.org
    }

    pub fn repo(&self) -> &str {
        &self.repo
    }

    /// `/org/repo`, without a trailing slash.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Absolute document path for a path relative to the repository root.
    pub fn absolute(&self, relative: impl AsRef<Path>) -> StorageResult<String> {
        Ok(format!("{}/{}", self.prefix, to_slash(relative)?))
    }

    /// Strip the namespace from an absolute document path, keeping the
    /// leading slash. Paths outside the namespace are returned unchanged.
    pub fn strip<'a>(&self, path: &'a str) -> &'a str {
        match path.strip_prefix(self.prefix.as_str()) {
            Some(rest) if rest.starts_with('/') => rest,
            Some("") => "/",
            _ => path,
        }
    }

    /// Key of the progress record in the local mirror.
    pub fn progress_key(&self) -> String {
        format!("{}:{CHECKPOINT_KEY}", self.prefix)
    }
}

/// Immutable settings threaded through every discovery component.
#[derive(Debug, Clone)]
pub struct Context {
    pub namespace: Namespace,
    pub filter: ExclusionFilter,
    pub concurrency: usize,
}
impl Context {
    pub fn new(namespace: Namespace) -> Self {
        Self {
            namespace,
            filter: ExclusionFilter::default(),
            concurrency: DEFAULT_CONCURRENCY,
        }
    }

    pub fn with_exclusions(mut self, patterns: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.filter = ExclusionFilter::new(patterns);
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }
}
impl From<&Config> for Context {
    fn from(config: &Config) -> Self {
        Self::new(Namespace::new(&config.org, &config.repo))
            .with_exclusions(config.exclusion_patterns().iter().cloned())
            .with_concurrency(config.concurrency)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("/acme/website/blog/post.html", "/blog/post.html")]
    #[case("/acme/website", "/")]
    #[case("/acme/website-old/post.html", "/acme/website-old/post.html")]
    #[case("/other/repo/post.html", "/other/repo/post.html")]
    fn test_strip(#[case] path: &str, #[case] expected: &str) {
        assert_eq!(Namespace::new("acme", "website").strip(path), expected);
    }

    #[test]
    fn test_absolute() {
        let namespace = Namespace::new("acme", "website");
        assert_eq!(namespace.absolute("blog/post.html").unwrap(), "/acme/website/blog/post.html");
        assert_eq!(namespace.progress_key(), "/acme/website:discovery-checkpoint");
    }

    #[test]
    fn test_concurrency_is_at_least_one() {
        let ctx = Context::new(Namespace::new("acme", "website")).with_concurrency(0);
        assert_eq!(ctx.concurrency, 1);
    }
}

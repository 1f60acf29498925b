//! Configuration loading and validation.
//!
//! Configuration is layered with [`figment`]:
//!
//! 1. built-in defaults,
//! 2. a config file (TOML, YAML or JSON, picked by extension), either given
//!    explicitly or looked up in the platform config directory,
//! 3. environment variables prefixed with `SITESCAN_` (nested keys use `__`,
//!    e.g. `SITESCAN_BACKEND__ROOT`).
//!
//! ```toml
//! org = "acme"
//! repo = "website"
//! concurrency = 4
//! exclusions = ["/drafts/*", "/fragments/nav.html"]
//!
//! [backend]
//! type = "local"
//! root = "/srv/content/acme/website"
//! ```

pub mod error;

use crate::error::{ErrorKind, Result};
use directories::ProjectDirs;
use exn::{OptionExt, ResultExt};
use figment::Figment;
use figment::providers::{Env, Format, Json, Serialized, Toml, Yaml};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const ENV_PREFIX: &str = "SITESCAN_";
pub const DEFAULT_CONCURRENCY: usize = 4;
pub const MAX_CONCURRENCY: usize = 64;
const STATE_DATABASE: &str = "progress.sqlite";

/// Where the content repository lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BackendConfig {
    /// A local directory holding the repository contents.
    Local { root: PathBuf },
    /// The remote admin API.
    Http {
        base_url: String,
        #[serde(default)]
        token: Option<String>,
    },
}

/// Fully merged configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    pub org: String,
    pub repo: String,
    pub backend: BackendConfig,
    /// Exclusion patterns: exact repository paths, or prefixes ending in `/*`.
    #[serde(default)]
    pub exclusions: Vec<String>,
    /// Maximum number of folders discovered concurrently.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Directory holding the local progress database.
    #[serde(default)]
    pub state_dir: Option<PathBuf>,
    /// Read the repository but never write to it.
    #[serde(default)]
    pub dry_run: bool,
}

fn default_concurrency() -> usize {
    DEFAULT_CONCURRENCY
}

#[derive(Serialize)]
struct Defaults {
    concurrency: usize,
    dry_run: bool,
    exclusions: Vec<String>,
}
impl Default for Defaults {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            dry_run: false,
            exclusions: Vec::new(),
        }
    }
}

fn project_dirs() -> Result<ProjectDirs> {
    ProjectDirs::from("dev", "sitescan", "sitescan").ok_or_raise(|| ErrorKind::NoDirectories)
}

/// The config file looked up when none is given explicitly.
pub fn default_config_file() -> Result<PathBuf> {
    Ok(project_dirs()?.config_dir().join("config.toml"))
}

fn file_provider(figment: Figment, path: &Path) -> Result<Figment> {
    let ext = path.extension().and_then(|e| e.to_str()).map(str::to_ascii_lowercase);
    Ok(match ext.as_deref() {
        Some("toml") => figment.merge(Toml::file_exact(path)),
        Some("yaml" | "yml") => figment.merge(Yaml::file_exact(path)),
        Some("json") => figment.merge(Json::file_exact(path)),
        _ => exn::bail!(ErrorKind::UnsupportedFormat(path.to_path_buf())),
    })
}

impl Config {
    /// Load configuration from defaults, a config file and the environment.
    ///
    /// An explicitly passed `file` must exist; the default config file is
    /// optional.
    pub fn load(file: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(Defaults::default()));
        match file {
            Some(path) if !path.is_file() => exn::bail!(ErrorKind::NotFound(path.to_path_buf())),
            Some(path) => figment = file_provider(figment, path)?,
            None => match default_config_file() {
                Ok(path) if path.is_file() => figment = file_provider(figment, &path)?,
                Ok(path) => tracing::debug!(path = %path.display(), "No default config file"),
                Err(_) => tracing::debug!("No home directory; skipping default config file"),
            },
        }
        Self::from_figment(figment.merge(Env::prefixed(ENV_PREFIX).split("__")))
    }

    /// Extract and validate a configuration from an already assembled figment.
    pub fn from_figment(figment: Figment) -> Result<Self> {
        let config: Self = figment.extract().or_raise(|| ErrorKind::Parse)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        for (field, value) in [("org", &self.org), ("repo", &self.repo)] {
            if value.trim().is_empty() || value.contains('/') {
                exn::bail!(ErrorKind::Invalid(format!("`{field}` must be a non-empty name without slashes")));
            }
        }
        if !(1..=MAX_CONCURRENCY).contains(&self.concurrency) {
            exn::bail!(ErrorKind::Invalid(format!("`concurrency` must be between 1 and {MAX_CONCURRENCY}")));
        }
        match &self.backend {
            BackendConfig::Local { root } if !root.is_absolute() => {
                exn::bail!(ErrorKind::Invalid(format!("local root `{}` must be absolute", root.display())))
            },
            BackendConfig::Http { base_url, .. }
                if !(base_url.starts_with("https://") || base_url.starts_with("http://")) =>
            {
                exn::bail!(ErrorKind::Invalid(format!("base url `{base_url}` must be http(s)")))
            },
            _ => {},
        }
        if let Some(pattern) = self.exclusions.iter().find(|p| !p.starts_with('/')) {
            exn::bail!(ErrorKind::Invalid(format!("exclusion `{pattern}` must start with `/`")));
        }
        Ok(())
    }

    /// Exclusion patterns as a flat list.
    pub fn exclusion_patterns(&self) -> &[String] {
        &self.exclusions
    }

    /// Location of the SQLite database mirroring discovery progress.
    pub fn state_database(&self) -> Result<PathBuf> {
        let dir = match &self.state_dir {
            Some(dir) => dir.clone(),
            None => project_dirs()?.data_dir().to_path_buf(),
        };
        Ok(dir.join(STATE_DATABASE))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;
    use rstest::rstest;

    fn base() -> Config {
        Config {
            org: "acme".into(),
            repo: "website".into(),
            backend: BackendConfig::Local { root: PathBuf::from("/srv/content") },
            exclusions: vec!["/drafts/*".into()],
            concurrency: DEFAULT_CONCURRENCY,
            state_dir: None,
            dry_run: false,
        }
    }

    #[test]
    fn test_load_toml_with_env_override() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "sitescan.toml",
                r#"
                    org = "acme"
                    repo = "website"
                    exclusions = ["/drafts/*"]

                    [backend]
                    type = "local"
                    root = "/srv/content"
                "#,
            )?;
            jail.set_env("SITESCAN_CONCURRENCY", "8");
            let config = Config::load(Some(Path::new("sitescan.toml"))).unwrap();
            assert_eq!(config.org, "acme");
            assert_eq!(config.concurrency, 8);
            assert_eq!(config.exclusion_patterns(), ["/drafts/*".to_string()]);
            assert!(!config.dry_run);
            Ok(())
        });
    }

    #[test]
    fn test_load_json_http_backend() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "sitescan.json",
                r#"{"org": "acme", "repo": "website",
                    "backend": {"type": "http", "base_url": "https://admin.example.com", "token": "t"}}"#,
            )?;
            let config = Config::load(Some(Path::new("sitescan.json"))).unwrap();
            assert_eq!(
                config.backend,
                BackendConfig::Http {
                    base_url: "https://admin.example.com".into(),
                    token: Some("t".into())
                }
            );
            assert_eq!(config.concurrency, DEFAULT_CONCURRENCY);
            Ok(())
        });
    }

    #[test]
    fn test_missing_explicit_file() {
        let err = Config::load(Some(Path::new("/definitely/not/here.toml"))).unwrap_err();
        assert!(matches!(&*err, ErrorKind::NotFound(_)));
    }

    #[test]
    fn test_unsupported_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.ini");
        std::fs::write(&path, "org=acme").unwrap();
        let err = Config::load(Some(&path)).unwrap_err();
        assert!(matches!(&*err, ErrorKind::UnsupportedFormat(_)));
    }

    #[rstest]
    #[case::empty_org(Config { org: "".into(), ..base() })]
    #[case::slash_repo(Config { repo: "a/b".into(), ..base() })]
    #[case::zero_concurrency(Config { concurrency: 0, ..base() })]
    #[case::huge_concurrency(Config { concurrency: 1000, ..base() })]
    #[case::relative_root(Config { backend: BackendConfig::Local { root: "content".into() }, ..base() })]
    #[case::bad_url(Config { backend: BackendConfig::Http { base_url: "ftp://x".into(), token: None }, ..base() })]
    #[case::bad_pattern(Config { exclusions: vec!["drafts/*".into()], ..base() })]
    fn test_validation_rejects(#[case] config: Config) {
        let err = config.validate().unwrap_err();
        assert!(matches!(&*err, ErrorKind::Invalid(_)));
    }

    #[test]
    fn test_state_database_in_state_dir() {
        let config = Config { state_dir: Some(PathBuf::from("/var/lib/sitescan")), ..base() };
        assert_eq!(config.state_database().unwrap(), Path::new("/var/lib/sitescan/progress.sqlite"));
    }
}

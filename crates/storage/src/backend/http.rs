//! Remote repository backend over an HTTP admin API.
//!
//! The remote content service exposes one repository as `/{org}/{repo}` under
//! three endpoint families:
//!
//! | Operation | Request                                   |
//! |-----------|-------------------------------------------|
//! | list      | `GET    {base}/list/{org}/{repo}/{path}`   |
//! | read      | `GET    {base}/source/{org}/{repo}/{path}` |
//! | exists    | `HEAD   {base}/source/{org}/{repo}/{path}` |
//! | write     | `PUT    {base}/source/{org}/{repo}/{path}` |
//! | delete    | `DELETE {base}/source/{org}/{repo}/{path}` |
//!
//! Listing responses are JSON arrays of `{name, path, ext?, lastModified?}`
//! where `path` is absolute (`/{org}/{repo}/...`) and `lastModified` is in
//! milliseconds since the Unix epoch.

use crate::backend::EntryStream;
use crate::error::{ErrorKind, Result};
use crate::models::Entry;
use crate::path::{to_slash, validate as validate_path, validate_folder};
use crate::RepositoryBackend;
use async_stream::stream;
use async_trait::async_trait;
use exn::ResultExt;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Generous default for concurrent API requests.
const DEFAULT_CONCURRENT_REQUESTS: usize = 16;

/// Connection options for [`HttpBackend`].
#[derive(Debug, Clone)]
pub struct HttpOptions {
    pub timeout: Duration,
    /// Retries after the first attempt, for retryable failures only.
    pub max_retries: u32,
    /// Initial backoff duration (doubles each retry).
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub max_concurrent_requests: usize,
}
impl Default for HttpOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            max_retries: 3,
            initial_backoff: Duration::from_millis(250),
            max_backoff: Duration::from_secs(8),
            max_concurrent_requests: DEFAULT_CONCURRENT_REQUESTS,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListItem {
    name: String,
    path: String,
    #[serde(default)]
    ext: Option<String>,
    #[serde(default)]
    last_modified: Option<i64>,
}

/// Repository backend talking to the remote admin API.
///
/// # Examples
///
/// ```no_run
/// use sitescan_storage::backend::{HttpBackend, HttpOptions};
///
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let backend = HttpBackend::new(
///     "remote",
///     "https://admin.example.com",
///     "acme",
///     "website",
///     Some("token".to_string()),
///     HttpOptions::default(),
/// )?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct HttpBackend {
    name: String,
    client: Client,
    base_url: String,
    /// `{org}/{repo}` without surrounding slashes.
    namespace: String,
    token: Option<String>,
    options: HttpOptions,
    /// Rate limiter for concurrent API calls.
    rate_limiter: Arc<Semaphore>,
}

impl HttpBackend {
    pub fn new(
        name: impl Into<String>,
        base_url: impl Into<String>,
        org: impl AsRef<str>,
        repo: impl AsRef<str>,
        token: Option<String>,
        options: HttpOptions,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(options.timeout)
            .build()
            .or_raise(|| ErrorKind::BackendError("could not build HTTP client".to_string()))?;
        let rate_limiter = Arc::new(Semaphore::new(options.max_concurrent_requests.max(1)));
        Ok(Self {
            name: name.into(),
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            namespace: format!("{}/{}", org.as_ref().trim_matches('/'), repo.as_ref().trim_matches('/')),
            token,
            options,
            rate_limiter,
        })
    }

    fn url(&self, endpoint: &str, relative: Option<&Path>) -> Result<String> {
        Ok(match relative {
            Some(path) => format!("{}/{endpoint}/{}/{}", self.base_url, self.namespace, to_slash(path)?),
            None => format!("{}/{endpoint}/{}", self.base_url, self.namespace),
        })
    }

    /// Strip the `/{org}/{repo}` prefix from a path handed out by the API.
    fn relative_path(&self, absolute: &str) -> Result<PathBuf> {
        let trimmed = absolute.trim_start_matches('/');
        let relative = trimmed
            .strip_prefix(self.namespace.as_str())
            .map(|rest| rest.trim_start_matches('/'))
            .unwrap_or(trimmed);
        validate_path(relative)
    }

    async fn acquire_permit(&self) -> Result<OwnedSemaphorePermit> {
        self.rate_limiter
            .clone()
            .acquire_owned()
            .await
            .or_raise(|| ErrorKind::BackendError("request limiter closed".to_string()))
    }

    fn classify(status: StatusCode, path: &Path) -> ErrorKind {
        match status {
            StatusCode::NOT_FOUND => ErrorKind::NotFound(path.to_path_buf()),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ErrorKind::PermissionDenied(path.to_path_buf()),
            StatusCode::TOO_MANY_REQUESTS => ErrorKind::Network(format!("HTTP {status}")),
            s if s.is_server_error() => ErrorKind::Network(format!("HTTP {status}")),
            s => ErrorKind::BackendError(format!("unexpected HTTP {s}")),
        }
    }

    /// Send a request with retry and exponential backoff.
    ///
    /// Only transport failures, throttling and server errors are retried;
    /// any other status is returned to the caller as an error immediately.
    async fn send(&self, path: &Path, build: impl Fn() -> RequestBuilder) -> Result<Response> {
        let _permit = self.acquire_permit().await?;
        let mut backoff = self.options.initial_backoff;
        let mut attempt = 0;
        loop {
            let mut request = build();
            if let Some(token) = &self.token {
                request = request.bearer_auth(token);
            }
            let kind = match request.send().await {
                Ok(response) if response.status().is_success() => return Ok(response),
                Ok(response) => Self::classify(response.status(), path),
                Err(e) => ErrorKind::Network(e.to_string()),
            };
            if !kind.is_retryable() || attempt >= self.options.max_retries {
                exn::bail!(kind);
            }
            attempt += 1;
            tracing::debug!(backend = %self.name, path = %path.display(), attempt, error = %kind, "Retrying request");
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(self.options.max_backoff);
        }
    }

    async fn list_items(&self, folder: Option<&Path>) -> Result<Vec<ListItem>> {
        let url = self.url("list", folder)?;
        let display = folder.map(Path::to_path_buf).unwrap_or_default();
        let response = match self.send(&display, || self.client.request(Method::GET, &url)).await {
            Ok(r) => r,
            // Listing a folder that doesn't exist is an empty list, not an error.
            Err(e) if e.is_not_found() => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        response
            .json::<Vec<ListItem>>()
            .await
            .or_raise(|| ErrorKind::BackendError(format!("malformed listing for `{}`", display.display())))
    }

    fn to_entry(&self, item: ListItem) -> Result<Entry> {
        let path = self.relative_path(&item.path)?;
        let last_modified = item
            .last_modified
            .and_then(|ms| OffsetDateTime::from_unix_timestamp_nanos(i128::from(ms) * 1_000_000).ok());
        Ok(match item.ext {
            Some(ext) if !ext.is_empty() => {
                let mut entry = Entry::file(path, last_modified);
                entry.name = item.name;
                entry.ext = Some(ext.to_ascii_lowercase());
                entry
            },
            _ => Entry::folder(path),
        })
    }
}

#[async_trait]
impl RepositoryBackend for HttpBackend {
    fn name(&self) -> &str {
        &self.name
    }

    // A PUT carries the whole body; the server never exposes half of it.
    fn atomic_writes(&self) -> bool {
        true
    }

    fn entries<'a>(&'a self, folder: Option<&'a Path>) -> EntryStream<'a> {
        let folder = match validate_folder(folder) {
            Ok(folder) => folder,
            Err(e) => return Box::pin(futures::stream::once(async { Err(e) })),
        };
        Box::pin(stream! {
            let items = match self.list_items(folder.as_deref()).await {
                Ok(items) => items,
                Err(e) => { yield Err(e); return; },
            };
            for item in items {
                yield self.to_entry(item);
            }
        })
    }

    async fn exists(&self, path: &Path) -> Result<bool> {
        let path = validate_path(path)?;
        let url = self.url("source", Some(&path))?;
        match self.send(&path, || self.client.request(Method::HEAD, &url)).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn read(&self, path: &Path) -> Result<Vec<u8>> {
        let path = validate_path(path)?;
        let url = self.url("source", Some(&path))?;
        let response = self.send(&path, || self.client.request(Method::GET, &url)).await?;
        let bytes = response.bytes().await.or_raise(|| ErrorKind::Network(format!("reading body of {url}")))?;
        Ok(bytes.to_vec())
    }

    async fn write(&self, path: &Path, data: &[u8]) -> Result<()> {
        let path = validate_path(path)?;
        let url = self.url("source", Some(&path))?;
        self.send(&path, || self.client.request(Method::PUT, &url).body(data.to_vec())).await?;
        Ok(())
    }

    async fn delete(&self, path: &Path) -> Result<()> {
        let path = validate_path(path)?;
        let url = self.url("source", Some(&path))?;
        self.send(&path, || self.client.request(Method::DELETE, &url)).await?;
        Ok(())
    }

    async fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        // The API has no atomic move; copy then delete.
        let data = self.read(from).await?;
        self.write(to, &data).await?;
        if let Err(e) = self.delete(from).await {
            tracing::warn!(backend = %self.name, from = %from.display(), error = %&*e, "Rename left source behind");
        }
        Ok(())
    }

    async fn ensure_folder(&self, path: &Path) -> Result<()> {
        // Folders are created implicitly by writing into them.
        validate_path(path)?;
        Ok(())
    }
}

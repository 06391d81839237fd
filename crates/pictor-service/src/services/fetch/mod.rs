//! Resolving request keys to raw bytes.
//!
//! The request pipeline talks to its fetch stage through the [`FetchStage`] trait. The default
//! implementation, [`FetchService`], picks a fetcher based on the URI scheme of the key:
//!
//! - `file://` URIs and absolute paths are read from the local file system,
//! - `http://` and `https://` URIs are downloaded.
//!
//! Every other key is unsupported, which the pipeline reports before taking the key's lock.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use bytes::Bytes;
use futures::future::BoxFuture;
use thiserror::Error;
use url::Url;

use crate::caching::RequestKey;
use crate::config::Config;
use crate::types::Provenance;
use crate::utils::http::{DownloadTimeouts, create_client};

mod filesystem;
mod http;

pub use self::filesystem::FilesystemFetcher;
pub use self::http::HttpFetcher;

/// Errors produced by a [`FetchStage`].
///
/// These are collapsed into [`FailedCause::FetchFailed`](crate::types::FailedCause) by the
/// pipeline; the details only end up in logs.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    #[error("not found")]
    NotFound,
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("download timed out")]
    Timeout,
    #[error("download failed: {0}")]
    DownloadError(String),
    #[error("unsupported uri: {0}")]
    Unsupported(String),
    #[error("i/o error: {0}")]
    Io(String),
}

impl From<io::Error> for FetchError {
    fn from(error: io::Error) -> Self {
        match error.kind() {
            io::ErrorKind::NotFound => Self::NotFound,
            io::ErrorKind::PermissionDenied => Self::PermissionDenied(error.to_string()),
            _ => Self::Io(error.to_string()),
        }
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            return Self::Timeout;
        }

        let mut source: &dyn std::error::Error = &error;
        while let Some(inner) = source.source() {
            source = inner;
        }
        Self::DownloadError(source.to_string())
    }
}

/// Raw bytes produced by a [`FetchStage`], together with where they came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fetched {
    pub bytes: Bytes,
    pub provenance: Provenance,
}

/// The stage resolving a [`RequestKey`] to raw bytes.
///
/// Fetches are not preempted: once started, a fetch runs to completion even when its request
/// is canceled in the meantime.
pub trait FetchStage: Send + Sync + 'static {
    /// Whether this stage can fetch `key` at all.
    ///
    /// Keys that are not supported fail with
    /// [`FailedCause::Unsupported`](crate::types::FailedCause) without ever being locked.
    fn supports(&self, _key: &RequestKey) -> bool {
        true
    }

    /// Fetches the raw bytes for `key`.
    fn fetch<'a>(&'a self, key: &'a RequestKey) -> BoxFuture<'a, Result<Fetched, FetchError>>;
}

/// Where the bytes of a key live.
#[derive(Debug, Clone, PartialEq, Eq)]
enum FetchSource {
    Filesystem(PathBuf),
    Http(Url),
}

impl FetchSource {
    fn resolve(key: &RequestKey) -> Option<Self> {
        let uri = key.uri();
        match key.scheme() {
            Some("file") => {
                let path = Url::parse(uri).ok()?.to_file_path().ok()?;
                Some(Self::Filesystem(path))
            }
            Some("http" | "https") => Url::parse(uri).ok().map(Self::Http),
            None if Path::new(uri).is_absolute() => Some(Self::Filesystem(uri.into())),
            _ => None,
        }
    }
}

/// The default [`FetchStage`], dispatching on the URI scheme.
#[derive(Debug, Clone)]
pub struct FetchService {
    fs: FilesystemFetcher,
    http: HttpFetcher,
}

impl FetchService {
    pub fn new(config: &Config) -> Result<Arc<Self>> {
        let timeouts = DownloadTimeouts::from_config(config);
        let client = create_client(&timeouts, &config.user_agent)
            .context("failed to create http client")?;

        Ok(Arc::new(Self {
            fs: FilesystemFetcher::new(),
            http: HttpFetcher::new(client),
        }))
    }

    async fn fetch_source(&self, key: &RequestKey) -> Result<Fetched, FetchError> {
        let source = FetchSource::resolve(key)
            .ok_or_else(|| FetchError::Unsupported(key.uri().to_owned()))?;

        let fetched = match source {
            FetchSource::Filesystem(path) => self.fs.fetch_file(&path).await,
            FetchSource::Http(url) => self.http.fetch_url(url).await,
        };

        match &fetched {
            Ok(fetched) => {
                metric!(
                    time_raw("fetch.bytes") = fetched.bytes.len() as u64,
                    "provenance" => fetched.provenance.as_str(),
                );
            }
            Err(error) => {
                tracing::debug!(
                    error = error as &dyn std::error::Error,
                    key = %key,
                    "Failed to fetch image"
                );
            }
        }

        fetched
    }
}

impl FetchStage for FetchService {
    fn supports(&self, key: &RequestKey) -> bool {
        FetchSource::resolve(key).is_some()
    }

    fn fetch<'a>(&'a self, key: &'a RequestKey) -> BoxFuture<'a, Result<Fetched, FetchError>> {
        Box::pin(self.fetch_source(key))
    }
}

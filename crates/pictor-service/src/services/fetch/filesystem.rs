//! Reading images from the local file system.

use std::path::Path;

use crate::types::Provenance;

use super::{FetchError, Fetched};

/// Fetcher for `file://` URIs and absolute paths.
#[derive(Debug, Clone, Default)]
pub struct FilesystemFetcher {}

impl FilesystemFetcher {
    pub fn new() -> Self {
        Self {}
    }

    /// Reads the file at `path`.
    pub async fn fetch_file(&self, path: &Path) -> Result<Fetched, FetchError> {
        tracing::debug!("Fetching image from {:?}", path);

        let bytes = tokio::fs::read(path).await?;
        Ok(Fetched {
            bytes: bytes.into(),
            provenance: Provenance::Local,
        })
    }
}

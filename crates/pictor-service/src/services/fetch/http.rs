//! Downloading images over HTTP.

use reqwest::{Client, StatusCode};
use url::Url;

use crate::types::Provenance;

use super::{FetchError, Fetched};

/// Fetcher for `http://` and `https://` URIs.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Downloads the image at `url`.
    pub async fn fetch_url(&self, url: Url) -> Result<Fetched, FetchError> {
        tracing::debug!("Fetching image from `{}`", url);

        let response = self.client.get(url).send().await?;
        let status = response.status();

        if !status.is_success() {
            tracing::debug!(%status, "Unexpected status code");
            return Err(match status {
                StatusCode::NOT_FOUND => FetchError::NotFound,
                StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                    FetchError::PermissionDenied(status.to_string())
                }
                _ => FetchError::DownloadError(status.to_string()),
            });
        }

        let bytes = response.bytes().await?;
        Ok(Fetched {
            bytes,
            provenance: Provenance::Network,
        })
    }
}

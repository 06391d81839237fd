use std::time::Duration;

use reqwest::header;

use crate::config::Config;

/// Timeouts applied by the HTTP fetcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownloadTimeouts {
    /// The timeout for establishing a connection.
    pub connect: Duration,
    /// Global timeout for one download.
    pub max_download: Duration,
}

impl DownloadTimeouts {
    pub fn from_config(config: &Config) -> Self {
        Self {
            connect: config.connect_timeout,
            max_download: config.max_download_timeout,
        }
    }
}

impl Default for DownloadTimeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(1),
            max_download: Duration::from_secs(30),
        }
    }
}

/// Creates a [`reqwest::Client`] with the given timeouts and `User-Agent`.
pub fn create_client(
    timeouts: &DownloadTimeouts,
    user_agent: &str,
) -> Result<reqwest::Client, reqwest::Error> {
    let mut headers = header::HeaderMap::new();
    if let Ok(value) = header::HeaderValue::from_str(user_agent) {
        headers.insert(header::USER_AGENT, value);
    } else {
        tracing::warn!(user_agent, "Ignoring invalid user agent");
    }

    reqwest::ClientBuilder::new()
        .gzip(true)
        .connect_timeout(timeouts.connect)
        .timeout(timeouts.max_download)
        .pool_idle_timeout(Duration::from_secs(30))
        .default_headers(headers)
        .build()
}

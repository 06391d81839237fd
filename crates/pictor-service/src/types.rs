//! Common types shared by the request pipeline and its consumers.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::caching::Resource;

/// Unique identifier of a submitted request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestId(uuid::Uuid);

impl RequestId {
    /// Creates a new random request id.
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Per-request caching behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestOptions {
    /// Look the key up in the memory cache before loading.
    ///
    /// Cache-reading requests for the same key are serialized by the key's lock.
    pub cache_read: bool,
    /// Populate the memory cache with a freshly loaded resource.
    pub cache_write: bool,
    /// Only serve the request from the memory cache.
    ///
    /// A miss fails with [`FailedCause::CacheRetrievalMissing`] instead of fetching.
    pub cache_only: bool,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            cache_read: true,
            cache_write: true,
            cache_only: false,
        }
    }
}

impl RequestOptions {
    /// Options that bypass the memory cache entirely.
    pub fn uncached() -> Self {
        Self {
            cache_read: false,
            cache_write: false,
            cache_only: false,
        }
    }
}

/// Where a delivered resource came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provenance {
    /// Served from the in-memory result cache.
    MemoryCache,
    /// Served by the fetch stage from a persistent cache.
    DiskCache,
    /// Read from the local file system.
    Local,
    /// Downloaded from the network.
    Network,
}

impl Provenance {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MemoryCache => "memory_cache",
            Self::DiskCache => "disk_cache",
            Self::Local => "local",
            Self::Network => "network",
        }
    }
}

impl fmt::Display for Provenance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The lifecycle states of a request, in the order they are entered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestState {
    /// Submitted and waiting for a worker slot.
    Pending,
    /// Waiting for the key's lock.
    AcquiringLock,
    /// Looking the key up in the memory cache.
    ProbingCache,
    /// Waiting for the fetch stage.
    Fetching,
    /// Waiting for the decode stage.
    Decoding,
    /// Storing a freshly loaded resource in the memory cache.
    Populating,
    /// Giving up the key's lock.
    ReleasingLock,
    /// Handed off to the consumer context.
    Dispatching,
    /// The consumer received the resource.
    Completed,
    /// The consumer was told the request failed.
    Failed,
    /// The consumer was told the request was canceled.
    Canceled,
}

impl RequestState {
    /// Whether no further transitions can happen.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Canceled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::AcquiringLock => "acquiring_lock",
            Self::ProbingCache => "probing_cache",
            Self::Fetching => "fetching",
            Self::Decoding => "decoding",
            Self::Populating => "populating",
            Self::ReleasingLock => "releasing_lock",
            Self::Dispatching => "dispatching",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        }
    }
}

impl fmt::Display for RequestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a request failed.
///
/// Failures are terminal and never retried by the pipeline itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailedCause {
    /// The request key has an empty URI.
    #[error("empty or invalid key")]
    InvalidKey,
    /// No fetcher supports the URI.
    #[error("unsupported uri")]
    Unsupported,
    /// The fetch stage could not produce the bytes.
    #[error("fetch failed")]
    FetchFailed,
    /// The bytes could not be decoded.
    #[error("decode failed")]
    DecodeFailed,
    /// A cache-only request missed the memory cache.
    #[error("not found in cache")]
    CacheRetrievalMissing,
}

impl FailedCause {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidKey => "invalid_key",
            Self::Unsupported => "unsupported",
            Self::FetchFailed => "fetch_failed",
            Self::DecodeFailed => "decode_failed",
            Self::CacheRetrievalMissing => "cache_retrieval_missing",
        }
    }
}

/// Why a request was canceled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelCause {
    /// The consumer detached from the request.
    #[error("consumer detached")]
    ConsumerDetached,
    /// The caller canceled the request through its handle.
    #[error("canceled")]
    ExplicitCancel,
    /// The consumer was rebound to a newer request.
    #[error("superseded by another request")]
    Superseded,
}

impl CancelCause {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ConsumerDetached => "consumer_detached",
            Self::ExplicitCancel => "explicit_cancel",
            Self::Superseded => "superseded",
        }
    }
}

/// The terminal result of a request, as delivered to its consumer.
#[derive(Debug, Clone)]
pub enum Outcome {
    Completed(Arc<Resource>, Provenance),
    Failed(FailedCause),
    Canceled(CancelCause),
}

impl Outcome {
    /// The terminal state matching this outcome.
    pub fn state(&self) -> RequestState {
        match self {
            Self::Completed(..) => RequestState::Completed,
            Self::Failed(_) => RequestState::Failed,
            Self::Canceled(_) => RequestState::Canceled,
        }
    }

    /// A tag value for metrics and logs.
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Completed(..) => "completed",
            Self::Failed(cause) => cause.as_str(),
            Self::Canceled(cause) => cause.as_str(),
        }
    }
}

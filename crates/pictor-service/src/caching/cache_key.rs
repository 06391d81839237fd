use std::fmt::{self, Write};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// An upper bound on the decoded image dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MaxSize {
    pub width: u32,
    pub height: u32,
}

/// Transform options applied by the decode stage.
///
/// These are part of the [`RequestKey`], as differently transformed images of the same source
/// are different cache entries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct DecodeOptions {
    /// Downscale the decoded image so that it fits into this size, keeping the aspect ratio.
    pub max_size: Option<MaxSize>,
}

/// The key of a request, used both for the memory cache and for the per-key locks.
///
/// The key is derived from the source URI and the [`DecodeOptions`]. Two keys compare equal
/// exactly when their canonical representations do.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestKey {
    /// The canonical, human-readable representation, which is what we compare and hash.
    id: Arc<str>,
    uri: Arc<str>,
    options: DecodeOptions,
}

impl fmt::Display for RequestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id)
    }
}

impl RequestKey {
    /// Creates a key for the untransformed image at `uri`.
    pub fn new(uri: impl Into<String>) -> Self {
        Self::with_options(uri, DecodeOptions::default())
    }

    /// Creates a key for the image at `uri`, transformed with `options`.
    pub fn with_options(uri: impl Into<String>, options: DecodeOptions) -> Self {
        let uri: String = uri.into();
        let uri = uri.trim();

        let mut id = String::from(uri);
        if !uri.is_empty() {
            if let Some(MaxSize { width, height }) = options.max_size {
                // writing into a `String` is infallible
                let _ = write!(id, "#max_size({width}x{height})");
            }
        }

        Self {
            id: id.into(),
            uri: uri.into(),
            options,
        }
    }

    /// The source URI.
    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// The decode transform options.
    pub fn options(&self) -> &DecodeOptions {
        &self.options
    }

    /// The canonical string form of the key.
    pub fn as_str(&self) -> &str {
        &self.id
    }

    /// Whether the key has no URI, in which case it can be neither loaded nor cached.
    pub fn is_empty(&self) -> bool {
        self.uri.is_empty()
    }

    /// The URI scheme, if the URI has one.
    ///
    /// Absolute paths are treated as having no scheme.
    pub fn scheme(&self) -> Option<&str> {
        let (scheme, _) = self.uri.split_once("://")?;
        let valid = !scheme.is_empty()
            && scheme
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'));
        valid.then_some(scheme)
    }
}

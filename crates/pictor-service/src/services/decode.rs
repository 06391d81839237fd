//! Turning fetched bytes into decoded images.

use std::io::Cursor;

use bytes::Bytes;
use futures::future::BoxFuture;
use image::{ImageFormat, ImageReader};
use thiserror::Error;

use crate::caching::{DecodeOptions, DecodedImage, MaxSize, RequestKey};

/// Errors produced by a [`DecodeStage`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("unknown image format")]
    UnknownFormat,
    #[error("malformed image: {0}")]
    Malformed(String),
    #[error("decoder crashed")]
    Crashed,
}

impl From<image::ImageError> for DecodeError {
    fn from(error: image::ImageError) -> Self {
        match error {
            image::ImageError::Unsupported(_) => Self::UnknownFormat,
            other => Self::Malformed(other.to_string()),
        }
    }
}

/// The stage turning raw bytes into a [`DecodedImage`].
pub trait DecodeStage: Send + Sync + 'static {
    /// Decodes `bytes` according to the [`DecodeOptions`] of `key`.
    fn decode<'a>(
        &'a self,
        key: &'a RequestKey,
        bytes: Bytes,
    ) -> BoxFuture<'a, Result<DecodedImage, DecodeError>>;
}

/// The default [`DecodeStage`], backed by the `image` crate.
///
/// Decoding runs on the blocking thread pool of the current runtime. Images are converted to
/// RGBA8. GIFs are reported as animated, which keeps them out of the memory cache.
#[derive(Debug, Clone, Copy, Default)]
pub struct ImageDecoder;

impl ImageDecoder {
    pub fn new() -> Self {
        Self
    }
}

impl DecodeStage for ImageDecoder {
    fn decode<'a>(
        &'a self,
        key: &'a RequestKey,
        bytes: Bytes,
    ) -> BoxFuture<'a, Result<DecodedImage, DecodeError>> {
        let options = *key.options();
        Box::pin(async move {
            tokio::task::spawn_blocking(move || decode_image(&bytes, options))
                .await
                .map_err(|_| DecodeError::Crashed)?
        })
    }
}

fn decode_image(bytes: &[u8], options: DecodeOptions) -> Result<DecodedImage, DecodeError> {
    let reader = ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .map_err(|e| DecodeError::Malformed(e.to_string()))?;
    let format = reader.format().ok_or(DecodeError::UnknownFormat)?;

    let mut image = reader.decode()?;
    if let Some(MaxSize { width, height }) = options.max_size {
        let fits = image.width() <= width && image.height() <= height;
        if !fits && width > 0 && height > 0 {
            image = image.thumbnail(width, height);
        }
    }

    let image = image.into_rgba8();
    let (width, height) = image.dimensions();

    Ok(DecodedImage {
        width,
        height,
        mime_type: format.to_mime_type().to_owned(),
        animated: format == ImageFormat::Gif,
        pixels: Bytes::from(image.into_raw()),
    })
}

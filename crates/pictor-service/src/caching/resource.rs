use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;

use super::RequestKey;

/// The output of a decode stage.
#[derive(Clone, PartialEq, Eq)]
pub struct DecodedImage {
    pub width: u32,
    pub height: u32,
    pub mime_type: String,
    /// Animated images are delivered, but never kept in the memory cache.
    pub animated: bool,
    /// The decoded pixels.
    pub pixels: Bytes,
}

impl fmt::Debug for DecodedImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecodedImage")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("mime_type", &self.mime_type)
            .field("animated", &self.animated)
            .field("pixels", &self.pixels.len())
            .finish()
    }
}

/// Immutable facts about a [`Resource`] that survive its reclamation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageInfo {
    pub width: u32,
    pub height: u32,
    pub mime_type: String,
    pub animated: bool,
    pub byte_size: usize,
}

#[derive(Debug)]
struct ResourceState {
    /// `None` once the resource was reclaimed.
    pixels: Option<Bytes>,
    in_use: usize,
    cached: bool,
}

/// A decoded image shared between the memory cache, in-flight requests and consumers.
///
/// A resource is *reclaimed* by dropping its pixel buffer. This only ever happens while its
/// in-use count is zero:
///
/// - when the last [`InUse`] pin of a resource that is not cached is dropped,
/// - when an unused resource is removed or evicted from the cache,
/// - or when [`Resource::reclaim`] is called on an unused resource.
///
/// The count and the reclamation decision share one critical section, so no observer can ever
/// see a pinned resource being reclaimed.
pub struct Resource {
    key: RequestKey,
    info: ImageInfo,
    state: Mutex<ResourceState>,
}

impl fmt::Debug for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state();
        f.debug_struct("Resource")
            .field("key", &self.key.as_str())
            .field("info", &self.info)
            .field("in_use", &state.in_use)
            .field("cached", &state.cached)
            .field("reclaimed", &state.pixels.is_none())
            .finish()
    }
}

impl Resource {
    pub fn new(key: RequestKey, image: DecodedImage) -> Arc<Self> {
        let DecodedImage {
            width,
            height,
            mime_type,
            animated,
            pixels,
        } = image;
        let info = ImageInfo {
            width,
            height,
            mime_type,
            animated,
            byte_size: pixels.len(),
        };

        Arc::new(Self {
            key,
            info,
            state: Mutex::new(ResourceState {
                pixels: Some(pixels),
                in_use: 0,
                cached: false,
            }),
        })
    }

    /// Creates a resource that is already pinned once by the returned [`InUse`].
    pub fn new_pinned(key: RequestKey, image: DecodedImage) -> InUse {
        let resource = Self::new(key, image);
        resource.state().in_use = 1;
        InUse { resource }
    }

    fn state(&self) -> MutexGuard<'_, ResourceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn key(&self) -> &RequestKey {
        &self.key
    }

    pub fn info(&self) -> &ImageInfo {
        &self.info
    }

    /// The decoded pixels, or `None` if the resource was reclaimed.
    ///
    /// Hold an [`InUse`] pin for as long as the pixels are being presented.
    pub fn pixels(&self) -> Option<Bytes> {
        self.state().pixels.clone()
    }

    pub fn is_reclaimed(&self) -> bool {
        self.state().pixels.is_none()
    }

    /// The number of outstanding [`InUse`] pins.
    pub fn in_use(&self) -> usize {
        self.state().in_use
    }

    /// Whether the memory cache currently holds this resource.
    pub fn is_cached(&self) -> bool {
        self.state().cached
    }

    /// Whether this resource may be stored in the memory cache at all.
    pub fn is_cacheable(&self) -> bool {
        !self.info.animated
    }

    /// Marks the resource as in use, protecting it from reclamation until the returned pin is
    /// dropped.
    ///
    /// Returns `None` if the resource was already reclaimed.
    pub fn pin(self: &Arc<Self>) -> Option<InUse> {
        let mut state = self.state();
        state.pixels.as_ref()?;
        state.in_use += 1;
        drop(state);

        Some(InUse {
            resource: Arc::clone(self),
        })
    }

    /// Reclaims the resource if nothing is using it.
    ///
    /// This ignores whether the resource is cached; a cached resource that was reclaimed this
    /// way is dropped from the cache the next time it is looked up. Returns `true` if this call
    /// reclaimed the resource.
    pub fn reclaim(&self) -> bool {
        let mut state = self.state();
        if state.in_use > 0 || state.pixels.is_none() {
            return false;
        }
        self.reclaim_locked(&mut state, "explicit");
        true
    }

    pub(crate) fn set_cached(&self, cached: bool) {
        let mut state = self.state();
        state.cached = cached;
        if !cached && state.in_use == 0 && state.pixels.is_some() {
            self.reclaim_locked(&mut state, "uncached");
        }
    }

    fn unpin(&self) {
        let mut state = self.state();
        state.in_use = state.in_use.saturating_sub(1);
        if state.in_use == 0 && !state.cached && state.pixels.is_some() {
            self.reclaim_locked(&mut state, "unused");
        }
    }

    fn reclaim_locked(&self, state: &mut ResourceState, reason: &'static str) {
        state.pixels = None;
        tracing::trace!(key = %self.key, reason, "Reclaimed resource");
        metric!(counter("resources.reclaimed") += 1, "reason" => reason);
    }
}

/// An RAII pin keeping a [`Resource`] from being reclaimed.
///
/// Dropping the pin decrements the resource's in-use count.
pub struct InUse {
    resource: Arc<Resource>,
}

impl InUse {
    pub fn resource(&self) -> &Arc<Resource> {
        &self.resource
    }
}

impl fmt::Debug for InUse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("InUse").field(&self.resource.key.as_str()).finish()
    }
}

impl Drop for InUse {
    fn drop(&mut self) {
        self.resource.unpin();
    }
}

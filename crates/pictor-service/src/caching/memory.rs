use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use moka::notification::RemovalCause;
use tokio::sync::broadcast;

use super::{RequestKey, Resource};
use crate::config::MemoryCacheConfig;

/// Capacity of the [`CacheEvent`] channel. Slow subscribers lose the oldest events.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// An entry of the [`ResultCache`].
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub resource: Arc<Resource>,
    /// When the entry was inserted.
    pub inserted_at: Instant,
}

/// Something that happened to an entry of the [`ResultCache`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheEvent {
    /// The entry was evicted to stay within capacity.
    Evicted(RequestKey),
    /// The entry was removed explicitly, for example because it was found reclaimed.
    Removed(RequestKey),
    /// The entry was overwritten by another resource for the same key.
    Replaced(RequestKey),
}

impl CacheEvent {
    pub fn key(&self) -> &RequestKey {
        match self {
            Self::Evicted(key) | Self::Removed(key) | Self::Replaced(key) => key,
        }
    }
}

/// The in-memory result cache, mapping [`RequestKey`]s to decoded [`Resource`]s.
///
/// The cache is bounded by the total pixel size of its resources. Storing a resource marks it
/// as cached; a resource that leaves the cache for any reason is unmarked, which reclaims it
/// unless a pending delivery or a consumer is still using it.
///
/// The cache does no locking of its own beyond what is needed to keep the map consistent.
/// Callers that need read-then-write consistency for a key hold that key's
/// [`KeyedLocks`](super::KeyedLocks) lock.
#[derive(Clone)]
pub struct ResultCache {
    inner: moka::sync::Cache<RequestKey, CacheEntry>,
    events: broadcast::Sender<CacheEvent>,
}

impl fmt::Debug for ResultCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResultCache")
            .field("entries", &self.inner.entry_count())
            .field("weighted_size", &self.inner.weighted_size())
            .finish()
    }
}

impl ResultCache {
    pub fn new(config: &MemoryCacheConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        let listener_events = events.clone();
        let inner = moka::sync::Cache::builder()
            .name("resources")
            .max_capacity(config.max_capacity)
            // NOTE: we count the bookkeeping structures to the weight as well
            .weigher(|_key: &RequestKey, entry: &CacheEntry| {
                let size = entry.resource.info().byte_size + std::mem::size_of::<CacheEntry>();
                u32::try_from(size).unwrap_or(u32::MAX)
            })
            .eviction_listener(
                move |key: Arc<RequestKey>, entry: CacheEntry, cause: RemovalCause| {
                    entry.resource.set_cached(false);

                    let key = RequestKey::clone(&key);
                    let event = match cause {
                        RemovalCause::Explicit => CacheEvent::Removed(key),
                        RemovalCause::Replaced => CacheEvent::Replaced(key),
                        RemovalCause::Expired | RemovalCause::Size => {
                            metric!(counter("caches.memory.evicted") += 1);
                            CacheEvent::Evicted(key)
                        }
                    };
                    tracing::trace!(?event, "Resource left the memory cache");
                    // nobody listening is fine
                    let _ = listener_events.send(event);
                },
            )
            .build();

        Self { inner, events }
    }

    /// Looks up the resource for `key`.
    pub fn get(&self, key: &RequestKey) -> Option<Arc<Resource>> {
        self.inner.get(key).map(|entry| entry.resource)
    }

    /// Stores `resource` under `key`, silently replacing an existing entry.
    ///
    /// Storing the resource that is already cached under `key` is a no-op.
    pub fn put(&self, key: RequestKey, resource: Arc<Resource>) {
        if let Some(existing) = self.inner.get(&key) {
            if Arc::ptr_eq(&existing.resource, &resource) {
                return;
            }
        }

        resource.set_cached(true);
        let entry = CacheEntry {
            resource,
            inserted_at: Instant::now(),
        };
        self.inner.insert(key, entry);
    }

    /// Looks up the full entry for `key`.
    pub fn entry(&self, key: &RequestKey) -> Option<CacheEntry> {
        self.inner.get(key)
    }

    /// Removes the entry for `key`, returning its resource.
    pub fn remove(&self, key: &RequestKey) -> Option<Arc<Resource>> {
        self.inner.remove(key).map(|entry| entry.resource)
    }

    /// Whether an entry exists for `key`.
    pub fn contains(&self, key: &RequestKey) -> bool {
        self.inner.contains_key(key)
    }

    /// Removes all entries.
    pub fn clear(&self) {
        self.inner.invalidate_all();
        self.inner.run_pending_tasks();
    }

    /// The number of entries, after applying pending evictions.
    pub fn len(&self) -> u64 {
        self.inner.run_pending_tasks();
        self.inner.entry_count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Subscribes to evictions, removals and replacements.
    pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.events.subscribe()
    }
}

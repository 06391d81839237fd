//! # Pictor caching infrastructure
//!
//! Decoding images is expensive, and the same image is typically requested many times by a
//! presentation layer that scrolls back and forth. Pictor keeps decoded images in memory, and
//! this module contains the pieces that make that safe under concurrency.
//!
//! ## [`RequestKey`]
//!
//! The key identifies a requested image: the source URI plus the [`DecodeOptions`] it is
//! transformed with. Keys are used both for the [`ResultCache`] and for the [`KeyedLocks`].
//! A key with an empty URI is invalid and is never loaded or cached.
//!
//! ## [`ResultCache`]
//!
//! A bounded in-memory map from key to a shared [`Resource`]. It is weighted by the size of the
//! decoded pixels. Entries leave the cache when they are evicted for capacity, replaced, or
//! removed; subscribers get told about this via [`CacheEvent`]s.
//!
//! ## [`KeyedLocks`]
//!
//! Looking a key up in the cache and populating it after a miss is a check-then-act sequence.
//! Without serialization two requests could both observe a miss, both load the image, and
//! both populate the cache. Requests that read the cache therefore hold the key's lock from
//! before the lookup until after population, which means that for any key, at most one load
//! is running at a time and the first writer wins.
//!
//! The lock is never held while handing results over to the consumer context.
//!
//! ## The in-use protocol
//!
//! A [`Resource`] can be *reclaimed*, which frees its pixels. Whoever is about to deliver or
//! present a resource holds an [`InUse`] pin on it. A resource is only reclaimed when nothing
//! pins it and it is not cached. A cached resource can also be reclaimed explicitly while it
//! is unused, in which case the next lookup finds it reclaimed, drops it from the cache, and
//! loads it afresh.
//!
//! ### Metrics
//!
//! - `caches.access`: Cache lookups.
//! - `caches.memory.hit`: Lookups served by the memory cache.
//! - `caches.memory.miss`: Lookups that had to load the image.
//! - `caches.memory.reclaimed`: Lookups that found a reclaimed resource and healed the cache.
//! - `caches.memory.populate`: Freshly loaded resources stored in the cache.
//! - `caches.memory.evicted`: Resources evicted for capacity.
//! - `resources.reclaimed`: Reclaimed resources, tagged by `reason`.
//! - `locks.wait`: Time spent waiting for a key's lock.

mod cache_key;
mod keyed_lock;
mod memory;
mod resource;

pub use cache_key::*;
pub use keyed_lock::*;
pub use memory::*;
pub use resource::*;

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use super::RequestKey;
use crate::utils::defer::defer;

type LockMap = HashMap<RequestKey, Arc<AsyncMutex<()>>>;

/// A registry handing out one mutual-exclusion lock per [`RequestKey`].
///
/// Locks are created lazily on first use and shared by all concurrent requests for the same
/// key. A registry entry lives for as long as any request holds or waits for its lock, and is
/// dropped together with the last [`KeyLockGuard`].
///
/// Waiters are woken in FIFO order, so a steady stream of requests for one key cannot starve
/// any of them.
#[derive(Clone, Default)]
pub struct KeyedLocks {
    locks: Arc<Mutex<LockMap>>,
}

impl fmt::Debug for KeyedLocks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyedLocks")
            .field("keys", &self.len())
            .finish()
    }
}

fn lock_map(locks: &Mutex<LockMap>) -> MutexGuard<'_, LockMap> {
    locks.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Drops the registry entry of `key` if nobody holds or waits for its lock anymore.
///
/// Every clone of a registry lock is taken while holding the registry, so with the registry
/// held, a count of one means the entry is idle.
fn remove_if_idle(locks: &mut LockMap, key: &RequestKey) {
    if let Some(lock) = locks.get(key) {
        if Arc::strong_count(lock) == 1 {
            locks.remove(key);
        }
    }
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits until the lock for `key` is free and takes it.
    ///
    /// Acquisition never fails. The lock is released when the returned guard is dropped.
    pub async fn acquire(&self, key: &RequestKey) -> KeyLockGuard {
        let lock = {
            let mut locks = lock_map(&self.locks);
            Arc::clone(locks.entry(key.clone()).or_default())
        };

        let start = Instant::now();
        // declared before the wait, so an abandoned wait has released its clone by the time
        // this runs
        let abandoned = defer(|| remove_if_idle(&mut lock_map(&self.locks), key));
        let wait = lock.lock_owned();
        tokio::pin!(wait);
        let guard = wait.await;
        abandoned.cancel();
        metric!(timer("locks.wait") = start.elapsed());

        KeyLockGuard {
            locks: Arc::clone(&self.locks),
            key: key.clone(),
            guard: Some(guard),
        }
    }

    /// The number of keys that currently have a lock.
    pub fn len(&self) -> usize {
        lock_map(&self.locks).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Proof of holding the lock of one key.
pub struct KeyLockGuard {
    locks: Arc<Mutex<LockMap>>,
    key: RequestKey,
    guard: Option<OwnedMutexGuard<()>>,
}

impl KeyLockGuard {
    pub fn key(&self) -> &RequestKey {
        &self.key
    }

    /// Releases the lock. Equivalent to dropping the guard.
    pub fn release(self) {}
}

impl fmt::Debug for KeyLockGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("KeyLockGuard")
            .field(&self.key.as_str())
            .finish()
    }
}

impl Drop for KeyLockGuard {
    fn drop(&mut self) {
        let mut locks = lock_map(&self.locks);
        drop(self.guard.take());
        remove_if_idle(&mut locks, &self.key);
    }
}

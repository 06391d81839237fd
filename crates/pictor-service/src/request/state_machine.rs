use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use futures::FutureExt;

use super::binding::RequestControl;
use super::dispatch::Dispatcher;
use super::{CacheLayer, LoadPipeline};
use crate::caching::{InUse, RequestKey, Resource};
use crate::types::{
    CancelCause, FailedCause, Outcome, Provenance, RequestOptions, RequestState,
};

/// The outcome a request has produced by the time it gives up the key's lock.
struct Produced {
    outcome: Outcome,
    /// Set for completed outcomes only.
    pin: Option<InUse>,
}

impl Produced {
    fn completed(pin: InUse, provenance: Provenance) -> Self {
        Self {
            outcome: Outcome::Completed(Arc::clone(pin.resource()), provenance),
            pin: Some(pin),
        }
    }

    fn failed(cause: FailedCause) -> Self {
        Self {
            outcome: Outcome::Failed(cause),
            pin: None,
        }
    }

    fn canceled(cause: CancelCause) -> Self {
        Self {
            outcome: Outcome::Canceled(cause),
            pin: None,
        }
    }

    /// A failure, unless the request was canceled in the meantime.
    fn failed_or_canceled(cause: FailedCause, canceled: Option<CancelCause>) -> Self {
        match canceled {
            Some(canceled) => Self::canceled(canceled),
            None => Self::failed(cause),
        }
    }
}

/// Drives a single request from submission to the hand-off of its outcome.
///
/// Cancellation is re-evaluated at every checkpoint, since the consumer may detach at any
/// time. The key's lock is held from before the cache is probed until after it has been
/// populated, and is released on every exit path before the outcome is dispatched.
///
/// Every request dispatches exactly one outcome. A panicking stage fails the request, and a
/// machine dropped before it could dispatch (for example when its runtime shuts down) fails
/// the request from its `Drop` impl.
pub(crate) struct RequestStateMachine {
    key: RequestKey,
    options: RequestOptions,
    control: Arc<RequestControl>,
    pipeline: Arc<LoadPipeline>,
    cache: Option<CacheLayer>,
    dispatcher: Dispatcher,
    state: RequestState,
    dispatched: bool,
}

impl RequestStateMachine {
    pub fn new(
        key: RequestKey,
        options: RequestOptions,
        control: Arc<RequestControl>,
        pipeline: Arc<LoadPipeline>,
        cache: Option<CacheLayer>,
        dispatcher: Dispatcher,
    ) -> Self {
        Self {
            key,
            options,
            control,
            pipeline,
            cache,
            dispatcher,
            state: RequestState::Pending,
            dispatched: false,
        }
    }

    /// Runs the request and dispatches its outcome.
    pub async fn run(mut self) {
        let start = Instant::now();

        let produced = AssertUnwindSafe(self.drive()).catch_unwind().await;
        let Produced { outcome, pin } = match produced {
            Ok(produced) => produced,
            Err(_) => {
                // the key's lock went away with the unwound future
                tracing::error!(state = %self.state, "Request stage panicked");
                metric!(counter("requests.panicked") += 1);
                let cause = self.interrupted_cause();
                if self.state != RequestState::Pending {
                    self.enter(RequestState::ReleasingLock);
                }
                Produced::failed(cause)
            }
        };

        metric!(
            timer("requests.duration") = start.elapsed(),
            "outcome" => outcome.tag(),
        );
        self.finish(outcome, pin);
    }

    fn finish(&mut self, outcome: Outcome, pin: Option<InUse>) {
        self.enter(RequestState::Dispatching);
        tracing::debug!(outcome = outcome.tag(), "Dispatching outcome");
        self.dispatched = true;
        self.dispatcher.dispatch(self.control.id(), outcome, pin);
    }

    /// The failure reported for a request that was interrupted in its current state.
    fn interrupted_cause(&self) -> FailedCause {
        match self.state {
            RequestState::Decoding => FailedCause::DecodeFailed,
            _ => FailedCause::FetchFailed,
        }
    }

    fn enter(&mut self, state: RequestState) {
        tracing::trace!(from = %self.state, to = %state, "Request state change");
        self.state = state;
        self.dispatcher.state_changed(self.control.id(), state);
    }

    /// Whether a freshly loaded resource goes into the memory cache.
    fn writes_cache(&self) -> bool {
        self.options.cache_write && self.cache.is_some() && !self.key.is_empty()
    }

    /// The cache layer, if this request reads from it.
    fn read_layer(&self) -> Option<&CacheLayer> {
        self.cache.as_ref().filter(|_| self.options.cache_read)
    }

    async fn drive(&mut self) -> Produced {
        if let Some(cause) = self.control.check() {
            return Produced::canceled(cause);
        }
        if self.key.is_empty() {
            return Produced::failed(FailedCause::InvalidKey);
        }
        if !self.options.cache_only && !self.pipeline.fetch.supports(&self.key) {
            return Produced::failed(FailedCause::Unsupported);
        }

        let guard = match self.read_layer().map(|layer| layer.locks.clone()) {
            Some(locks) => {
                self.enter(RequestState::AcquiringLock);
                Some(locks.acquire(&self.key).await)
            }
            None => None,
        };

        let produced = self.load().await;

        self.enter(RequestState::ReleasingLock);
        if let Some(guard) = guard {
            guard.release();
        }

        produced
    }

    async fn load(&mut self) -> Produced {
        self.enter(RequestState::ProbingCache);
        if let Some(cause) = self.control.check() {
            return Produced::canceled(cause);
        }

        if let Some(pin) = self.probe_cache() {
            // a hit is not populated again
            self.enter(RequestState::Populating);
            return Produced::completed(pin, Provenance::MemoryCache);
        }
        if self.options.cache_only {
            return Produced::failed(FailedCause::CacheRetrievalMissing);
        }

        self.enter(RequestState::Fetching);
        if let Some(cause) = self.control.check() {
            return Produced::canceled(cause);
        }
        let fetched = self.pipeline.fetch.fetch(&self.key).await;

        // Fetches are not preempted. When the request was canceled during the fetch, its
        // result is still decoded and cached if the request writes to the cache.
        let canceled = self.control.check();
        let fetched = match fetched {
            Ok(fetched) => fetched,
            Err(error) => {
                tracing::debug!(error = &error as &dyn std::error::Error, "Fetch failed");
                self.enter(RequestState::Populating);
                return Produced::failed_or_canceled(FailedCause::FetchFailed, canceled);
            }
        };
        if let Some(cause) = canceled {
            if !self.writes_cache() {
                return Produced::canceled(cause);
            }
        }

        self.enter(RequestState::Decoding);
        let decoded = self.pipeline.decode.decode(&self.key, fetched.bytes).await;
        let canceled = canceled.or_else(|| self.control.check());
        let pin = match decoded {
            Ok(image) => Resource::new_pinned(self.key.clone(), image),
            Err(error) => {
                tracing::debug!(error = &error as &dyn std::error::Error, "Decode failed");
                self.enter(RequestState::Populating);
                return Produced::failed_or_canceled(FailedCause::DecodeFailed, canceled);
            }
        };

        self.enter(RequestState::Populating);
        self.populate(pin.resource());

        match canceled.or_else(|| self.control.check()) {
            // dropping the pin reclaims the resource unless it was just cached
            Some(cause) => Produced::canceled(cause),
            None => Produced::completed(pin, fetched.provenance),
        }
    }

    /// Looks the key up in the memory cache, pinning a hit.
    ///
    /// A cached resource that has been reclaimed is removed and reported as a miss.
    fn probe_cache(&self) -> Option<InUse> {
        let layer = self.read_layer()?;
        metric!(counter("caches.access") += 1);

        let Some(entry) = layer.cache.entry(&self.key) else {
            metric!(counter("caches.memory.miss") += 1);
            return None;
        };

        match entry.resource.pin() {
            Some(pin) => {
                tracing::trace!(age = ?entry.inserted_at.elapsed(), "Memory cache hit");
                metric!(counter("caches.memory.hit") += 1);
                Some(pin)
            }
            None => {
                tracing::debug!("Removing reclaimed resource from the memory cache");
                metric!(counter("caches.memory.reclaimed") += 1);
                metric!(counter("caches.memory.miss") += 1);
                layer.cache.remove(&self.key);
                None
            }
        }
    }

    fn populate(&self, resource: &Arc<Resource>) {
        if !self.writes_cache() {
            return;
        }
        let Some(layer) = &self.cache else {
            return;
        };
        if !resource.is_cacheable() {
            tracing::debug!("Not caching animated image");
            return;
        }

        layer.cache.put(self.key.clone(), Arc::clone(resource));
        metric!(counter("caches.memory.populate") += 1);
    }
}

impl Drop for RequestStateMachine {
    fn drop(&mut self) {
        if self.dispatched {
            return;
        }
        tracing::warn!(state = %self.state, "Request dropped before dispatching an outcome");
        let outcome = Outcome::Failed(self.interrupted_cause());
        self.finish(outcome, None);
    }
}

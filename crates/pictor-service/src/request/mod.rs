//! The request lifecycle.
//!
//! A request is submitted to a [`ResourceLoader`] with a [`RequestKey`], [`RequestOptions`], a
//! [`ConsumerBinding`] and a [`Consumer`]. It is then driven by a worker task through the
//! following states:
//!
//! ```text
//! Pending
//!   -> AcquiringLock        (cache reads enabled)
//!   -> ProbingCache         -> Populating on a hit
//!   -> Fetching -> Decoding -> Populating
//!   -> ReleasingLock
//!   -> Dispatching          -> Completed | Failed | Canceled
//! ```
//!
//! Requests that fail before touching the cache (an empty key, an unsupported URI, or a
//! cancellation while still pending) go straight to `Dispatching`. Everything else passes
//! through `ReleasingLock`, which releases the key's lock if it was taken.
//!
//! Outcomes are handed to the [`ConsumerContext`] through a channel. The consumer context is
//! the only place that calls consumers, and it re-validates every outcome before delivery.
//!
//! The loader is a composition: a [`LoadPipeline`] of a fetch and a decode stage that turns a
//! key into a resource, optionally wrapped by a [`CacheLayer`] that adds the memory cache and
//! the per-key locks around it.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use sentry::SentryFutureExt;
use tokio::sync::{Semaphore, watch};
use tracing::Instrument;

use crate::caching::{KeyedLocks, RequestKey, ResultCache};
use crate::services::decode::DecodeStage;
use crate::services::fetch::FetchStage;
use crate::types::{CancelCause, RequestId, RequestOptions, RequestState};
use crate::utils::defer::defer;

mod binding;
mod consumer;
mod dispatch;
mod state_machine;

use self::binding::RequestControl;
use self::state_machine::RequestStateMachine;

pub use self::binding::{Attached, ConsumerBinding, ConsumerSlot, SlotBinding};
pub use self::consumer::Consumer;
pub use self::dispatch::{ConsumerContext, Dispatcher};

/// The base pipeline, turning a key into a decoded image.
#[derive(Clone)]
pub struct LoadPipeline {
    pub fetch: Arc<dyn FetchStage>,
    pub decode: Arc<dyn DecodeStage>,
}

impl fmt::Debug for LoadPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadPipeline").finish_non_exhaustive()
    }
}

impl LoadPipeline {
    pub fn new(fetch: Arc<dyn FetchStage>, decode: Arc<dyn DecodeStage>) -> Self {
        Self { fetch, decode }
    }
}

/// The memory cache and the key locks guarding its population.
///
/// Loaders sharing a cache must share the locks too, which is why both travel together.
#[derive(Debug, Clone)]
pub struct CacheLayer {
    pub cache: ResultCache,
    pub locks: KeyedLocks,
}

impl CacheLayer {
    pub fn new(cache: ResultCache) -> Self {
        Self {
            cache,
            locks: KeyedLocks::new(),
        }
    }
}

/// Builder for a [`ResourceLoader`].
#[derive(Debug)]
pub struct ResourceLoaderBuilder {
    pipeline: LoadPipeline,
    cache: Option<CacheLayer>,
    max_concurrent_requests: usize,
    runtime: tokio::runtime::Handle,
}

impl ResourceLoaderBuilder {
    /// Adds the memory cache.
    pub fn cache(mut self, layer: CacheLayer) -> Self {
        self.cache = Some(layer);
        self
    }

    /// Limits how many requests run at the same time. Defaults to `64`.
    pub fn max_concurrent_requests(mut self, limit: usize) -> Self {
        self.max_concurrent_requests = limit.max(1);
        self
    }

    /// Creates the loader and the consumer context its outcomes are delivered to.
    pub fn build(self) -> (ResourceLoader, ConsumerContext) {
        let (dispatcher, context) = dispatch::channel();
        let loader = ResourceLoader {
            pipeline: Arc::new(self.pipeline),
            cache: self.cache,
            dispatcher,
            admission: Arc::new(Semaphore::new(self.max_concurrent_requests)),
            active: Arc::new(AtomicU64::new(0)),
            runtime: self.runtime,
        };
        (loader, context)
    }
}

/// Submits requests and runs them on worker tasks.
#[derive(Debug, Clone)]
pub struct ResourceLoader {
    pipeline: Arc<LoadPipeline>,
    cache: Option<CacheLayer>,
    dispatcher: Dispatcher,
    admission: Arc<Semaphore>,
    active: Arc<AtomicU64>,
    runtime: tokio::runtime::Handle,
}

impl ResourceLoader {
    /// Starts building a loader that spawns its requests on `runtime`.
    pub fn builder(
        pipeline: LoadPipeline,
        runtime: tokio::runtime::Handle,
    ) -> ResourceLoaderBuilder {
        ResourceLoaderBuilder {
            pipeline,
            cache: None,
            max_concurrent_requests: 64,
            runtime,
        }
    }

    /// The memory cache, if the loader has one.
    pub fn cache(&self) -> Option<&CacheLayer> {
        self.cache.as_ref()
    }

    /// Submits a request.
    ///
    /// The request starts running right away, subject to the concurrency limit. Its outcome is
    /// delivered to `consumer` on the [`ConsumerContext`].
    pub fn submit<C: Consumer>(
        &self,
        key: RequestKey,
        options: RequestOptions,
        binding: Arc<dyn ConsumerBinding>,
        consumer: C,
    ) -> RequestHandle {
        let id = RequestId::new();
        let control = Arc::new(RequestControl::new(id, binding));
        let (state_tx, state_rx) = watch::channel(RequestState::Pending);

        // registration is queued before anything the worker sends
        self.dispatcher
            .register(Arc::clone(&control), Box::new(consumer), state_tx);
        metric!(counter("requests.submitted") += 1);

        let span = tracing::debug_span!("request", %id, key = %key);
        let machine = RequestStateMachine::new(
            key,
            options,
            Arc::clone(&control),
            Arc::clone(&self.pipeline),
            self.cache.clone(),
            self.dispatcher.clone(),
        );
        let admission = Arc::clone(&self.admission);
        let active = Arc::clone(&self.active);

        let future = async move {
            let _permit = admission.acquire_owned().await.ok();

            let count = active.fetch_add(1, Ordering::Relaxed) + 1;
            metric!(gauge("requests.active") = count);
            let _active = defer(|| {
                let count = active.fetch_sub(1, Ordering::Relaxed).saturating_sub(1);
                metric!(gauge("requests.active") = count);
            });

            machine.run().await;
        };

        self.runtime.spawn(
            future
                .instrument(span)
                .bind_hub(sentry::Hub::new_from_top(sentry::Hub::current())),
        );

        RequestHandle {
            control,
            state: state_rx,
        }
    }
}

/// A handle to a submitted request.
///
/// Dropping the handle does not cancel the request.
#[derive(Debug, Clone)]
pub struct RequestHandle {
    control: Arc<RequestControl>,
    state: watch::Receiver<RequestState>,
}

impl RequestHandle {
    pub fn id(&self) -> RequestId {
        self.control.id()
    }

    /// Cancels the request.
    ///
    /// Cancellation is cooperative: a running fetch or decode is not interrupted, but the
    /// consumer is told the request was canceled, unless its outcome was already delivered.
    pub fn cancel(&self) {
        self.control.cancel(CancelCause::ExplicitCancel);
    }

    /// The last state delivered to the consumer context.
    pub fn state(&self) -> RequestState {
        *self.state.borrow()
    }

    /// Waits until the consumer context has delivered the outcome and returns the terminal
    /// state.
    ///
    /// If the consumer context goes away first, this returns the last state it delivered.
    pub async fn finished(&self) -> RequestState {
        let mut state = self.state.clone();
        let finished = state.wait_for(RequestState::is_terminal).await.map(|s| *s);
        finished.unwrap_or_else(|_| *state.borrow())
    }
}

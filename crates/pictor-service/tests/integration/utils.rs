use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use futures::future::BoxFuture;
use tokio::sync::{Semaphore, watch};

use pictor_service::caching::{DecodedImage, RequestKey, Resource, ResultCache};
use pictor_service::config::MemoryCacheConfig;
use pictor_service::request::{
    Attached, CacheLayer, Consumer, ConsumerBinding, ConsumerContext, LoadPipeline,
    RequestHandle, ResourceLoader,
};
use pictor_service::services::decode::{DecodeError, DecodeStage};
use pictor_service::services::fetch::{FetchError, FetchStage, Fetched};
use pictor_service::types::{CancelCause, FailedCause, Provenance, RequestOptions, RequestState};
use pictor_test as test;

/// A scripted [`FetchStage`] that keeps track of how it is called.
pub struct TestFetch {
    images: HashMap<String, Bytes>,
    delay: Option<Duration>,
    gate: Option<Semaphore>,
    started: watch::Sender<usize>,
    active: Mutex<HashMap<String, usize>>,
    max_active: AtomicUsize,
}

impl TestFetch {
    pub fn new() -> Self {
        Self {
            images: HashMap::new(),
            delay: None,
            gate: None,
            started: watch::Sender::new(0),
            active: Mutex::new(HashMap::new()),
            max_active: AtomicUsize::new(0),
        }
    }

    /// Serves `bytes` for `uri`. Unknown URIs are not found.
    pub fn image(mut self, uri: &str, bytes: impl Into<Bytes>) -> Self {
        self.images.insert(uri.to_owned(), bytes.into());
        self
    }

    /// Makes every fetch take `delay`.
    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Makes every fetch wait until [`open_gate`](Self::open_gate) lets it pass.
    pub fn gated(mut self) -> Self {
        self.gate = Some(Semaphore::new(0));
        self
    }

    /// Lets `fetches` gated fetches complete.
    pub fn open_gate(&self, fetches: usize) {
        if let Some(gate) = &self.gate {
            gate.add_permits(fetches);
        }
    }

    /// Waits until `count` fetches have started in total.
    pub async fn wait_started(&self, count: usize) {
        self.started
            .subscribe()
            .wait_for(|started| *started >= count)
            .await
            .unwrap();
    }

    /// The total number of fetches started.
    pub fn calls(&self) -> usize {
        *self.started.borrow()
    }

    /// The highest number of concurrent fetches observed for a single key.
    pub fn max_concurrent_per_key(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    async fn fetch_uri(&self, uri: &str) -> Result<Fetched, FetchError> {
        {
            let mut active = self.active.lock().unwrap();
            let active = active.entry(uri.to_owned()).or_default();
            *active += 1;
            self.max_active.fetch_max(*active, Ordering::SeqCst);
        }
        self.started.send_modify(|started| *started += 1);

        if let Some(gate) = &self.gate {
            gate.acquire().await.unwrap().forget();
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        if let Some(active) = self.active.lock().unwrap().get_mut(uri) {
            *active -= 1;
        }

        let bytes = self.images.get(uri).cloned().ok_or(FetchError::NotFound)?;
        Ok(Fetched {
            bytes,
            provenance: Provenance::Network,
        })
    }
}

impl FetchStage for TestFetch {
    fn fetch<'a>(&'a self, key: &'a RequestKey) -> BoxFuture<'a, Result<Fetched, FetchError>> {
        Box::pin(self.fetch_uri(key.uri()))
    }
}

/// A [`DecodeStage`] that uses the fetched bytes as pixels.
///
/// Empty input fails to decode, input starting with `GIF` is animated.
#[derive(Default)]
pub struct TestDecode {
    calls: AtomicUsize,
}

impl TestDecode {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl DecodeStage for TestDecode {
    fn decode<'a>(
        &'a self,
        _key: &'a RequestKey,
        bytes: Bytes,
    ) -> BoxFuture<'a, Result<DecodedImage, DecodeError>> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if bytes.is_empty() {
                return Err(DecodeError::UnknownFormat);
            }

            let animated = bytes.starts_with(b"GIF");
            Ok(DecodedImage {
                width: 1,
                height: 1,
                mime_type: if animated { "image/gif" } else { "image/test" }.into(),
                animated,
                pixels: bytes,
            })
        })
    }
}

/// A terminal callback as seen by a [`Recorder`].
#[derive(Debug, Clone)]
pub enum Delivered {
    Completed {
        resource: Arc<Resource>,
        provenance: Provenance,
        /// The in-use count during the callback.
        in_use: usize,
    },
    Failed(FailedCause),
    Canceled(CancelCause),
}

impl Delivered {
    #[track_caller]
    pub fn unwrap_completed(self) -> (Arc<Resource>, Provenance) {
        match self {
            Self::Completed {
                resource,
                provenance,
                ..
            } => (resource, provenance),
            other => panic!("expected completed, got {other:?}"),
        }
    }

    pub fn failed(&self) -> Option<FailedCause> {
        match self {
            Self::Failed(cause) => Some(*cause),
            _ => None,
        }
    }

    pub fn canceled(&self) -> Option<CancelCause> {
        match self {
            Self::Canceled(cause) => Some(*cause),
            _ => None,
        }
    }
}

#[derive(Debug, Default)]
struct Recorded {
    states: Vec<RequestState>,
    terminal: Vec<Delivered>,
}

/// A [`Consumer`] that records every callback.
#[derive(Debug, Clone, Default)]
pub struct Recorder {
    inner: Arc<Mutex<Recorded>>,
}

impl Recorder {
    pub fn states(&self) -> Vec<RequestState> {
        self.inner.lock().unwrap().states.clone()
    }

    /// All terminal callbacks received so far.
    pub fn terminal(&self) -> Vec<Delivered> {
        self.inner.lock().unwrap().terminal.clone()
    }

    /// The single terminal callback.
    #[track_caller]
    pub fn delivered(&self) -> Delivered {
        let terminal = self.terminal();
        assert_eq!(terminal.len(), 1, "expected exactly one outcome: {terminal:?}");
        terminal.into_iter().next().unwrap()
    }
}

impl Consumer for Recorder {
    fn on_state_changed(&mut self, state: RequestState) {
        self.inner.lock().unwrap().states.push(state);
    }

    fn on_completed(&mut self, resource: &Arc<Resource>, provenance: Provenance) {
        self.inner.lock().unwrap().terminal.push(Delivered::Completed {
            resource: Arc::clone(resource),
            provenance,
            in_use: resource.in_use(),
        });
    }

    fn on_failed(&mut self, cause: FailedCause) {
        self.inner
            .lock()
            .unwrap()
            .terminal
            .push(Delivered::Failed(cause));
    }

    fn on_canceled(&mut self, cause: CancelCause) {
        self.inner
            .lock()
            .unwrap()
            .terminal
            .push(Delivered::Canceled(cause));
    }
}

/// A loader wired up with a [`TestFetch`], a [`TestDecode`] and a memory cache.
pub struct TestLoader {
    pub loader: ResourceLoader,
    pub fetch: Arc<TestFetch>,
    pub decode: Arc<TestDecode>,
    pub cache: CacheLayer,
}

impl TestLoader {
    /// Submits a request with a consumer that never detaches.
    pub fn submit(&self, uri: &str, options: RequestOptions) -> (RequestHandle, Recorder) {
        self.submit_bound(uri, options, Arc::new(Attached))
    }

    pub fn submit_bound(
        &self,
        uri: &str,
        options: RequestOptions,
        binding: Arc<dyn ConsumerBinding>,
    ) -> (RequestHandle, Recorder) {
        let recorder = Recorder::default();
        let handle = self
            .loader
            .submit(RequestKey::new(uri), options, binding, recorder.clone());
        (handle, recorder)
    }

    /// Submits a request and waits for its outcome.
    pub async fn load(&self, uri: &str, options: RequestOptions) -> (RequestState, Recorder) {
        let (handle, recorder) = self.submit(uri, options);
        (handle.finished().await, recorder)
    }
}

/// Creates a [`TestLoader`] and the consumer context it delivers to.
pub fn test_loader_with_context(fetch: TestFetch) -> (TestLoader, ConsumerContext) {
    test::setup();

    let fetch = Arc::new(fetch);
    let decode = Arc::new(TestDecode::default());
    let cache = CacheLayer::new(ResultCache::new(&MemoryCacheConfig::default()));

    let pipeline = LoadPipeline::new(fetch.clone(), decode.clone());
    let (loader, context) = ResourceLoader::builder(pipeline, tokio::runtime::Handle::current())
        .cache(cache.clone())
        .build();

    let test_loader = TestLoader {
        loader,
        fetch,
        decode,
        cache,
    };
    (test_loader, context)
}

/// Creates a [`TestLoader`] whose consumer context runs on its own task.
pub fn test_loader(fetch: TestFetch) -> TestLoader {
    let (loader, context) = test_loader_with_context(fetch);
    tokio::spawn(context.run());
    loader
}

//! Provides the default Pictor services and a way to initialize them.
//!
//! [`SharedServices`] creates the default fetch and decode stages and the memory cache
//! according to the provided [`Config`], and hands out [`ResourceLoader`]s that share them.
//!
//! Requests are run on a dedicated runtime, which keeps fetching and decoding away from
//! whatever drives the consumer context.

use std::sync::Arc;

use anyhow::{Context, Result};

use crate::caching::ResultCache;
use crate::config::Config;
use crate::request::{CacheLayer, ConsumerContext, LoadPipeline, ResourceLoader};

pub mod decode;
pub mod fetch;

use self::decode::ImageDecoder;
use self::fetch::FetchService;

pub struct SharedServices {
    pub config: Config,
    pub fetch: Arc<FetchService>,
    pub decode: Arc<ImageDecoder>,
    /// The memory cache, unless disabled in the config.
    pub cache: Option<CacheLayer>,
    io_pool: tokio::runtime::Handle,
}

impl SharedServices {
    pub fn new(config: Config, io_pool: tokio::runtime::Handle) -> Result<Self> {
        let fetch = FetchService::new(&config).context("failed to create fetch service")?;
        let decode = Arc::new(ImageDecoder::new());

        let memory = &config.caches.memory;
        let cache = memory
            .enabled
            .then(|| CacheLayer::new(ResultCache::new(memory)));

        Ok(Self {
            config,
            fetch,
            decode,
            cache,
            io_pool,
        })
    }

    /// Creates a loader together with the consumer context it delivers to.
    ///
    /// All loaders created from the same services share the memory cache.
    pub fn loader(&self) -> (ResourceLoader, ConsumerContext) {
        let pipeline = LoadPipeline::new(self.fetch.clone(), self.decode.clone());
        let mut builder = ResourceLoader::builder(pipeline, self.io_pool.clone())
            .max_concurrent_requests(self.config.max_concurrent_requests);
        if let Some(cache) = &self.cache {
            builder = builder.cache(cache.clone());
        }
        builder.build()
    }
}

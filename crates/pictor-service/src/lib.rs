//! Pictor service.
//!
//! An asynchronous image-loading pipeline: requests for keyed images are fetched, decoded and
//! cached by a pool of worker tasks, and their outcomes are handed off to a single consumer
//! context. See [`request`] for the request lifecycle and [`caching`] for the locking and
//! in-use protocols that make concurrent requests for the same key safe.

#[macro_use]
pub mod metrics;

pub mod caching;
pub mod config;
pub mod logging;
pub mod request;
pub mod services;
pub mod types;
pub mod utils;

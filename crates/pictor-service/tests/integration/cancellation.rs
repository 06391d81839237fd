use std::sync::Arc;

use pictor_service::caching::RequestKey;
use pictor_service::request::ConsumerSlot;
use pictor_service::types::{CancelCause, Provenance, RequestOptions, RequestState};

use crate::{TestFetch, test_loader, test_loader_with_context};

#[tokio::test]
async fn test_cancel_before_start() {
    let test = test_loader(TestFetch::new().image("img://a", "pixels"));

    let (handle, recorder) = test.submit("img://a", RequestOptions::default());
    handle.cancel();

    assert_eq!(handle.finished().await, RequestState::Canceled);
    assert_eq!(
        recorder.delivered().canceled(),
        Some(CancelCause::ExplicitCancel)
    );
    assert_eq!(recorder.states(), [RequestState::Dispatching]);
    assert_eq!(test.fetch.calls(), 0);
}

#[tokio::test]
async fn test_detached_before_start() {
    let test = test_loader(TestFetch::new().image("img://a", "pixels"));
    let slot = ConsumerSlot::new();
    let binding = slot.bind();
    slot.clear();

    let (handle, recorder) =
        test.submit_bound("img://a", RequestOptions::default(), Arc::new(binding));

    assert_eq!(handle.finished().await, RequestState::Canceled);
    assert_eq!(
        recorder.delivered().canceled(),
        Some(CancelCause::ConsumerDetached)
    );
    assert_eq!(test.fetch.calls(), 0);
}

#[tokio::test]
async fn test_cancel_mid_fetch_releases_lock() {
    let test = test_loader(TestFetch::new().image("img://a", "pixels").gated());
    let key = RequestKey::new("img://a");

    let (first, first_recorder) = test.submit("img://a", RequestOptions::default());
    test.fetch.wait_started(1).await;
    first.cancel();

    // queues up behind the first request's lock
    let (second, second_recorder) = test.submit("img://a", RequestOptions::default());
    test.fetch.open_gate(2);

    assert_eq!(first.finished().await, RequestState::Canceled);
    assert_eq!(second.finished().await, RequestState::Completed);
    assert_eq!(
        first_recorder.delivered().canceled(),
        Some(CancelCause::ExplicitCancel)
    );

    // the canceled request still populated the cache
    let (resource, provenance) = second_recorder.delivered().unwrap_completed();
    assert_eq!(provenance, Provenance::MemoryCache);
    assert_eq!(test.fetch.calls(), 1);
    assert_eq!(resource.in_use(), 0);
    assert!(test.cache.cache.contains(&key));
    assert!(test.cache.locks.is_empty());
}

#[tokio::test]
async fn test_cancel_mid_fetch_without_cache_write() {
    let test = test_loader(TestFetch::new().image("img://a", "pixels").gated());
    let read_only = RequestOptions {
        cache_write: false,
        ..Default::default()
    };

    let (first, first_recorder) = test.submit("img://a", read_only);
    test.fetch.wait_started(1).await;
    first.cancel();

    let (second, second_recorder) = test.submit("img://a", RequestOptions::default());
    test.fetch.open_gate(2);

    assert_eq!(first.finished().await, RequestState::Canceled);
    assert_eq!(second.finished().await, RequestState::Completed);
    assert_eq!(
        first_recorder.states().last(),
        Some(&RequestState::Dispatching)
    );
    assert!(!first_recorder.states().contains(&RequestState::Decoding));

    let (_, provenance) = second_recorder.delivered().unwrap_completed();
    assert_eq!(provenance, Provenance::Network);
    assert_eq!(test.fetch.calls(), 2);
    assert_eq!(test.decode.calls(), 1);
}

#[tokio::test]
async fn test_detach_during_fetch_populates_cache() {
    let test = test_loader(TestFetch::new().image("img://a", "pixels").gated());
    let key = RequestKey::new("img://a");
    let slot = ConsumerSlot::new();

    let (handle, recorder) =
        test.submit_bound("img://a", RequestOptions::default(), Arc::new(slot.bind()));
    test.fetch.wait_started(1).await;
    slot.clear();
    test.fetch.open_gate(1);

    assert_eq!(handle.finished().await, RequestState::Canceled);
    assert_eq!(
        recorder.delivered().canceled(),
        Some(CancelCause::ConsumerDetached)
    );

    let resource = test.cache.cache.get(&key).unwrap();
    assert_eq!(resource.in_use(), 0);
    assert!(!resource.is_reclaimed());
}

#[tokio::test]
async fn test_detach_during_fetch_without_cache_write() {
    let test = test_loader(TestFetch::new().image("img://a", "pixels").gated());
    let slot = ConsumerSlot::new();
    let read_only = RequestOptions {
        cache_write: false,
        ..Default::default()
    };

    let (handle, recorder) = test.submit_bound("img://a", read_only, Arc::new(slot.bind()));
    test.fetch.wait_started(1).await;
    slot.clear();
    test.fetch.open_gate(1);

    assert_eq!(handle.finished().await, RequestState::Canceled);
    assert_eq!(
        recorder.delivered().canceled(),
        Some(CancelCause::ConsumerDetached)
    );
    assert!(test.cache.cache.is_empty());
    assert_eq!(test.decode.calls(), 0);
}

#[tokio::test]
async fn test_rebinding_supersedes() {
    let test = test_loader(TestFetch::new().image("img://a", "pixels").gated());
    let slot = ConsumerSlot::new();

    let (first, first_recorder) =
        test.submit_bound("img://a", RequestOptions::default(), Arc::new(slot.bind()));
    test.fetch.wait_started(1).await;

    let (second, second_recorder) =
        test.submit_bound("img://a", RequestOptions::default(), Arc::new(slot.bind()));
    test.fetch.open_gate(2);

    assert_eq!(first.finished().await, RequestState::Canceled);
    assert_eq!(second.finished().await, RequestState::Completed);
    assert_eq!(
        first_recorder.delivered().canceled(),
        Some(CancelCause::Superseded)
    );
    let (_, provenance) = second_recorder.delivered().unwrap_completed();
    assert_eq!(provenance, Provenance::MemoryCache);
}

#[tokio::test]
async fn test_detach_after_dispatch_releases_pin() {
    let fetch = TestFetch::new().image("img://a", "pixels");
    let (test, mut context) = test_loader_with_context(fetch);
    let key = RequestKey::new("img://a");

    let (first, _) = test.submit("img://a", RequestOptions::default());
    while !first.state().is_terminal() {
        assert!(context.next().await);
    }
    assert_eq!(first.state(), RequestState::Completed);
    let resource = test.cache.cache.get(&key).unwrap();

    let slot = ConsumerSlot::new();
    let (second, recorder) =
        test.submit_bound("img://a", RequestOptions::default(), Arc::new(slot.bind()));

    // the worker has pinned the cache hit once it reports dispatching
    while second.state() != RequestState::Dispatching {
        assert!(context.next().await);
    }
    assert_eq!(resource.in_use(), 1);

    slot.clear();
    while !second.state().is_terminal() {
        assert!(context.next().await);
    }

    assert_eq!(second.state(), RequestState::Canceled);
    assert_eq!(
        recorder.delivered().canceled(),
        Some(CancelCause::ConsumerDetached)
    );
    assert_eq!(resource.in_use(), 0);
    assert!(!resource.is_reclaimed());
}

#[tokio::test]
async fn test_cancel_after_completion_is_ignored() {
    let test = test_loader(TestFetch::new().image("img://a", "pixels"));

    let (handle, recorder) = test.submit("img://a", RequestOptions::default());
    assert_eq!(handle.finished().await, RequestState::Completed);
    handle.cancel();

    tokio::task::yield_now().await;
    assert_eq!(handle.state(), RequestState::Completed);
    assert_eq!(recorder.terminal().len(), 1);
}

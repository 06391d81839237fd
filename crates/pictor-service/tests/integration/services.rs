use std::sync::Arc;

use pictor_service::caching::{DecodeOptions, MaxSize, RequestKey};
use pictor_service::config::Config;
use pictor_service::request::{Attached, ResourceLoader};
use pictor_service::services::SharedServices;
use pictor_service::types::{FailedCause, Provenance, RequestOptions, RequestState};
use pictor_test::{self as test, ImageServer};

use crate::Recorder;

fn setup_services(update_config: impl FnOnce(&mut Config)) -> (SharedServices, ResourceLoader) {
    test::setup();

    let mut config = Config::default();
    update_config(&mut config);

    let services = SharedServices::new(config, tokio::runtime::Handle::current()).unwrap();
    let (loader, context) = services.loader();
    tokio::spawn(context.run());

    (services, loader)
}

async fn load(loader: &ResourceLoader, key: RequestKey) -> (RequestState, Recorder) {
    let recorder = Recorder::default();
    let handle = loader.submit(
        key,
        RequestOptions::default(),
        Arc::new(Attached),
        recorder.clone(),
    );
    (handle.finished().await, recorder)
}

#[tokio::test]
async fn test_local_file() {
    let (_services, loader) = setup_services(|_| {});
    let dir = test::tempdir();
    let path = dir.path().join("a.png");
    std::fs::write(&path, test::png(8, 4)).unwrap();
    let uri = path.to_str().unwrap();

    let (state, recorder) = load(&loader, RequestKey::new(uri)).await;
    assert_eq!(state, RequestState::Completed);
    let (resource, provenance) = recorder.delivered().unwrap_completed();
    assert_eq!(provenance, Provenance::Local);
    assert_eq!((resource.info().width, resource.info().height), (8, 4));
    assert_eq!(resource.info().mime_type, "image/png");

    let file_uri = format!("file://{uri}");
    let (state, recorder) = load(&loader, RequestKey::new(file_uri)).await;
    assert_eq!(state, RequestState::Completed);
    let (_, provenance) = recorder.delivered().unwrap_completed();
    assert_eq!(provenance, Provenance::Local);

    let (state, recorder) = load(&loader, RequestKey::new(uri)).await;
    assert_eq!(state, RequestState::Completed);
    let (_, provenance) = recorder.delivered().unwrap_completed();
    assert_eq!(provenance, Provenance::MemoryCache);
}

#[tokio::test]
async fn test_missing_local_file() {
    let (_services, loader) = setup_services(|_| {});
    let dir = test::tempdir();
    let path = dir.path().join("missing.png");

    let (state, recorder) = load(&loader, RequestKey::new(path.to_str().unwrap())).await;
    assert_eq!(state, RequestState::Failed);
    assert_eq!(recorder.delivered().failed(), Some(FailedCause::FetchFailed));
}

#[tokio::test]
async fn test_http() {
    let (_services, loader) = setup_services(|_| {});
    let server = ImageServer::new();
    let url = server.url("png/16/16/a.png");

    let (state, recorder) = load(&loader, RequestKey::new(url.as_str())).await;
    assert_eq!(state, RequestState::Completed);
    let (resource, provenance) = recorder.delivered().unwrap_completed();
    assert_eq!(provenance, Provenance::Network);
    assert_eq!(resource.info().byte_size, 16 * 16 * 4);
    assert_eq!(server.accesses(), 1);

    let (_, recorder) = load(&loader, RequestKey::new(url.as_str())).await;
    let (_, provenance) = recorder.delivered().unwrap_completed();
    assert_eq!(provenance, Provenance::MemoryCache);
    assert_eq!(server.accesses(), 0);
}

#[tokio::test]
async fn test_http_errors() {
    let (_services, loader) = setup_services(|_| {});
    let server = ImageServer::new();

    let not_found = server.url("respond_statuscode/404/a.png");
    let (state, recorder) = load(&loader, RequestKey::new(not_found.as_str())).await;
    assert_eq!(state, RequestState::Failed);
    assert_eq!(recorder.delivered().failed(), Some(FailedCause::FetchFailed));

    let garbage = server.url("garbage/hello");
    let (state, recorder) = load(&loader, RequestKey::new(garbage.as_str())).await;
    assert_eq!(state, RequestState::Failed);
    assert_eq!(recorder.delivered().failed(), Some(FailedCause::DecodeFailed));
}

#[tokio::test]
async fn test_unsupported_scheme() {
    let (services, loader) = setup_services(|_| {});

    let (state, recorder) = load(&loader, RequestKey::new("ftp://example.com/a.png")).await;
    assert_eq!(state, RequestState::Failed);
    assert_eq!(recorder.delivered().failed(), Some(FailedCause::Unsupported));
    assert_eq!(recorder.states(), [RequestState::Dispatching]);

    let cache = services.cache.unwrap();
    assert!(cache.locks.is_empty());
    assert!(cache.cache.is_empty());
}

#[tokio::test]
async fn test_gif_is_not_cached() {
    let (services, loader) = setup_services(|_| {});
    let server = ImageServer::new();
    let url = server.url("gif/4/4/a.gif");

    for _ in 0..2 {
        let (_, recorder) = load(&loader, RequestKey::new(url.as_str())).await;
        let (resource, provenance) = recorder.delivered().unwrap_completed();
        assert_eq!(provenance, Provenance::Network);
        assert!(resource.info().animated);
    }

    assert_eq!(server.accesses(), 2);
    assert!(services.cache.unwrap().cache.is_empty());
}

#[tokio::test]
async fn test_max_size() {
    let (services, loader) = setup_services(|_| {});
    let server = ImageServer::new();
    let url = server.url("png/16/8/a.png");

    let thumbnail = RequestKey::with_options(
        url.as_str(),
        DecodeOptions {
            max_size: Some(MaxSize {
                width: 4,
                height: 4,
            }),
        },
    );
    let (_, recorder) = load(&loader, thumbnail).await;
    let (resource, _) = recorder.delivered().unwrap_completed();
    assert_eq!((resource.info().width, resource.info().height), (4, 2));

    let (_, recorder) = load(&loader, RequestKey::new(url.as_str())).await;
    let (resource, provenance) = recorder.delivered().unwrap_completed();
    assert_eq!(provenance, Provenance::Network);
    assert_eq!((resource.info().width, resource.info().height), (16, 8));

    assert_eq!(services.cache.unwrap().cache.len(), 2);
}

#[tokio::test]
async fn test_memory_cache_disabled() {
    let (services, loader) = setup_services(|config| config.caches.memory.enabled = false);
    let server = ImageServer::new();
    let url = server.url("png/2/2/a.png");
    assert!(services.cache.is_none());

    for _ in 0..2 {
        let (state, recorder) = load(&loader, RequestKey::new(url.as_str())).await;
        assert_eq!(state, RequestState::Completed);
        assert!(!recorder.states().contains(&RequestState::AcquiringLock));
        let (resource, provenance) = recorder.delivered().unwrap_completed();
        assert_eq!(provenance, Provenance::Network);
        assert!(resource.is_reclaimed());
    }
    assert_eq!(server.accesses(), 2);
}

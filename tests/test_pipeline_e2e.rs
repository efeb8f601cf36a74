mod common;

use async_trait::async_trait;
use common::{FailingProcessor, StaticLoader, UppercaseProcessor};
use http::header::{CONTENT_LENGTH, CONTENT_TYPE};
use http::StatusCode;
use image_relay::{
    Blob, FileStorage, ImageRequest, Orchestrator, Params, Processed, Processor, RelayError,
    Result, Setting,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[tokio::test]
async fn test_unknown_op_passes_original_through() {
    let orchestrator = Orchestrator::builder()
        .allow_unsafe(true)
        .processor(UppercaseProcessor::default())
        .apply([Setting::Loader(
            StaticLoader::found("origin", b"ORIG", Some("image/png")).shared(),
        )])
        .build()
        .unwrap();

    let request = ImageRequest::new("img", "op:noop").unwrap().unsafe_request();
    let response = orchestrator.serve(request).await.unwrap();

    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.blob.as_bytes().await.unwrap(), "ORIG");
    assert_eq!(response.headers.get(CONTENT_TYPE).unwrap(), "image/png");
    assert_eq!(response.headers.get(CONTENT_LENGTH).unwrap(), "4");
}

#[tokio::test]
async fn test_known_op_transforms() {
    let orchestrator = Orchestrator::builder()
        .allow_unsafe(true)
        .processor(UppercaseProcessor::default())
        .apply([Setting::Loader(
            StaticLoader::found("origin", b"orig", Some("image/png")).shared(),
        )])
        .build()
        .unwrap();

    let request = ImageRequest::new("img", "op:upper").unwrap().unsafe_request();
    let response = orchestrator.serve(request).await.unwrap();
    assert_eq!(response.blob.as_bytes().await.unwrap(), "ORIG");
}

#[tokio::test]
async fn test_request_timeout_cuts_slow_loader() {
    let loader = StaticLoader::found("slow", b"late", None)
        .with_delay(Duration::from_millis(50))
        .shared();
    let orchestrator = Orchestrator::builder()
        .allow_unsafe(true)
        .request_timeout(Duration::from_millis(10))
        .apply([Setting::Loader(loader.clone())])
        .build()
        .unwrap();

    let started = Instant::now();
    let request = ImageRequest::new("img", "").unwrap().unsafe_request();
    let err = orchestrator.serve(request).await.unwrap_err();
    let elapsed = started.elapsed();

    assert!(matches!(err, RelayError::Timeout(_)), "unexpected error: {:?}", err);
    assert!(elapsed < Duration::from_millis(45), "took {:?}", elapsed);
    assert_eq!(orchestrator.error_response(&err).status, 504);
    assert_eq!(loader.calls(), 1);
}

#[tokio::test]
async fn test_load_timeout_is_fatal() {
    let slow = StaticLoader::found("slow", b"late", None)
        .with_delay(Duration::from_millis(200))
        .shared();
    let backup = StaticLoader::found("backup", b"backup", None).shared();
    let orchestrator = Orchestrator::builder()
        .allow_unsafe(true)
        .load_timeout(Duration::from_millis(20))
        .apply([Setting::Loader(slow), Setting::Loader(backup.clone())])
        .build()
        .unwrap();

    let request = ImageRequest::new("img", "").unwrap().unsafe_request();
    let err = orchestrator.serve(request).await.unwrap_err();
    assert!(matches!(err, RelayError::Timeout(_)));
    assert_eq!(backup.calls(), 0);
}

#[tokio::test]
async fn test_process_timeout() {
    let orchestrator = Orchestrator::builder()
        .allow_unsafe(true)
        .process_timeout(Duration::from_millis(20))
        .processor(common::BlockingProcessor::new(Duration::from_millis(500)))
        .apply([Setting::Loader(
            StaticLoader::found("origin", b"img", None).shared(),
        )])
        .build()
        .unwrap();

    let started = Instant::now();
    let request = ImageRequest::new("img", "").unwrap().unsafe_request();
    let err = orchestrator.serve(request).await.unwrap_err();
    assert!(matches!(err, RelayError::Timeout(_)));
    assert!(started.elapsed() < Duration::from_millis(400));
    assert_eq!(orchestrator.metrics().processing_in_flight.get(), 0);
}

#[tokio::test]
async fn test_processor_failure_fails_request() {
    let after = Arc::new(UppercaseProcessor::default());
    let orchestrator = Orchestrator::builder()
        .allow_unsafe(true)
        .processor(FailingProcessor)
        .apply([
            Setting::Processor(after.clone()),
            Setting::Loader(StaticLoader::found("origin", b"img", None).shared()),
        ])
        .build()
        .unwrap();

    let request = ImageRequest::new("img", "op:upper").unwrap().unsafe_request();
    let err = orchestrator.serve(request).await.unwrap_err();
    assert!(matches!(err, RelayError::ProcessFailed(_)));
    assert_eq!(orchestrator.error_response(&err).status, 422);
    assert_eq!(after.calls(), 0);
}

#[tokio::test]
async fn test_first_handling_processor_wins() {
    let first = Arc::new(UppercaseProcessor::default());
    let second = Arc::new(UppercaseProcessor::default());
    let orchestrator = Orchestrator::builder()
        .allow_unsafe(true)
        .apply([
            Setting::Processor(first.clone()),
            Setting::Processor(second.clone()),
            Setting::Loader(StaticLoader::found("origin", b"abc", None).shared()),
        ])
        .build()
        .unwrap();

    let request = ImageRequest::new("img", "op:upper").unwrap().unsafe_request();
    let response = orchestrator.serve(request).await.unwrap();
    assert_eq!(response.blob.as_bytes().await.unwrap(), "ABC");
    assert_eq!(first.calls(), 1);
    assert_eq!(second.calls(), 0);
}

#[derive(Default)]
struct LifecycleProcessor {
    started: AtomicUsize,
    stopped: AtomicUsize,
}

#[async_trait]
impl Processor for LifecycleProcessor {
    fn name(&self) -> &str {
        "lifecycle"
    }

    async fn startup(&self) -> Result<()> {
        self.started.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn process(&self, _blob: &Blob, _params: &Params) -> Result<Processed> {
        Ok(Processed::Declined)
    }

    async fn shutdown(&self) -> Result<()> {
        self.stopped.fetch_add(1, Ordering::SeqCst);
        Err(RelayError::InternalError("already stopped".to_string()))
    }
}

#[tokio::test]
async fn test_processor_lifecycle_hooks() {
    let a = Arc::new(LifecycleProcessor::default());
    let b = Arc::new(LifecycleProcessor::default());
    let orchestrator = Orchestrator::builder()
        .apply([Setting::Processor(a.clone()), Setting::Processor(b.clone())])
        .build()
        .unwrap();

    orchestrator.startup().await.unwrap();
    assert_eq!(a.started.load(Ordering::SeqCst), 1);
    assert_eq!(b.started.load(Ordering::SeqCst), 1);

    // Every hook runs even though each one fails
    assert!(orchestrator.shutdown().await.is_err());
    assert_eq!(a.stopped.load(Ordering::SeqCst), 1);
    assert_eq!(b.stopped.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_file_storage_roundtrip_through_pipeline() {
    let originals = tempfile::tempdir().unwrap();
    let results = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(originals.path().join("photos")).unwrap();
    std::fs::write(originals.path().join("photos/cat.txt"), b"meow").unwrap();

    let orchestrator = Orchestrator::builder()
        .allow_unsafe(true)
        .loader(FileStorage::new(originals.path()))
        .result_storage(FileStorage::new(results.path()))
        .processor(UppercaseProcessor::default())
        .build()
        .unwrap();

    let request = ImageRequest::new("photos/cat.txt", "op:upper")
        .unwrap()
        .unsafe_request();
    let response = orchestrator.serve(request).await.unwrap();
    assert_eq!(response.blob.as_bytes().await.unwrap(), "MEOW");

    let written = std::fs::read(results.path().join("op:upper/photos/cat.txt")).unwrap();
    assert_eq!(written, b"MEOW");
}

mod common;

use common::{FailingStorage, StaticLoader, UppercaseProcessor, PNG_BYTES};
use image_relay::{HmacSigner, ImageRequest, Orchestrator, RelayError, Setting, Signer};
use std::sync::Arc;

struct Harness {
    orchestrator: Orchestrator,
    loader: Arc<StaticLoader>,
    storage: Arc<FailingStorage>,
    result_storage: Arc<FailingStorage>,
    processor: Arc<UppercaseProcessor>,
}

fn harness(signer: Option<HmacSigner>, allow_unsafe: bool) -> Harness {
    let loader = StaticLoader::found("origin", PNG_BYTES, None).shared();
    let storage = Arc::new(FailingStorage::default());
    let result_storage = Arc::new(FailingStorage::default());
    let processor = Arc::new(UppercaseProcessor::default());

    let mut builder = Orchestrator::builder().allow_unsafe(allow_unsafe).apply([
        Setting::Loader(loader.clone()),
        Setting::Storage(storage.clone()),
        Setting::ResultStorage(result_storage.clone()),
        Setting::Processor(processor.clone()),
    ]);
    if let Some(signer) = signer {
        builder = builder.signer(signer);
    }

    Harness {
        orchestrator: builder.build().unwrap(),
        loader,
        storage,
        result_storage,
        processor,
    }
}

impl Harness {
    fn untouched(&self) -> bool {
        self.loader.calls() == 0
            && self.storage.gets() == 0
            && self.storage.puts() == 0
            && self.result_storage.gets() == 0
            && self.result_storage.puts() == 0
            && self.processor.calls() == 0
    }
}

#[tokio::test]
async fn test_invalid_signature_touches_no_backend() {
    let h = harness(Some(HmacSigner::new("secret")), false);
    let request = ImageRequest::new("a.png", "op:upper")
        .unwrap()
        .with_signature("forged");

    let err = h.orchestrator.serve(request).await.unwrap_err();
    assert!(matches!(err, RelayError::Unauthorized));
    assert_eq!(h.orchestrator.error_response(&err).status, 403);
    assert!(h.untouched());
}

#[tokio::test]
async fn test_missing_signature_rejected() {
    let h = harness(Some(HmacSigner::new("secret")), false);
    let request = ImageRequest::new("a.png", "").unwrap();
    let err = h.orchestrator.serve(request).await.unwrap_err();
    assert!(matches!(err, RelayError::Unauthorized));
    assert!(h.untouched());
}

#[tokio::test]
async fn test_valid_signature_covers_params_and_key() {
    let signer = HmacSigner::new("secret");
    let signature = signer.sign("op:upper/a.png");
    let h = harness(Some(signer), false);

    let request = ImageRequest::new("a.png", "op:upper")
        .unwrap()
        .with_signature(signature.clone());
    assert!(h.orchestrator.serve(request).await.is_ok());
    assert_eq!(h.loader.calls(), 1);

    // Same signature, different params
    let tampered = ImageRequest::new("a.png", "op:upper,width:10")
        .unwrap()
        .with_signature(signature);
    let err = h.orchestrator.serve(tampered).await.unwrap_err();
    assert!(matches!(err, RelayError::Unauthorized));
    assert_eq!(h.loader.calls(), 1);
}

#[tokio::test]
async fn test_signed_request_without_signer_rejected() {
    let h = harness(None, false);
    let request = ImageRequest::new("a.png", "").unwrap().with_signature("anything");
    let err = h.orchestrator.serve(request).await.unwrap_err();
    assert!(matches!(err, RelayError::Unauthorized));
    assert!(h.untouched());
}

#[tokio::test]
async fn test_unsafe_needs_unsafe_mode() {
    let h = harness(Some(HmacSigner::new("secret")), false);
    let request = ImageRequest::new("a.png", "").unwrap().unsafe_request();
    assert!(h.orchestrator.serve(request).await.is_err());
    assert!(h.untouched());

    let h = harness(None, true);
    let request = ImageRequest::new("a.png", "").unwrap().unsafe_request();
    assert!(h.orchestrator.serve(request).await.is_ok());
    assert_eq!(h.loader.calls(), 1);
}

#[tokio::test]
async fn test_unauthorized_body_can_be_disabled() {
    let orchestrator = Orchestrator::builder()
        .signer(HmacSigner::new("secret"))
        .disable_error_body(true)
        .build()
        .unwrap();
    let request = ImageRequest::new("a.png", "").unwrap().with_signature("nope");
    let err = orchestrator.serve(request).await.unwrap_err();

    let rendered = orchestrator.error_response(&err);
    assert_eq!(rendered.status, 403);
    assert_eq!(rendered.kind, "unauthorized");
    assert!(rendered.body.is_empty());
}

#[test]
fn test_truncated_signatures() {
    let full = HmacSigner::new("secret");
    let short = HmacSigner::new("secret").with_truncate(8);
    let path = "width:300/photos/cat.jpg";

    assert_eq!(short.sign(path).len(), 8);
    assert!(full.sign(path).starts_with(&short.sign(path)));
    assert!(short.verify(path, &short.sign(path)));
    assert!(!short.verify(path, &full.sign(path)));
}

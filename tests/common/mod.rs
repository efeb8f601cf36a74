//! Test doubles shared by the integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use image_relay::{
    Blob, Loader, Params, Processed, Processor, RelayError, Result, Storage, StoredBlob,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

enum Behavior {
    Found(Bytes, Option<&'static str>),
    NotFound,
    Fail,
}

/// Loader with a fixed answer that counts how often it was asked
pub struct StaticLoader {
    name: String,
    behavior: Behavior,
    delay: Option<Duration>,
    modified: Option<SystemTime>,
    calls: AtomicUsize,
}

impl StaticLoader {
    fn build(name: &str, behavior: Behavior) -> Self {
        StaticLoader {
            name: name.to_string(),
            behavior,
            delay: None,
            modified: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn found(name: &str, data: &'static [u8], content_type: Option<&'static str>) -> Self {
        Self::build(name, Behavior::Found(Bytes::from_static(data), content_type))
    }

    pub fn not_found(name: &str) -> Self {
        Self::build(name, Behavior::NotFound)
    }

    pub fn failing(name: &str) -> Self {
        Self::build(name, Behavior::Fail)
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_modified(mut self, modified: SystemTime) -> Self {
        self.modified = Some(modified);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }
}

#[async_trait]
impl Loader for StaticLoader {
    fn name(&self) -> &str {
        &self.name
    }

    async fn load(&self, key: &str) -> Result<Blob> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        match &self.behavior {
            Behavior::Found(data, content_type) => Ok(Blob::from_bytes(data.clone(), *content_type)),
            Behavior::NotFound => Err(RelayError::NotFound(format!("{}: {}", self.name, key))),
            Behavior::Fail => Err(RelayError::origin_server_error(500, "origin exploded")),
        }
    }

    async fn stat(&self, _key: &str) -> Result<Option<SystemTime>> {
        Ok(self.modified)
    }
}

/// Storage whose reads always miss and whose writes always fail
#[derive(Default)]
pub struct FailingStorage {
    pub gets: AtomicUsize,
    pub puts: AtomicUsize,
}

impl FailingStorage {
    pub fn puts(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }

    pub fn gets(&self) -> usize {
        self.gets.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Storage for FailingStorage {
    fn name(&self) -> &str {
        "failing"
    }

    async fn get(&self, _key: &str) -> Result<Option<StoredBlob>> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        Ok(None)
    }

    async fn put(&self, key: &str, _blob: &Blob) -> Result<()> {
        self.puts.fetch_add(1, Ordering::SeqCst);
        Err(RelayError::BackendWrite(format!("disk full writing {}", key)))
    }
}

/// Storage whose reads fail outright
pub struct BrokenReadStorage;

#[async_trait]
impl Storage for BrokenReadStorage {
    fn name(&self) -> &str {
        "broken"
    }

    async fn get(&self, _key: &str) -> Result<Option<StoredBlob>> {
        Err(RelayError::IoError("connection reset".to_string()))
    }

    async fn put(&self, _key: &str, _blob: &Blob) -> Result<()> {
        Ok(())
    }
}

/// Uppercases content for `op:upper`, declines anything else
#[derive(Default)]
pub struct UppercaseProcessor {
    calls: AtomicUsize,
}

impl UppercaseProcessor {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Processor for UppercaseProcessor {
    fn name(&self) -> &str {
        "uppercase"
    }

    async fn process(&self, blob: &Blob, params: &Params) -> Result<Processed> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if params.get("op") != Some("upper") {
            return Ok(Processed::Declined);
        }
        let data = blob.as_bytes().await?;
        let upper = Bytes::from(data.to_ascii_uppercase());
        Ok(Processed::Transformed(Blob::from_bytes(
            upper,
            blob.declared_content_type(),
        )))
    }
}

/// Holds each request for a while and records peak concurrency
pub struct BlockingProcessor {
    hold: Duration,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    entered: AtomicUsize,
    completed: AtomicUsize,
}

impl BlockingProcessor {
    pub fn new(hold: Duration) -> Self {
        BlockingProcessor {
            hold,
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            entered: AtomicUsize::new(0),
            completed: AtomicUsize::new(0),
        }
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn entered(&self) -> usize {
        self.entered.load(Ordering::SeqCst)
    }

    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Processor for BlockingProcessor {
    fn name(&self) -> &str {
        "blocking"
    }

    async fn process(&self, blob: &Blob, _params: &Params) -> Result<Processed> {
        self.entered.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.hold).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.completed.fetch_add(1, Ordering::SeqCst);
        Ok(Processed::Transformed(blob.clone()))
    }
}

/// Fails every invocation
pub struct FailingProcessor;

#[async_trait]
impl Processor for FailingProcessor {
    fn name(&self) -> &str {
        "failing"
    }

    async fn process(&self, _blob: &Blob, _params: &Params) -> Result<Processed> {
        Err(RelayError::ProcessFailed("corrupt image".to_string()))
    }
}

pub const PNG_BYTES: &[u8] = &[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0, 0, 0, 0];

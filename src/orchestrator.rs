//! Request pipeline
//!
//! Every request walks the same stages:
//!
//! ```text
//! Verifying -> ResultCacheCheck -> Loading -> OriginalCacheWrite
//!           -> Processing -> ResultCacheWrite -> Responding
//! ```
//!
//! A result-cache hit jumps straight to `Responding`. A failure in
//! verification, loading or processing ends the request with an error; a
//! failure in either write stage is logged and counted but the request still
//! succeeds. The whole walk is bounded by the request timeout, and each stage
//! by the smaller of its own timeout and the time left.

use crate::backend::Storage;
use crate::blob::Blob;
use crate::error::{Result, RelayError};
use crate::metrics::RelayMetrics;
use crate::options::{OrchestratorBuilder, Settings};
use crate::params::{ImageRequest, OutputFormat, Params, FORMAT_PARAM};
use crate::processor::Processed;
use crate::response::{self, CachePolicy, CacheStatus, ErrorResponse, RelayResponse};
use futures::future::join_all;
use http::StatusCode;
use prometheus::IntGauge;
use std::fmt;
use std::time::{Duration, SystemTime};
use tokio::sync::Semaphore;
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, info, warn};

/// Pipeline stages, as they appear in logs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Verifying,
    ResultCacheCheck,
    Loading,
    OriginalCacheWrite,
    Processing,
    ResultCacheWrite,
    Responding,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Verifying => "verifying",
            Stage::ResultCacheCheck => "result_cache_check",
            Stage::Loading => "loading",
            Stage::OriginalCacheWrite => "original_cache_write",
            Stage::Processing => "processing",
            Stage::ResultCacheWrite => "result_cache_write",
            Stage::Responding => "responding",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Runs image requests through the pipeline
///
/// Built once through [`OrchestratorBuilder`] and shared, typically behind an
/// `Arc`, by every request. Its settings never change after construction.
pub struct Orchestrator {
    settings: Settings,
    limiter: Option<Semaphore>,
    metrics: RelayMetrics,
}

impl Orchestrator {
    pub(crate) fn new(settings: Settings, metrics: RelayMetrics) -> Self {
        let limiter = match settings.process_concurrency {
            0 => None,
            n => Some(Semaphore::new(n)),
        };
        Orchestrator {
            settings,
            limiter,
            metrics,
        }
    }

    pub fn builder() -> OrchestratorBuilder {
        OrchestratorBuilder::new()
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn metrics(&self) -> &RelayMetrics {
        &self.metrics
    }

    /// Run processor startup hooks in registration order
    pub async fn startup(&self) -> Result<()> {
        for processor in &self.settings.processors {
            processor.startup().await?;
            debug!("Processor started: {}", processor.name());
        }
        info!("Orchestrator started: {:?}", self.settings);
        Ok(())
    }

    /// Run processor shutdown hooks in registration order
    ///
    /// Every hook runs even if an earlier one fails; the first failure is
    /// returned.
    pub async fn shutdown(&self) -> Result<()> {
        let mut first_error = None;
        for processor in &self.settings.processors {
            if let Err(e) = processor.shutdown().await {
                warn!("Processor shutdown failed: name={}, error={}", processor.name(), e);
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Serve one request end to end
    pub async fn serve(&self, request: ImageRequest) -> Result<RelayResponse> {
        let started = Instant::now();
        let deadline = started + self.settings.request_timeout;
        let key = request.key.clone();

        let result = match timeout_at(deadline, self.run(request, started, deadline)).await {
            Ok(result) => result,
            Err(_) => Err(RelayError::Timeout(format!(
                "request exceeded {:?}",
                self.settings.request_timeout
            ))),
        };

        let elapsed = started.elapsed();
        match &result {
            Ok(response) => {
                self.metrics.record_request("success", elapsed);
                info!(
                    "Served image: key={}, cache={:?}, size={}, duration_ms={}",
                    key,
                    response.cache_status,
                    response.blob.size(),
                    elapsed.as_millis()
                );
            }
            Err(e) => {
                self.metrics.record_request(e.kind(), elapsed);
                warn!(
                    "Request failed: key={}, status={}, duration_ms={}, error={}",
                    key,
                    e.to_http_status(),
                    elapsed.as_millis(),
                    e
                );
            }
        }
        result
    }

    /// Render an error the way this orchestrator is configured to
    pub fn error_response(&self, err: &RelayError) -> ErrorResponse {
        response::error_response(err, self.settings.disable_error_body)
    }

    pub fn cache_policy(&self) -> CachePolicy {
        CachePolicy {
            ttl: self.settings.cache_header_ttl,
            stale_while_revalidate: self.settings.cache_header_swr,
        }
    }

    async fn run(
        &self,
        mut request: ImageRequest,
        started: Instant,
        deadline: Instant,
    ) -> Result<RelayResponse> {
        self.verify(&request)?;
        self.trace_stage(Stage::Verifying, &request.key, started);

        self.negotiate_format(&mut request);

        let result_key = if self.settings.result_storages.is_empty() {
            None
        } else {
            Some(
                self.settings
                    .result_key
                    .derive(&request.key, &request.params),
            )
        };

        if let Some(result_key) = &result_key {
            let cached = self
                .check_result_cache(&request.key, result_key, deadline)
                .await;
            self.trace_stage(Stage::ResultCacheCheck, &request.key, started);
            if let Some(blob) = cached {
                let response = self.respond(blob, CacheStatus::Hit);
                self.trace_stage(Stage::Responding, &request.key, started);
                return Ok(response);
            }
        }

        let (original, from_storage) = self.load_original(&request.key, deadline).await?;
        self.trace_stage(Stage::Loading, &request.key, started);

        if !from_storage && !self.settings.storages.is_empty() {
            self.write_all(
                &self.settings.storages,
                &request.key,
                &original,
                deadline,
                "original",
            )
            .await;
            self.trace_stage(Stage::OriginalCacheWrite, &request.key, started);
        }

        let output = self.process(original, &request.params, deadline).await?;
        self.trace_stage(Stage::Processing, &request.key, started);

        if let Some(result_key) = &result_key {
            self.write_all(
                &self.settings.result_storages,
                result_key,
                &output,
                deadline,
                "result",
            )
            .await;
            self.trace_stage(Stage::ResultCacheWrite, &request.key, started);
        }

        let response = self.respond(output, CacheStatus::Miss);
        self.trace_stage(Stage::Responding, &request.key, started);
        Ok(response)
    }

    fn verify(&self, request: &ImageRequest) -> Result<()> {
        if request.is_unsafe && self.settings.allow_unsafe {
            return Ok(());
        }

        let signature = request.signature.as_deref().ok_or(RelayError::Unauthorized)?;
        let signer = self
            .settings
            .signer
            .as_ref()
            .ok_or(RelayError::Unauthorized)?;

        if signer.verify(&request.signed_path(), signature) {
            Ok(())
        } else {
            debug!("Signature mismatch: key={}", request.key);
            Err(RelayError::Unauthorized)
        }
    }

    /// Pick an output format from the caller's `Accept` support
    ///
    /// An explicit format parameter always wins. AVIF is preferred over WebP.
    fn negotiate_format(&self, request: &mut ImageRequest) {
        if request.params.contains(FORMAT_PARAM) {
            return;
        }
        let format = if self.settings.auto_avif && request.accept.avif {
            OutputFormat::Avif
        } else if self.settings.auto_webp && request.accept.webp {
            OutputFormat::Webp
        } else {
            return;
        };
        debug!("Negotiated output format: key={}, format={}", request.key, format.as_str());
        request.params.set(FORMAT_PARAM, format.as_str());
    }

    /// Look the result up in each result storage in turn
    ///
    /// Read errors are logged and the next storage is tried. With the
    /// modified-time check enabled, a hit older than the original is a miss.
    async fn check_result_cache(
        &self,
        key: &str,
        result_key: &str,
        deadline: Instant,
    ) -> Option<Blob> {
        for storage in &self.settings.result_storages {
            let budget = stage_budget(deadline, self.settings.load_timeout);
            let stored = match timeout(budget, storage.get(result_key)).await {
                Ok(Ok(Some(stored))) => stored,
                Ok(Ok(None)) => continue,
                Ok(Err(e)) => {
                    warn!(
                        "Result storage read failed: storage={}, key={}, error={}",
                        storage.name(),
                        result_key,
                        e
                    );
                    continue;
                }
                Err(_) => {
                    warn!(
                        "Result storage read timed out: storage={}, key={}",
                        storage.name(),
                        result_key
                    );
                    continue;
                }
            };

            if self.settings.modified_time_check {
                if let (Some(cached), Some(original)) =
                    (stored.modified, self.original_modified(key, deadline).await)
                {
                    if cached < original {
                        debug!("Result cache stale: key={}, storage={}", result_key, storage.name());
                        self.metrics.record_result_cache("stale");
                        return None;
                    }
                }
            }

            debug!("Result cache hit: key={}, storage={}", result_key, storage.name());
            self.metrics.record_result_cache("hit");
            return Some(stored.blob);
        }

        self.metrics.record_result_cache("miss");
        None
    }

    /// Modified time of the original, from the first storage then the first
    /// loader that reports one
    async fn original_modified(&self, key: &str, deadline: Instant) -> Option<SystemTime> {
        let budget = stage_budget(deadline, self.settings.load_timeout);
        if let Some(storage) = self.settings.storages.first() {
            if let Ok(Ok(Some(modified))) = timeout(budget, storage.stat(key)).await {
                return Some(modified);
            }
        }
        if let Some(loader) = self.settings.loaders.first() {
            if let Ok(Ok(Some(modified))) = timeout(budget, loader.stat(key)).await {
                return Some(modified);
            }
        }
        None
    }

    /// Fetch the original, returning whether it came from a storage
    async fn load_original(&self, key: &str, deadline: Instant) -> Result<(Blob, bool)> {
        for storage in &self.settings.storages {
            let budget = stage_budget(deadline, self.settings.load_timeout);
            match timeout(budget, storage.get(key)).await {
                Ok(Ok(Some(stored))) => {
                    debug!("Original found in storage: key={}, storage={}", key, storage.name());
                    return Ok((stored.blob, true));
                }
                Ok(Ok(None)) => {}
                Ok(Err(e)) => warn!(
                    "Storage read failed: storage={}, key={}, error={}",
                    storage.name(),
                    key,
                    e
                ),
                Err(_) => warn!("Storage read timed out: storage={}, key={}", storage.name(), key),
            }
        }

        for loader in &self.settings.loaders {
            let budget = stage_budget(deadline, self.settings.load_timeout);
            match timeout(budget, loader.load(key)).await {
                Ok(Ok(blob)) => {
                    self.metrics.record_loader_attempt(loader.name(), "ok");
                    debug!(
                        "Original loaded: key={}, loader={}, size={}",
                        key,
                        loader.name(),
                        blob.size()
                    );
                    return Ok((blob, false));
                }
                Ok(Err(e)) if e.is_not_found() => {
                    self.metrics.record_loader_attempt(loader.name(), "not_found");
                    debug!("Loader has no such key: key={}, loader={}", key, loader.name());
                }
                Ok(Err(e)) => {
                    self.metrics.record_loader_attempt(loader.name(), "error");
                    return Err(e);
                }
                Err(_) => {
                    self.metrics.record_loader_attempt(loader.name(), "timeout");
                    return Err(RelayError::Timeout(format!(
                        "loader {} exceeded {:?}",
                        loader.name(),
                        budget
                    )));
                }
            }
        }

        Err(RelayError::NotFound(key.to_string()))
    }

    /// Write a blob to every storage concurrently; failures are only logged
    async fn write_all(
        &self,
        storages: &[std::sync::Arc<dyn Storage>],
        key: &str,
        blob: &Blob,
        deadline: Instant,
        stage: &str,
    ) {
        let budget = stage_budget(deadline, self.settings.save_timeout);
        let writes = storages.iter().map(|storage| async move {
            (storage.name(), timeout(budget, storage.put(key, blob)).await)
        });

        for (name, outcome) in join_all(writes).await {
            match outcome {
                Ok(Ok(())) => debug!("Stored {}: storage={}, key={}", stage, name, key),
                Ok(Err(e)) => {
                    self.metrics.record_write_failure(stage);
                    warn!(
                        "Storage write failed: stage={}, storage={}, key={}, error={}",
                        stage, name, key, e
                    );
                }
                Err(_) => {
                    self.metrics.record_write_failure(stage);
                    warn!(
                        "Storage write timed out: stage={}, storage={}, key={}, budget={:?}",
                        stage, name, key, budget
                    );
                }
            }
        }
    }

    /// Run processors under the concurrency limit
    ///
    /// Waiting for a slot counts against the request deadline only; the
    /// process timeout starts once a slot is held.
    async fn process(&self, original: Blob, params: &Params, deadline: Instant) -> Result<Blob> {
        if self.settings.processors.is_empty() {
            return Ok(original);
        }

        let queued = Instant::now();
        let _permit = match &self.limiter {
            Some(limiter) => match timeout_at(deadline, limiter.acquire()).await {
                Ok(Ok(permit)) => Some(permit),
                Ok(Err(_)) => {
                    return Err(RelayError::InternalError(
                        "processing limiter closed".to_string(),
                    ))
                }
                Err(_) => {
                    return Err(RelayError::Timeout(
                        "waiting for a processing slot".to_string(),
                    ))
                }
            },
            None => None,
        };
        self.metrics.record_queue_wait(queued.elapsed());

        let _in_flight = InFlight::enter(&self.metrics.processing_in_flight);
        let budget = stage_budget(deadline, self.settings.process_timeout);
        let started = Instant::now();
        let result = timeout(budget, self.run_processors(original, params)).await;
        self.metrics.record_process_duration(started.elapsed());

        match result {
            Ok(result) => result,
            Err(_) => Err(RelayError::Timeout(format!(
                "processing exceeded {:?}",
                budget
            ))),
        }
    }

    async fn run_processors(&self, original: Blob, params: &Params) -> Result<Blob> {
        for processor in &self.settings.processors {
            match processor.process(&original, params).await {
                Ok(Processed::Transformed(output)) => {
                    debug!(
                        "Processed: processor={}, params={}, size={}",
                        processor.name(),
                        params,
                        output.size()
                    );
                    return Ok(output);
                }
                Ok(Processed::Declined) => {
                    debug!("Processor declined: processor={}, params={}", processor.name(), params);
                }
                Err(e @ (RelayError::ProcessFailed(_) | RelayError::Timeout(_))) => return Err(e),
                Err(e) => {
                    return Err(RelayError::ProcessFailed(format!(
                        "{}: {}",
                        processor.name(),
                        e
                    )))
                }
            }
        }
        Ok(original)
    }

    fn respond(&self, blob: Blob, cache_status: CacheStatus) -> RelayResponse {
        let headers = response::success_headers(
            &blob,
            &self.cache_policy(),
            self.settings.negotiates_format(),
        );
        RelayResponse {
            status: StatusCode::OK,
            headers,
            blob,
            cache_status,
        }
    }

    fn trace_stage(&self, stage: Stage, key: &str, started: Instant) {
        let elapsed_ms = started.elapsed().as_millis();
        if self.settings.debug {
            info!("Stage complete: stage={}, key={}, elapsed_ms={}", stage, key, elapsed_ms);
        } else {
            debug!("Stage complete: stage={}, key={}, elapsed_ms={}", stage, key, elapsed_ms);
        }
    }
}

/// Time a stage may use: its own timeout, capped by what is left
fn stage_budget(deadline: Instant, stage_timeout: Duration) -> Duration {
    deadline
        .saturating_duration_since(Instant::now())
        .min(stage_timeout)
}

/// Keeps the in-flight gauge accurate even when processing is cancelled
struct InFlight(IntGauge);

impl InFlight {
    fn enter(gauge: &IntGauge) -> Self {
        gauge.inc();
        InFlight(gauge.clone())
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.dec();
    }
}

//! Orchestrator settings and their builder
//!
//! Settings are assembled from a sequence of [`Setting`] mutations applied in
//! order. The two kinds of fields behave differently:
//!
//! - **Backend lists** (loaders, storages, result storages, processors) are
//!   additive. Every mutation appends, so several backends of the same kind
//!   coexist and are tried in the order they were registered.
//! - **Scalars** (timeouts, flags, TTLs, signer, result key) are
//!   last-mutator-wins. Durations of zero are ignored and keep the previous
//!   value.
//!
//! Once built, settings are immutable and shared by all requests.

use crate::backend::{Loader, Storage};
use crate::error::{Result, RelayError};
use crate::metrics::RelayMetrics;
use crate::orchestrator::Orchestrator;
use crate::processor::Processor;
use crate::result_key::{DefaultResultKey, ResultKey};
use crate::signer::Signer;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_STAGE_TIMEOUT: Duration = Duration::from_secs(20);
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(7 * 24 * 3600);
pub const DEFAULT_CACHE_SWR: Duration = Duration::from_secs(24 * 3600);

/// A single configuration mutation
#[derive(Clone)]
pub enum Setting {
    Loader(Arc<dyn Loader>),
    Storage(Arc<dyn Storage>),
    ResultStorage(Arc<dyn Storage>),
    Processor(Arc<dyn Processor>),
    RequestTimeout(Duration),
    LoadTimeout(Duration),
    SaveTimeout(Duration),
    ProcessTimeout(Duration),
    /// Maximum requests inside the processing stage; 0 means unbounded
    ProcessConcurrency(usize),
    /// Honor requests that ask to skip signature verification
    Unsafe(bool),
    AutoWebp(bool),
    AutoAvif(bool),
    CacheHeaderTtl(Duration),
    CacheHeaderSwr(Duration),
    /// Force the cache TTL to zero
    CacheHeaderNoCache(bool),
    ModifiedTimeCheck(bool),
    ResultKey(Arc<dyn ResultKey>),
    DisableErrorBody(bool),
    BasePathRedirect(String),
    Debug(bool),
    Signer(Arc<dyn Signer>),
}

/// Immutable orchestrator configuration
#[derive(Clone)]
pub struct Settings {
    pub loaders: Vec<Arc<dyn Loader>>,
    pub storages: Vec<Arc<dyn Storage>>,
    pub result_storages: Vec<Arc<dyn Storage>>,
    pub processors: Vec<Arc<dyn Processor>>,
    pub request_timeout: Duration,
    pub load_timeout: Duration,
    pub save_timeout: Duration,
    pub process_timeout: Duration,
    pub process_concurrency: usize,
    pub allow_unsafe: bool,
    pub auto_webp: bool,
    pub auto_avif: bool,
    pub cache_header_ttl: Duration,
    pub cache_header_swr: Duration,
    pub modified_time_check: bool,
    pub result_key: Arc<dyn ResultKey>,
    pub disable_error_body: bool,
    pub base_path_redirect: Option<String>,
    pub debug: bool,
    pub signer: Option<Arc<dyn Signer>>,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            loaders: Vec::new(),
            storages: Vec::new(),
            result_storages: Vec::new(),
            processors: Vec::new(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            load_timeout: DEFAULT_STAGE_TIMEOUT,
            save_timeout: DEFAULT_STAGE_TIMEOUT,
            process_timeout: DEFAULT_STAGE_TIMEOUT,
            process_concurrency: 0,
            allow_unsafe: false,
            auto_webp: false,
            auto_avif: false,
            cache_header_ttl: DEFAULT_CACHE_TTL,
            cache_header_swr: DEFAULT_CACHE_SWR,
            modified_time_check: false,
            result_key: Arc::new(DefaultResultKey),
            disable_error_body: false,
            base_path_redirect: None,
            debug: false,
            signer: None,
        }
    }
}

impl Settings {
    /// Apply one mutation
    pub fn apply(&mut self, setting: Setting) {
        match setting {
            Setting::Loader(loader) => self.loaders.push(loader),
            Setting::Storage(storage) => self.storages.push(storage),
            Setting::ResultStorage(storage) => self.result_storages.push(storage),
            Setting::Processor(processor) => self.processors.push(processor),
            Setting::RequestTimeout(d) => set_nonzero(&mut self.request_timeout, d),
            Setting::LoadTimeout(d) => set_nonzero(&mut self.load_timeout, d),
            Setting::SaveTimeout(d) => set_nonzero(&mut self.save_timeout, d),
            Setting::ProcessTimeout(d) => set_nonzero(&mut self.process_timeout, d),
            Setting::ProcessConcurrency(n) => self.process_concurrency = n,
            Setting::Unsafe(enabled) => self.allow_unsafe = enabled,
            Setting::AutoWebp(enabled) => self.auto_webp = enabled,
            Setting::AutoAvif(enabled) => self.auto_avif = enabled,
            Setting::CacheHeaderTtl(d) => set_nonzero(&mut self.cache_header_ttl, d),
            Setting::CacheHeaderSwr(d) => set_nonzero(&mut self.cache_header_swr, d),
            Setting::CacheHeaderNoCache(true) => self.cache_header_ttl = Duration::ZERO,
            Setting::CacheHeaderNoCache(false) => {}
            Setting::ModifiedTimeCheck(enabled) => self.modified_time_check = enabled,
            Setting::ResultKey(strategy) => self.result_key = strategy,
            Setting::DisableErrorBody(disabled) => self.disable_error_body = disabled,
            Setting::BasePathRedirect(url) => {
                self.base_path_redirect = if url.is_empty() { None } else { Some(url) }
            }
            Setting::Debug(enabled) => self.debug = enabled,
            Setting::Signer(signer) => self.signer = Some(signer),
        }
    }

    /// Clamp stage timeouts to the request timeout
    fn finish(&mut self) {
        for stage in [
            &mut self.load_timeout,
            &mut self.save_timeout,
            &mut self.process_timeout,
        ] {
            if stage.is_zero() || *stage > self.request_timeout {
                *stage = self.request_timeout;
            }
        }
        self.process_concurrency = self.process_concurrency.min(Semaphore::MAX_PERMITS);
    }

    /// Whether responses vary by the `Accept` header
    pub fn negotiates_format(&self) -> bool {
        self.auto_webp || self.auto_avif
    }
}

fn set_nonzero(field: &mut Duration, value: Duration) {
    if !value.is_zero() {
        *field = value;
    }
}

impl fmt::Debug for Settings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = |items: Vec<&str>| items.join(",");
        f.debug_struct("Settings")
            .field("loaders", &names(self.loaders.iter().map(|l| l.name()).collect()))
            .field("storages", &names(self.storages.iter().map(|s| s.name()).collect()))
            .field(
                "result_storages",
                &names(self.result_storages.iter().map(|s| s.name()).collect()),
            )
            .field("processors", &names(self.processors.iter().map(|p| p.name()).collect()))
            .field("request_timeout", &self.request_timeout)
            .field("load_timeout", &self.load_timeout)
            .field("save_timeout", &self.save_timeout)
            .field("process_timeout", &self.process_timeout)
            .field("process_concurrency", &self.process_concurrency)
            .field("allow_unsafe", &self.allow_unsafe)
            .field("auto_webp", &self.auto_webp)
            .field("auto_avif", &self.auto_avif)
            .field("cache_header_ttl", &self.cache_header_ttl)
            .field("cache_header_swr", &self.cache_header_swr)
            .field("modified_time_check", &self.modified_time_check)
            .field("disable_error_body", &self.disable_error_body)
            .field("base_path_redirect", &self.base_path_redirect)
            .field("debug", &self.debug)
            .field("signer", &self.signer.is_some())
            .finish()
    }
}

/// Builds an [`Orchestrator`] from a sequence of settings
#[derive(Default)]
pub struct OrchestratorBuilder {
    settings: Settings,
    metrics: Option<RelayMetrics>,
}

impl OrchestratorBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply settings in order
    pub fn apply(mut self, settings: impl IntoIterator<Item = Setting>) -> Self {
        for setting in settings {
            self.settings.apply(setting);
        }
        self
    }

    pub fn loader(self, loader: impl Loader + 'static) -> Self {
        self.apply([Setting::Loader(Arc::new(loader))])
    }

    pub fn storage(self, storage: impl Storage + 'static) -> Self {
        self.apply([Setting::Storage(Arc::new(storage))])
    }

    pub fn result_storage(self, storage: impl Storage + 'static) -> Self {
        self.apply([Setting::ResultStorage(Arc::new(storage))])
    }

    pub fn processor(self, processor: impl Processor + 'static) -> Self {
        self.apply([Setting::Processor(Arc::new(processor))])
    }

    pub fn request_timeout(self, timeout: Duration) -> Self {
        self.apply([Setting::RequestTimeout(timeout)])
    }

    pub fn load_timeout(self, timeout: Duration) -> Self {
        self.apply([Setting::LoadTimeout(timeout)])
    }

    pub fn save_timeout(self, timeout: Duration) -> Self {
        self.apply([Setting::SaveTimeout(timeout)])
    }

    pub fn process_timeout(self, timeout: Duration) -> Self {
        self.apply([Setting::ProcessTimeout(timeout)])
    }

    pub fn process_concurrency(self, limit: usize) -> Self {
        self.apply([Setting::ProcessConcurrency(limit)])
    }

    pub fn allow_unsafe(self, enabled: bool) -> Self {
        self.apply([Setting::Unsafe(enabled)])
    }

    pub fn auto_webp(self, enabled: bool) -> Self {
        self.apply([Setting::AutoWebp(enabled)])
    }

    pub fn auto_avif(self, enabled: bool) -> Self {
        self.apply([Setting::AutoAvif(enabled)])
    }

    pub fn cache_header_ttl(self, ttl: Duration) -> Self {
        self.apply([Setting::CacheHeaderTtl(ttl)])
    }

    pub fn cache_header_swr(self, swr: Duration) -> Self {
        self.apply([Setting::CacheHeaderSwr(swr)])
    }

    pub fn cache_header_no_cache(self, no_cache: bool) -> Self {
        self.apply([Setting::CacheHeaderNoCache(no_cache)])
    }

    pub fn modified_time_check(self, enabled: bool) -> Self {
        self.apply([Setting::ModifiedTimeCheck(enabled)])
    }

    pub fn result_key(self, strategy: impl ResultKey + 'static) -> Self {
        self.apply([Setting::ResultKey(Arc::new(strategy))])
    }

    pub fn disable_error_body(self, disabled: bool) -> Self {
        self.apply([Setting::DisableErrorBody(disabled)])
    }

    pub fn base_path_redirect(self, url: impl Into<String>) -> Self {
        self.apply([Setting::BasePathRedirect(url.into())])
    }

    pub fn debug(self, enabled: bool) -> Self {
        self.apply([Setting::Debug(enabled)])
    }

    pub fn signer(self, signer: impl Signer + 'static) -> Self {
        self.apply([Setting::Signer(Arc::new(signer))])
    }

    /// Use an existing metrics collector instead of a fresh one
    pub fn metrics(mut self, metrics: RelayMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Settings as they would be built, without constructing the orchestrator
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn build(mut self) -> Result<Orchestrator> {
        self.settings.finish();
        let metrics = match self.metrics {
            Some(metrics) => metrics,
            None => RelayMetrics::new()
                .map_err(|e| RelayError::ConfigError(format!("metrics registry: {}", e)))?,
        };
        Ok(Orchestrator::new(self.settings, metrics))
    }
}

//! HTTP origin loader

use super::Loader;
use crate::blob::Blob;
use crate::error::{Result, RelayError};
use async_trait::async_trait;
use bytes::BytesMut;
use chrono::DateTime;
use http::header::{CACHE_CONTROL, CONTENT_TYPE, ETAG, LAST_MODIFIED};
use http::StatusCode;
use reqwest::Client;
use std::time::{Duration, SystemTime};
use tokio::time::sleep;
use tracing::{debug, warn};

/// Retry policy for transient origin failures
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of retries
    pub max_retries: usize,
    /// Backoff durations in milliseconds for each retry attempt
    pub backoff_ms: Vec<u64>,
}

impl RetryPolicy {
    /// Create a new retry policy with exponential backoff
    pub fn new(max_retries: usize) -> Self {
        // 100ms, 200ms, 400ms, ...
        let backoff_ms = (0..max_retries)
            .map(|i| 100 * 2u64.pow(i as u32))
            .collect();

        RetryPolicy {
            max_retries,
            backoff_ms,
        }
    }

    /// Check if we should retry based on the attempt number and error
    pub fn should_retry(&self, attempt: usize, error: &RelayError) -> bool {
        attempt < self.max_retries && error.should_retry()
    }

    /// Get the backoff duration for a given attempt
    pub fn backoff_duration(&self, attempt: usize) -> Duration {
        let ms = self
            .backoff_ms
            .get(attempt)
            .copied()
            .unwrap_or_else(|| *self.backoff_ms.last().unwrap_or(&1000));
        Duration::from_millis(ms)
    }
}

/// Loads originals from an HTTP origin
///
/// Relative keys are joined onto `base_url`. Absolute `http(s)://` keys are
/// fetched as-is only when explicitly allowed; otherwise they are reported as
/// not found so that other loaders can try.
pub struct HttpLoader {
    name: String,
    client: Client,
    base_url: Option<String>,
    allow_absolute: bool,
    max_body_bytes: Option<u64>,
    retry_policy: RetryPolicy,
}

impl HttpLoader {
    /// Create a loader for `base_url`
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let mut loader = Self::build(Duration::from_secs(30))?;
        loader.base_url = Some(base_url.into());
        Ok(loader)
    }

    /// Create a loader that only accepts absolute URLs as keys
    pub fn absolute() -> Result<Self> {
        let mut loader = Self::build(Duration::from_secs(30))?;
        loader.allow_absolute = true;
        Ok(loader)
    }

    fn build(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_nodelay(true)
            .build()
            .map_err(|e| RelayError::HttpError(format!("Failed to create HTTP client: {}", e)))?;

        Ok(HttpLoader {
            name: "http".to_string(),
            client,
            base_url: None,
            allow_absolute: false,
            max_body_bytes: None,
            retry_policy: RetryPolicy::new(0),
        })
    }

    pub fn with_allow_absolute(mut self, allow: bool) -> Self {
        self.allow_absolute = allow;
        self
    }

    pub fn with_max_body_bytes(mut self, max: u64) -> Self {
        self.max_body_bytes = if max > 0 { Some(max) } else { None };
        self
    }

    pub fn with_retries(mut self, max_retries: usize) -> Self {
        self.retry_policy = RetryPolicy::new(max_retries);
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// URL to fetch for a key
    pub fn resolve_url(&self, key: &str) -> Result<String> {
        if key.starts_with("http://") || key.starts_with("https://") {
            if self.allow_absolute {
                return Ok(key.to_string());
            }
            return Err(RelayError::NotFound(format!(
                "{}: absolute URLs are not allowed",
                self.name
            )));
        }

        match &self.base_url {
            Some(base) => Ok(format!(
                "{}/{}",
                base.trim_end_matches('/'),
                key.trim_start_matches('/')
            )),
            None => Err(RelayError::NotFound(format!(
                "{}: no base URL for relative key",
                self.name
            ))),
        }
    }

    async fn try_load(&self, url: &str) -> Result<Blob> {
        let mut response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| request_error("GET", url, e))?;

        let status = response.status();
        debug!("Origin responded: url={}, status={}", url, status);

        if !status.is_success() {
            return Err(RelayError::from_http_status(
                status.as_u16(),
                format!("{} returned {}", url, status),
            ));
        }

        if let (Some(max), Some(len)) = (self.max_body_bytes, response.content_length()) {
            if len > max {
                return Err(RelayError::origin_client_error(
                    413,
                    format!("{} is {} bytes, limit is {}", url, len, max),
                ));
            }
        }

        let headers = response.headers().clone();
        let content_type = headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        // Content-Length is optional, so the limit is enforced while reading
        let capacity = response.content_length().unwrap_or(0) as usize;
        let mut data = BytesMut::with_capacity(capacity);
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| RelayError::HttpError(format!("Failed to read response body: {}", e)))?
        {
            if let Some(max) = self.max_body_bytes {
                if (data.len() + chunk.len()) as u64 > max {
                    return Err(RelayError::origin_client_error(
                        413,
                        format!("{} exceeded body limit of {} bytes", url, max),
                    ));
                }
            }
            data.extend_from_slice(&chunk);
        }

        let mut blob = Blob::from_bytes(data.freeze(), content_type.as_deref());
        for name in [LAST_MODIFIED, ETAG, CACHE_CONTROL] {
            if let Some(value) = headers.get(&name) {
                blob = blob.with_header(name, value.clone());
            }
        }
        Ok(blob)
    }

    /// Ask the origin for `Last-Modified` without fetching the body
    async fn head_modified(&self, url: &str) -> Result<Option<SystemTime>> {
        let response = self
            .client
            .head(url)
            .send()
            .await
            .map_err(|e| request_error("HEAD", url, e))?;

        let status = response.status();
        debug!("Origin HEAD responded: url={}, status={}", url, status);

        if status == StatusCode::METHOD_NOT_ALLOWED || status == StatusCode::NOT_IMPLEMENTED {
            return Ok(None);
        }
        if !status.is_success() {
            let err = RelayError::from_http_status(
                status.as_u16(),
                format!("{} returned {}", url, status),
            );
            return if err.is_not_found() { Ok(None) } else { Err(err) };
        }

        Ok(response
            .headers()
            .get(LAST_MODIFIED)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_http_date))
    }
}

fn request_error(method: &str, url: &str, e: reqwest::Error) -> RelayError {
    if e.is_timeout() {
        RelayError::Timeout(format!("{} {}: {}", method, url, e))
    } else {
        RelayError::HttpError(format!("{} {}: {}", method, url, e))
    }
}

/// Parse an HTTP date such as `Wed, 21 Oct 2015 07:28:00 GMT`
pub fn parse_http_date(value: &str) -> Option<SystemTime> {
    DateTime::parse_from_rfc2822(value.trim())
        .ok()
        .map(SystemTime::from)
}

#[async_trait]
impl Loader for HttpLoader {
    fn name(&self) -> &str {
        &self.name
    }

    async fn load(&self, key: &str) -> Result<Blob> {
        let url = self.resolve_url(key)?;
        let mut attempt = 0;

        loop {
            match self.try_load(&url).await {
                Ok(blob) => return Ok(blob),
                Err(e) => {
                    if !self.retry_policy.should_retry(attempt, &e) {
                        return Err(e);
                    }

                    let backoff = self.retry_policy.backoff_duration(attempt);
                    warn!(
                        "Origin fetch failed for {} (attempt {}), retrying after {:?}: {}",
                        url,
                        attempt + 1,
                        backoff,
                        e
                    );
                    sleep(backoff).await;
                    attempt += 1;
                }
            }
        }
    }

    async fn stat(&self, key: &str) -> Result<Option<SystemTime>> {
        let url = match self.resolve_url(key) {
            Ok(url) => url,
            Err(e) if e.is_not_found() => return Ok(None),
            Err(e) => return Err(e),
        };
        self.head_modified(&url).await
    }
}

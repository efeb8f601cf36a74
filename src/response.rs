//! Responses and cache-header policy

use crate::blob::Blob;
use crate::error::RelayError;
use bytes::Bytes;
use http::header::{HeaderValue, CACHE_CONTROL, CONTENT_LENGTH, CONTENT_TYPE, VARY};
use http::{HeaderMap, StatusCode};
use serde::Serialize;
use std::time::Duration;

/// Where the served blob came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    /// Served from a result storage
    Hit,
    /// Produced by loading and processing
    Miss,
}

/// A successful pipeline result
#[derive(Debug, Clone)]
pub struct RelayResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub blob: Blob,
    pub cache_status: CacheStatus,
}

/// A failed pipeline result, ready to send
#[derive(Debug, Clone)]
pub struct ErrorResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    /// Empty when error bodies are disabled
    pub body: Bytes,
    pub kind: &'static str,
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    message: String,
    status: u16,
    kind: &'a str,
}

/// Cache-Control shaping for successful responses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CachePolicy {
    pub ttl: Duration,
    pub stale_while_revalidate: Duration,
}

impl CachePolicy {
    /// `Cache-Control` value for a successful response
    ///
    /// A zero TTL disables caching entirely. The SWR window never exceeds
    /// the TTL.
    pub fn cache_control(&self) -> String {
        let ttl = self.ttl.as_secs();
        if ttl == 0 {
            return no_cache_value().to_string();
        }

        let mut value = format!("public, s-maxage={}, max-age={}, no-transform", ttl, ttl);
        let swr = self.stale_while_revalidate.as_secs().min(ttl);
        if swr > 0 {
            value.push_str(&format!(", stale-while-revalidate={}", swr));
        }
        value
    }
}

fn no_cache_value() -> &'static str {
    "private, no-cache, no-store, must-revalidate"
}

/// Build the headers of a successful response
pub fn success_headers(blob: &Blob, policy: &CachePolicy, vary_accept: bool) -> HeaderMap {
    let mut headers = HeaderMap::new();
    if let Ok(value) = HeaderValue::from_str(blob.content_type()) {
        headers.insert(CONTENT_TYPE, value);
    }
    headers.insert(CONTENT_LENGTH, HeaderValue::from(blob.size()));
    if let Ok(value) = HeaderValue::from_str(&policy.cache_control()) {
        headers.insert(CACHE_CONTROL, value);
    }
    if vary_accept {
        headers.insert(VARY, HeaderValue::from_static("Accept"));
    }
    headers
}

/// Render an error into a response
///
/// The status always reflects the error classification. The JSON body is
/// left out when `disable_body` is set.
pub fn error_response(err: &RelayError, disable_body: bool) -> ErrorResponse {
    let status =
        StatusCode::from_u16(err.to_http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut headers = HeaderMap::new();
    headers.insert(CACHE_CONTROL, HeaderValue::from_static(no_cache_value()));

    let body = if disable_body {
        Bytes::new()
    } else {
        let payload = ErrorBody {
            message: err.to_string(),
            status: status.as_u16(),
            kind: err.kind(),
        };
        match serde_json::to_vec(&payload) {
            Ok(json) => {
                headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
                Bytes::from(json)
            }
            Err(_) => Bytes::new(),
        }
    };
    headers.insert(CONTENT_LENGTH, HeaderValue::from(body.len()));

    ErrorResponse {
        status,
        headers,
        body,
        kind: err.kind(),
    }
}

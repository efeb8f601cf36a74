//! HTTP front end
//!
//! Routes:
//! - `GET /health`: liveness
//! - `GET /metrics`: Prometheus text exposition
//! - `GET /`: redirect to the configured base path, or a banner
//! - `GET /{unsafe|signature}/[params/]key`: an image through the pipeline
//!
//! `HEAD` is accepted wherever `GET` is and returns the same headers.

use crate::error::{RelayError, Result};
use crate::orchestrator::Orchestrator;
use crate::params::{AcceptHint, ImageRequest, Params};
use crate::response::CacheStatus;
use http::header::{HeaderValue, ACCEPT, ALLOW, CACHE_CONTROL, CONTENT_LENGTH, CONTENT_TYPE, LOCATION};
use http::{HeaderMap, Method, Request, Response, StatusCode};
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, error, info};

const UNSAFE_SEGMENT: &str = "unsafe";
const BANNER: &str = concat!("image-relay ", env!("CARGO_PKG_VERSION"), "\n");

/// HTTP server in front of an [`Orchestrator`]
pub struct RelayServer {
    orchestrator: Arc<Orchestrator>,
    addr: SocketAddr,
}

impl RelayServer {
    pub fn new(orchestrator: Arc<Orchestrator>, addr: SocketAddr) -> Self {
        Self { orchestrator, addr }
    }

    /// Accept connections until the process is terminated
    pub async fn start(self) -> std::result::Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let listener = TcpListener::bind(self.addr).await?;
        info!("Image relay listening on http://{}", self.addr);
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener
    pub async fn serve(
        self,
        listener: TcpListener,
    ) -> std::result::Result<(), Box<dyn std::error::Error + Send + Sync>> {
        loop {
            let (stream, peer) = listener.accept().await?;
            let io = TokioIo::new(stream);
            let orchestrator = Arc::clone(&self.orchestrator);

            tokio::task::spawn(async move {
                let service = service_fn(move |req| {
                    let orchestrator = Arc::clone(&orchestrator);
                    async move { Ok::<_, Infallible>(handle(&orchestrator, req).await) }
                });

                if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                    error!("Error serving connection: peer={}, error={:?}", peer, err);
                }
            });
        }
    }
}

/// Map one HTTP request to a response
pub async fn handle<B>(orchestrator: &Orchestrator, req: Request<B>) -> Response<Full<Bytes>> {
    let (parts, _body) = req.into_parts();
    let head_only = parts.method == Method::HEAD;
    if parts.method != Method::GET && !head_only {
        let mut response = text_response(StatusCode::METHOD_NOT_ALLOWED, "method not allowed\n");
        response
            .headers_mut()
            .insert(ALLOW, HeaderValue::from_static("GET, HEAD"));
        return response;
    }

    let response = match parts.uri.path() {
        "/health" => text_response(StatusCode::OK, "ok\n"),
        "/metrics" => metrics_response(orchestrator),
        "/" => index_response(orchestrator),
        path => {
            let accept = parts
                .headers
                .get(ACCEPT)
                .and_then(|v| v.to_str().ok())
                .map(AcceptHint::from_accept)
                .unwrap_or_default();
            image_response(orchestrator, path, accept).await
        }
    };

    if head_only {
        let (parts, _) = response.into_parts();
        return Response::from_parts(parts, Full::new(Bytes::new()));
    }
    response
}

async fn image_response(
    orchestrator: &Orchestrator,
    path: &str,
    accept: AcceptHint,
) -> Response<Full<Bytes>> {
    let request = match parse_path(path) {
        Ok(request) => request.with_accept(accept),
        Err(e) => {
            debug!("Rejected path: path={}, error={}", path, e);
            return error_to_response(orchestrator, &e);
        }
    };

    let served = match orchestrator.serve(request).await {
        Ok(served) => served,
        Err(e) => return error_to_response(orchestrator, &e),
    };

    let body = match served.blob.as_bytes().await {
        Ok(body) => body,
        Err(e) => return error_to_response(orchestrator, &e),
    };

    let mut headers = served.headers;
    let cache = match served.cache_status {
        CacheStatus::Hit => "HIT",
        CacheStatus::Miss => "MISS",
    };
    headers.insert("x-cache", HeaderValue::from_static(cache));
    build_response(served.status, headers, body)
}

/// Parse `/{unsafe|signature}/[params/]key` into a request
///
/// The segment after the signature is taken as parameters only when it is a
/// valid parameter list and a key follows it, so keys such as
/// `https://host/a.jpg` pass through whole. The key is percent-decoded, and
/// signatures cover the decoded key.
pub fn parse_path(path: &str) -> Result<ImageRequest> {
    let path = path.trim_start_matches('/');
    let (auth, rest) = path
        .split_once('/')
        .ok_or_else(|| RelayError::InvalidRequest(format!("no resource key in '/{}'", path)))?;
    if auth.is_empty() || rest.is_empty() {
        return Err(RelayError::InvalidRequest(format!(
            "no resource key in '/{}'",
            path
        )));
    }

    let (raw_params, key) = match rest.split_once('/') {
        Some((candidate, key))
            if !key.is_empty() && candidate.contains(':') && Params::parse(candidate).is_ok() =>
        {
            (candidate, key)
        }
        _ => ("", rest),
    };

    let key = urlencoding::decode(key).map_err(|e| {
        RelayError::InvalidRequest(format!("key '{}' is not valid percent-encoded UTF-8: {}", key, e))
    })?;

    let request = ImageRequest::new(key.into_owned(), raw_params)?;
    if auth == UNSAFE_SEGMENT {
        Ok(request.unsafe_request())
    } else {
        Ok(request.with_signature(auth))
    }
}

fn error_to_response(orchestrator: &Orchestrator, err: &RelayError) -> Response<Full<Bytes>> {
    let rendered = orchestrator.error_response(err);
    build_response(rendered.status, rendered.headers, rendered.body)
}

fn build_response(status: StatusCode, headers: HeaderMap, body: Bytes) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body));
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}

fn text_response(status: StatusCode, body: &'static str) -> Response<Full<Bytes>> {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
    headers.insert(CONTENT_LENGTH, HeaderValue::from(body.len()));
    headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    build_response(status, headers, Bytes::from_static(body.as_bytes()))
}

fn metrics_response(orchestrator: &Orchestrator) -> Response<Full<Bytes>> {
    let body = orchestrator.metrics().gather_text();
    let mut headers = HeaderMap::new();
    headers.insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; version=0.0.4; charset=utf-8"),
    );
    headers.insert(CONTENT_LENGTH, HeaderValue::from(body.len()));
    build_response(StatusCode::OK, headers, Bytes::from(body))
}

fn index_response(orchestrator: &Orchestrator) -> Response<Full<Bytes>> {
    let redirect = orchestrator
        .settings()
        .base_path_redirect
        .as_deref()
        .and_then(|url| HeaderValue::from_str(url).ok());

    match redirect {
        Some(location) => {
            let mut headers = HeaderMap::new();
            headers.insert(LOCATION, location);
            headers.insert(CONTENT_LENGTH, HeaderValue::from(0u64));
            build_response(StatusCode::MOVED_PERMANENTLY, headers, Bytes::new())
        }
        None => text_response(StatusCode::OK, BANNER),
    }
}

//! Forwarding to the engine's internal HTTP endpoint.
//!
//! The upstream body is relayed as a stream: each chunk goes out as soon as the
//! engine produces it, and dropping the downstream response drops the upstream
//! connection with it. Only the wait for response headers is bounded.

use std::time::{Duration, Instant};

use axum::body::Body;
use axum::http::header::{self, HeaderMap, HeaderName, HeaderValue};
use axum::http::Method;
use axum::response::Response;
use bytes::Bytes;
use futures::TryStreamExt;
use tracing::{debug, warn};

use crate::config::ServerConfig;
use crate::server::error::AdapterError;

pub const X_REQUEST_ID: HeaderName = HeaderName::from_static("x-request-id");

/// Headers never copied to the engine: hop-by-hop headers plus the ones the
/// client recomputes for the new connection.
fn is_skipped_request_header(name: &HeaderName) -> bool {
    [
        header::HOST,
        header::CONNECTION,
        header::PROXY_AUTHENTICATE,
        header::PROXY_AUTHORIZATION,
        header::TE,
        header::TRAILER,
        header::TRANSFER_ENCODING,
        header::UPGRADE,
        header::CONTENT_LENGTH,
        header::ACCEPT_ENCODING,
    ]
    .contains(name)
}

/// A forwarded response whose headers have arrived.
pub struct Forwarded {
    pub response: Response,
    pub first_byte: Duration,
}

/// HTTP client for the engine.
#[derive(Clone)]
pub struct EngineClient {
    http: reqwest::Client,
    first_byte_timeout: Duration,
}

impl EngineClient {
    pub fn new(config: &ServerConfig) -> reqwest::Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout())
            .build()?;
        Ok(Self {
            http,
            first_byte_timeout: config.first_byte_timeout(),
        })
    }

    /// Send `body` to `base_url` + `path` and relay the engine's response.
    pub async fn forward(
        &self,
        base_url: &str,
        method: Method,
        path: &str,
        inbound: &HeaderMap,
        body: Bytes,
        request_id: &str,
    ) -> Result<Forwarded, AdapterError> {
        let url = format!("{base_url}{path}");
        let mut headers = upstream_headers(inbound);
        if let Ok(value) = HeaderValue::from_str(request_id) {
            headers.insert(X_REQUEST_ID, value);
        }

        debug!(request_id, %method, url, bytes = body.len(), "Forwarding to engine");

        let started = Instant::now();
        let send = self
            .http
            .request(method, &url)
            .headers(headers)
            .body(body)
            .send();

        let upstream = match tokio::time::timeout(self.first_byte_timeout, send).await {
            Ok(Ok(resp)) => resp,
            Ok(Err(e)) => return Err(classify_error(e, self.first_byte_timeout)),
            Err(_) => return Err(AdapterError::UpstreamTimeout(self.first_byte_timeout)),
        };
        let first_byte = started.elapsed();

        Ok(Forwarded {
            response: relay(upstream, request_id),
            first_byte,
        })
    }
}

fn upstream_headers(inbound: &HeaderMap) -> HeaderMap {
    let mut headers = HeaderMap::with_capacity(inbound.len());
    for (name, value) in inbound {
        if !is_skipped_request_header(name) && name.as_str() != "keep-alive" {
            headers.append(name.clone(), value.clone());
        }
    }
    headers
}

/// Status and `content-type` verbatim, body streamed, correlation id echoed.
fn relay(upstream: reqwest::Response, request_id: &str) -> Response {
    let status = upstream.status();
    let content_type = upstream.headers().get(header::CONTENT_TYPE).cloned();

    let request_id_owned = request_id.to_string();
    let stream = upstream.bytes_stream().inspect_err(move |e| {
        warn!(request_id = request_id_owned, "Engine stream interrupted: {e}");
    });

    let mut response = Response::new(Body::from_stream(stream));
    *response.status_mut() = status;
    if let Some(content_type) = content_type {
        response
            .headers_mut()
            .insert(header::CONTENT_TYPE, content_type);
    }
    set_request_id(&mut response, request_id);
    response
}

pub fn set_request_id(response: &mut Response, request_id: &str) {
    if let Ok(value) = HeaderValue::from_str(request_id) {
        response.headers_mut().insert(X_REQUEST_ID, value);
    }
}

fn classify_error(err: reqwest::Error, timeout: Duration) -> AdapterError {
    if err.is_timeout() {
        AdapterError::UpstreamTimeout(timeout)
    } else if err.is_connect() {
        AdapterError::unavailable(format!("connection to engine failed: {err}"))
    } else {
        AdapterError::unavailable(err.to_string())
    }
}

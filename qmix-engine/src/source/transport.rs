//! HTTP transport boundary
//!
//! Data sources talk to the network through [`HttpTransport`]. The transport
//! owns connection setup (DNS, TLS, redirects); sources only see a status,
//! headers and a stream of body chunks. Both calls take a [`CancelToken`] and
//! must return promptly once it is cancelled.
//!
//! [`ReqwestTransport`] drives an async `reqwest::Client` on its own tokio
//! runtime so blocking decode threads can use it. [`MemoryTransport`] serves
//! registered in-memory bodies.

use super::cancel::CancelToken;
use crate::error::{EngineError, Result};
use qmix_common::HttpConfig;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};
use url::Url;

/// Outgoing request description
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub url: Url,
    /// Byte offset to request with a `Range: bytes=N-` header
    pub range_start: Option<u64>,
    /// Extra request headers
    pub headers: Vec<(String, String)>,
}

impl HttpRequest {
    pub fn get(url: Url) -> Self {
        Self {
            url,
            range_start: None,
            headers: Vec::new(),
        }
    }

    pub fn with_range_start(mut self, offset: Option<u64>) -> Self {
        // A range starting at zero is the same as no range
        self.range_start = offset.filter(|&o| o > 0);
        self
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }
}

/// Pull-based response body
pub trait ChunkStream: Send {
    /// Next body chunk, `Ok(None)` at the end of the body
    ///
    /// Blocks until data arrives; returns `SourceInterrupted` once `cancel`
    /// fires.
    fn next_chunk(&mut self, cancel: &CancelToken) -> Result<Option<Vec<u8>>>;
}

/// Successful (2xx) response
pub struct HttpResponse {
    pub status: u16,
    /// Header names lowercased
    pub headers: HashMap<String, String>,
    /// Length of this response body, if announced
    pub content_length: Option<u64>,
    pub body: Box<dyn ChunkStream>,
}

impl std::fmt::Debug for HttpResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpResponse")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .field("content_length", &self.content_length)
            .finish_non_exhaustive()
    }
}

impl HttpResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// True if the server honored a range request
    pub fn is_partial(&self) -> bool {
        self.status == 206
    }

    /// Size of the whole resource, if the server told us
    ///
    /// From `Content-Range: bytes a-b/total` on partial responses, from the
    /// body length otherwise.
    pub fn total_length(&self) -> Option<u64> {
        if self.is_partial() {
            self.header("content-range")
                .and_then(|v| v.rsplit('/').next())
                .and_then(|t| t.trim().parse().ok())
        } else {
            self.content_length
        }
    }

    /// Parse a numeric header such as `icy-metaint`
    ///
    /// Values like `128,128` (some servers repeat `icy-br`) use the first number.
    pub fn numeric_header(&self, name: &str) -> Option<u64> {
        self.header(name)
            .and_then(|v| v.split(',').next())
            .and_then(|v| v.trim().parse().ok())
    }
}

/// Opens HTTP GET requests
pub trait HttpTransport: Send + Sync {
    /// Issue `request`
    ///
    /// # Returns
    /// A 2xx response, `SourceNotFound` for 4xx, `SourceUnavailable` for
    /// connection failures and 5xx, `SourceInterrupted` if cancelled.
    fn open(&self, request: &HttpRequest, cancel: &CancelToken) -> Result<HttpResponse>;
}

/// Map a status code to the engine's error classes
pub fn check_status(status: u16, url: &Url) -> Result<()> {
    match status {
        200..=299 => Ok(()),
        400..=499 => Err(EngineError::SourceNotFound(format!("HTTP {} for {}", status, url))),
        _ => Err(EngineError::SourceUnavailable(format!(
            "HTTP {} for {}",
            status, url
        ))),
    }
}

/// Runtime that shuts down without blocking when the last user goes away
///
/// Shared between the transport and every body stream it hands out.
struct RuntimeHolder(Option<tokio::runtime::Runtime>);

impl RuntimeHolder {
    fn handle(&self) -> Result<&tokio::runtime::Runtime> {
        self.0
            .as_ref()
            .ok_or_else(|| EngineError::InvalidState("HTTP runtime shut down".to_string()))
    }
}

impl Drop for RuntimeHolder {
    fn drop(&mut self) {
        if let Some(runtime) = self.0.take() {
            runtime.shutdown_background();
        }
    }
}

/// Network transport backed by reqwest
pub struct ReqwestTransport {
    client: reqwest::Client,
    runtime: Arc<RuntimeHolder>,
}

impl ReqwestTransport {
    pub fn new(config: &HttpConfig) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("qmix-http")
            .enable_all()
            .build()?;

        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout())
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(|e| EngineError::InvalidState(format!("HTTP client: {}", e)))?;

        debug!("HTTP transport ready (user agent {})", config.user_agent);
        Ok(Self {
            client,
            runtime: Arc::new(RuntimeHolder(Some(runtime))),
        })
    }
}

fn map_reqwest_error(err: reqwest::Error) -> EngineError {
    if let Some(status) = err.status() {
        if status.is_client_error() {
            return EngineError::SourceNotFound(err.to_string());
        }
    }
    EngineError::SourceUnavailable(err.to_string())
}

impl HttpTransport for ReqwestTransport {
    fn open(&self, request: &HttpRequest, cancel: &CancelToken) -> Result<HttpResponse> {
        let mut builder = self.client.get(request.url.clone());
        if let Some(offset) = request.range_start {
            builder = builder.header(reqwest::header::RANGE, format!("bytes={}-", offset));
        }
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let runtime = self.runtime.handle()?;
        let response = runtime.block_on(async {
            tokio::select! {
                _ = cancel.cancelled() => Err(EngineError::SourceInterrupted(
                    format!("open of {} cancelled", request.url),
                )),
                result = builder.send() => result.map_err(map_reqwest_error),
            }
        })?;

        let status = response.status().as_u16();
        check_status(status, &request.url)?;

        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_ascii_lowercase(), v.to_string()))
            })
            .collect::<HashMap<_, _>>();
        let content_length = response.content_length();

        debug!(
            "GET {} -> {} (length {:?}, range {:?})",
            request.url, status, content_length, request.range_start
        );

        Ok(HttpResponse {
            status,
            headers,
            content_length,
            body: Box::new(ReqwestChunkStream {
                response,
                runtime: self.runtime.clone(),
            }),
        })
    }
}

struct ReqwestChunkStream {
    response: reqwest::Response,
    runtime: Arc<RuntimeHolder>,
}

impl ChunkStream for ReqwestChunkStream {
    fn next_chunk(&mut self, cancel: &CancelToken) -> Result<Option<Vec<u8>>> {
        let runtime = self.runtime.clone();
        let runtime = runtime.handle()?;
        let response = &mut self.response;
        runtime.block_on(async {
            tokio::select! {
                _ = cancel.cancelled() => Err(EngineError::SourceInterrupted(
                    "body read cancelled".to_string(),
                )),
                chunk = response.chunk() => match chunk {
                    Ok(chunk) => Ok(chunk.map(|b| b.to_vec())),
                    Err(e) => {
                        warn!("HTTP body read failed: {}", e);
                        Err(EngineError::SourceUnavailable(e.to_string()))
                    }
                },
            }
        })
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    struct NoBody;

    impl ChunkStream for NoBody {
        fn next_chunk(&mut self, _cancel: &CancelToken) -> Result<Option<Vec<u8>>> {
            Ok(None)
        }
    }

    fn response(status: u16, headers: &[(&str, &str)], len: Option<u64>) -> HttpResponse {
        HttpResponse {
            status,
            headers: headers
                .iter()
                .map(|(k, v)| (k.to_ascii_lowercase(), v.to_string()))
                .collect(),
            content_length: len,
            body: Box::new(NoBody),
        }
    }

    #[test]
    fn test_status_classification() {
        let url = Url::parse("http://host/a.mp3").unwrap();
        assert!(check_status(200, &url).is_ok());
        assert!(check_status(206, &url).is_ok());
        assert!(matches!(check_status(404, &url), Err(EngineError::SourceNotFound(_))));
        assert!(matches!(check_status(503, &url), Err(EngineError::SourceUnavailable(_))));
    }

    #[test]
    fn test_total_length() {
        let partial = response(206, &[("Content-Range", "bytes 100-999/1000")], Some(900));
        assert_eq!(partial.total_length(), Some(1000));
        let full = response(200, &[], Some(1000));
        assert_eq!(full.total_length(), Some(1000));
        let live = response(200, &[], None);
        assert_eq!(live.total_length(), None);
    }

    #[test]
    fn test_numeric_header() {
        let r = response(200, &[("icy-br", "128,128"), ("icy-metaint", "8192")], None);
        assert_eq!(r.numeric_header("ICY-BR"), Some(128));
        assert_eq!(r.numeric_header("icy-metaint"), Some(8192));
        assert_eq!(r.numeric_header("icy-name"), None);
    }

    #[test]
    fn test_zero_range_is_dropped() {
        let url = Url::parse("http://host/a.mp3").unwrap();
        assert_eq!(HttpRequest::get(url.clone()).with_range_start(Some(0)).range_start, None);
        assert_eq!(HttpRequest::get(url).with_range_start(Some(5)).range_start, Some(5));
    }
}

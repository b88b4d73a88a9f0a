//! In-memory transport
//!
//! Serves registered bodies by URL with the same status and header behavior
//! as a real server: range requests, ICY headers, transient failures and
//! stalled connections can all be scripted. Used for pre-fetched content and
//! throughout the test suite.

use super::cancel::CancelToken;
use super::transport::{ChunkStream, HttpRequest, HttpResponse, HttpTransport};
use crate::error::{EngineError, Result};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::trace;

/// One servable resource
#[derive(Debug, Clone)]
pub struct MemoryResource {
    body: Arc<Vec<u8>>,
    headers: Vec<(String, String)>,
    chunk_size: usize,
    failures_remaining: u32,
    stall_after: Option<usize>,
    chunk_delay: Option<Duration>,
    honors_ranges: bool,
    live: bool,
    status: u16,
}

impl MemoryResource {
    pub fn new(body: Vec<u8>) -> Self {
        Self {
            body: Arc::new(body),
            headers: Vec::new(),
            chunk_size: 4096,
            failures_remaining: 0,
            stall_after: None,
            chunk_delay: None,
            honors_ranges: true,
            live: false,
            status: 200,
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_ascii_lowercase(), value.to_string()));
        self
    }

    /// Bytes handed out per body chunk
    pub fn chunk_size(mut self, size: usize) -> Self {
        self.chunk_size = size.max(1);
        self
    }

    /// Fail the next `n` opens with `SourceUnavailable`
    pub fn fail_times(mut self, n: u32) -> Self {
        self.failures_remaining = n;
        self
    }

    /// Stop delivering after `bytes` body bytes until cancelled
    pub fn stall_after(mut self, bytes: usize) -> Self {
        self.stall_after = Some(bytes);
        self
    }

    /// Sleep before each chunk
    pub fn chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = Some(delay);
        self
    }

    /// Answer range requests with the full body (status 200)
    pub fn ignore_ranges(mut self) -> Self {
        self.honors_ranges = false;
        self
    }

    /// Ignore range requests and omit the content length, like a live stream
    pub fn live(mut self) -> Self {
        self.honors_ranges = false;
        self.live = true;
        self
    }

    /// Respond with an error status
    pub fn status(mut self, status: u16) -> Self {
        self.status = status;
        self
    }
}

/// Transport over registered in-memory resources
#[derive(Debug, Default)]
pub struct MemoryTransport {
    resources: Mutex<HashMap<String, MemoryResource>>,
    requests: Mutex<Vec<HttpRequest>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the resource served at `url`
    pub fn insert(&self, url: &str, resource: MemoryResource) {
        lock(&self.resources).insert(url.to_string(), resource);
    }

    /// Every request issued so far, in order
    pub fn requests(&self) -> Vec<HttpRequest> {
        lock(&self.requests).clone()
    }

    /// Number of requests issued for `url`
    pub fn open_count(&self, url: &str) -> usize {
        lock(&self.requests)
            .iter()
            .filter(|r| r.url.as_str() == url)
            .count()
    }
}

impl HttpTransport for MemoryTransport {
    fn open(&self, request: &HttpRequest, cancel: &CancelToken) -> Result<HttpResponse> {
        lock(&self.requests).push(request.clone());
        if cancel.is_cancelled() {
            return Err(EngineError::SourceInterrupted("open cancelled".to_string()));
        }

        let resource = {
            let mut resources = lock(&self.resources);
            let Some(resource) = resources.get_mut(request.url.as_str()) else {
                return Err(EngineError::SourceNotFound(format!(
                    "HTTP 404 for {}",
                    request.url
                )));
            };
            if resource.failures_remaining > 0 {
                resource.failures_remaining -= 1;
                return Err(EngineError::SourceUnavailable(format!(
                    "connection reset by {}",
                    request.url
                )));
            }
            resource.clone()
        };
        super::transport::check_status(resource.status, &request.url)?;

        let len = resource.body.len() as u64;
        let mut headers: HashMap<String, String> = resource.headers.iter().cloned().collect();
        let (status, start, content_length) = match request.range_start {
            Some(offset) if resource.honors_ranges => {
                let offset = offset.min(len);
                headers.insert(
                    "content-range".to_string(),
                    format!("bytes {}-{}/{}", offset, len.saturating_sub(1), len),
                );
                (206, offset as usize, Some(len - offset))
            }
            _ if resource.live => (200, 0, None),
            _ => (200, 0, Some(len)),
        };
        if resource.honors_ranges {
            headers.insert("accept-ranges".to_string(), "bytes".to_string());
        }

        trace!(
            "memory GET {} -> {} from byte {}",
            request.url,
            status,
            start
        );
        Ok(HttpResponse {
            status,
            headers,
            content_length,
            body: Box::new(MemoryChunkStream {
                body: resource.body.clone(),
                pos: start,
                served: 0,
                chunk_size: resource.chunk_size,
                stall_after: resource.stall_after,
                chunk_delay: resource.chunk_delay,
            }),
        })
    }
}

struct MemoryChunkStream {
    body: Arc<Vec<u8>>,
    pos: usize,
    served: usize,
    chunk_size: usize,
    stall_after: Option<usize>,
    chunk_delay: Option<Duration>,
}

impl ChunkStream for MemoryChunkStream {
    fn next_chunk(&mut self, cancel: &CancelToken) -> Result<Option<Vec<u8>>> {
        let interrupted = || EngineError::SourceInterrupted("body read cancelled".to_string());
        if cancel.is_cancelled() {
            return Err(interrupted());
        }
        if self.pos >= self.body.len() {
            return Ok(None);
        }

        let mut take = self.chunk_size.min(self.body.len() - self.pos);
        if let Some(limit) = self.stall_after {
            if self.served >= limit {
                // Hang like a dead connection until torn down
                while !cancel.wait_timeout(Duration::from_secs(3600)) {}
                return Err(interrupted());
            }
            take = take.min(limit - self.served);
        }
        if let Some(delay) = self.chunk_delay {
            if cancel.wait_timeout(delay) {
                return Err(interrupted());
            }
        }

        let chunk = self.body[self.pos..self.pos + take].to_vec();
        self.pos += take;
        self.served += take;
        Ok(Some(chunk))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use url::Url;

    fn drain(mut response: HttpResponse) -> Vec<u8> {
        let cancel = CancelToken::new();
        let mut out = Vec::new();
        while let Some(chunk) = response.body.next_chunk(&cancel).unwrap() {
            out.extend(chunk);
        }
        out
    }

    #[test]
    fn test_serves_ranges() {
        let transport = MemoryTransport::new();
        transport.insert("http://h/a", MemoryResource::new((0..100u8).collect()).chunk_size(7));
        let url = Url::parse("http://h/a").unwrap();
        let cancel = CancelToken::new();

        let full = transport.open(&HttpRequest::get(url.clone()), &cancel).unwrap();
        assert_eq!(full.status, 200);
        assert_eq!(drain(full).len(), 100);

        let part = transport
            .open(&HttpRequest::get(url).with_range_start(Some(90)), &cancel)
            .unwrap();
        assert_eq!(part.status, 206);
        assert_eq!(part.total_length(), Some(100));
        assert_eq!(drain(part), (90..100u8).collect::<Vec<_>>());
        assert_eq!(transport.open_count("http://h/a"), 2);
    }

    #[test]
    fn test_failures_and_missing() {
        let transport = MemoryTransport::new();
        transport.insert("http://h/flaky", MemoryResource::new(vec![1]).fail_times(1));
        transport.insert("http://h/gone", MemoryResource::new(vec![]).status(410));
        let cancel = CancelToken::new();
        let get = |u: &str| HttpRequest::get(Url::parse(u).unwrap());

        assert!(matches!(
            transport.open(&get("http://h/flaky"), &cancel),
            Err(EngineError::SourceUnavailable(_))
        ));
        assert!(transport.open(&get("http://h/flaky"), &cancel).is_ok());
        assert!(matches!(
            transport.open(&get("http://h/missing"), &cancel),
            Err(EngineError::SourceNotFound(_))
        ));
        assert!(matches!(
            transport.open(&get("http://h/gone"), &cancel),
            Err(EngineError::SourceNotFound(_))
        ));
    }

    #[test]
    fn test_live_ignores_range() {
        let transport = MemoryTransport::new();
        transport.insert("http://h/live", MemoryResource::new(vec![9; 10]).live());
        let request = HttpRequest::get(Url::parse("http://h/live").unwrap()).with_range_start(Some(4));
        let response = transport.open(&request, &CancelToken::new()).unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.content_length, None);
        assert_eq!(drain(response).len(), 10);
    }
}

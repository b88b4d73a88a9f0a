//! Data sources
//!
//! A data source is a pull-based byte stream with seek, read by one entry's
//! decode thread. Three HTTP variants share one implementation:
//!
//! - [`HttpDataSource`]: plain byte stream
//! - [`MetadataSource`]: strips ICY interval metadata and reports it to a
//!   [`MetadataListener`] with the decoded-frame position it applies from
//! - [`AdaptiveSource`]: metadata source that can hot-swap its URL with
//!   [`DataSource::switch_to_url`]
//!
//! Blocking is confined to [`DataSource::read`] and [`DataSource::open`].
//! [`DataSource::close`] may be called from any thread and wakes a blocked
//! reader with `SourceInterrupted`.

pub mod adaptive;
pub mod cancel;
pub mod http;
pub mod icy;
pub mod memory;
pub mod metadata;
pub mod transport;

pub use adaptive::AdaptiveSource;
pub use cancel::CancelToken;
pub use http::HttpDataSource;
pub use memory::{MemoryResource, MemoryTransport};
pub use metadata::MetadataSource;
pub use transport::{ChunkStream, HttpRequest, HttpResponse, HttpTransport, ReqwestTransport};

use crate::decode::PcmFormat;
use crate::error::{EngineError, Result};
use qmix_common::{HttpConfig, SourceKind};
use std::sync::Arc;
use tracing::debug;
use url::Url;

/// Connection lifecycle of a data source
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SourceState {
    Idle = 0,
    Opening = 1,
    Reading = 2,
    EndOfStream = 3,
    Closed = 4,
    Failed = 5,
}

impl SourceState {
    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            1 => SourceState::Opening,
            2 => SourceState::Reading,
            3 => SourceState::EndOfStream,
            4 => SourceState::Closed,
            5 => SourceState::Failed,
            _ => SourceState::Idle,
        }
    }
}

/// Metadata found in the stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataEvent {
    /// Audio byte offset the metadata was found at (metadata bytes excluded)
    pub byte_offset: u64,
    /// Decoded-frame position of `byte_offset`, once the format is known
    pub frame: Option<u64>,
    /// Payload with NUL padding removed
    pub payload: Vec<u8>,
}

impl MetadataEvent {
    /// Payload as text (lossy UTF-8)
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }

    /// `StreamTitle` field, if present
    pub fn stream_title(&self) -> Option<String> {
        icy::parse_icy_fields(&self.text())
            .into_iter()
            .find(|(k, _)| k.eq_ignore_ascii_case("StreamTitle"))
            .map(|(_, v)| v)
    }
}

/// Receives metadata from a metadata source
///
/// Called on the decode thread; implementations must not block.
pub trait MetadataListener: Send + Sync {
    /// Stream started delivering audio
    fn did_start_receive(&self) {}

    /// Metadata arrived; delivered before any audio byte at or after
    /// `event.byte_offset`
    fn did_receive(&self, event: &MetadataEvent);
}

/// Listener that ignores everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopListener;

impl MetadataListener for NoopListener {
    fn did_receive(&self, _event: &MetadataEvent) {}
}

/// Pull-based byte stream read by one decode thread
pub trait DataSource: Send + Sync {
    /// URL currently being read
    fn locator(&self) -> Url;

    /// Connect, optionally starting at a byte offset
    ///
    /// Reopening an open source replaces its connection.
    fn open(&self, offset: Option<u64>) -> Result<()>;

    /// Copy up to `buf.len()` bytes
    ///
    /// # Returns
    /// Bytes copied, `0` at end of stream, or `SourceInterrupted` if the
    /// source was closed
    fn read(&self, buf: &mut [u8]) -> Result<usize>;

    /// Reconnect at `offset`
    fn seek(&self, offset: u64) -> Result<()>;

    /// Offset of the next byte `read` will return
    fn position(&self) -> u64;

    /// Offset one past the last byte received from the network
    fn available_byte_count(&self) -> u64;

    /// Total length, when the server announced one
    fn content_length(&self) -> Option<u64>;

    fn state(&self) -> SourceState;

    /// Tear down; idempotent. A blocked `read` returns `SourceInterrupted`.
    fn close(&self);

    /// Decoder reports the stream format
    fn format_detected(&self, _format: &PcmFormat) {}

    /// Continue the stream from a different URL
    fn switch_to_url(&self, url: &Url) -> Result<()> {
        Err(EngineError::SwitchFailed(format!(
            "{} does not support switching to {}",
            self.locator(),
            url
        )))
    }
}

/// Builds data sources for queue entries
pub trait SourceFactory: Send + Sync {
    fn create(
        &self,
        url: &Url,
        listener: Arc<dyn MetadataListener>,
    ) -> Result<Arc<dyn DataSource>>;
}

/// Creates HTTP data sources of the configured kind
pub struct HttpSourceFactory {
    transport: Arc<dyn HttpTransport>,
    config: HttpConfig,
    kind: SourceKind,
}

impl HttpSourceFactory {
    pub fn new(transport: Arc<dyn HttpTransport>, config: HttpConfig, kind: SourceKind) -> Self {
        Self {
            transport,
            config,
            kind,
        }
    }
}

impl SourceFactory for HttpSourceFactory {
    fn create(
        &self,
        url: &Url,
        listener: Arc<dyn MetadataListener>,
    ) -> Result<Arc<dyn DataSource>> {
        if !matches!(url.scheme(), "http" | "https") {
            return Err(EngineError::SourceNotFound(format!(
                "unsupported scheme in {}",
                url
            )));
        }
        debug!("Creating {:?} source for {}", self.kind, url);
        let transport = self.transport.clone();
        let source: Arc<dyn DataSource> = match self.kind {
            SourceKind::Plain => Arc::new(HttpDataSource::new(url.clone(), transport, &self.config, false)),
            SourceKind::Metadata => Arc::new(MetadataSource::new(
                url.clone(),
                transport,
                &self.config,
                listener,
            )),
            SourceKind::Adaptive => Arc::new(AdaptiveSource::new(
                url.clone(),
                transport,
                &self.config,
                listener,
            )),
        };
        Ok(source)
    }
}

//! Metadata-stripping data source
//!
//! Requests interleaved ICY metadata, removes it from the byte stream and
//! hands each block to a [`MetadataListener`] before any audio byte that
//! follows it is returned from `read`. The decoder never sees metadata bytes.

use super::http::{HttpDataSource, ReadStep};
use super::transport::HttpTransport;
use super::{DataSource, MetadataEvent, MetadataListener, SourceState};
use crate::decode::PcmFormat;
use crate::error::Result;
use qmix_common::timing::{bits_per_frame_from_kbps, byte_offset_to_frame};
use qmix_common::HttpConfig;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};
use url::Url;

/// HTTP source with ICY metadata stripping
pub struct MetadataSource {
    inner: HttpDataSource,
    listener: Arc<dyn MetadataListener>,
    sample_rate: AtomicU32,
    /// f64 bit pattern; zero while unknown
    bits_per_frame: AtomicU64,
    started: AtomicBool,
}

impl MetadataSource {
    pub fn new(
        url: Url,
        transport: Arc<dyn HttpTransport>,
        config: &HttpConfig,
        listener: Arc<dyn MetadataListener>,
    ) -> Self {
        Self {
            inner: HttpDataSource::new(url, transport, config, true),
            listener,
            sample_rate: AtomicU32::new(0),
            bits_per_frame: AtomicU64::new(0),
            started: AtomicBool::new(false),
        }
    }

    pub(crate) fn http(&self) -> &HttpDataSource {
        &self.inner
    }

    /// Compressed bits per decoded frame, if known
    ///
    /// The decoder's figure wins; otherwise it is derived from the
    /// connection's `icy-br` header and the decoded sample rate.
    pub fn bits_per_frame(&self) -> Option<f64> {
        let bits = self.bits_per_frame.load(Ordering::Acquire);
        if bits != 0 {
            return Some(f64::from_bits(bits));
        }
        let sample_rate = self.sample_rate.load(Ordering::Acquire);
        let (kbps, _) = self.inner.connection_info()?;
        bits_per_frame_from_kbps(kbps?, sample_rate)
    }

    fn mark_started(&self) {
        if !self.started.swap(true, Ordering::AcqRel) {
            debug!("Metadata stream {} started", self.inner.locator());
            self.listener.did_start_receive();
        }
    }
}

impl DataSource for MetadataSource {
    fn locator(&self) -> Url {
        self.inner.locator()
    }

    fn open(&self, offset: Option<u64>) -> Result<()> {
        self.inner.open(offset)
    }

    fn read(&self, buf: &mut [u8]) -> Result<usize> {
        loop {
            match self.inner.read_step(buf)? {
                ReadStep::Data(n) => {
                    if n > 0 {
                        self.mark_started();
                    }
                    return Ok(n);
                }
                ReadStep::End => return Ok(0),
                ReadStep::Metadata(block) => {
                    self.mark_started();
                    let event = MetadataEvent {
                        byte_offset: block.byte_offset,
                        frame: byte_offset_to_frame(block.byte_offset, self.bits_per_frame()),
                        payload: block.payload,
                    };
                    trace!(
                        "Metadata at byte {} (frame {:?}): {} bytes",
                        event.byte_offset,
                        event.frame,
                        event.payload.len()
                    );
                    self.listener.did_receive(&event);
                }
            }
        }
    }

    fn seek(&self, offset: u64) -> Result<()> {
        self.inner.seek(offset)
    }

    fn position(&self) -> u64 {
        self.inner.position()
    }

    fn available_byte_count(&self) -> u64 {
        self.inner.available_byte_count()
    }

    fn content_length(&self) -> Option<u64> {
        self.inner.content_length()
    }

    fn state(&self) -> SourceState {
        self.inner.state()
    }

    fn close(&self) {
        self.inner.close()
    }

    fn format_detected(&self, format: &PcmFormat) {
        self.sample_rate.store(format.sample_rate, Ordering::Release);
        if let Some(bpf) = format.bits_per_frame.filter(|b| *b > 0.0) {
            self.bits_per_frame.store(bpf.to_bits(), Ordering::Release);
        }
        debug!(
            "Format for {}: {} Hz, {} bits per frame",
            self.inner.locator(),
            format.sample_rate,
            self.bits_per_frame()
                .map_or_else(|| "unknown".to_string(), |b| format!("{:.3}", b))
        );
    }
}

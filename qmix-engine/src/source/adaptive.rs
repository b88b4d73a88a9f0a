//! Adaptive data source
//!
//! A metadata source whose URL can be swapped while the decode thread keeps
//! reading, e.g. to move between bitrate variants of the same program.
//!
//! The replacement connection is opened without holding any lock the reader
//! needs. Only once it is open is it installed, in a single step under the
//! connection lock, so the reader sees either the old stream or the new one.
//! A failed open leaves the old connection untouched.

use super::http::OffsetMapping;
use super::metadata::MetadataSource;
use super::transport::HttpTransport;
use super::{DataSource, MetadataListener, SourceState};
use crate::decode::PcmFormat;
use crate::error::{EngineError, Result};
use qmix_common::HttpConfig;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{info, warn};
use url::Url;

/// Metadata source with `switch_to_url`
pub struct AdaptiveSource {
    inner: MetadataSource,
    // Serializes switches so two cannot interleave their open/install steps
    switching: Mutex<()>,
}

impl AdaptiveSource {
    pub fn new(
        url: Url,
        transport: Arc<dyn HttpTransport>,
        config: &HttpConfig,
        listener: Arc<dyn MetadataListener>,
    ) -> Self {
        Self {
            inner: MetadataSource::new(url, transport, config, listener),
            switching: Mutex::new(()),
        }
    }

    pub fn bits_per_frame(&self) -> Option<f64> {
        self.inner.bits_per_frame()
    }

    fn switch_failed(url: &Url, err: EngineError) -> EngineError {
        match err {
            EngineError::SourceInterrupted(_) => err,
            other => EngineError::SwitchFailed(format!("{}: {}", url, other)),
        }
    }
}

impl DataSource for AdaptiveSource {
    fn locator(&self) -> Url {
        self.inner.locator()
    }

    fn open(&self, offset: Option<u64>) -> Result<()> {
        self.inner.open(offset)
    }

    fn read(&self, buf: &mut [u8]) -> Result<usize> {
        self.inner.read(buf)
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
        self.inner.format_detected(format)
    }

    /// Continue from `url` at the same audio position
    ///
    /// Bytes already returned by `read` are not fetched again. Bytes the
    /// reader consumes while the new connection is opening are skipped on
    /// it. When both streams announce `icy-br` and the rates differ, the
    /// position is scaled by the bitrate ratio; live streams continue from
    /// their live edge.
    ///
    /// # Returns
    /// `SwitchFailed` if the new URL cannot be opened; reads continue from
    /// the previous URL unaffected
    fn switch_to_url(&self, url: &Url) -> Result<()> {
        let _switching = self.switching.lock().unwrap_or_else(PoisonError::into_inner);
        let http = self.inner.http();
        if http.is_closed() {
            return Err(EngineError::SourceInterrupted(format!(
                "{} closed",
                self.locator()
            )));
        }

        let Some((old_kbps, old_live)) = http.connection_info() else {
            // Nothing open yet: the next open uses the new URL
            http.set_locator(url.clone());
            info!("Source switched to {} before open", url);
            return Ok(());
        };

        let opened_at = http.position();
        let offset = if old_live { None } else { Some(opened_at) };
        let conn = http
            .connect(url, offset)
            .map_err(|e| Self::switch_failed(url, e))?;

        let (conn, opened_at, mapping) = match (old_kbps, conn.bitrate_kbps()) {
            _ if conn.is_live() => (conn, opened_at, OffsetMapping::Live),
            (Some(old), Some(new)) if old != new && old > 0 && !old_live => {
                let ratio = new as f64 / old as f64;
                let mapped = (opened_at as f64 * ratio).round() as u64;
                conn.retire();
                let scaled = http
                    .connect(url, Some(mapped))
                    .map_err(|e| Self::switch_failed(url, e))?;
                // Scale the bytes read meanwhile from the position the
                // scaled connection was requested for
                (scaled, opened_at, OffsetMapping::Scaled(ratio))
            }
            _ => (conn, opened_at, OffsetMapping::Identity),
        };

        match http.install(conn, opened_at, mapping, Some(url)) {
            Ok(()) => {
                info!(
                    "Source switched to {} at byte {} ({:?})",
                    url,
                    http.position(),
                    mapping
                );
                Ok(())
            }
            Err(e) => {
                warn!("Switch to {} abandoned: {}", url, e);
                Err(e)
            }
        }
    }
}

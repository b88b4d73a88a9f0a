//! Decoder boundary
//!
//! Decoders are black boxes behind [`AudioDecoder`]: they pull compressed
//! bytes from a data source through [`SourceReader`] and hand back
//! interleaved `f32` PCM. The entry's decode thread then maps channels to
//! stereo and resamples to the output rate with [`StreamResampler`].
//!
//! Two implementations ship with the engine:
//! - [`SymphoniaDecoderFactory`]: container/codec probing via symphonia
//! - [`RawPcmDecoderFactory`]: headerless 16-bit little-endian PCM

pub mod raw;
pub mod resampler;
pub mod symphonia_decoder;

pub use self::raw::{RawPcmDecoder, RawPcmDecoderFactory};
pub use self::resampler::StreamResampler;
pub use self::symphonia_decoder::{SymphoniaDecoder, SymphoniaDecoderFactory};

use crate::error::{EngineError, Result};
use crate::source::DataSource;
use std::io;
use std::sync::Arc;
use url::Url;

/// Decoded stream format
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PcmFormat {
    pub sample_rate: u32,
    pub channels: u16,
    /// Compressed bits per decoded frame, for codecs with a fixed ratio
    pub bits_per_frame: Option<f64>,
}

impl PcmFormat {
    pub fn new(sample_rate: u32, channels: u16, bits_per_frame: Option<f64>) -> Self {
        Self {
            sample_rate,
            channels,
            bits_per_frame,
        }
    }
}

/// Incremental decoder
pub trait AudioDecoder: Send {
    /// Format of the samples returned by `next_chunk`
    fn format(&self) -> PcmFormat;

    /// Next run of interleaved samples, `Ok(None)` at end of stream
    ///
    /// Blocks on the underlying data source.
    fn next_chunk(&mut self) -> Result<Option<Vec<f32>>>;
}

/// Builds a decoder for an opened data source
pub trait DecoderFactory: Send + Sync {
    /// Probe the stream and build a decoder
    ///
    /// # Arguments
    /// * `reader` - Byte stream positioned at the start of the audio
    /// * `locator` - URL of the stream, for format hints
    fn create(&self, reader: SourceReader, locator: &Url) -> Result<Box<dyn AudioDecoder>>;
}

/// `std::io::Read` adapter over a data source
///
/// Engine errors are carried through `io::Error` with distinct kinds so
/// [`engine_error_from_io`] can restore their class. Interruption maps to
/// `ConnectionAborted`, not `Interrupted`, because readers retry on the
/// latter.
pub struct SourceReader {
    source: Arc<dyn DataSource>,
}

impl SourceReader {
    pub fn new(source: Arc<dyn DataSource>) -> Self {
        Self { source }
    }

    pub fn source(&self) -> &Arc<dyn DataSource> {
        &self.source
    }
}

impl io::Read for SourceReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.source.read(buf).map_err(io_error_from_engine)
    }
}

fn io_error_from_engine(err: EngineError) -> io::Error {
    let kind = match &err {
        EngineError::SourceInterrupted(_) => io::ErrorKind::ConnectionAborted,
        EngineError::SourceUnavailable(_) => io::ErrorKind::ConnectionReset,
        EngineError::SourceNotFound(_) => io::ErrorKind::NotFound,
        _ => io::ErrorKind::Other,
    };
    io::Error::new(kind, err.to_string())
}

/// Recover the engine error class from an I/O error raised by a reader
pub fn engine_error_from_io(err: &io::Error) -> EngineError {
    let message = err.to_string();
    match err.kind() {
        io::ErrorKind::ConnectionAborted => EngineError::SourceInterrupted(message),
        io::ErrorKind::ConnectionReset => EngineError::SourceUnavailable(message),
        io::ErrorKind::NotFound => EngineError::SourceNotFound(message),
        _ => EngineError::Decode(message),
    }
}

/// Convert interleaved samples of any channel count to interleaved stereo
///
/// Mono is duplicated to both sides; for more than two channels the first
/// two are kept.
pub fn map_to_stereo(samples: &[f32], channels: u16) -> Vec<f32> {
    match channels {
        2 => samples.to_vec(),
        0 => Vec::new(),
        1 => samples.iter().flat_map(|&s| [s, s]).collect(),
        n => samples
            .chunks_exact(n as usize)
            .flat_map(|frame| [frame[0], frame[1]])
            .collect(),
    }
}

/// File extension of a URL path, for probe hints
pub fn extension_hint(locator: &Url) -> Option<String> {
    let last = locator.path_segments()?.next_back()?;
    let (_, ext) = last.rsplit_once('.')?;
    (!ext.is_empty()).then(|| ext.to_ascii_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_to_stereo() {
        assert_eq!(map_to_stereo(&[0.1, 0.2], 1), vec![0.1, 0.1, 0.2, 0.2]);
        assert_eq!(map_to_stereo(&[0.1, 0.2], 2), vec![0.1, 0.2]);
        assert_eq!(
            map_to_stereo(&[0.1, 0.2, 0.3, 0.4, 0.5, 0.6], 3),
            vec![0.1, 0.2, 0.4, 0.5]
        );
    }

    #[test]
    fn test_error_classes_survive_io() {
        let io = io_error_from_engine(EngineError::SourceInterrupted("closed".into()));
        assert_eq!(io.kind(), io::ErrorKind::ConnectionAborted);
        assert!(matches!(
            engine_error_from_io(&io),
            EngineError::SourceInterrupted(_)
        ));
        let io = io_error_from_engine(EngineError::SourceUnavailable("reset".into()));
        assert!(engine_error_from_io(&io).is_retryable());
    }

    #[test]
    fn test_extension_hint() {
        let url = Url::parse("http://h/music/Track.MP3?x=1").unwrap();
        assert_eq!(extension_hint(&url).as_deref(), Some("mp3"));
        assert_eq!(extension_hint(&Url::parse("http://h/stream").unwrap()), None);
    }
}

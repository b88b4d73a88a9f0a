//! Headerless PCM decoder
//!
//! For streams that carry raw interleaved signed 16-bit little-endian
//! samples (e.g. `audio/L16` feeds, or pre-rendered test streams). The
//! format is configured up front since there is no header to probe.

use super::{engine_error_from_io, AudioDecoder, DecoderFactory, PcmFormat, SourceReader};
use crate::error::{EngineError, Result};
use std::io::Read;
use tracing::trace;
use url::Url;

const BYTES_PER_SAMPLE: usize = 2;

/// Decoder for interleaved s16le PCM
pub struct RawPcmDecoder {
    reader: SourceReader,
    format: PcmFormat,
    buf: Vec<u8>,
    /// Bytes of a split frame carried into the next read
    carry: Vec<u8>,
    eof: bool,
}

impl RawPcmDecoder {
    pub fn new(reader: SourceReader, sample_rate: u32, channels: u16, read_size: usize) -> Self {
        let bits_per_frame = (BYTES_PER_SAMPLE * 8 * channels as usize) as f64;
        Self {
            reader,
            format: PcmFormat::new(sample_rate, channels, Some(bits_per_frame)),
            buf: vec![0u8; read_size.max(BYTES_PER_SAMPLE * channels as usize)],
            carry: Vec::new(),
            eof: false,
        }
    }

    fn frame_bytes(&self) -> usize {
        BYTES_PER_SAMPLE * self.format.channels as usize
    }
}

impl AudioDecoder for RawPcmDecoder {
    fn format(&self) -> PcmFormat {
        self.format
    }

    fn next_chunk(&mut self) -> Result<Option<Vec<f32>>> {
        loop {
            if self.eof {
                return Ok(None);
            }
            let n = self
                .reader
                .read(&mut self.buf)
                .map_err(|e| engine_error_from_io(&e))?;
            if n == 0 {
                self.eof = true;
                if !self.carry.is_empty() {
                    trace!("Dropping {} trailing bytes of a partial frame", self.carry.len());
                }
                return Ok(None);
            }

            self.carry.extend_from_slice(&self.buf[..n]);
            let whole = self.carry.len() / self.frame_bytes() * self.frame_bytes();
            if whole == 0 {
                continue;
            }
            let samples = self.carry[..whole]
                .chunks_exact(BYTES_PER_SAMPLE)
                .map(|b| i16::from_le_bytes([b[0], b[1]]) as f32 / 32768.0)
                .collect();
            self.carry.drain(..whole);
            return Ok(Some(samples));
        }
    }
}

/// Builds [`RawPcmDecoder`]s with a fixed format
#[derive(Debug, Clone, Copy)]
pub struct RawPcmDecoderFactory {
    pub sample_rate: u32,
    pub channels: u16,
    pub read_size: usize,
}

impl RawPcmDecoderFactory {
    /// 16-bit stereo at `sample_rate`
    pub fn stereo(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            channels: 2,
            read_size: 64 * 1024,
        }
    }
}

impl DecoderFactory for RawPcmDecoderFactory {
    fn create(&self, reader: SourceReader, _locator: &Url) -> Result<Box<dyn AudioDecoder>> {
        if self.sample_rate == 0 || self.channels == 0 {
            return Err(EngineError::UnsupportedFormat(format!(
                "raw PCM needs a sample rate and channel count, got {} Hz x {}",
                self.sample_rate, self.channels
            )));
        }
        Ok(Box::new(RawPcmDecoder::new(
            reader,
            self.sample_rate,
            self.channels,
            self.read_size,
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{DataSource, HttpDataSource, MemoryResource, MemoryTransport};
    use qmix_common::HttpConfig;
    use std::sync::Arc;

    #[test]
    fn test_decodes_split_frames() {
        let samples: Vec<i16> = vec![0, 16384, -16384, 32767, -32768, 1];
        let bytes: Vec<u8> = samples.iter().flat_map(|s| s.to_le_bytes()).collect();

        let transport = Arc::new(MemoryTransport::new());
        // Chunks of 3 bytes split samples and frames
        transport.insert("http://h/pcm", MemoryResource::new(bytes).chunk_size(3));
        let source = Arc::new(HttpDataSource::new(
            Url::parse("http://h/pcm").unwrap(),
            transport,
            &HttpConfig::default(),
            false,
        ));
        source.open(None).unwrap();

        let factory = RawPcmDecoderFactory {
            sample_rate: 8_000,
            channels: 2,
            read_size: 5,
        };
        let mut decoder = factory
            .create(SourceReader::new(source), &Url::parse("http://h/pcm").unwrap())
            .unwrap();
        assert_eq!(decoder.format().bits_per_frame, Some(32.0));

        let mut out = Vec::new();
        while let Some(chunk) = decoder.next_chunk().unwrap() {
            assert_eq!(chunk.len() % 2, 0);
            out.extend(chunk);
        }
        assert_eq!(out, vec![0.0, 0.5, -0.5, 32767.0 / 32768.0, -1.0, 1.0 / 32768.0]);
    }
}

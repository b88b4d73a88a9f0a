//! Audio decoder using symphonia
//!
//! Probes the container from the first bytes of the stream and decodes one
//! packet per `next_chunk` call. The data source is wrapped in a
//! `ReadOnlySource`, so probing never seeks and works on live streams.

use super::{
    engine_error_from_io, extension_hint, AudioDecoder, DecoderFactory, PcmFormat, SourceReader,
};
use crate::error::{EngineError, Result};
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{Decoder, DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader};
use symphonia::core::io::{MediaSourceStream, ReadOnlySource};
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use tracing::{debug, warn};
use url::Url;

/// Consecutive undecodable packets tolerated before giving up
const MAX_CONSECUTIVE_DECODE_ERRORS: u32 = 32;

/// Streaming symphonia decoder
pub struct SymphoniaDecoder {
    reader: Box<dyn FormatReader>,
    decoder: Box<dyn Decoder>,
    track_id: u32,
    format: PcmFormat,
    sample_buf: Option<SampleBuffer<f32>>,
}

fn map_symphonia_error(err: SymphoniaError) -> EngineError {
    match err {
        SymphoniaError::IoError(e) => engine_error_from_io(&e),
        SymphoniaError::Unsupported(what) => EngineError::UnsupportedFormat(what.to_string()),
        other => EngineError::Decode(other.to_string()),
    }
}

impl SymphoniaDecoder {
    /// Probe `reader` and set up a decoder for its default audio track
    pub fn open(reader: SourceReader, locator: &Url) -> Result<Self> {
        let mss = MediaSourceStream::new(Box::new(ReadOnlySource::new(reader)), Default::default());

        let mut hint = Hint::new();
        if let Some(ext) = extension_hint(locator) {
            hint.with_extension(&ext);
        }

        let probed = symphonia::default::get_probe()
            .format(&hint, mss, &FormatOptions::default(), &MetadataOptions::default())
            .map_err(|e| match e {
                SymphoniaError::IoError(io) => engine_error_from_io(&io),
                other => EngineError::UnsupportedFormat(format!(
                    "failed to probe {}: {}",
                    locator, other
                )),
            })?;
        let reader = probed.format;

        let track = reader
            .tracks()
            .iter()
            .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
            .ok_or_else(|| EngineError::UnsupportedFormat(format!("no audio track in {}", locator)))?;

        let track_id = track.id;
        let params = track.codec_params.clone();
        let sample_rate = params
            .sample_rate
            .ok_or_else(|| EngineError::UnsupportedFormat("sample rate not found".to_string()))?;
        let channels = params
            .channels
            .map(|c| c.count() as u16)
            .ok_or_else(|| EngineError::UnsupportedFormat("channel count not found".to_string()))?;
        // Only fixed-size codecs (PCM family) announce coded bits per sample
        let bits_per_frame = params
            .bits_per_coded_sample
            .map(|bits| bits as f64 * channels as f64);

        let decoder = symphonia::default::get_codecs()
            .make(&params, &DecoderOptions::default())
            .map_err(map_symphonia_error)?;

        debug!(
            "Decoding {}: {} Hz, {} channels, codec {:?}",
            locator, sample_rate, channels, params.codec
        );

        Ok(Self {
            reader,
            decoder,
            track_id,
            format: PcmFormat::new(sample_rate, channels, bits_per_frame),
            sample_buf: None,
        })
    }
}

impl AudioDecoder for SymphoniaDecoder {
    fn format(&self) -> PcmFormat {
        self.format
    }

    fn next_chunk(&mut self) -> Result<Option<Vec<f32>>> {
        let mut decode_errors = 0;
        loop {
            let packet = match self.reader.next_packet() {
                Ok(packet) => packet,
                Err(SymphoniaError::IoError(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    debug!("End of stream");
                    return Ok(None);
                }
                Err(SymphoniaError::ResetRequired) => {
                    self.decoder.reset();
                    continue;
                }
                Err(e) => return Err(map_symphonia_error(e)),
            };

            if packet.track_id() != self.track_id {
                continue;
            }

            match self.decoder.decode(&packet) {
                Ok(decoded) => {
                    if decoded.frames() == 0 {
                        continue;
                    }
                    let spec = *decoded.spec();
                    let frames = decoded.capacity() as u64;
                    let samples = decoded.capacity() * spec.channels.count();
                    if self
                        .sample_buf
                        .as_ref()
                        .map_or(true, |buf| buf.capacity() < samples)
                    {
                        self.sample_buf = None;
                    }
                    let buf = self
                        .sample_buf
                        .get_or_insert_with(|| SampleBuffer::<f32>::new(frames, spec));
                    buf.copy_interleaved_ref(decoded);
                    self.format.channels = spec.channels.count() as u16;
                    return Ok(Some(buf.samples().to_vec()));
                }
                Err(SymphoniaError::DecodeError(msg)) => {
                    decode_errors += 1;
                    warn!("Decode error (skipping packet): {}", msg);
                    if decode_errors >= MAX_CONSECUTIVE_DECODE_ERRORS {
                        return Err(EngineError::Decode(format!(
                            "{} consecutive undecodable packets",
                            decode_errors
                        )));
                    }
                }
                Err(e) => return Err(map_symphonia_error(e)),
            }
        }
    }
}

/// Builds [`SymphoniaDecoder`]s
#[derive(Debug, Default, Clone, Copy)]
pub struct SymphoniaDecoderFactory;

impl DecoderFactory for SymphoniaDecoderFactory {
    fn create(&self, reader: SourceReader, locator: &Url) -> Result<Box<dyn AudioDecoder>> {
        Ok(Box::new(SymphoniaDecoder::open(reader, locator)?))
    }
}

//! Deterministic stream bodies
//!
//! Everything here except [`wav_constant`] is headerless 16-bit
//! little-endian stereo, the format `RawPcmDecoderFactory::stereo` reads.

use std::io::Cursor;

/// `frames` frames of a constant value on both channels
///
/// `value` is scaled by 32768, so 0.5 and 0.25 are exact.
pub fn pcm_constant(frames: usize, value: f32) -> Vec<u8> {
    let sample = (value * 32768.0).round().clamp(-32768.0, 32767.0) as i16;
    (0..frames * 2).flat_map(|_| sample.to_le_bytes()).collect()
}

/// Frame `i` carries sample value `i % 32768` on both channels
pub fn pcm_ramp(frames: usize) -> Vec<u8> {
    (0..frames)
        .flat_map(|i| {
            let s = (i % 32768) as i16;
            let [a, b] = s.to_le_bytes();
            [a, b, a, b]
        })
        .collect()
}

/// Interleave ICY metadata into `audio` every `interval` bytes
///
/// `payload_for(k)` gives the payload after the `k`-th interval (k from 1);
/// `None` writes an empty block. Payloads are NUL-padded to a multiple of 16.
pub fn icy_stream(
    audio: &[u8],
    interval: usize,
    mut payload_for: impl FnMut(usize) -> Option<Vec<u8>>,
) -> Vec<u8> {
    let mut wire = Vec::with_capacity(audio.len() + audio.len() / interval * 17);
    for (i, chunk) in audio.chunks(interval).enumerate() {
        wire.extend_from_slice(chunk);
        if chunk.len() < interval {
            break;
        }
        match payload_for(i + 1) {
            Some(payload) => {
                let blocks = payload.len().div_ceil(16);
                wire.push(blocks as u8);
                wire.extend_from_slice(&payload);
                wire.resize(wire.len() + blocks * 16 - payload.len(), 0);
            }
            None => wire.push(0),
        }
    }
    wire
}

/// 16-bit stereo WAV file at the test rate holding a constant sample
pub fn wav_constant(frames: usize, value: i16) -> Vec<u8> {
    let spec = hound::WavSpec {
        channels: 2,
        sample_rate: super::TEST_RATE,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
        for _ in 0..frames * 2 {
            writer.write_sample(value).unwrap();
        }
        writer.finalize().unwrap();
    }
    cursor.into_inner()
}

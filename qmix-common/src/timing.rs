//! Frame, byte and duration conversions
//!
//! Frames are counted at a given sample rate (one frame = one sample per
//! channel). Compressed byte offsets map to frames through the stream's
//! bits-per-frame figure.

use std::time::Duration;

/// Convert seconds to a whole number of frames (rounded to nearest)
pub fn seconds_to_frames(seconds: f64, sample_rate: u32) -> u64 {
    if seconds <= 0.0 {
        return 0;
    }
    (seconds * sample_rate as f64).round() as u64
}

/// Convert a duration to frames at `sample_rate`
pub fn duration_to_frames(duration: Duration, sample_rate: u32) -> u64 {
    // Integer math keeps whole-millisecond durations exact
    (duration.as_nanos() * sample_rate as u128 / 1_000_000_000) as u64
}

/// Convert a frame count to a duration at `sample_rate`
pub fn frames_to_duration(frames: u64, sample_rate: u32) -> Duration {
    if sample_rate == 0 {
        return Duration::ZERO;
    }
    let nanos = frames as u128 * 1_000_000_000 / sample_rate as u128;
    Duration::from_nanos(nanos as u64)
}

/// Decoded-frame position of a compressed byte offset
///
/// # Arguments
/// * `byte_offset` - Offset into the audio byte stream (metadata excluded)
/// * `bits_per_frame` - Compressed bits per decoded frame
///
/// # Returns
/// `None` when `bits_per_frame` is unknown or not positive
pub fn byte_offset_to_frame(byte_offset: u64, bits_per_frame: Option<f64>) -> Option<u64> {
    match bits_per_frame {
        Some(bpf) if bpf > 0.0 => Some(((byte_offset as f64) * 8.0 / bpf).floor() as u64),
        _ => None,
    }
}

/// Compressed bits per frame implied by a bitrate in kbit/s
///
/// Used for streams that announce `icy-br` but whose decoder reports no
/// fixed frame size.
pub fn bits_per_frame_from_kbps(kbps: u32, sample_rate: u32) -> Option<f64> {
    if kbps == 0 || sample_rate == 0 {
        return None;
    }
    Some(kbps as f64 * 1000.0 / sample_rate as f64)
}

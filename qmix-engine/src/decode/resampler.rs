//! Streaming sample-rate conversion using rubato
//!
//! Decoders produce chunks of arbitrary size at the stream's own rate; the
//! mixer consumes stereo at the output rate. [`StreamResampler`] keeps one
//! rubato resampler alive for the whole stream so filter state carries
//! across chunk boundaries, buffering input until a full resampler chunk is
//! available.

use crate::error::{EngineError, Result};
use rubato::{FastFixedIn, PolynomialDegree, Resampler};
use tracing::debug;

/// Input frames per resampler call
const CHUNK_FRAMES: usize = 1024;

const CHANNELS: usize = 2;

/// Stateful stereo resampler
pub struct StreamResampler {
    resampler: Option<FastFixedIn<f32>>,
    input_rate: u32,
    output_rate: u32,
    /// Planar input not yet consumed by the resampler
    pending: [Vec<f32>; CHANNELS],
}

impl StreamResampler {
    /// # Arguments
    /// * `input_rate` - Decoded stream rate
    /// * `output_rate` - Mixer rate
    ///
    /// Equal rates give a pass-through that copies samples unchanged.
    pub fn new(input_rate: u32, output_rate: u32) -> Result<Self> {
        if input_rate == 0 || output_rate == 0 {
            return Err(EngineError::UnsupportedFormat(format!(
                "cannot resample {} Hz to {} Hz",
                input_rate, output_rate
            )));
        }

        let resampler = if input_rate == output_rate {
            None
        } else {
            debug!("Resampling {} Hz -> {} Hz", input_rate, output_rate);
            Some(
                FastFixedIn::<f32>::new(
                    output_rate as f64 / input_rate as f64,
                    1.0,
                    PolynomialDegree::Septic,
                    CHUNK_FRAMES,
                    CHANNELS,
                )
                .map_err(|e| EngineError::Decode(format!("Failed to create resampler: {}", e)))?,
            )
        };

        Ok(Self {
            resampler,
            input_rate,
            output_rate,
            pending: [Vec::new(), Vec::new()],
        })
    }

    pub fn input_rate(&self) -> u32 {
        self.input_rate
    }

    pub fn output_rate(&self) -> u32 {
        self.output_rate
    }

    pub fn is_passthrough(&self) -> bool {
        self.resampler.is_none()
    }

    /// Feed interleaved stereo, appending interleaved stereo output to `out`
    pub fn process(&mut self, input: &[f32], out: &mut Vec<f32>) -> Result<()> {
        let Some(resampler) = self.resampler.as_mut() else {
            out.extend_from_slice(input);
            return Ok(());
        };

        for frame in input.chunks_exact(CHANNELS) {
            self.pending[0].push(frame[0]);
            self.pending[1].push(frame[1]);
        }

        loop {
            let needed = resampler.input_frames_next();
            if self.pending[0].len() < needed {
                return Ok(());
            }
            let chunk = [&self.pending[0][..needed], &self.pending[1][..needed]];
            let planar = resampler
                .process(&chunk[..], None)
                .map_err(|e| EngineError::Decode(format!("Resampling failed: {}", e)))?;
            interleave_into(&planar, out);
            for channel in self.pending.iter_mut() {
                channel.drain(..needed);
            }
        }
    }

    /// Push out whatever input is still buffered (end of stream)
    pub fn flush(&mut self, out: &mut Vec<f32>) -> Result<()> {
        let Some(resampler) = self.resampler.as_mut() else {
            return Ok(());
        };
        if self.pending[0].is_empty() {
            return Ok(());
        }
        let chunk = [&self.pending[0][..], &self.pending[1][..]];
        let planar = resampler
            .process_partial(Some(&chunk[..]), None)
            .map_err(|e| EngineError::Decode(format!("Resampling failed: {}", e)))?;
        interleave_into(&planar, out);
        for channel in self.pending.iter_mut() {
            channel.clear();
        }
        Ok(())
    }
}

/// Append planar channels to `out` as interleaved samples
fn interleave_into(planar: &[Vec<f32>], out: &mut Vec<f32>) {
    let frames = planar.first().map_or(0, Vec::len);
    out.reserve(frames * planar.len());
    for i in 0..frames {
        for channel in planar {
            out.push(channel[i]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_passthrough_same_rate() {
        let mut r = StreamResampler::new(44_100, 44_100).unwrap();
        assert!(r.is_passthrough());
        let mut out = Vec::new();
        r.process(&[0.1, 0.2, 0.3, 0.4], &mut out).unwrap();
        r.flush(&mut out).unwrap();
        assert_eq!(out, vec![0.1, 0.2, 0.3, 0.4]);
    }

    #[test]
    fn test_rejects_zero_rate() {
        assert!(StreamResampler::new(0, 44_100).is_err());
    }

    #[test]
    fn test_upsample_length_roughly_scales() {
        let mut r = StreamResampler::new(22_050, 44_100).unwrap();
        let input: Vec<f32> = (0..22_050)
            .flat_map(|i| {
                let s = (i as f32 * 0.01).sin() * 0.5;
                [s, s]
            })
            .collect();
        let mut out = Vec::new();
        // Odd-sized pieces exercise the carry-over buffer
        for piece in input.chunks(2 * 777) {
            r.process(piece, &mut out).unwrap();
        }
        r.flush(&mut out).unwrap();

        let frames = out.len() / 2;
        assert_eq!(out.len() % 2, 0);
        assert!(
            (42_000..=47_000).contains(&frames),
            "expected about 44100 frames, got {frames}"
        );
        assert!(out.iter().all(|s| s.abs() <= 1.0));
    }

    #[test]
    fn test_interleave_into() {
        let mut out = vec![9.0];
        interleave_into(&[vec![1.0, 3.0], vec![2.0, 4.0]], &mut out);
        assert_eq!(out, vec![9.0, 1.0, 2.0, 3.0, 4.0]);
    }
}

//! Decode thread body
//!
//! Opens the entry's data source (retrying transient failures), builds a
//! decoder, and feeds stereo frames at the output rate into the ring until
//! end of stream. The thread parks while the ring is full and exits promptly
//! once the entry's cancel token fires.

use super::{EntryState, PcmRingBuffer, QueueEntry};
use crate::decode::{map_to_stereo, SourceReader, StreamResampler};
use crate::error::Result;
use crate::source::DataSource;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Longest park while waiting for ring space; the cancel token is
/// re-checked after each one
const FULL_RING_PARK: Duration = Duration::from_millis(50);

/// How a decode run ended
#[derive(Debug, PartialEq, Eq)]
enum Outcome {
    Complete,
    Cancelled,
}

pub(super) fn run(entry: Arc<QueueEntry>, ring: Arc<PcmRingBuffer>, source: Arc<dyn DataSource>) {
    ring.register_producer(std::thread::current());

    match decode_stream(&entry, &ring, &source) {
        Ok(Outcome::Complete) => {
            ring.mark_decode_complete();
            entry.decode_complete();
        }
        Ok(Outcome::Cancelled) => {
            debug!("Decode of {} cancelled", entry.track_id());
        }
        Err(e) if entry.cancel_token().is_cancelled() => {
            debug!("Decode of {} stopped: {}", entry.track_id(), e);
        }
        Err(e) => entry.fail(&e),
    }
}

fn open_with_retries(entry: &QueueEntry, source: &dyn DataSource) -> Result<Outcome> {
    let config = entry.config();
    let mut retries = 0;
    loop {
        match source.open(None) {
            Ok(()) => return Ok(Outcome::Complete),
            Err(e) if e.is_retryable() && retries < config.max_open_retries => {
                retries += 1;
                warn!(
                    "Opening {} failed ({}), retry {}/{}",
                    entry.locator(),
                    e,
                    retries,
                    config.max_open_retries
                );
                if entry.cancel_token().wait_timeout(config.open_retry_backoff()) {
                    return Ok(Outcome::Cancelled);
                }
            }
            Err(e) => return Err(e),
        }
    }
}

fn decode_stream(
    entry: &QueueEntry,
    ring: &PcmRingBuffer,
    source: &Arc<dyn DataSource>,
) -> Result<Outcome> {
    if open_with_retries(entry, source.as_ref())? == Outcome::Cancelled {
        return Ok(Outcome::Cancelled);
    }

    let decoders = Arc::clone(&entry.context.decoders);
    let mut decoder = decoders.create(SourceReader::new(Arc::clone(source)), entry.locator())?;
    let format = decoder.format();
    source.format_detected(&format);
    entry.set_format(format);

    let output_rate = entry.config().output_sample_rate;
    let mut resampler = StreamResampler::new(format.sample_rate, output_rate)?;
    entry.transition(EntryState::Buffering, |s| s == EntryState::Loading);
    debug!(
        "Decoding {}: {} Hz x {} -> {} Hz stereo",
        entry.track_id(),
        format.sample_rate,
        format.channels,
        output_rate
    );

    let mut resampled = Vec::new();
    loop {
        if entry.cancel_token().is_cancelled() {
            return Ok(Outcome::Cancelled);
        }
        let Some(samples) = decoder.next_chunk()? else {
            break;
        };
        let stereo = map_to_stereo(&samples, decoder.format().channels);
        resampled.clear();
        resampler.process(&stereo, &mut resampled)?;
        if fill(entry, ring, &resampled) == Outcome::Cancelled {
            return Ok(Outcome::Cancelled);
        }
    }

    resampled.clear();
    resampler.flush(&mut resampled)?;
    Ok(fill(entry, ring, &resampled))
}

/// Push every frame of `samples`, waiting for space as needed
fn fill(entry: &QueueEntry, ring: &PcmRingBuffer, samples: &[f32]) -> Outcome {
    let frames = samples.len() / 2;
    let mut offset = 0;
    while offset < frames {
        if entry.cancel_token().is_cancelled() {
            return Outcome::Cancelled;
        }
        offset += entry.continue_buffering(ring, &samples[offset * 2..]);
        if offset < frames {
            ring.wait_for_space(FULL_RING_PARK);
        }
    }
    Outcome::Complete
}

//! Test helpers for qmix-engine integration tests
//!
//! - Stream builders: constant PCM bodies, ramps, WAV files and
//!   ICY-interleaved streams
//! - Mixer construction over an in-memory transport
//! - A local HTTP server for the reqwest transport
//! - A recording delegate and a render driver

#![allow(dead_code)]

pub mod http_server;
pub mod streams;

pub use streams::{icy_stream, pcm_constant, pcm_ramp, wav_constant};

use qmix_common::{MixerConfig, MixerState, SourceKind};
use qmix_engine::decode::RawPcmDecoderFactory;
use qmix_engine::mixer::{MixerDelegate, MixerRenderer};
use qmix_engine::source::{HttpSourceFactory, MemoryTransport, MetadataEvent};
use qmix_engine::{EntryId, QueueMixer, TrackRequest};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use url::Url;

/// Output and decode rate used throughout the tests
pub const TEST_RATE: u32 = 8_000;

/// Install a subscriber honoring RUST_LOG; safe to call from every test
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Small configuration: 1 s entry rings, 0.25 s start threshold
pub fn test_config() -> MixerConfig {
    MixerConfig {
        output_sample_rate: TEST_RATE,
        pcm_buffer_seconds: 1.0,
        seconds_required_to_start_playing: 0.25,
        seconds_required_to_start_playing_after_underrun: 0.5,
        pool_block_bytes: 4096,
        pool_max_blocks: 64,
        open_retry_backoff_ms: 10,
        ..MixerConfig::default()
    }
}

/// Mixer decoding raw s16le stereo from `transport`
pub fn memory_mixer(
    transport: Arc<MemoryTransport>,
    kind: SourceKind,
    delegate: Arc<dyn MixerDelegate>,
) -> QueueMixer {
    memory_mixer_with(transport, kind, delegate, test_config())
}

pub fn memory_mixer_with(
    transport: Arc<MemoryTransport>,
    kind: SourceKind,
    delegate: Arc<dyn MixerDelegate>,
    config: MixerConfig,
) -> QueueMixer {
    let sources = Arc::new(HttpSourceFactory::new(transport, config.http.clone(), kind));
    QueueMixer::new(
        config,
        sources,
        Arc::new(RawPcmDecoderFactory::stereo(TEST_RATE)),
        delegate,
    )
    .expect("mixer")
}

pub fn url(path: &str) -> String {
    format!("http://stream.test/{}", path)
}

pub fn request(track: &str) -> TrackRequest {
    TrackRequest::new(track, Url::parse(&url(track)).expect("url"))
}

/// Poll `cond` every 5 ms for up to 5 s
pub fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    false
}

/// Render `frames` frames in blocks, servicing the mixer between blocks
///
/// # Returns
/// Interleaved stereo output
pub fn render_frames(
    mixer: &QueueMixer,
    renderer: &mut MixerRenderer,
    frames: usize,
    block: usize,
) -> Vec<f32> {
    let mut out = Vec::with_capacity(frames * 2);
    let mut buf = vec![0.0f32; block * 2];
    while out.len() < frames * 2 {
        let n = block.min(frames - out.len() / 2);
        renderer.render(&mut buf[..n * 2]);
        out.extend_from_slice(&buf[..n * 2]);
        mixer.service();
    }
    out
}

/// Render until `done` holds or 10 s pass, pausing briefly between blocks
/// so decode threads keep up
pub fn render_until(
    mixer: &QueueMixer,
    renderer: &mut MixerRenderer,
    block: usize,
    mut done: impl FnMut() -> bool,
) -> Vec<f32> {
    let deadline = Instant::now() + Duration::from_secs(10);
    let mut out = Vec::new();
    let mut buf = vec![0.0f32; block * 2];
    while !done() && Instant::now() < deadline {
        renderer.render(&mut buf);
        out.extend_from_slice(&buf);
        mixer.service();
        std::thread::sleep(Duration::from_millis(1));
    }
    out
}

/// Left channel of interleaved stereo
pub fn left(samples: &[f32]) -> Vec<f32> {
    samples.iter().step_by(2).copied().collect()
}

/// Nonzero left samples must be the ramp 1, 2, 3, ... with nothing missing
/// or repeated; silence from buffering is skipped
pub fn assert_continuous_ramp(output: &[f32], frames: usize) {
    let values: Vec<u32> = left(output)
        .into_iter()
        .filter(|s| *s != 0.0)
        .map(|s| (s * 32768.0).round() as u32)
        .collect();
    let expected: Vec<u32> = (1..frames as u32).collect();
    assert_eq!(values.len(), expected.len());
    assert!(values == expected, "ramp is not continuous");
}

/// Delegate that records every call as a short string
#[derive(Default)]
pub struct RecordingDelegate {
    calls: Mutex<Vec<String>>,
    metadata: Mutex<Vec<(String, MetadataEvent)>>,
}

impl RecordingDelegate {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn has(&self, call: &str) -> bool {
        self.calls().iter().any(|c| c == call)
    }

    pub fn has_prefix(&self, prefix: &str) -> bool {
        self.calls().iter().any(|c| c.starts_with(prefix))
    }

    pub fn metadata(&self) -> Vec<(String, MetadataEvent)> {
        self.metadata.lock().unwrap().clone()
    }

    fn push(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

impl MixerDelegate for RecordingDelegate {
    fn state_changed(&self, from: MixerState, to: MixerState) {
        self.push(format!("state:{}->{}", from, to));
    }

    fn track_started(&self, track_id: &str, _entry: EntryId) {
        self.push(format!("started:{}", track_id));
    }

    fn track_finished(&self, track_id: &str, _entry: EntryId, frames_played: u64) {
        self.push(format!("finished:{}:{}", track_id, frames_played));
    }

    fn track_skipped(&self, track_id: &str, _entry: EntryId) {
        self.push(format!("skipped:{}", track_id));
    }

    fn track_failed(&self, track_id: &str, _entry: EntryId, reason: &str) {
        self.push(format!("failed:{}:{}", track_id, reason));
    }

    fn metadata_received(&self, track_id: &str, _entry: EntryId, event: &MetadataEvent) {
        self.push(format!("metadata:{}", track_id));
        self.metadata
            .lock()
            .unwrap()
            .push((track_id.to_string(), event.clone()));
    }
}

//! Async host integration
//!
//! A mixer configured from a TOML file, serviced by its own thread and
//! rendered on another, reporting to an async host through
//! `EventChannelDelegate`.

mod helpers;

use helpers::*;
use qmix_common::{MixerConfig, MixerEvent, MixerState};
use qmix_engine::decode::RawPcmDecoderFactory;
use qmix_engine::source::{HttpSourceFactory, MemoryResource, MemoryTransport};
use qmix_engine::{EventChannelDelegate, QueueMixer};
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;

const CONFIG: &str = r#"
output_sample_rate = 8000
pcm_buffer_seconds = 1.0
seconds_required_to_start_playing = 0.25
seconds_required_to_start_playing_after_underrun = 0.5
pool_block_bytes = 4096
pool_max_blocks = 64
source_kind = "plain"
fade_curve = "linear"
"#;

async fn next_event(rx: &mut UnboundedReceiver<MixerEvent>) -> anyhow::Result<MixerEvent> {
    tokio::time::timeout(Duration::from_secs(10), rx.recv())
        .await?
        .ok_or_else(|| anyhow::anyhow!("event channel closed"))
}

#[tokio::test]
async fn test_events_reach_async_host() -> anyhow::Result<()> {
    init_tracing();
    let mut file = tempfile::NamedTempFile::new()?;
    file.write_all(CONFIG.as_bytes())?;
    let config = MixerConfig::load(file.path())?;
    assert_eq!(config.output_sample_rate, TEST_RATE);

    let transport = Arc::new(MemoryTransport::new());
    transport.insert(&url("a"), MemoryResource::new(pcm_constant(1000, 0.5)));
    transport.insert(&url("b"), MemoryResource::new(pcm_constant(1000, 0.25)));
    let sources = Arc::new(HttpSourceFactory::new(
        transport,
        config.http.clone(),
        config.source_kind,
    ));

    let (delegate, mut rx) = EventChannelDelegate::channel();
    let mixer = Arc::new(QueueMixer::new(
        config,
        sources,
        Arc::new(RawPcmDecoderFactory::stereo(TEST_RATE)),
        Arc::new(delegate),
    )?);
    let service = mixer.spawn_service_thread(Duration::from_millis(5))?;

    // Audio callback stand-in
    let mut renderer = mixer
        .take_renderer()
        .ok_or_else(|| anyhow::anyhow!("renderer already taken"))?;
    let running = Arc::new(AtomicBool::new(true));
    let audio = {
        let running = Arc::clone(&running);
        std::thread::spawn(move || {
            let mut buf = vec![0.0f32; 512];
            while running.load(Ordering::Acquire) {
                renderer.render(&mut buf);
                std::thread::sleep(Duration::from_millis(2));
            }
        })
    };

    mixer.enqueue(request("a"));
    mixer.enqueue(request("b"));
    mixer.play()?;

    let mut finished = Vec::new();
    let mut started = Vec::new();
    let mut saw_playing = false;
    while finished.len() < 2 {
        match next_event(&mut rx).await? {
            MixerEvent::StateChanged { from, to, .. } => {
                if from == MixerState::READY && to == MixerState::PLAYING {
                    saw_playing = true;
                }
            }
            MixerEvent::TrackStarted { track_id, .. } => started.push(track_id),
            MixerEvent::TrackFinished {
                track_id,
                frames_played,
                ..
            } => {
                assert_eq!(frames_played, 1000);
                finished.push(track_id);
            }
            other => anyhow::bail!("unexpected event {:?}", other),
        }
    }

    assert!(saw_playing);
    assert_eq!(started, vec!["a", "b"]);
    assert_eq!(finished, vec!["a", "b"]);

    running.store(false, Ordering::Release);
    audio.join().map_err(|_| anyhow::anyhow!("audio thread panicked"))?;
    mixer.shutdown();
    service.join().map_err(|_| anyhow::anyhow!("service thread panicked"))?;
    Ok(())
}

#[test]
fn test_invalid_config_rejected() {
    let config = MixerConfig {
        pool_block_bytes: 10,
        ..test_config()
    };
    let transport = Arc::new(MemoryTransport::new());
    let sources = Arc::new(HttpSourceFactory::new(
        transport,
        config.http.clone(),
        config.source_kind,
    ));
    let result = QueueMixer::new(
        config,
        sources,
        Arc::new(RawPcmDecoderFactory::stereo(TEST_RATE)),
        Arc::new(qmix_engine::NoopDelegate),
    );
    assert!(matches!(result, Err(qmix_engine::EngineError::Config(_))));
}

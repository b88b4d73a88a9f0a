//! The reqwest transport against a real socket
//!
//! A loopback server stands in for the stream host:
//! - Range and ICY request headers reach the wire
//! - HTTP status codes map onto engine errors
//! - Cancelling unblocks a body read that is waiting on the network
//! - A mixer built with `QueueMixer::with_http` plays a WAV end to end

mod helpers;

use helpers::http_server::{Route, TestServer};
use helpers::*;
use qmix_common::HttpConfig;
use qmix_engine::source::{
    CancelToken, DataSource, HttpDataSource, HttpRequest, HttpTransport, ReqwestTransport,
};
use qmix_engine::{EngineError, QueueMixer, TrackRequest};
use std::sync::Arc;
use std::time::{Duration, Instant};

const EPSILON: f32 = 1e-6;

fn body(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

fn read_to_end(source: &dyn DataSource) -> Vec<u8> {
    let mut out = Vec::new();
    let mut buf = vec![0u8; 4096];
    loop {
        let n = source.read(&mut buf).expect("read");
        if n == 0 {
            return out;
        }
        out.extend_from_slice(&buf[..n]);
    }
}

#[test]
fn test_range_and_icy_headers_reach_the_server() {
    init_tracing();
    let server = TestServer::start(vec![("stream", Route::ok(body(10_000)))]);
    let config = HttpConfig::default();
    let transport = Arc::new(ReqwestTransport::new(&config).unwrap());
    let source = HttpDataSource::new(server.url("stream"), transport, &config, true);

    source.open(Some(4_000)).unwrap();
    assert_eq!(source.content_length(), Some(10_000));
    assert_eq!(read_to_end(&source), body(10_000)[4_000..].to_vec());
    source.close();

    let requests = server.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].path, "stream");
    assert_eq!(requests[0].header("range"), Some("bytes=4000-"));
    assert_eq!(requests[0].header("icy-metadata"), Some("1"));
    assert_eq!(
        requests[0].header("user-agent"),
        Some(config.user_agent.as_str())
    );
}

#[test]
fn test_status_codes_map_to_engine_errors() {
    let server = TestServer::start(vec![
        ("gone", Route::status(410)),
        ("busy", Route::status(503)),
        ("broken", Route::status(500)),
    ]);
    let transport = ReqwestTransport::new(&HttpConfig::default()).unwrap();
    let cancel = CancelToken::new();
    let open = |path: &str| transport.open(&HttpRequest::get(server.url(path)), &cancel);

    assert!(matches!(open("missing"), Err(EngineError::SourceNotFound(_))));
    assert!(matches!(open("gone"), Err(EngineError::SourceNotFound(_))));
    assert!(matches!(open("busy"), Err(EngineError::SourceUnavailable(_))));
    assert!(matches!(open("broken"), Err(EngineError::SourceUnavailable(_))));
    assert_eq!(server.requests().len(), 4);
}

#[test]
fn test_cancel_interrupts_blocked_body_read() {
    init_tracing();
    let server = TestServer::start(vec![(
        "stall",
        Route::ok(vec![7u8; 8192]).hang_after(1024),
    )]);
    let transport = ReqwestTransport::new(&HttpConfig::default()).unwrap();
    let cancel = CancelToken::new();
    let mut response = transport
        .open(&HttpRequest::get(server.url("stall")), &cancel)
        .unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(response.content_length, Some(8192));

    let mut received = 0;
    while received < 1024 {
        let chunk = response
            .body
            .next_chunk(&cancel)
            .unwrap()
            .expect("bytes before the stall");
        received += chunk.len();
    }
    assert_eq!(received, 1024);

    // Nothing more is coming; only the cancel can end this read
    let canceller = {
        let cancel = cancel.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(100));
            cancel.cancel();
        })
    };
    let started = Instant::now();
    let result = response.body.next_chunk(&cancel);
    let waited = started.elapsed();
    assert!(matches!(result, Err(EngineError::SourceInterrupted(_))));
    assert!(waited >= Duration::from_millis(90), "returned after {:?}", waited);
    assert!(waited < Duration::from_secs(2), "returned after {:?}", waited);
    canceller.join().unwrap();
}

#[test]
fn test_close_unblocks_stalled_source_read() {
    let server = TestServer::start(vec![(
        "stall",
        Route::ok(vec![7u8; 8192]).hang_after(1024),
    )]);
    let config = HttpConfig::default();
    let transport = Arc::new(ReqwestTransport::new(&config).unwrap());
    let source = Arc::new(HttpDataSource::new(server.url("stall"), transport, &config, false));
    source.open(None).unwrap();

    let reader = {
        let source = Arc::clone(&source);
        std::thread::spawn(move || {
            let mut buf = vec![0u8; 4096];
            let mut received = 0;
            loop {
                match source.read(&mut buf) {
                    Ok(0) => return (received, None),
                    Ok(n) => received += n,
                    Err(e) => return (received, Some(e)),
                }
            }
        })
    };
    std::thread::sleep(Duration::from_millis(200));
    let started = Instant::now();
    source.close();
    let (received, error) = reader.join().unwrap();
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(received, 1024);
    assert!(matches!(error, Some(EngineError::SourceInterrupted(_))));
}

#[test]
fn test_http_mixer_plays_wav() {
    init_tracing();
    let server = TestServer::start(vec![("tone.wav", Route::ok(wav_constant(4000, 16384)))]);
    let delegate = RecordingDelegate::new();
    let mixer = QueueMixer::with_http(test_config(), delegate.clone()).unwrap();
    let mut renderer = mixer.take_renderer().unwrap();

    mixer.enqueue(TrackRequest::new("tone", server.url("tone.wav")));
    mixer.play().unwrap();
    let out = left(&render_until(&mixer, &mut renderer, 256, || {
        delegate.has_prefix("finished:tone")
    }));

    assert!(delegate.has("finished:tone:4000"));
    let audible: Vec<_> = out.iter().filter(|s| **s != 0.0).collect();
    assert_eq!(audible.len(), 4000);
    assert!(audible.iter().all(|s| (**s - 0.5).abs() < EPSILON));
    assert!(!server.requests().is_empty());
}

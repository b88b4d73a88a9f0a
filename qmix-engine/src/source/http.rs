//! HTTP data source
//!
//! Each connection runs a pump thread that pulls body chunks from the
//! transport, strips ICY metadata when the server interleaves it, and pushes
//! the pieces into a bounded channel. `read` drains that channel. The bound
//! gives back-pressure: a reader that stops reading stops the pump.
//!
//! Connections carry a generation number. Replacing the connection (seek,
//! URL switch) cancels the old pump; anything a reader picked up from the old
//! channel after the swap is discarded because its generation no longer
//! matches.
//!
//! Offsets sent by a pump are relative to its connection. The reader maps
//! them to stream offsets with the connection's `base`, and drops bytes
//! below `deliver_from` so a reconnect can resume mid-body.

use super::cancel::CancelToken;
use super::icy::{IcyPiece, IcyStripper, ICY_BITRATE_HEADER, ICY_METAINT_HEADER};
use super::transport::{ChunkStream, HttpRequest, HttpTransport};
use super::{DataSource, SourceState};
use crate::error::{EngineError, Result};
use crossbeam_channel::{select, Receiver, Sender};
use qmix_common::HttpConfig;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use tracing::{debug, info, trace, warn};
use url::Url;

const UNKNOWN_LENGTH: u64 = u64::MAX;

/// Message from a connection pump to the reader
#[derive(Debug)]
enum PumpMessage {
    Audio { offset: u64, data: Vec<u8> },
    Metadata { offset: u64, payload: Vec<u8> },
    End,
    Failed(EngineError),
}

/// Metadata block found while reading, at a stream offset
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct IcyBlock {
    pub byte_offset: u64,
    pub payload: Vec<u8>,
}

/// Result of one reader step
#[derive(Debug)]
pub(crate) enum ReadStep {
    Data(usize),
    Metadata(IcyBlock),
    End,
}

/// Audio bytes taken from the channel but not yet handed out
#[derive(Debug)]
struct Segment {
    /// Stream offset of `data[0]`
    offset: u64,
    data: Vec<u8>,
    pos: usize,
}

/// How a replacement connection's offsets relate to the current position
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum OffsetMapping {
    /// Same byte layout (same program, same encoding)
    Identity,
    /// Same program at another bitrate; offsets scale by the ratio
    Scaled(f64),
    /// Live stream with no byte positions; continue from the current one
    Live,
}

pub(crate) struct Connection {
    generation: u64,
    url: Url,
    rx: Receiver<PumpMessage>,
    cancel: CancelToken,
    base: u64,
    deliver_from: u64,
    received: Arc<AtomicU64>,
    current: Option<Segment>,
    eof: bool,
    total_length: Option<u64>,
    bitrate_kbps: Option<u32>,
    live: bool,
    pump: Option<JoinHandle<()>>,
}

impl Connection {
    pub(crate) fn bitrate_kbps(&self) -> Option<u32> {
        self.bitrate_kbps
    }

    pub(crate) fn is_live(&self) -> bool {
        self.live
    }

    /// Cancel the pump and wait for it to exit
    pub(crate) fn retire(mut self) {
        self.cancel.cancel();
        if let Some(pump) = self.pump.take() {
            if pump.join().is_err() {
                warn!("Pump thread for {} panicked", self.url);
            }
        }
        trace!("Connection {} to {} retired", self.generation, self.url);
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Plain HTTP byte stream
pub struct HttpDataSource {
    url: Mutex<Url>,
    transport: Arc<dyn HttpTransport>,
    chunk_queue_depth: usize,
    request_icy_metadata: bool,
    closed: CancelToken,
    connection: Mutex<Option<Connection>>,
    position: AtomicU64,
    content_length: AtomicU64,
    state: AtomicU8,
    next_generation: AtomicU64,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

fn interrupted(url: &Url) -> EngineError {
    EngineError::SourceInterrupted(format!("{} closed", url))
}

impl HttpDataSource {
    /// # Arguments
    /// * `url` - Locator to read
    /// * `transport` - Shared HTTP transport
    /// * `config` - Queue depth and request settings
    /// * `icy` - Request and strip interleaved metadata (still subject to
    ///   `config.request_icy_metadata`)
    pub fn new(url: Url, transport: Arc<dyn HttpTransport>, config: &HttpConfig, icy: bool) -> Self {
        Self {
            url: Mutex::new(url),
            transport,
            chunk_queue_depth: config.chunk_queue_depth.max(1),
            request_icy_metadata: icy && config.request_icy_metadata,
            closed: CancelToken::new(),
            connection: Mutex::new(None),
            position: AtomicU64::new(0),
            content_length: AtomicU64::new(UNKNOWN_LENGTH),
            state: AtomicU8::new(SourceState::Idle as u8),
            next_generation: AtomicU64::new(1),
        }
    }

    fn set_state(&self, state: SourceState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub(crate) fn set_locator(&self, url: Url) {
        *lock(&self.url) = url;
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Connect to `url` and start its pump
    ///
    /// The connection is not installed; the caller decides whether it
    /// replaces the current one.
    pub(crate) fn connect(&self, url: &Url, offset: Option<u64>) -> Result<Connection> {
        let cancel = self.closed.child();
        let mut request = HttpRequest::get(url.clone()).with_range_start(offset);
        if self.request_icy_metadata {
            request = request.with_header("Icy-MetaData", "1");
        }

        let response = match self.transport.open(&request, &cancel) {
            Ok(response) => response,
            Err(e) => {
                cancel.cancel();
                return Err(e);
            }
        };

        let requested = offset.unwrap_or(0);
        let total_length = response.total_length();
        let live = total_length.is_none();
        let (base, deliver_from) = if response.is_partial() || requested == 0 || live {
            (requested, requested)
        } else {
            // Server ignored the range: read from the start and discard
            debug!("{} ignored range request at {}; skipping", url, requested);
            (0, requested)
        };

        let stripper = if self.request_icy_metadata {
            response
                .numeric_header(ICY_METAINT_HEADER)
                .filter(|&n| n > 0)
                .map(|n| IcyStripper::new(n as usize))
        } else {
            None
        };
        let bitrate_kbps = response
            .numeric_header(ICY_BITRATE_HEADER)
            .map(|kbps| kbps as u32);

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = crossbeam_channel::bounded(self.chunk_queue_depth);
        let received = Arc::new(AtomicU64::new(0));

        let pump = {
            let cancel = cancel.clone();
            let received = received.clone();
            let url = url.clone();
            let body = response.body;
            std::thread::Builder::new()
                .name(format!("qmix-pump-{}", generation))
                .spawn(move || run_pump(body, tx, cancel, stripper, received, url))
        };
        let pump = match pump {
            Ok(handle) => handle,
            Err(e) => {
                cancel.cancel();
                return Err(EngineError::Io(e));
            }
        };

        debug!(
            "Connection {} to {}: status {}, base {}, length {:?}, icy {}",
            generation,
            url,
            response.status,
            base,
            total_length,
            self.request_icy_metadata
        );

        Ok(Connection {
            generation,
            url: url.clone(),
            rx,
            cancel,
            base,
            deliver_from,
            received,
            current: None,
            eof: false,
            total_length,
            bitrate_kbps,
            live,
            pump: Some(pump),
        })
    }

    /// Bitrate and liveness of the current connection
    pub(crate) fn connection_info(&self) -> Option<(Option<u32>, bool)> {
        lock(&self.connection)
            .as_ref()
            .map(|c| (c.bitrate_kbps, c.live))
    }

    /// Replace the current connection
    ///
    /// `opened_at` is the position the new connection was requested for.
    /// Bytes the reader consumed since then are skipped on the new
    /// connection according to `mapping`.
    pub(crate) fn install(
        &self,
        mut conn: Connection,
        opened_at: u64,
        mapping: OffsetMapping,
        url: Option<&Url>,
    ) -> Result<()> {
        let old = {
            let mut guard = lock(&self.connection);
            if self.closed.is_cancelled() {
                drop(guard);
                let url = conn.url.clone();
                conn.retire();
                return Err(interrupted(&url));
            }

            let now = self.position.load(Ordering::Acquire);
            let advanced = now.saturating_sub(opened_at);
            match mapping {
                OffsetMapping::Identity => conn.deliver_from += advanced,
                OffsetMapping::Scaled(ratio) => {
                    conn.deliver_from += (advanced as f64 * ratio).round() as u64
                }
                OffsetMapping::Live => {
                    conn.base = now;
                    conn.deliver_from = now;
                }
            }

            self.position.store(conn.deliver_from, Ordering::Release);
            self.content_length
                .store(conn.total_length.unwrap_or(UNKNOWN_LENGTH), Ordering::Release);
            if let Some(url) = url {
                *lock(&self.url) = url.clone();
            }
            guard.replace(conn)
        };

        self.set_state(SourceState::Reading);
        if let Some(old) = old {
            old.retire();
        }
        Ok(())
    }

    /// Hand out audio bytes or the next metadata block
    pub(crate) fn read_step(&self, buf: &mut [u8]) -> Result<ReadStep> {
        if buf.is_empty() {
            return Ok(ReadStep::Data(0));
        }

        loop {
            let (rx, conn_cancel, generation) = {
                let mut guard = lock(&self.connection);
                if self.closed.is_cancelled() {
                    return Err(interrupted(&self.locator()));
                }
                let conn = guard
                    .as_mut()
                    .ok_or_else(|| EngineError::InvalidState("read before open".to_string()))?;

                if let Some(segment) = conn.current.as_mut() {
                    let remaining = &segment.data[segment.pos..];
                    let n = remaining.len().min(buf.len());
                    buf[..n].copy_from_slice(&remaining[..n]);
                    segment.pos += n;
                    self.position
                        .store(segment.offset + segment.pos as u64, Ordering::Release);
                    if segment.pos >= segment.data.len() {
                        conn.current = None;
                    }
                    return Ok(ReadStep::Data(n));
                }
                if conn.eof {
                    return Ok(ReadStep::End);
                }
                (conn.rx.clone(), conn.cancel.clone(), conn.generation)
            };

            // Block without holding the connection lock
            let message = select! {
                recv(rx) -> message => message.ok(),
                recv(self.closed.closed_receiver()) -> _ => {
                    return Err(interrupted(&self.locator()));
                }
                recv(conn_cancel.closed_receiver()) -> _ => None,
            };

            let mut guard = lock(&self.connection);
            let conn = match guard.as_mut() {
                Some(conn) if conn.generation == generation => conn,
                // Replaced while we waited
                _ => continue,
            };

            match message {
                Some(PumpMessage::Audio { offset, data }) => {
                    let start = conn.base + offset;
                    let end = start + data.len() as u64;
                    if end <= conn.deliver_from {
                        continue;
                    }
                    let skip = conn.deliver_from.saturating_sub(start) as usize;
                    conn.current = Some(Segment {
                        offset: start,
                        data,
                        pos: skip,
                    });
                }
                Some(PumpMessage::Metadata { offset, payload }) => {
                    let byte_offset = conn.base + offset;
                    if byte_offset < conn.deliver_from {
                        continue;
                    }
                    return Ok(ReadStep::Metadata(IcyBlock {
                        byte_offset,
                        payload,
                    }));
                }
                Some(PumpMessage::End) => {
                    conn.eof = true;
                    self.set_state(SourceState::EndOfStream);
                    debug!("End of stream from {}", conn.url);
                    return Ok(ReadStep::End);
                }
                Some(PumpMessage::Failed(e)) => {
                    conn.eof = true;
                    self.set_state(SourceState::Failed);
                    warn!("Stream from {} failed: {}", conn.url, e);
                    return Err(e);
                }
                None => {
                    // Pump gone without End: its connection was cancelled
                    return Err(interrupted(&conn.url));
                }
            }
        }
    }
}

/// Send `message` unless the connection is cancelled first
fn send(tx: &Sender<PumpMessage>, cancel: &CancelToken, message: PumpMessage) -> bool {
    select! {
        send(tx, message) -> result => result.is_ok(),
        recv(cancel.closed_receiver()) -> _ => false,
    }
}

/// Connection pump: transport body → stripped pieces → channel
fn run_pump(
    mut body: Box<dyn ChunkStream>,
    tx: Sender<PumpMessage>,
    cancel: CancelToken,
    mut stripper: Option<IcyStripper>,
    received: Arc<AtomicU64>,
    url: Url,
) {
    let mut offset = 0u64;
    let mut pieces = Vec::new();
    loop {
        let chunk = match body.next_chunk(&cancel) {
            Ok(Some(chunk)) => chunk,
            Ok(None) => {
                send(&tx, &cancel, PumpMessage::End);
                return;
            }
            Err(e) => {
                if !cancel.is_cancelled() {
                    send(&tx, &cancel, PumpMessage::Failed(e));
                }
                return;
            }
        };

        match stripper.as_mut() {
            Some(stripper) => stripper.feed(&chunk, &mut pieces),
            None => pieces.push(IcyPiece::Audio(chunk)),
        }

        for piece in pieces.drain(..) {
            let message = match piece {
                IcyPiece::Audio(data) if data.is_empty() => continue,
                IcyPiece::Audio(data) => {
                    let len = data.len() as u64;
                    let message = PumpMessage::Audio { offset, data };
                    offset += len;
                    received.store(offset, Ordering::Release);
                    message
                }
                IcyPiece::Metadata(payload) => {
                    trace!("Metadata block at {} from {}", offset, url);
                    PumpMessage::Metadata { offset, payload }
                }
            };
            if !send(&tx, &cancel, message) {
                return;
            }
        }
    }
}

impl DataSource for HttpDataSource {
    fn locator(&self) -> Url {
        lock(&self.url).clone()
    }

    fn open(&self, offset: Option<u64>) -> Result<()> {
        let url = self.locator();
        if self.closed.is_cancelled() {
            return Err(interrupted(&url));
        }
        self.set_state(SourceState::Opening);
        let conn = match self.connect(&url, offset) {
            Ok(conn) => conn,
            Err(e) => {
                if !self.closed.is_cancelled() {
                    self.set_state(SourceState::Failed);
                }
                return Err(e);
            }
        };
        let start = conn.deliver_from;
        // A plain reopen takes the new offset as-is
        self.position.store(start, Ordering::Release);
        self.install(conn, start, OffsetMapping::Identity, None)?;
        info!("Opened {} at byte {}", url, start);
        Ok(())
    }

    fn read(&self, buf: &mut [u8]) -> Result<usize> {
        loop {
            match self.read_step(buf)? {
                ReadStep::Data(n) => return Ok(n),
                ReadStep::End => return Ok(0),
                ReadStep::Metadata(block) => {
                    trace!("Dropping metadata at {} on plain source", block.byte_offset)
                }
            }
        }
    }

    fn seek(&self, offset: u64) -> Result<()> {
        if let Some(length) = self.content_length() {
            if offset > length {
                return Err(EngineError::InvalidState(format!(
                    "seek to {} past end {}",
                    offset, length
                )));
            }
        }
        self.open(Some(offset))
    }

    fn position(&self) -> u64 {
        self.position.load(Ordering::Acquire)
    }

    fn available_byte_count(&self) -> u64 {
        let received = lock(&self.connection)
            .as_ref()
            .map(|c| c.base + c.received.load(Ordering::Acquire))
            .unwrap_or(0);
        received.max(self.position())
    }

    fn content_length(&self) -> Option<u64> {
        match self.content_length.load(Ordering::Acquire) {
            UNKNOWN_LENGTH => None,
            n => Some(n),
        }
    }

    fn state(&self) -> SourceState {
        SourceState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn close(&self) {
        self.closed.cancel();
        let conn = lock(&self.connection).take();
        if let Some(conn) = conn {
            conn.retire();
            debug!("Closed {}", self.locator());
        }
        self.set_state(SourceState::Closed);
    }
}

impl Drop for HttpDataSource {
    fn drop(&mut self) {
        self.close();
    }
}

// ============================================================================
// Tests
// ============================================================================

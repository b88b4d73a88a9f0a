//! Queue entries
//!
//! A [`QueueEntry`] is one track in the mixer queue. It owns, while loading
//! or playing, a data source, a decode thread and a [`PcmRingBuffer`] whose
//! consumer end belongs to an [`EntryPlayhead`] staged in the renderer.
//!
//! ## Threads
//!
//! - Control thread: creates the entry, calls `begin_load`, `skip`,
//!   `set_fadeout` and `tidy_up`
//! - Decode thread: opens the source, decodes, resamples and pushes frames
//!   (see [`loader`])
//! - Render thread: pulls frames through the playhead and moves the entry
//!   between playing states
//!
//! Everything the render thread touches (state, fade envelopes, consumer
//! position) is atomic.
//!
//! ## States
//!
//! ```text
//! Pending → Loading → Buffering → Ready ⇄ Playing → Fading → Drained → Finished
//!                                                   Error and Skipped from any
//! ```
//!
//! Finished, Error and Skipped are terminal: no transition leaves them.

pub mod fade;
mod loader;
pub mod playhead;
pub mod ring_buffer;

pub use fade::{FadeDirection, FadeEnvelope, FadeSnapshot};
pub use playhead::{Blend, EntryPlayhead};
pub use ring_buffer::{PcmRingBuffer, RingStats};

use crate::decode::{DecoderFactory, PcmFormat};
use crate::error::{EngineError, Result};
use crate::pool::BufferPool;
use crate::source::{CancelToken, DataSource, MetadataEvent, MetadataListener, SourceFactory};
use qmix_common::timing::duration_to_frames;
use qmix_common::MixerConfig;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, trace, warn};
use url::Url;
use uuid::Uuid;

/// Identifies one queue entry; two entries of the same track differ
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntryId(Uuid);

impl EntryId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for EntryId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Entry lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum EntryState {
    Pending = 0,
    Loading = 1,
    Buffering = 2,
    Ready = 3,
    Playing = 4,
    Fading = 5,
    Drained = 6,
    Finished = 7,
    Error = 8,
    Skipped = 9,
}

impl EntryState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => EntryState::Loading,
            2 => EntryState::Buffering,
            3 => EntryState::Ready,
            4 => EntryState::Playing,
            5 => EntryState::Fading,
            6 => EntryState::Drained,
            7 => EntryState::Finished,
            8 => EntryState::Error,
            9 => EntryState::Skipped,
            _ => EntryState::Pending,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            EntryState::Finished | EntryState::Error | EntryState::Skipped
        )
    }

    /// Handed to the renderer and producing audio
    pub fn is_audible(self) -> bool {
        matches!(
            self,
            EntryState::Playing | EntryState::Fading | EntryState::Drained
        )
    }

    pub fn name(self) -> &'static str {
        match self {
            EntryState::Pending => "pending",
            EntryState::Loading => "loading",
            EntryState::Buffering => "buffering",
            EntryState::Ready => "ready",
            EntryState::Playing => "playing",
            EntryState::Fading => "fading",
            EntryState::Drained => "drained",
            EntryState::Finished => "finished",
            EntryState::Error => "error",
            EntryState::Skipped => "skipped",
        }
    }
}

impl fmt::Display for EntryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Entry state shared across threads
#[derive(Debug)]
struct AtomicEntryState(AtomicU8);

impl AtomicEntryState {
    fn new(state: EntryState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    fn load(&self) -> EntryState {
        EntryState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Move to `to` if the current state is non-terminal and `allowed`
    ///
    /// # Returns
    /// The state that was replaced, or `None` if no transition happened
    fn transition(&self, to: EntryState, allowed: impl Fn(EntryState) -> bool) -> Option<EntryState> {
        let mut current = self.load();
        loop {
            if current.is_terminal() || !allowed(current) {
                return None;
            }
            match self.0.compare_exchange_weak(
                current as u8,
                to as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(current),
                Err(actual) => current = EntryState::from_u8(actual),
            }
        }
    }
}

/// What the host asked to play
#[derive(Debug, Clone)]
pub struct TrackRequest {
    /// Host identifier, opaque to the engine
    pub track_id: String,
    pub locator: Url,
    /// Expected length, when the host knows it
    pub duration: Option<Duration>,
    /// Position at which the crossfade into the next entry starts
    pub fade_at: Option<Duration>,
    pub fade_duration: Duration,
}

impl TrackRequest {
    pub fn new(track_id: impl Into<String>, locator: Url) -> Self {
        Self {
            track_id: track_id.into(),
            locator,
            duration: None,
            fade_at: None,
            fade_duration: Duration::ZERO,
        }
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = Some(duration);
        self
    }

    /// Crossfade starting at `at` and lasting `duration`
    pub fn with_fade(mut self, at: Duration, duration: Duration) -> Self {
        self.fade_at = Some(at);
        self.fade_duration = duration;
        self
    }

    /// Fade start, defaulting to `duration - fade_duration` when only the
    /// length is known and a fade length was given
    pub fn effective_fade_at(&self) -> Option<Duration> {
        self.fade_at.or_else(|| {
            let duration = self.duration?;
            (!self.fade_duration.is_zero()).then(|| duration.saturating_sub(self.fade_duration))
        })
    }
}

/// Shared collaborators every entry needs
pub struct EntryContext {
    pub pool: Arc<BufferPool>,
    pub sources: Arc<dyn SourceFactory>,
    pub decoders: Arc<dyn DecoderFactory>,
    pub config: MixerConfig,
}

impl fmt::Debug for EntryContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntryContext")
            .field("pool", &self.pool)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Receives an entry's lifecycle events
///
/// Methods may be called from the render thread (`should_begin_fade_out`,
/// `finished`), so implementations must not block or allocate.
pub trait EntryDelegate: Send + Sync {
    /// Consumer reached the configured fade start
    fn should_begin_fade_out(&self, entry: &QueueEntry);

    /// Decoder reported the stream's format
    fn format_changed(&self, entry: &QueueEntry, format: &PcmFormat);

    /// Enough audio is buffered to start
    fn buffered(&self, _entry: &QueueEntry) {}

    /// Played to the end, or faded out completely
    fn finished(&self, entry: &QueueEntry);

    fn skipped(&self, entry: &QueueEntry);

    /// Load or decode failed; the entry is now in `Error`
    fn failed(&self, entry: &QueueEntry, error: &EngineError);

    /// Stream metadata arrived
    fn metadata(&self, entry: &QueueEntry, event: &MetadataEvent);
}

/// Resources held while loading or playing
#[derive(Default)]
struct EntryResources {
    ring: Option<Arc<PcmRingBuffer>>,
    source: Option<Arc<dyn DataSource>>,
    decode_thread: Option<JoinHandle<()>>,
}

/// One track in the mixer queue
pub struct QueueEntry {
    id: EntryId,
    request: TrackRequest,
    context: Arc<EntryContext>,
    delegate: Arc<dyn EntryDelegate>,

    state: AtomicEntryState,
    fade_out: FadeEnvelope,
    fade_in: FadeEnvelope,
    /// Set by `fade_from_now`; the renderer must not postpone the fade
    fade_forced: AtomicBool,
    /// Frames handed to the renderer so far
    frames_consumed: AtomicU64,
    load_attempts: AtomicU32,

    cancel: CancelToken,
    resources: Mutex<EntryResources>,
    format: Mutex<Option<PcmFormat>>,
    failure: Mutex<Option<String>>,
}

impl QueueEntry {
    pub fn new(
        request: TrackRequest,
        context: Arc<EntryContext>,
        delegate: Arc<dyn EntryDelegate>,
    ) -> Arc<Self> {
        let curve = context.config.fade_curve;
        let entry = Self {
            id: EntryId::new(),
            request,
            context,
            delegate,
            state: AtomicEntryState::new(EntryState::Pending),
            fade_out: FadeEnvelope::new(FadeDirection::Out, curve),
            fade_in: FadeEnvelope::new(FadeDirection::In, curve),
            fade_forced: AtomicBool::new(false),
            frames_consumed: AtomicU64::new(0),
            load_attempts: AtomicU32::new(0),
            cancel: CancelToken::new(),
            resources: Mutex::new(EntryResources::default()),
            format: Mutex::new(None),
            failure: Mutex::new(None),
        };
        if let Some(at) = entry.request.effective_fade_at() {
            entry.set_fadeout(at, entry.request.fade_duration);
        }
        trace!("Entry {} created for track {}", entry.id, entry.request.track_id);
        Arc::new(entry)
    }

    /// Fresh pending entry for the same request
    pub fn requeue(&self) -> Arc<Self> {
        Self::new(
            self.request.clone(),
            Arc::clone(&self.context),
            Arc::clone(&self.delegate),
        )
    }

    pub fn id(&self) -> EntryId {
        self.id
    }

    pub fn track_id(&self) -> &str {
        &self.request.track_id
    }

    pub fn locator(&self) -> &Url {
        &self.request.locator
    }

    pub fn request(&self) -> &TrackRequest {
        &self.request
    }

    pub fn state(&self) -> EntryState {
        self.state.load()
    }

    pub fn delegate(&self) -> &Arc<dyn EntryDelegate> {
        &self.delegate
    }

    pub(crate) fn config(&self) -> &MixerConfig {
        &self.context.config
    }

    fn resources(&self) -> MutexGuard<'_, EntryResources> {
        self.resources.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn transition(
        &self,
        to: EntryState,
        allowed: impl Fn(EntryState) -> bool,
    ) -> Option<EntryState> {
        let from = self.state.transition(to, allowed)?;
        if from != to {
            trace!("Entry {} {} -> {}", self.id, from, to);
        }
        Some(from)
    }

    /// Transition without logging, for the render thread
    pub(crate) fn advance(
        &self,
        to: EntryState,
        allowed: impl Fn(EntryState) -> bool,
    ) -> Option<EntryState> {
        self.state.transition(to, allowed)
    }

    /// Take a loaded entry back before the renderer makes it audible
    ///
    /// Moves it to `Pending` in one step, so the renderer can no longer
    /// start it.
    ///
    /// # Returns
    /// `false` once the entry is audible or has ended
    pub(crate) fn withdraw(&self) -> bool {
        self.transition(EntryState::Pending, |s| {
            matches!(
                s,
                EntryState::Loading | EntryState::Buffering | EntryState::Ready
            )
        })
        .is_some()
    }

    // ------------------------------------------------------------------------
    // Fades
    // ------------------------------------------------------------------------

    pub fn fade_out(&self) -> &FadeEnvelope {
        &self.fade_out
    }

    pub fn fade_in(&self) -> &FadeEnvelope {
        &self.fade_in
    }

    /// Schedule the fade-out at `at` into the track, lasting `duration`
    ///
    /// May be called at any time; a fade already in progress is replaced.
    pub fn set_fadeout(&self, at: Duration, duration: Duration) {
        let rate = self.context.config.output_sample_rate;
        self.set_fadeout_frames(duration_to_frames(at, rate), duration_to_frames(duration, rate));
    }

    /// Frame-exact form of [`set_fadeout`](Self::set_fadeout)
    pub fn set_fadeout_frames(&self, at: u64, duration: u64) {
        debug!(
            "Entry {} fade-out at frame {} for {} frames",
            self.id, at, duration
        );
        self.fade_out.set(at, duration);
    }

    /// Start fading out immediately from the current consumer position
    ///
    /// Unlike a scheduled fade, this one is never postponed while the next
    /// entry buffers.
    pub fn fade_from_now(&self, duration: Duration) {
        let frames = duration_to_frames(duration, self.context.config.output_sample_rate);
        let now = self.frames_consumed();
        self.fade_forced.store(true, Ordering::Release);
        self.fade_out.set(now, frames);
        debug!("Entry {} fading out now over {} frames", self.id, frames);
    }

    pub(crate) fn is_fade_forced(&self) -> bool {
        self.fade_forced.load(Ordering::Acquire)
    }

    /// Gain applied at the current consumer position
    pub fn current_fade_gain(&self) -> f32 {
        let pos = self.frames_consumed();
        self.fade_out.gain_at(pos) * self.fade_in.gain_at(pos)
    }

    pub fn frames_consumed(&self) -> u64 {
        self.frames_consumed.load(Ordering::Acquire)
    }

    pub(crate) fn set_frames_consumed(&self, frames: u64) {
        self.frames_consumed.store(frames, Ordering::Release);
    }

    // ------------------------------------------------------------------------
    // Loading
    // ------------------------------------------------------------------------

    /// Allocate the ring buffer, create the data source and start decoding
    ///
    /// # Returns
    /// The playhead to stage in the renderer. On `PoolExhausted` the entry
    /// stays `Pending` so the load can be retried; other errors leave it in
    /// `Error`.
    pub fn begin_load(self: &Arc<Self>) -> Result<EntryPlayhead> {
        if self
            .transition(EntryState::Loading, |s| s == EntryState::Pending)
            .is_none()
        {
            return Err(EngineError::InvalidState(format!(
                "entry {} cannot load from {}",
                self.id,
                self.state()
            )));
        }
        let attempt = self.load_attempts.fetch_add(1, Ordering::AcqRel) + 1;

        let ring = match PcmRingBuffer::allocate(&self.context.pool, self.config().pcm_buffer_frames())
        {
            Ok(ring) => Arc::new(ring),
            Err(e @ EngineError::PoolExhausted(_)) => {
                debug!("Entry {} waiting for pool blocks (attempt {})", self.id, attempt);
                self.transition(EntryState::Pending, |s| s == EntryState::Loading);
                return Err(e);
            }
            Err(e) => {
                self.fail(&e);
                return Err(e);
            }
        };

        let listener: Arc<dyn MetadataListener> = Arc::new(EntryListener {
            entry: Arc::downgrade(self),
        });
        let source = match self.context.sources.create(self.locator(), listener) {
            Ok(source) => source,
            Err(e) => {
                self.fail(&e);
                return Err(e);
            }
        };

        let entry = Arc::clone(self);
        let thread_ring = Arc::clone(&ring);
        let thread_source = Arc::clone(&source);
        let spawned = std::thread::Builder::new()
            .name(format!("qmix-decode-{}", self.request.track_id))
            .spawn(move || loader::run(entry, thread_ring, thread_source));
        let handle = match spawned {
            Ok(handle) => handle,
            Err(e) => {
                let e = EngineError::from(e);
                source.close();
                self.fail(&e);
                return Err(e);
            }
        };

        let mut resources = self.resources();
        resources.ring = Some(Arc::clone(&ring));
        resources.source = Some(source);
        resources.decode_thread = Some(handle);
        drop(resources);

        info!("Loading {} ({})", self.request.track_id, self.locator());
        Ok(EntryPlayhead::new(Arc::clone(self), ring))
    }

    /// Push decoded frames once, as far as the ring has room
    ///
    /// Moves `Buffering` to `Ready` once the start threshold is buffered.
    ///
    /// # Returns
    /// Frames taken from `samples`
    pub fn continue_buffering(&self, ring: &PcmRingBuffer, samples: &[f32]) -> usize {
        let pushed = ring.push_frames(samples);
        if self.state() == EntryState::Buffering {
            let threshold = self.config().start_threshold_frames();
            if ring.used_frames() >= threshold || ring.free_frames() == 0 {
                self.mark_ready();
            }
        }
        pushed
    }

    fn mark_ready(&self) {
        if self
            .transition(EntryState::Ready, |s| s == EntryState::Buffering)
            .is_some()
        {
            debug!("Entry {} ready", self.id);
            self.delegate.buffered(self);
        }
    }

    /// Decode thread reached end of stream
    pub(crate) fn decode_complete(&self) {
        // A stream shorter than the start threshold is ready as soon as it ends
        self.mark_ready();
        self.transition(EntryState::Drained, |s| {
            matches!(s, EntryState::Playing | EntryState::Fading)
        });
        debug!("Entry {} decode complete", self.id);
    }

    pub(crate) fn set_format(&self, format: PcmFormat) {
        *self.format.lock().unwrap_or_else(PoisonError::into_inner) = Some(format);
        self.delegate.format_changed(self, &format);
    }

    pub fn format(&self) -> Option<PcmFormat> {
        *self.format.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn load_attempts(&self) -> u32 {
        self.load_attempts.load(Ordering::Acquire)
    }

    pub fn ring_stats(&self) -> Option<RingStats> {
        self.resources().ring.as_ref().map(|ring| ring.stats())
    }

    /// Data source, while loading or playing
    pub fn source(&self) -> Option<Arc<dyn DataSource>> {
        self.resources().source.clone()
    }

    pub(crate) fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    // ------------------------------------------------------------------------
    // Terminal transitions
    // ------------------------------------------------------------------------

    /// Mark skipped; the renderer retires it on its next pass
    ///
    /// # Returns
    /// `false` if the entry had already ended
    pub fn skip(&self) -> bool {
        if self.transition(EntryState::Skipped, |_| true).is_none() {
            return false;
        }
        info!("Skipped {}", self.request.track_id);
        self.delegate.skipped(self);
        true
    }

    /// Played out; called by the renderer
    pub(crate) fn finish(&self) -> bool {
        if self.advance(EntryState::Finished, |_| true).is_none() {
            return false;
        }
        self.delegate.finished(self);
        true
    }

    pub(crate) fn fail(&self, error: &EngineError) {
        if self.transition(EntryState::Error, |_| true).is_none() {
            return;
        }
        warn!("Entry {} ({}) failed: {}", self.id, self.request.track_id, error);
        *self.failure.lock().unwrap_or_else(PoisonError::into_inner) = Some(error.to_string());
        self.delegate.failed(self, error);
    }

    /// Why the entry is in `Error`
    pub fn failure(&self) -> Option<String> {
        self.failure.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Stop decoding and release the source and ring
    ///
    /// Blocks until the decode thread exits. Idempotent. The ring's blocks go
    /// back to the pool once the playhead holding it is dropped as well.
    pub fn tidy_up(&self) {
        self.cancel.cancel();
        let EntryResources {
            ring,
            source,
            decode_thread,
        } = std::mem::take(&mut *self.resources());

        if let Some(source) = &source {
            source.close();
        }
        if let Some(ring) = &ring {
            ring.wake_producer();
        }
        if let Some(handle) = decode_thread {
            if handle.thread().id() == std::thread::current().id() {
                warn!("Entry {} tidied from its own decode thread", self.id);
            } else if handle.join().is_err() {
                warn!("Decode thread of entry {} panicked", self.id);
            }
        }
        if source.is_some() || ring.is_some() {
            debug!("Entry {} tidied up", self.id);
        }
    }
}

impl fmt::Debug for QueueEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueEntry")
            .field("id", &self.id)
            .field("track_id", &self.request.track_id)
            .field("state", &self.state())
            .field("frames_consumed", &self.frames_consumed())
            .finish()
    }
}

/// Forwards source metadata to the entry's delegate
///
/// Holds the entry weakly: the source is owned by the entry.
struct EntryListener {
    entry: Weak<QueueEntry>,
}

impl MetadataListener for EntryListener {
    fn did_start_receive(&self) {
        if let Some(entry) = self.entry.upgrade() {
            trace!("Entry {} receiving audio", entry.id);
        }
    }

    fn did_receive(&self, event: &MetadataEvent) {
        if let Some(entry) = self.entry.upgrade() {
            entry.delegate.metadata(&entry, event);
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

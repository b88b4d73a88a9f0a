//! Queue mixer
//!
//! The mixer is split across two threads:
//!
//! - [`QueueMixer`] is the control surface. It owns the queue, starts
//!   entries loading, and turns renderer and decoder notices into
//!   [`MixerDelegate`] calls. All of its methods take `&self`; queue state
//!   sits behind one mutex that the render thread never touches.
//! - [`MixerRenderer`] is taken once with [`QueueMixer::take_renderer`] and
//!   moved to the audio callback.
//!
//! ```text
//! control ──Command (ringbuf SPSC)──▶ renderer
//! control ◀──Notice (crossbeam)────── renderer, decode threads
//! ```
//!
//! Notices are processed by [`QueueMixer::service`], called by the host or
//! by the thread [`QueueMixer::spawn_service_thread`] starts.
//!
//! ## State
//!
//! Mixer state is a flag set ([`MixerState`]): `PLAYING`, `BUFFERING` and
//! `PAUSED` all include `RUNNING`. The renderer moves between `PLAYING` and
//! `BUFFERING` on its own; everything else is driven from the control side.
//!
//! ## Locking
//!
//! Entries taken out of service under the queue lock are only tidied (source
//! closed, decode thread joined) after it is released, and host callbacks
//! run after that.

pub mod delegate;
mod messages;
pub mod queue;
pub mod renderer;

pub use delegate::{EventChannelDelegate, MixerDelegate, NoopDelegate};
pub use queue::{EntryRole, QueueItem};
pub use renderer::MixerRenderer;

use self::delegate::MixerLink;
use self::messages::{Command, Notice, RetireReason};
use self::queue::{MixerQueue, QueueSlot};
use crate::decode::{DecoderFactory, SymphoniaDecoderFactory};
use crate::entry::{EntryContext, EntryId, EntryState, QueueEntry, TrackRequest};
use crate::error::{EngineError, Result};
use crate::pool::{BufferPool, PoolStats};
use crate::source::{HttpSourceFactory, MetadataEvent, ReqwestTransport, SourceFactory};
use crossbeam_channel::{Receiver, RecvTimeoutError};
use qmix_common::{MixerConfig, MixerState};
use ringbuf::traits::*;
use ringbuf::{HeapProd, HeapRb};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};
use url::Url;

/// State shared lock-free between control and renderer
#[derive(Debug)]
pub(crate) struct MixerShared {
    state: AtomicU32,
    /// Master volume as `f32` bits
    volume: AtomicU32,
    frames_rendered: AtomicU64,
    /// Advisory notices dropped on a full channel since last taken
    dropped_notices: AtomicU64,
}

impl MixerShared {
    pub(crate) fn new(volume: f32) -> Self {
        Self {
            state: AtomicU32::new(MixerState::READY.bits()),
            volume: AtomicU32::new(volume.clamp(0.0, 1.0).to_bits()),
            frames_rendered: AtomicU64::new(0),
            dropped_notices: AtomicU64::new(0),
        }
    }

    pub(crate) fn state(&self) -> MixerState {
        MixerState::from_bits(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn swap_state(&self, to: MixerState) -> MixerState {
        MixerState::from_bits(self.state.swap(to.bits(), Ordering::AcqRel))
    }

    pub(crate) fn compare_and_set(&self, from: MixerState, to: MixerState) -> bool {
        self.state
            .compare_exchange(from.bits(), to.bits(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn volume(&self) -> f32 {
        f32::from_bits(self.volume.load(Ordering::Relaxed))
    }

    pub(crate) fn set_volume(&self, volume: f32) {
        self.volume
            .store(volume.clamp(0.0, 1.0).to_bits(), Ordering::Relaxed);
    }

    pub(crate) fn add_frames_rendered(&self, frames: u64) {
        self.frames_rendered.fetch_add(frames, Ordering::Relaxed);
    }

    pub(crate) fn frames_rendered(&self) -> u64 {
        self.frames_rendered.load(Ordering::Relaxed)
    }

    pub(crate) fn note_dropped_notice(&self) {
        self.dropped_notices.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn take_dropped_notices(&self) -> u64 {
        self.dropped_notices.swap(0, Ordering::Relaxed)
    }
}

/// Host notification collected under the queue lock, delivered after it
enum HostEvent {
    State(MixerState, MixerState),
    Started(Arc<QueueEntry>),
    /// Entry left the queue in a terminal state
    Ended(Arc<QueueEntry>),
    Metadata(Arc<QueueEntry>, MetadataEvent),
}

/// Queue state guarded by the control mutex
struct Control {
    queue: MixerQueue,
    /// Entries out of the queue whose playheads the renderer still holds
    retiring: HashMap<EntryId, Arc<QueueEntry>>,
    commands: HeapProd<Command>,
    /// Commands that did not fit in the ring yet
    pending: VecDeque<Command>,
    /// Entries out of service, tidied once the lock is dropped
    released: Vec<Arc<QueueEntry>>,
}

impl Control {
    fn send(&mut self, command: Command) {
        trace!("Command {:?}", command);
        self.pending.push_back(command);
        self.flush_commands();
    }

    fn flush_commands(&mut self) {
        while let Some(command) = self.pending.pop_front() {
            if let Err(command) = self.commands.try_push(command) {
                self.pending.push_front(command);
                debug!("Command ring full, {} commands waiting", self.pending.len());
                break;
            }
        }
    }

    /// Take a slot out of service: recall its playhead and stop its decoder
    fn release(&mut self, slot: QueueSlot) {
        let entry = slot.entry;
        if slot.staged {
            self.send(Command::Unstage(entry.id()));
            self.retiring.insert(entry.id(), Arc::clone(&entry));
        }
        self.released.push(entry);
    }

    /// Claim the staged entry at `index` back before it becomes audible
    ///
    /// # Returns
    /// `InvalidIndex` if the renderer started it since the index was checked
    fn withdraw(&self, index: usize) -> Result<()> {
        match self.queue.slots().get(index) {
            Some(slot) if slot.staged && !slot.entry.state().is_terminal() => {
                if slot.entry.withdraw() {
                    Ok(())
                } else {
                    Err(EngineError::InvalidIndex(format!(
                        "entry at {} has started playing",
                        index
                    )))
                }
            }
            _ => Ok(()),
        }
    }

    /// Swap a staged-but-silent entry for a fresh pending copy
    fn requeue(&mut self, index: usize) {
        let Some(slot) = self.queue.slots().get(index) else {
            return;
        };
        if !slot.staged {
            return;
        }
        let fresh = slot.entry.requeue();
        let old = self.queue.replace(index, fresh);
        self.release(old);
    }

    fn find(&self, id: EntryId) -> Option<Arc<QueueEntry>> {
        self.queue
            .find(id)
            .or_else(|| self.retiring.get(&id))
            .cloned()
    }
}

/// Control surface of the queue mixer
pub struct QueueMixer {
    config: MixerConfig,
    context: Arc<EntryContext>,
    link: Arc<MixerLink>,
    delegate: Arc<dyn MixerDelegate>,
    shared: Arc<MixerShared>,
    control: Mutex<Control>,
    notices: Receiver<Notice>,
    renderer: Mutex<Option<MixerRenderer>>,
    shutdown: AtomicBool,
}

impl QueueMixer {
    /// Create a mixer in the `READY` state
    ///
    /// # Arguments
    /// * `config` - Validated before use
    /// * `sources` - Builds data sources for queued locators
    /// * `decoders` - Builds decoders for opened sources
    /// * `delegate` - Receives playback events
    pub fn new(
        config: MixerConfig,
        sources: Arc<dyn SourceFactory>,
        decoders: Arc<dyn DecoderFactory>,
        delegate: Arc<dyn MixerDelegate>,
    ) -> Result<Self> {
        config.validate()?;
        let pool = Arc::new(BufferPool::new(
            config.pool_max_blocks,
            config.pool_block_bytes,
        )?);

        let (notice_tx, notice_rx) = crossbeam_channel::bounded(config.notice_capacity);
        let (commands, command_rx) = HeapRb::<Command>::new(config.command_capacity).split();
        let shared = Arc::new(MixerShared::new(config.master_volume));
        let renderer = MixerRenderer::new(
            Arc::clone(&shared),
            command_rx,
            notice_tx.clone(),
            config.underrun_threshold_frames(),
            config.command_capacity,
        );

        info!(
            "Queue mixer created: {} Hz output, {:.1}s entry buffers, pool {} x {} bytes",
            config.output_sample_rate,
            config.pcm_buffer_seconds,
            config.pool_max_blocks,
            config.pool_block_bytes
        );

        Ok(Self {
            context: Arc::new(EntryContext {
                pool,
                sources,
                decoders,
                config: config.clone(),
            }),
            config,
            link: Arc::new(MixerLink::new(notice_tx, Arc::clone(&shared))),
            delegate,
            shared,
            control: Mutex::new(Control {
                queue: MixerQueue::default(),
                retiring: HashMap::new(),
                commands,
                pending: VecDeque::new(),
                released: Vec::new(),
            }),
            notices: notice_rx,
            renderer: Mutex::new(Some(renderer)),
            shutdown: AtomicBool::new(false),
        })
    }

    /// Mixer over real HTTP with symphonia decoding
    pub fn with_http(config: MixerConfig, delegate: Arc<dyn MixerDelegate>) -> Result<Self> {
        let transport = Arc::new(ReqwestTransport::new(&config.http)?);
        let sources = Arc::new(HttpSourceFactory::new(
            transport,
            config.http.clone(),
            config.source_kind,
        ));
        Self::new(config, sources, Arc::new(SymphoniaDecoderFactory), delegate)
    }

    fn lock(&self) -> MutexGuard<'_, Control> {
        self.control.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `f` under the queue lock, then tidy released entries and deliver
    /// host events with the lock dropped
    fn edit<R>(&self, f: impl FnOnce(&mut Control, &mut Vec<HostEvent>) -> R) -> R {
        let mut events = Vec::new();
        let (result, released) = {
            let mut control = self.lock();
            let result = f(&mut control, &mut events);
            (result, std::mem::take(&mut control.released))
        };
        for entry in released {
            entry.tidy_up();
        }
        self.dispatch(events);
        result
    }

    fn new_entry(&self, request: TrackRequest) -> Arc<QueueEntry> {
        QueueEntry::new(request, Arc::clone(&self.context), self.link.clone())
    }

    /// Hand out the render half; `None` after the first call
    pub fn take_renderer(&self) -> Option<MixerRenderer> {
        self.renderer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    pub fn config(&self) -> &MixerConfig {
        &self.config
    }

    // ------------------------------------------------------------------------
    // Queue editing
    // ------------------------------------------------------------------------

    /// Append a track
    pub fn enqueue(&self, request: TrackRequest) -> EntryId {
        let entry = self.new_entry(request);
        let id = entry.id();
        debug!("Enqueue {} as {}", entry.track_id(), id);
        self.edit(|control, events| {
            control.queue.push(entry);
            self.ensure_staged(control, events);
        });
        id
    }

    /// Insert a track at `index`
    ///
    /// # Returns
    /// `InvalidIndex` if `index` is past the end or inside the active pair
    pub fn insert(&self, index: usize, request: TrackRequest) -> Result<EntryId> {
        self.edit(|control, events| -> Result<EntryId> {
            control.queue.check_insert(index)?;
            // Displacing a loaded next entry sends it back to pending
            control.withdraw(index)?;
            control.requeue(index);
            let entry = self.new_entry(request);
            let id = entry.id();
            debug!("Insert {} as {} at {}", entry.track_id(), id, index);
            control.queue.insert(index, entry);
            self.ensure_staged(control, events);
            Ok(id)
        })
    }

    /// Replace the entry at `index`
    pub fn replace(&self, index: usize, request: TrackRequest) -> Result<EntryId> {
        self.edit(|control, events| -> Result<EntryId> {
            control.queue.check_existing(index)?;
            control.withdraw(index)?;
            let entry = self.new_entry(request);
            let id = entry.id();
            let old = control.queue.replace(index, entry);
            debug!("Replace {} at {} with {}", old.entry.track_id(), index, id);
            control.release(old);
            self.ensure_staged(control, events);
            Ok(id)
        })
    }

    /// Remove the entry at `index` without notifying the delegate
    pub fn remove(&self, index: usize) -> Result<()> {
        self.edit(|control, events| -> Result<()> {
            control.queue.check_existing(index)?;
            control.withdraw(index)?;
            let old = control.queue.remove(index);
            debug!("Remove {} at {}", old.entry.track_id(), index);
            control.release(old);
            self.ensure_staged(control, events);
            Ok(())
        })
    }

    /// Skip the first live entry of `track_id`
    ///
    /// A playing entry stops at the next render call and the next entry
    /// starts straight away if it is buffered. Skipping the outgoing side of
    /// a crossfade lets the fade finish; skipping the incoming side cuts it.
    pub fn skip(&self, track_id: &str) -> Result<()> {
        self.edit(|control, events| -> Result<()> {
            let index = control
                .queue
                .position_of_track(track_id)
                .ok_or_else(|| EngineError::NotFound(format!("track {} not queued", track_id)))?;
            let entry = Arc::clone(&control.queue.slots()[index].entry);
            entry.skip();
            self.reconcile(control, events);
            self.ensure_staged(control, events);
            Ok(())
        })
    }

    /// Whether `track_id` has an entry that has not ended
    pub fn item_is_queued_or_playing(&self, track_id: &str) -> bool {
        self.lock().queue.position_of_track(track_id).is_some()
    }

    /// Reschedule the fade-out of `track_id`'s first live entry
    pub fn set_fadeout(&self, track_id: &str, at: Duration, duration: Duration) -> Result<()> {
        let control = self.lock();
        let index = control
            .queue
            .position_of_track(track_id)
            .ok_or_else(|| EngineError::NotFound(format!("track {} not queued", track_id)))?;
        control.queue.slots()[index].entry.set_fadeout(at, duration);
        Ok(())
    }

    /// Fade the current entry out now; the next entry fades in alongside it
    /// if it is ready
    pub fn fade_out_current(&self, duration: Duration) -> Result<()> {
        let control = self.lock();
        match control.queue.slots().first() {
            Some(slot) if slot.staged && !slot.entry.state().is_terminal() => {
                slot.entry.fade_from_now(duration);
                Ok(())
            }
            _ => Err(EngineError::InvalidState("nothing is playing".to_string())),
        }
    }

    /// Move `track_id`'s stream to another URL without interrupting playback
    ///
    /// # Returns
    /// `SwitchFailed` if the new URL cannot be opened; playback continues on
    /// the old one
    pub fn switch_source(&self, track_id: &str, url: &Url) -> Result<()> {
        let source = {
            let control = self.lock();
            let index = control
                .queue
                .position_of_track(track_id)
                .ok_or_else(|| EngineError::NotFound(format!("track {} not queued", track_id)))?;
            control.queue.slots()[index].entry.source()
        };
        // Opening the new connection blocks; the queue lock is not held
        let source = source.ok_or_else(|| {
            EngineError::InvalidState(format!("track {} is not loaded", track_id))
        })?;
        source.switch_to_url(url)
    }

    // ------------------------------------------------------------------------
    // Transport
    // ------------------------------------------------------------------------

    /// Start or resume playback
    ///
    /// # Returns
    /// `InvalidState` in `ERROR`; call [`stop`](Self::stop) first
    pub fn play(&self) -> Result<()> {
        let started = loop {
            let from = self.shared.state();
            if from == MixerState::ERROR {
                return Err(EngineError::InvalidState(
                    "mixer is in error, stop it first".to_string(),
                ));
            }
            if from == MixerState::PLAYING || from == MixerState::BUFFERING {
                break None;
            }
            if self.shared.compare_and_set(from, MixerState::PLAYING) {
                info!("Mixer {} -> playing", from);
                break Some(HostEvent::State(from, MixerState::PLAYING));
            }
        };
        self.edit(|control, events| {
            events.extend(started);
            self.ensure_staged(control, events);
        });
        Ok(())
    }

    /// Pause; output decays to silence and entries keep their position
    pub fn pause(&self) -> Result<()> {
        loop {
            let from = self.shared.state();
            if from == MixerState::PAUSED {
                return Ok(());
            }
            if from != MixerState::PLAYING && from != MixerState::BUFFERING {
                return Err(EngineError::InvalidState(format!(
                    "cannot pause while {}",
                    from
                )));
            }
            if self.shared.compare_and_set(from, MixerState::PAUSED) {
                info!("Mixer {} -> paused", from);
                self.dispatch(vec![HostEvent::State(from, MixerState::PAUSED)]);
                return Ok(());
            }
        }
    }

    /// Stop playback and release every entry's resources
    ///
    /// With `keep_queue` the entries stay queued (reset to pending, from the
    /// start); otherwise the queue is cleared. Clears `ERROR`.
    pub fn stop(&self, keep_queue: bool) {
        let from = self.shared.swap_state(MixerState::STOPPED);
        self.edit(|control, events| {
            control.send(Command::Reset);
            for slot in control.queue.drain() {
                let entry = Arc::clone(&slot.entry);
                let touched = slot.staged || entry.state() != EntryState::Pending;
                if slot.staged {
                    control.retiring.insert(entry.id(), Arc::clone(&entry));
                }
                let keep = keep_queue && !entry.state().is_terminal();
                if !touched {
                    // Never loaded: nothing to tidy, and it stays usable
                    if keep {
                        control.queue.push(entry);
                    }
                    continue;
                }
                if keep {
                    control.queue.push(entry.requeue());
                }
                control.released.push(entry);
            }
            info!(
                "Mixer stopped ({} entries kept)",
                control.queue.len()
            );
            if from != MixerState::STOPPED {
                events.push(HostEvent::State(from, MixerState::STOPPED));
            }
        });
    }

    // ------------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------------

    pub fn state(&self) -> MixerState {
        self.shared.state()
    }

    pub fn queue_snapshot(&self) -> Vec<QueueItem> {
        self.lock().queue.snapshot()
    }

    pub fn queue_len(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn entry_state(&self, id: EntryId) -> Option<EntryState> {
        self.lock().find(id).map(|entry| entry.state())
    }

    /// Frames the renderer has written since creation, silence included
    pub fn frames_rendered(&self) -> u64 {
        self.shared.frames_rendered()
    }

    pub fn volume(&self) -> f32 {
        self.shared.volume()
    }

    /// Master volume, clamped to [0, 1]
    pub fn set_volume(&self, volume: f32) {
        self.shared.set_volume(volume);
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.context.pool.stats()
    }

    // ------------------------------------------------------------------------
    // Servicing
    // ------------------------------------------------------------------------

    /// Process pending notices, retire ended entries and start loading
    ///
    /// # Returns
    /// Notices handled
    pub fn service(&self) -> usize {
        self.service_with(None)
    }

    /// Like [`service`](Self::service), first waiting up to `timeout` for a
    /// notice
    pub fn service_timeout(&self, timeout: Duration) -> usize {
        match self.notices.recv_timeout(timeout) {
            Ok(notice) => self.service_with(Some(notice)),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {
                self.service_with(None)
            }
        }
    }

    /// Run [`service_timeout`](Self::service_timeout) on a background thread
    ///
    /// The thread holds the mixer weakly and exits once it is dropped or
    /// [`shutdown`](Self::shutdown) is called.
    pub fn spawn_service_thread(self: &Arc<Self>, period: Duration) -> Result<JoinHandle<()>> {
        let mixer = Arc::downgrade(self);
        let handle = std::thread::Builder::new()
            .name("qmix-service".to_string())
            .spawn(move || {
                debug!("Service thread started");
                while let Some(mixer) = mixer.upgrade() {
                    if mixer.shutdown.load(Ordering::Acquire) {
                        break;
                    }
                    mixer.service_timeout(period);
                }
                debug!("Service thread exiting");
            })?;
        Ok(handle)
    }

    /// Ask the service thread to exit
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
    }

    fn service_with(&self, first: Option<Notice>) -> usize {
        let handled = self.edit(|control, events| {
            let mut handled = 0;
            let notices = first.into_iter().chain(std::iter::from_fn(|| self.notices.try_recv().ok()));
            for notice in notices {
                handled += 1;
                self.handle_notice(control, notice, events);
            }
            self.reconcile(control, events);
            self.ensure_staged(control, events);
            handled
        });
        let dropped = self.shared.take_dropped_notices();
        if dropped > 0 {
            warn!("Notice channel full, {} notices dropped", dropped);
        }
        handled
    }

    fn handle_notice(&self, control: &mut Control, notice: Notice, events: &mut Vec<HostEvent>) {
        trace!("Notice {:?}", notice);
        match notice {
            Notice::Started(id) => {
                if let Some(entry) = control.find(id) {
                    info!("Started {}", entry.track_id());
                    events.push(HostEvent::Started(entry));
                }
            }
            Notice::FadeDue(id) => debug!("Fade-out due for {}", id),
            Notice::Buffered(id) => debug!("Entry {} buffered", id),
            Notice::Format(id, format) => debug!(
                "Entry {} format: {} Hz, {} channels",
                id, format.sample_rate, format.channels
            ),
            Notice::Finished(id) | Notice::Skipped(id) => trace!("Entry {} ended", id),
            Notice::Failed(id, reason) => debug!("Entry {} failed: {}", id, reason),
            Notice::Metadata(id, event) => {
                if let Some(entry) = control.find(id) {
                    events.push(HostEvent::Metadata(entry, event));
                }
            }
            Notice::StateChanged { from, to } => {
                debug!("Renderer moved mixer {} -> {}", from, to);
                events.push(HostEvent::State(from, to));
            }
            Notice::Retired { playhead, reason } => {
                let id = playhead.entry().id();
                control.retiring.remove(&id);
                if let Some(index) = control.queue.position_of(id) {
                    if let Some(slot) = control.queue.slot_mut(index) {
                        slot.staged = false;
                    }
                    if reason != RetireReason::Ended && !playhead.entry().state().is_terminal() {
                        // Bounced without playing; load it again from scratch
                        let fresh = playhead.entry().requeue();
                        let old = control.queue.replace(index, fresh);
                        control.released.push(old.entry);
                    }
                }
                // Dropping the playhead returns its ring's blocks to the pool
                drop(playhead);
            }
        }
    }

    /// Drop unstaged ended entries from the queue
    fn reconcile(&self, control: &mut Control, events: &mut Vec<HostEvent>) {
        for entry in control.queue.take_ended() {
            control.released.push(Arc::clone(&entry));
            events.push(HostEvent::Ended(entry));
        }
    }

    /// Start loading the first two entries while running
    fn ensure_staged(&self, control: &mut Control, events: &mut Vec<HostEvent>) {
        if !self.shared.state().is_running() {
            control.flush_commands();
            return;
        }

        loop {
            let mut removed_any = false;
            for index in 0..control.queue.len().min(2) {
                let slot = &control.queue.slots()[index];
                if slot.staged || slot.entry.state() != EntryState::Pending {
                    continue;
                }
                let entry = Arc::clone(&slot.entry);
                match entry.begin_load() {
                    Ok(playhead) => {
                        if let Some(slot) = control.queue.slot_mut(index) {
                            slot.staged = true;
                        }
                        control.send(Command::Stage(playhead));
                    }
                    Err(e) if e.is_retryable() => {
                        // Blocks held by retiring playheads are still coming back
                        if control.retiring.is_empty()
                            && entry.load_attempts() >= self.config.max_load_attempts
                        {
                            entry.fail(&e);
                            removed_any = true;
                        }
                        // Later entries wait for this one
                        break;
                    }
                    Err(EngineError::InvalidPoolConfig(reason)) => {
                        error!("Entry buffers cannot fit in the pool: {}", reason);
                        let from = self.shared.swap_state(MixerState::ERROR);
                        events.push(HostEvent::State(from, MixerState::ERROR));
                        self.reconcile(control, events);
                        control.flush_commands();
                        return;
                    }
                    Err(e) => {
                        warn!("Could not load {}: {}", entry.track_id(), e);
                        removed_any = true;
                    }
                }
            }
            if !removed_any {
                break;
            }
            self.reconcile(control, events);
        }
        control.flush_commands();
    }

    fn dispatch(&self, events: Vec<HostEvent>) {
        for event in events {
            match event {
                HostEvent::State(from, to) => self.delegate.state_changed(from, to),
                HostEvent::Started(entry) => {
                    self.delegate.track_started(entry.track_id(), entry.id())
                }
                HostEvent::Ended(entry) => match entry.state() {
                    EntryState::Finished => {
                        info!("Finished {}", entry.track_id());
                        self.delegate.track_finished(
                            entry.track_id(),
                            entry.id(),
                            entry.frames_consumed(),
                        )
                    }
                    EntryState::Skipped => self.delegate.track_skipped(entry.track_id(), entry.id()),
                    EntryState::Error => self.delegate.track_failed(
                        entry.track_id(),
                        entry.id(),
                        &entry.failure().unwrap_or_default(),
                    ),
                    _ => {}
                },
                HostEvent::Metadata(entry, event) => {
                    self.delegate
                        .metadata_received(entry.track_id(), entry.id(), &event)
                }
            }
        }
    }
}

impl Drop for QueueMixer {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        let control = self.control.get_mut().unwrap_or_else(PoisonError::into_inner);
        for slot in control.queue.drain() {
            slot.entry.tidy_up();
        }
        for (_, entry) in control.retiring.drain() {
            entry.tidy_up();
        }
        debug!("Queue mixer dropped");
    }
}

impl std::fmt::Debug for QueueMixer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueMixer")
            .field("state", &self.state())
            .field("frames_rendered", &self.frames_rendered())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Tests
// ============================================================================

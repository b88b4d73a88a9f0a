//! Real-time render path
//!
//! [`MixerRenderer`] is moved to the audio thread and driven by its
//! callback. Per call it drains pending commands, then fills the output by
//! walking the current entry (and, during a crossfade, the incoming one) in
//! segments that end exactly on fade boundaries. It holds at most two
//! playheads and never locks, blocks or logs. Playheads it is done with
//! travel back to the control thread as notices, so their rings are freed
//! there; a playhead that does not fit in the notice channel waits in a
//! backlog and is never dropped here. The backlog is reserved up front and
//! only allocates if more playheads pile up than the command ring can stage.

use super::messages::{Command, Notice, RetireReason};
use super::MixerShared;
use crate::entry::{Blend, EntryPlayhead, EntryState};
use crossbeam_channel::{Sender, TrySendError};
use qmix_common::MixerState;
use ringbuf::traits::*;
use ringbuf::HeapCons;
use std::sync::Arc;

/// Per-sample decay applied to the last output while paused
const PAUSE_DECAY_FACTOR: f32 = 0.96875;

/// Decayed samples below this become silence
const PAUSE_DECAY_FLOOR: f32 = 0.0001778;

/// Upper bound on segments walked in one callback
const MAX_SEGMENTS: usize = 32;

/// Audio-thread half of the mixer
pub struct MixerRenderer {
    shared: Arc<MixerShared>,
    commands: HeapCons<Command>,
    notices: Sender<Notice>,

    current: Option<EntryPlayhead>,
    next: Option<EntryPlayhead>,
    crossfading: bool,

    underrun_threshold: u64,
    backlog: Vec<Notice>,

    last_left: f32,
    last_right: f32,
}

impl MixerRenderer {
    pub(crate) fn new(
        shared: Arc<MixerShared>,
        commands: HeapCons<Command>,
        notices: Sender<Notice>,
        underrun_threshold: u64,
        command_capacity: usize,
    ) -> Self {
        Self {
            shared,
            commands,
            notices,
            current: None,
            next: None,
            crossfading: false,
            underrun_threshold,
            // Every staged playhead plus the two held
            backlog: Vec::with_capacity(command_capacity + 2),
            last_left: 0.0,
            last_right: 0.0,
        }
    }

    pub fn state(&self) -> MixerState {
        self.shared.state()
    }

    /// True while the current and incoming entries overlap
    pub fn is_crossfading(&self) -> bool {
        self.crossfading
    }

    /// Fill `out` (interleaved stereo) with the next block of audio
    ///
    /// # Returns
    /// Frames taken from entries; the rest of `out` is silence (or the pause
    /// decay tail)
    pub fn render(&mut self, out: &mut [f32]) -> usize {
        self.drain_commands();
        self.flush_backlog();

        let frames = out.len() / 2;
        let state = self.shared.state();
        let produced = if state == MixerState::PAUSED {
            self.hold_for_pause();
            self.fill_pause_decay(out);
            0
        } else if state == MixerState::PLAYING || state == MixerState::BUFFERING {
            out.fill(0.0);
            let produced = self.mix(out, frames);
            let volume = self.shared.volume();
            for sample in out.iter_mut() {
                *sample = (*sample * volume).clamp(-1.0, 1.0);
            }
            if frames > 0 {
                self.last_left = out[frames * 2 - 2];
                self.last_right = out[frames * 2 - 1];
            }
            produced
        } else {
            out.fill(0.0);
            self.last_left = 0.0;
            self.last_right = 0.0;
            0
        };

        self.shared.add_frames_rendered(frames as u64);
        produced
    }

    // ------------------------------------------------------------------------
    // Messages
    // ------------------------------------------------------------------------

    fn drain_commands(&mut self) {
        while let Some(command) = self.commands.try_pop() {
            match command {
                Command::Stage(playhead) => {
                    if self.current.is_none() {
                        self.current = Some(playhead);
                    } else if self.next.is_none() {
                        self.next = Some(playhead);
                    } else {
                        self.retire(playhead, RetireReason::Unstaged);
                    }
                }
                Command::Unstage(id) => {
                    if self.next.as_ref().is_some_and(|p| p.entry().id() == id) {
                        if let Some(playhead) = self.next.take() {
                            self.crossfading = false;
                            self.retire(playhead, RetireReason::Unstaged);
                        }
                    } else if self.current.as_ref().is_some_and(|p| p.entry().id() == id) {
                        if let Some(playhead) = self.current.take() {
                            self.crossfading = false;
                            self.retire(playhead, RetireReason::Unstaged);
                        }
                    }
                }
                Command::Reset => {
                    self.crossfading = false;
                    if let Some(playhead) = self.current.take() {
                        self.retire(playhead, RetireReason::Reset);
                    }
                    if let Some(playhead) = self.next.take() {
                        self.retire(playhead, RetireReason::Reset);
                    }
                }
            }
        }
    }

    fn notify(&mut self, notice: Notice) {
        match self.notices.try_send(notice) {
            Ok(()) => {}
            Err(TrySendError::Full(retired @ Notice::Retired { .. })) => {
                self.backlog.push(retired);
            }
            Err(TrySendError::Full(_)) => self.shared.note_dropped_notice(),
            // Control side is gone
            Err(TrySendError::Disconnected(_)) => {}
        }
    }

    fn flush_backlog(&mut self) {
        while let Some(notice) = self.backlog.pop() {
            if let Err(e) = self.notices.try_send(notice) {
                self.backlog.push(e.into_inner());
                break;
            }
        }
    }

    fn retire(&mut self, playhead: EntryPlayhead, reason: RetireReason) {
        self.notify(Notice::Retired { playhead, reason });
    }

    fn change_state(&mut self, from: MixerState, to: MixerState) {
        if self.shared.compare_and_set(from, to) {
            self.notify(Notice::StateChanged { from, to });
        }
    }

    // ------------------------------------------------------------------------
    // Mixing
    // ------------------------------------------------------------------------

    /// Walk entries into `out`, returning audible frames produced
    fn mix(&mut self, out: &mut [f32], frames: usize) -> usize {
        let mut pos = 0;
        let mut produced = 0;

        for _ in 0..MAX_SEGMENTS {
            if pos >= frames {
                break;
            }
            self.reap();
            if self.current.is_none() {
                self.current = self.next.take();
                self.crossfading = false;
            }
            let Some(current) = self.current.as_ref() else {
                // Nothing left to wait for
                self.change_state(MixerState::BUFFERING, MixerState::PLAYING);
                break;
            };
            let current_state = current.entry().state();

            if self.shared.state() == MixerState::BUFFERING && !self.can_resume() {
                break;
            }
            if matches!(
                current_state,
                EntryState::Pending | EntryState::Loading | EntryState::Buffering
            ) {
                self.change_state(MixerState::PLAYING, MixerState::BUFFERING);
                break;
            }
            if !self.start_current() {
                break;
            }

            let remaining = frames - pos;
            let seg = self.plan_segment(remaining);
            let range = &mut out[pos * 2..(pos + seg) * 2];

            if self.crossfading {
                let outgoing = match self.current.as_mut() {
                    Some(playhead) => playhead.pull_frames(range, Blend::Add),
                    None => 0,
                };
                let incoming = match self.next.as_mut() {
                    Some(playhead) => playhead.pull_frames(range, Blend::Add),
                    None => 0,
                };
                produced += outgoing.max(incoming);
                pos += seg;
            } else {
                let got = match self.current.as_mut() {
                    Some(playhead) => playhead.pull_frames(range, Blend::Add),
                    None => 0,
                };
                produced += got;
                pos += got;
                if got < seg && !self.current.as_ref().is_some_and(|p| p.is_drained()) {
                    self.change_state(MixerState::PLAYING, MixerState::BUFFERING);
                    break;
                }
            }
        }
        produced
    }

    /// Whether buffering can end for the current entry
    fn can_resume(&self) -> bool {
        let Some(current) = self.current.as_ref() else {
            return true;
        };
        let state = current.entry().state();
        if matches!(
            state,
            EntryState::Pending | EntryState::Loading | EntryState::Buffering
        ) {
            return false;
        }
        if !current.started {
            // Ready means the start threshold is already buffered
            return true;
        }
        current.ring().is_decode_complete() || current.buffered_frames() >= self.underrun_threshold
    }

    /// Move the current entry to playing, announcing its first start
    ///
    /// # Returns
    /// `false` if the entry was withdrawn or ended after its state was read
    fn start_current(&mut self) -> bool {
        let Some(current) = self.current.as_ref() else {
            return false;
        };
        let entry = Arc::clone(current.entry());
        entry.advance(EntryState::Playing, |s| s == EntryState::Ready);
        if !entry.state().is_audible() {
            return false;
        }
        if current.ring().is_decode_complete() {
            entry.advance(EntryState::Drained, |s| s == EntryState::Playing);
        }
        self.change_state(MixerState::BUFFERING, MixerState::PLAYING);
        let first_start = match self.current.as_mut() {
            Some(current) if !current.started => {
                current.started = true;
                true
            }
            _ => false,
        };
        if first_start {
            self.notify(Notice::Started(entry.id()));
        }
        true
    }

    /// Frames to pull before the next fade boundary, starting fades that are
    /// due
    fn plan_segment(&mut self, remaining: usize) -> usize {
        let Some(current) = self.current.as_mut() else {
            return 0;
        };
        let entry = Arc::clone(current.entry());
        let pos = current.position();
        let fade = entry.fade_out().snapshot();

        if !self.crossfading {
            match fade.start {
                Some(start) if pos < start => {
                    return remaining.min((start - pos) as usize);
                }
                Some(_) => {
                    if !current.fade_signalled {
                        current.fade_signalled = true;
                        entry.delegate().should_begin_fade_out(&entry);
                    }
                    let already_fading = current.fading;
                    let next_ready = self
                        .next
                        .as_ref()
                        .map(|n| n.entry().state() == EntryState::Ready);
                    match next_ready {
                        Some(true) if self.begin_crossfade(pos, already_fading) => {}
                        Some(_) if !already_fading && !entry.is_fade_forced() => {
                            // Hold full gain until the next entry is ready
                            entry.fade_out().rebase(pos + remaining as u64);
                            return remaining;
                        }
                        _ => {
                            // Fade out alone
                            if let Some(current) = self.current.as_mut() {
                                current.fading = true;
                            }
                            entry.advance(EntryState::Fading, |s| {
                                matches!(s, EntryState::Playing | EntryState::Drained)
                            });
                        }
                    }
                }
                None => return remaining,
            }
        }

        // Stop exactly where the outgoing fade completes
        let fade = entry.fade_out().snapshot();
        match fade.end() {
            Some(end) if end > pos => remaining.min((end - pos) as usize),
            Some(_) => 0,
            None => remaining,
        }
    }

    /// Start the next entry fading in under the current one
    ///
    /// # Returns
    /// `false`, changing nothing, if the next entry was withdrawn
    fn begin_crossfade(&mut self, pos: u64, already_fading: bool) -> bool {
        let (Some(current), Some(next)) = (self.current.as_mut(), self.next.as_mut()) else {
            return false;
        };
        let incoming = Arc::clone(next.entry());
        if incoming
            .advance(EntryState::Playing, |s| s == EntryState::Ready)
            .is_none()
        {
            return false;
        }
        let outgoing = Arc::clone(current.entry());
        if !already_fading && !outgoing.is_fade_forced() {
            // A postponed fade starts from here
            outgoing.fade_out().rebase(pos);
        }
        let end = outgoing.fade_out().snapshot().end().unwrap_or(pos);
        let length = end.saturating_sub(pos);

        incoming.fade_in().set(next.position(), length);
        outgoing.advance(EntryState::Fading, |s| {
            matches!(s, EntryState::Playing | EntryState::Drained)
        });
        current.fading = true;
        next.started = true;
        self.crossfading = true;
        self.notify(Notice::Started(incoming.id()));
        true
    }

    /// Retire playheads whose entries have ended
    fn reap(&mut self) {
        if let Some(current) = self.current.as_ref() {
            let entry = current.entry();
            let state = entry.state();
            let fade = entry.fade_out().snapshot();
            let faded_out = current.fading && fade.is_complete_at(current.position());
            let ended = match state {
                // A skipped outgoing entry still completes its crossfade
                EntryState::Skipped => !self.crossfading,
                EntryState::Finished | EntryState::Error => true,
                _ => false,
            };
            if ended || faded_out || current.is_drained() {
                if let Some(playhead) = self.current.take() {
                    playhead.entry().finish();
                    self.retire(playhead, RetireReason::Ended);
                }
                // The incoming entry carries on with its fade-in
                self.crossfading = false;
            }
        }

        if let Some(next) = self.next.as_ref() {
            if next.entry().state().is_terminal() {
                if let Some(playhead) = self.next.take() {
                    self.retire(playhead, RetireReason::Ended);
                }
                // Outgoing entry keeps fading out on its own
                self.crossfading = false;
            }
        }
    }

    // ------------------------------------------------------------------------
    // Pause
    // ------------------------------------------------------------------------

    fn hold_for_pause(&mut self) {
        if let Some(current) = self.current.as_ref() {
            current
                .entry()
                .advance(EntryState::Ready, |s| s == EntryState::Playing);
        }
    }

    /// Exponential decay from the last output sample
    fn fill_pause_decay(&mut self, out: &mut [f32]) {
        for frame in out.chunks_exact_mut(2) {
            self.last_left *= PAUSE_DECAY_FACTOR;
            self.last_right *= PAUSE_DECAY_FACTOR;
            if self.last_left.abs() < PAUSE_DECAY_FLOOR {
                self.last_left = 0.0;
            }
            if self.last_right.abs() < PAUSE_DECAY_FLOOR {
                self.last_right = 0.0;
            }
            frame[0] = self.last_left;
            frame[1] = self.last_right;
        }
    }
}

impl Drop for MixerRenderer {
    fn drop(&mut self) {
        // Return playheads so the control side can tidy their entries
        self.drain_commands();
        if let Some(playhead) = self.current.take() {
            self.retire(playhead, RetireReason::Reset);
        }
        if let Some(playhead) = self.next.take() {
            self.retire(playhead, RetireReason::Reset);
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::tests::{context, small_config, RecordingDelegate};
    use crate::entry::{EntryContext, EntryId, PcmRingBuffer, QueueEntry, TrackRequest};
    use crate::source::MemoryTransport;
    use crossbeam_channel::Receiver;
    use url::Url;

    fn renderer(last: (f32, f32)) -> MixerRenderer {
        let shared = Arc::new(MixerShared::new(1.0));
        let (_prod, cons) = ringbuf::HeapRb::<Command>::new(4).split();
        let (tx, _rx) = crossbeam_channel::bounded(4);
        let mut r = MixerRenderer::new(shared, cons, tx, 100, 4);
        r.last_left = last.0;
        r.last_right = last.1;
        r
    }

    #[test]
    fn test_pause_decay_falls_to_silence() {
        let mut r = renderer((1.0, -1.0));
        let mut out = vec![0.0f32; 8];
        r.fill_pause_decay(&mut out);
        assert_eq!(out[0], 0.96875);
        assert_eq!(out[1], -0.96875);
        assert!(out[2] < out[0]);
        assert!(out[4] < out[2]);

        let mut long = vec![1.0f32; 2 * 1000];
        r.fill_pause_decay(&mut long);
        assert_eq!(&long[long.len() - 2..], &[0.0, 0.0]);
    }

    #[test]
    fn test_stopped_renders_silence() {
        let mut r = renderer((0.5, 0.5));
        let mut out = vec![1.0f32; 16];
        assert_eq!(r.render(&mut out), 0);
        assert!(out.iter().all(|&s| s == 0.0));
        assert_eq!(r.shared.frames_rendered(), 8);
    }

    #[test]
    fn test_playing_with_empty_queue_is_silent() {
        let mut r = renderer((0.0, 0.0));
        r.shared.compare_and_set(MixerState::READY, MixerState::PLAYING);
        let mut out = vec![1.0f32; 16];
        assert_eq!(r.render(&mut out), 0);
        assert!(out.iter().all(|&s| s == 0.0));
        assert_eq!(r.state(), MixerState::PLAYING);
    }

    /// Renderer with `commands` already queued
    fn staged(commands: Vec<Command>, notice_capacity: usize) -> (MixerRenderer, Receiver<Notice>) {
        let shared = Arc::new(MixerShared::new(1.0));
        let (mut prod, cons) = ringbuf::HeapRb::<Command>::new(16).split();
        for command in commands {
            assert!(prod.try_push(command).is_ok());
        }
        let (tx, rx) = crossbeam_channel::bounded(notice_capacity);
        (MixerRenderer::new(shared, cons, tx, 100, 16), rx)
    }

    /// Playhead over a fully decoded constant signal
    fn loaded(ctx: &Arc<EntryContext>, track: &str, frames: usize, value: f32) -> EntryPlayhead {
        let entry = QueueEntry::new(
            TrackRequest::new(track, Url::parse(&format!("http://h/{track}")).unwrap()),
            Arc::clone(ctx),
            Arc::new(RecordingDelegate::default()),
        );
        let ring = Arc::new(PcmRingBuffer::allocate(&ctx.pool, frames as u64).unwrap());
        assert_eq!(ring.push_frames(&vec![value; frames * 2]), frames);
        ring.mark_decode_complete();
        EntryPlayhead::new(entry, ring)
    }

    fn make_ready(entry: &QueueEntry) {
        for to in [EntryState::Loading, EntryState::Buffering, EntryState::Ready] {
            entry.advance(to, |_| true);
        }
    }

    #[test]
    fn test_withdrawn_next_entry_is_never_started() {
        let ctx = context(Arc::new(MemoryTransport::new()), small_config());
        let a = loaded(&ctx, "a", 1000, 0.5);
        let b = loaded(&ctx, "b", 1000, 0.25);
        let (a_entry, b_entry) = (Arc::clone(a.entry()), Arc::clone(b.entry()));
        make_ready(&a_entry);
        a_entry.fade_out().set(100, 100);
        let (mut r, _rx) = staged(vec![Command::Stage(a), Command::Stage(b)], 16);
        r.shared.compare_and_set(MixerState::READY, MixerState::PLAYING);

        // Next entry still pending: the fade is held back at full gain
        let mut out = vec![0.0f32; 300 * 2];
        assert_eq!(r.render(&mut out), 300);
        assert!(out.iter().all(|&s| s == 0.5));
        assert!(!r.is_crossfading());
        assert_eq!(a_entry.fade_out().start(), Some(300));

        // Ready then withdrawn before the crossfade could claim it
        make_ready(&b_entry);
        assert!(b_entry.withdraw());
        assert!(!r.begin_crossfade(300, false));
        assert!(!r.is_crossfading());
        assert_eq!(b_entry.state(), EntryState::Pending);
        assert_eq!(b_entry.fade_in().start(), None);
        assert_eq!(a_entry.fade_out().start(), Some(300));
        assert_eq!(a_entry.state(), EntryState::Drained);

        make_ready(&b_entry);
        let mut out = vec![0.0f32; 200 * 2];
        assert_eq!(r.render(&mut out), 200);
        assert!((out[100] - 0.375).abs() < 1e-6);
        assert!(out[200..].iter().all(|&s| s == 0.25));
        assert_eq!(a_entry.state(), EntryState::Finished);
        // Fully decoded, so it plays on as drained
        assert_eq!(b_entry.state(), EntryState::Drained);
    }

    #[test]
    fn test_retired_playheads_wait_for_a_full_channel() {
        let ctx = context(Arc::new(MemoryTransport::new()), small_config());
        // Two are held, the other ten bounce straight back
        let commands = (0..12)
            .map(|i| Command::Stage(loaded(&ctx, &format!("t{i}"), 1000, 0.5)))
            .collect();
        let (mut r, rx) = staged(commands, 1);
        r.notices.try_send(Notice::Buffered(EntryId::new())).unwrap();
        let lent = ctx.pool.stats().lent;

        let mut out = vec![0.0f32; 16];
        r.render(&mut out);
        assert_eq!(r.backlog.len(), 10);
        assert_eq!(ctx.pool.stats().lent, lent);

        let mut retired = 0;
        while let Ok(notice) = rx.try_recv() {
            if let Notice::Retired { playhead, reason } = notice {
                assert_eq!(reason, RetireReason::Unstaged);
                drop(playhead);
                retired += 1;
            }
            r.render(&mut out);
        }
        assert_eq!(retired, 10);
        assert!(r.backlog.is_empty());
        assert_eq!(ctx.pool.stats().lent, lent / 6);
    }
}

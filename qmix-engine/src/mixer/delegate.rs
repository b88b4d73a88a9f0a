//! Host notifications
//!
//! [`MixerDelegate`] is how the host hears about playback. Every method is
//! called on the control thread (inside `QueueMixer::service` or a control
//! call), never on the render thread, and never while the mixer's queue lock
//! is held, so implementations may call back into the mixer.
//!
//! [`MixerLink`] is the other direction: the [`EntryDelegate`] every entry
//! reports to. It only queues notices and never logs, so it is safe on the
//! render and decode threads. Notices that do not fit are counted and
//! reported by the control thread.

use super::messages::Notice;
use super::MixerShared;
use crate::decode::PcmFormat;
use crate::entry::{EntryDelegate, EntryId, QueueEntry};
use crate::error::EngineError;
use crate::source::MetadataEvent;
use crossbeam_channel::{Sender, TrySendError};
use qmix_common::{MixerEvent, MixerState};
use tokio::sync::mpsc::UnboundedSender;
use std::sync::Arc;
use tracing::trace;

/// Receives playback events
///
/// All methods default to doing nothing.
pub trait MixerDelegate: Send + Sync {
    fn state_changed(&self, _from: MixerState, _to: MixerState) {}

    fn track_started(&self, _track_id: &str, _entry: EntryId) {}

    fn track_finished(&self, _track_id: &str, _entry: EntryId, _frames_played: u64) {}

    fn track_skipped(&self, _track_id: &str, _entry: EntryId) {}

    fn track_failed(&self, _track_id: &str, _entry: EntryId, _reason: &str) {}

    fn metadata_received(&self, _track_id: &str, _entry: EntryId, _event: &MetadataEvent) {}
}

/// Delegate that ignores every event
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopDelegate;

impl MixerDelegate for NoopDelegate {}

/// Forwards events as [`MixerEvent`]s into a tokio channel
///
/// Lets async hosts `recv().await` playback events. Events are dropped once
/// the receiver is gone.
#[derive(Debug, Clone)]
pub struct EventChannelDelegate {
    tx: UnboundedSender<MixerEvent>,
}

impl EventChannelDelegate {
    pub fn new(tx: UnboundedSender<MixerEvent>) -> Self {
        Self { tx }
    }

    /// Delegate plus the receiving end of its channel
    pub fn channel() -> (Self, tokio::sync::mpsc::UnboundedReceiver<MixerEvent>) {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn emit(&self, event: MixerEvent) {
        if self.tx.send(event).is_err() {
            trace!("Event receiver dropped");
        }
    }
}

impl MixerDelegate for EventChannelDelegate {
    fn state_changed(&self, from: MixerState, to: MixerState) {
        self.emit(MixerEvent::state_changed(from, to));
    }

    fn track_started(&self, track_id: &str, entry: EntryId) {
        self.emit(MixerEvent::track_started(track_id, entry.as_uuid()));
    }

    fn track_finished(&self, track_id: &str, entry: EntryId, frames_played: u64) {
        self.emit(MixerEvent::track_finished(
            track_id,
            entry.as_uuid(),
            frames_played,
        ));
    }

    fn track_skipped(&self, track_id: &str, entry: EntryId) {
        self.emit(MixerEvent::track_skipped(track_id, entry.as_uuid()));
    }

    fn track_failed(&self, track_id: &str, entry: EntryId, reason: &str) {
        self.emit(MixerEvent::track_failed(track_id, entry.as_uuid(), reason));
    }

    fn metadata_received(&self, track_id: &str, _entry: EntryId, event: &MetadataEvent) {
        self.emit(MixerEvent::metadata_received(
            track_id,
            event.frame,
            event.byte_offset,
            event.text(),
        ));
    }
}

/// Entry delegate that queues notices for the control thread
pub(crate) struct MixerLink {
    notices: Sender<Notice>,
    shared: Arc<MixerShared>,
}

impl MixerLink {
    pub(crate) fn new(notices: Sender<Notice>, shared: Arc<MixerShared>) -> Self {
        Self { notices, shared }
    }

    fn send(&self, notice: Notice) {
        match self.notices.try_send(notice) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => self.shared.note_dropped_notice(),
            Err(TrySendError::Disconnected(_)) => {}
        }
    }
}

impl EntryDelegate for MixerLink {
    fn should_begin_fade_out(&self, entry: &QueueEntry) {
        self.send(Notice::FadeDue(entry.id()));
    }

    fn format_changed(&self, entry: &QueueEntry, format: &PcmFormat) {
        self.send(Notice::Format(entry.id(), *format));
    }

    fn buffered(&self, entry: &QueueEntry) {
        self.send(Notice::Buffered(entry.id()));
    }

    fn finished(&self, entry: &QueueEntry) {
        self.send(Notice::Finished(entry.id()));
    }

    fn skipped(&self, entry: &QueueEntry) {
        self.send(Notice::Skipped(entry.id()));
    }

    fn failed(&self, entry: &QueueEntry, error: &EngineError) {
        self.send(Notice::Failed(entry.id(), error.to_string()));
    }

    fn metadata(&self, entry: &QueueEntry, event: &MetadataEvent) {
        self.send(Notice::Metadata(entry.id(), event.clone()));
    }
}

// ============================================================================
// Tests
// ============================================================================

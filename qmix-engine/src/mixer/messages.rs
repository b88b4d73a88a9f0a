//! Messages between the control side and the renderer
//!
//! Commands travel control → renderer over a lock-free SPSC ring; notices
//! travel renderer/decoders → control over a bounded crossbeam channel. The
//! render thread only ever uses `try_pop` and `try_send` on them.

use crate::decode::PcmFormat;
use crate::entry::{EntryId, EntryPlayhead};
use crate::source::MetadataEvent;
use qmix_common::MixerState;
use std::fmt;

/// Control → renderer
pub(crate) enum Command {
    /// Take ownership of a loaded entry's playhead (current slot if empty,
    /// otherwise next)
    Stage(EntryPlayhead),
    /// Hand back the playhead of this entry without playing it further
    Unstage(EntryId),
    /// Hand back every playhead
    Reset,
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Stage(playhead) => write!(f, "Stage({})", playhead.entry().id()),
            Command::Unstage(id) => write!(f, "Unstage({})", id),
            Command::Reset => f.write_str("Reset"),
        }
    }
}

/// Why a playhead came back from the renderer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RetireReason {
    /// Entry finished, was skipped or failed
    Ended,
    Unstaged,
    Reset,
}

/// Renderer/decoder → control
pub(crate) enum Notice {
    Started(EntryId),
    FadeDue(EntryId),
    Buffered(EntryId),
    Format(EntryId, PcmFormat),
    Finished(EntryId),
    Skipped(EntryId),
    Failed(EntryId, String),
    Metadata(EntryId, MetadataEvent),
    StateChanged { from: MixerState, to: MixerState },
    /// Playhead handed back so its ring is released off the render thread
    Retired {
        playhead: EntryPlayhead,
        reason: RetireReason,
    },
}

impl fmt::Debug for Notice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Notice::Started(id) => write!(f, "Started({})", id),
            Notice::FadeDue(id) => write!(f, "FadeDue({})", id),
            Notice::Buffered(id) => write!(f, "Buffered({})", id),
            Notice::Format(id, format) => write!(f, "Format({}, {:?})", id, format),
            Notice::Finished(id) => write!(f, "Finished({})", id),
            Notice::Skipped(id) => write!(f, "Skipped({})", id),
            Notice::Failed(id, reason) => write!(f, "Failed({}, {})", id, reason),
            Notice::Metadata(id, event) => write!(f, "Metadata({}, @{})", id, event.byte_offset),
            Notice::StateChanged { from, to } => write!(f, "StateChanged({} -> {})", from, to),
            Notice::Retired { playhead, reason } => {
                write!(f, "Retired({}, {:?})", playhead.entry().id(), reason)
            }
        }
    }
}

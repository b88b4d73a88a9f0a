//! Render-side handle on a queue entry
//!
//! The renderer owns one [`EntryPlayhead`] per staged entry. Pulling frames
//! applies the entry's fade envelopes and advances its consumer position;
//! nothing here locks or allocates.

use super::{PcmRingBuffer, QueueEntry};
use std::sync::Arc;

/// How pulled frames combine with what is already in the output
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Blend {
    /// Overwrite the output
    Replace,
    /// Add into the output (crossfades)
    Add,
}

/// Consumer end of an entry's ring buffer
pub struct EntryPlayhead {
    entry: Arc<QueueEntry>,
    ring: Arc<PcmRingBuffer>,
    /// Consumer position mirrored locally; the entry's copy is for readers
    /// on other threads
    position: u64,
    pub(crate) started: bool,
    pub(crate) fade_signalled: bool,
    /// Fade-out has begun (alone or as the outgoing side of a crossfade)
    pub(crate) fading: bool,
}

impl EntryPlayhead {
    pub(crate) fn new(entry: Arc<QueueEntry>, ring: Arc<PcmRingBuffer>) -> Self {
        let position = entry.frames_consumed();
        Self {
            entry,
            ring,
            position,
            started: false,
            fade_signalled: false,
            fading: false,
        }
    }

    pub fn entry(&self) -> &Arc<QueueEntry> {
        &self.entry
    }

    pub fn ring(&self) -> &Arc<PcmRingBuffer> {
        &self.ring
    }

    /// Frames consumed so far
    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn buffered_frames(&self) -> u64 {
        self.ring.used_frames()
    }

    /// Decode complete and every frame consumed
    pub fn is_drained(&self) -> bool {
        self.ring.is_drained()
    }

    /// Copy up to `out.len() / 2` stereo frames into `out` with fades applied
    ///
    /// With [`Blend::Replace`] the frames not produced are left untouched.
    ///
    /// # Returns
    /// Frames produced; fewer than requested on underrun or end of stream
    pub fn pull_frames(&mut self, out: &mut [f32], blend: Blend) -> usize {
        let fade_out = self.entry.fade_out().snapshot();
        let fade_in = self.entry.fade_in().snapshot();
        let start = self.position;

        let produced = self.ring.read_with(out.len() / 2, |i, left, right| {
            let pos = start + i as u64;
            let gain = fade_out.gain_at(pos) * fade_in.gain_at(pos);
            let (l, r) = (left * gain, right * gain);
            match blend {
                Blend::Replace => {
                    out[i * 2] = l;
                    out[i * 2 + 1] = r;
                }
                Blend::Add => {
                    out[i * 2] += l;
                    out[i * 2 + 1] += r;
                }
            }
        });

        self.position += produced as u64;
        self.entry.set_frames_consumed(self.position);
        produced
    }
}

impl std::fmt::Debug for EntryPlayhead {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntryPlayhead")
            .field("entry", &self.entry.id())
            .field("position", &self.position)
            .field("buffered", &self.buffered_frames())
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================

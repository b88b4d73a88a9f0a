//! Fade envelopes
//!
//! An envelope maps an entry's consumer position (frames handed to the
//! renderer) to a gain. The control thread configures a fade while the
//! renderer applies it, so start and duration share one packed atomic word:
//! a [`FadeSnapshot`] always carries a start and duration written together.
//! The renderer takes one snapshot per pull and evaluates that.
//!
//! The start occupies the upper 40 bits and the duration the lower 24.
//! Starts are clamped to [`MAX_FADE_START`] and durations to
//! [`MAX_FADE_DURATION`] frames (about 349 s at 48 kHz).

use qmix_common::FadeCurve;
use std::sync::atomic::{AtomicU64, Ordering};

const DURATION_BITS: u32 = 24;
const DURATION_MASK: u64 = (1 << DURATION_BITS) - 1;

/// All-ones start field: no fade configured
const UNSET_START: u64 = u64::MAX >> DURATION_BITS;

/// Latest frame a fade can start at
pub const MAX_FADE_START: u64 = UNSET_START - 1;

/// Longest fade, in frames
pub const MAX_FADE_DURATION: u64 = DURATION_MASK;

fn pack(start: Option<u64>, duration: u64) -> u64 {
    let start = start.map_or(UNSET_START, |s| s.min(MAX_FADE_START));
    (start << DURATION_BITS) | duration.min(MAX_FADE_DURATION)
}

fn unpack(word: u64) -> (Option<u64>, u64) {
    let start = word >> DURATION_BITS;
    ((start != UNSET_START).then_some(start), word & DURATION_MASK)
}

/// Fade direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FadeDirection {
    /// Silent before the start, full gain after the end
    In,
    /// Full gain before the start, silent after the end
    Out,
}

/// Atomically updatable fade
#[derive(Debug)]
pub struct FadeEnvelope {
    direction: FadeDirection,
    curve: FadeCurve,
    packed: AtomicU64,
}

impl FadeEnvelope {
    pub fn new(direction: FadeDirection, curve: FadeCurve) -> Self {
        Self {
            direction,
            curve,
            packed: AtomicU64::new(pack(None, 0)),
        }
    }

    pub fn direction(&self) -> FadeDirection {
        self.direction
    }

    /// Configure the fade to begin at frame `start` and last `duration` frames
    pub fn set(&self, start: u64, duration: u64) {
        self.packed
            .store(pack(Some(start), duration), Ordering::Release);
    }

    /// Move the start of a configured fade, keeping its duration
    pub fn rebase(&self, start: u64) {
        self.update_start(Some(start));
    }

    pub fn clear(&self) {
        self.update_start(None);
    }

    fn update_start(&self, start: Option<u64>) {
        // The closure never declines, so the update always lands
        let _ = self
            .packed
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |word| {
                Some(pack(start, unpack(word).1))
            });
    }

    pub fn start(&self) -> Option<u64> {
        unpack(self.packed.load(Ordering::Acquire)).0
    }

    pub fn duration(&self) -> u64 {
        unpack(self.packed.load(Ordering::Acquire)).1
    }

    pub fn snapshot(&self) -> FadeSnapshot {
        let (start, duration) = unpack(self.packed.load(Ordering::Acquire));
        FadeSnapshot {
            direction: self.direction,
            curve: self.curve,
            start,
            duration,
        }
    }

    pub fn gain_at(&self, position: u64) -> f32 {
        self.snapshot().gain_at(position)
    }
}

/// Envelope parameters read at one instant
#[derive(Debug, Clone, Copy)]
pub struct FadeSnapshot {
    pub direction: FadeDirection,
    pub curve: FadeCurve,
    pub start: Option<u64>,
    pub duration: u64,
}

impl FadeSnapshot {
    /// Frame at which the fade reaches its final gain
    pub fn end(&self) -> Option<u64> {
        self.start.map(|s| s.saturating_add(self.duration))
    }

    /// Gain at consumer position `position`, always within [0, 1]
    #[inline]
    pub fn gain_at(&self, position: u64) -> f32 {
        let Some(start) = self.start else {
            return 1.0;
        };
        let (before, after) = match self.direction {
            FadeDirection::In => (0.0, 1.0),
            FadeDirection::Out => (1.0, 0.0),
        };
        if position < start {
            return before;
        }
        let elapsed = position - start;
        if elapsed >= self.duration {
            return after;
        }
        let t = elapsed as f32 / self.duration as f32;
        let gain = match self.direction {
            FadeDirection::In => self.curve.fade_in(t),
            FadeDirection::Out => self.curve.fade_out(t),
        };
        gain.clamp(0.0, 1.0)
    }

    /// True once the fade has reached its final gain at `position`
    pub fn is_complete_at(&self, position: u64) -> bool {
        self.end().is_some_and(|end| position >= end)
    }
}

// ============================================================================
// Tests
// ============================================================================

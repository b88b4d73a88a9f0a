//! Mixer state flags and host-facing event types

use serde::{Deserialize, Serialize, Serializer};
use std::fmt;
use uuid::Uuid;

/// Mixer-level state as a set of flags
///
/// `PLAYING`, `PAUSED` and `BUFFERING` all include the `RUNNING` bit, so
/// `state.contains(MixerState::RUNNING)` is true for any of them. Code should
/// test bits with [`MixerState::contains`] rather than compare for equality
/// unless it needs one exact state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MixerState(u32);

impl MixerState {
    /// Nothing has been started yet
    pub const READY: MixerState = MixerState(0);
    /// Superstate of playing, paused and buffering
    pub const RUNNING: MixerState = MixerState(1);
    pub const PLAYING: MixerState = MixerState(1 << 1 | 1);
    /// Current entry underran; waiting for it to refill
    pub const BUFFERING: MixerState = MixerState(1 << 2 | 1);
    pub const PAUSED: MixerState = MixerState(1 << 3 | 1);
    pub const STOPPED: MixerState = MixerState(1 << 4);
    /// Unrecoverable failure; cleared only by `stop`
    pub const ERROR: MixerState = MixerState(1 << 5);

    /// Raw bit pattern (for atomic storage)
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Rebuild from a bit pattern produced by [`MixerState::bits`]
    pub const fn from_bits(bits: u32) -> MixerState {
        MixerState(bits)
    }

    /// True when every bit of `other` is set in `self`
    ///
    /// `READY` has no bits, so only an exact `READY` state contains it.
    pub fn contains(self, other: MixerState) -> bool {
        if other.0 == 0 {
            return self.0 == 0;
        }
        self.0 & other.0 == other.0
    }

    pub fn is_running(self) -> bool {
        self.contains(MixerState::RUNNING)
    }

    pub fn name(self) -> &'static str {
        match self {
            MixerState::READY => "ready",
            MixerState::RUNNING => "running",
            MixerState::PLAYING => "playing",
            MixerState::BUFFERING => "buffering",
            MixerState::PAUSED => "paused",
            MixerState::STOPPED => "stopped",
            MixerState::ERROR => "error",
            _ => "unknown",
        }
    }
}

impl Default for MixerState {
    fn default() -> Self {
        MixerState::READY
    }
}

impl fmt::Display for MixerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl Serialize for MixerState {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.name())
    }
}

impl<'de> Deserialize<'de> for MixerState {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        match name.as_str() {
            "ready" => Ok(MixerState::READY),
            "running" => Ok(MixerState::RUNNING),
            "playing" => Ok(MixerState::PLAYING),
            "buffering" => Ok(MixerState::BUFFERING),
            "paused" => Ok(MixerState::PAUSED),
            "stopped" => Ok(MixerState::STOPPED),
            "error" => Ok(MixerState::ERROR),
            other => Err(serde::de::Error::custom(format!(
                "unknown mixer state '{}'",
                other
            ))),
        }
    }
}

/// Events delivered to the host
///
/// Track ids are the host's opaque identifiers; `entry_id` distinguishes two
/// queue entries of the same track.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum MixerEvent {
    /// Mixer state flags changed
    StateChanged {
        from: MixerState,
        to: MixerState,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Entry began producing audible output
    TrackStarted {
        track_id: String,
        entry_id: Uuid,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Entry played to completion (or faded out fully)
    TrackFinished {
        track_id: String,
        entry_id: Uuid,
        frames_played: u64,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Entry was skipped by the host
    TrackSkipped {
        track_id: String,
        entry_id: Uuid,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Entry failed to load or decode
    TrackFailed {
        track_id: String,
        entry_id: Uuid,
        reason: String,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Interleaved stream metadata arrived
    MetadataReceived {
        track_id: String,
        /// Decoded-frame position the metadata applies from, when known
        frame: Option<u64>,
        /// Audio byte offset the metadata was found at
        byte_offset: u64,
        payload: String,
        timestamp: chrono::DateTime<chrono::Utc>,
    },
}

impl MixerEvent {
    pub fn state_changed(from: MixerState, to: MixerState) -> Self {
        MixerEvent::StateChanged {
            from,
            to,
            timestamp: chrono::Utc::now(),
        }
    }

    pub fn track_started(track_id: impl Into<String>, entry_id: Uuid) -> Self {
        MixerEvent::TrackStarted {
            track_id: track_id.into(),
            entry_id,
            timestamp: chrono::Utc::now(),
        }
    }

    pub fn track_finished(track_id: impl Into<String>, entry_id: Uuid, frames_played: u64) -> Self {
        MixerEvent::TrackFinished {
            track_id: track_id.into(),
            entry_id,
            frames_played,
            timestamp: chrono::Utc::now(),
        }
    }

    pub fn track_skipped(track_id: impl Into<String>, entry_id: Uuid) -> Self {
        MixerEvent::TrackSkipped {
            track_id: track_id.into(),
            entry_id,
            timestamp: chrono::Utc::now(),
        }
    }

    pub fn track_failed(
        track_id: impl Into<String>,
        entry_id: Uuid,
        reason: impl Into<String>,
    ) -> Self {
        MixerEvent::TrackFailed {
            track_id: track_id.into(),
            entry_id,
            reason: reason.into(),
            timestamp: chrono::Utc::now(),
        }
    }

    pub fn metadata_received(
        track_id: impl Into<String>,
        frame: Option<u64>,
        byte_offset: u64,
        payload: impl Into<String>,
    ) -> Self {
        MixerEvent::MetadataReceived {
            track_id: track_id.into(),
            frame,
            byte_offset,
            payload: payload.into(),
            timestamp: chrono::Utc::now(),
        }
    }

    /// Event type as string for filtering
    pub fn event_type(&self) -> &'static str {
        match self {
            MixerEvent::StateChanged { .. } => "StateChanged",
            MixerEvent::TrackStarted { .. } => "TrackStarted",
            MixerEvent::TrackFinished { .. } => "TrackFinished",
            MixerEvent::TrackSkipped { .. } => "TrackSkipped",
            MixerEvent::TrackFailed { .. } => "TrackFailed",
            MixerEvent::MetadataReceived { .. } => "MetadataReceived",
        }
    }

    /// Track the event refers to, if any
    pub fn track_id(&self) -> Option<&str> {
        match self {
            MixerEvent::StateChanged { .. } => None,
            MixerEvent::TrackStarted { track_id, .. }
            | MixerEvent::TrackFinished { track_id, .. }
            | MixerEvent::TrackSkipped { track_id, .. }
            | MixerEvent::TrackFailed { track_id, .. }
            | MixerEvent::MetadataReceived { track_id, .. } => Some(track_id),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_running_superstate() {
        for state in [MixerState::PLAYING, MixerState::PAUSED, MixerState::BUFFERING] {
            assert!(state.contains(MixerState::RUNNING), "{state} should be running");
            assert!(state.is_running());
        }
        for state in [MixerState::READY, MixerState::STOPPED, MixerState::ERROR] {
            assert!(!state.is_running(), "{state} should not be running");
        }
        assert!(!MixerState::PLAYING.contains(MixerState::PAUSED));
        assert!(MixerState::READY.contains(MixerState::READY));
        assert!(!MixerState::PLAYING.contains(MixerState::READY));
    }

    #[test]
    fn test_bits_round_trip() {
        let state = MixerState::from_bits(MixerState::BUFFERING.bits());
        assert_eq!(state, MixerState::BUFFERING);
        assert_eq!(state.to_string(), "buffering");
    }

    #[test]
    fn test_event_serialization() {
        let event = MixerEvent::StateChanged {
            from: MixerState::PLAYING,
            to: MixerState::BUFFERING,
            timestamp: chrono::Utc::now(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "StateChanged");
        assert_eq!(json["from"], "playing");
        assert_eq!(json["to"], "buffering");

        let back: MixerEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back.event_type(), "StateChanged");
        assert_eq!(back.track_id(), None);
    }

    #[test]
    fn test_track_event_constructors() {
        let id = Uuid::new_v4();
        let event = MixerEvent::track_finished("t1", id, 4410);
        assert_eq!(event.event_type(), "TrackFinished");
        assert_eq!(event.track_id(), Some("t1"));

        let json = serde_json::to_value(MixerEvent::metadata_received(
            "radio",
            Some(2048),
            8192,
            "StreamTitle='A';",
        ))
        .unwrap();
        assert_eq!(json["type"], "MetadataReceived");
        assert_eq!(json["frame"], 2048);
        assert_eq!(json["payload"], "StreamTitle='A';");
    }
}

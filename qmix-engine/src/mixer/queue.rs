//! Control-side queue bookkeeping
//!
//! Slot 0 is the current entry once staged; slot 1 is the next one. The
//! renderer holds playheads for at most those two. Indexes are validated
//! against the active pair: the staged current entry, plus the next entry
//! once it has started fading in.

use crate::entry::{EntryId, EntryState, QueueEntry};
use crate::error::{EngineError, Result};
use std::sync::Arc;

/// Where an entry sits relative to the renderer
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryRole {
    /// Staged as the renderer's current entry
    Current,
    /// Staged next and audible (crossfading in)
    Incoming,
    /// Staged next, still buffering or waiting
    Upcoming,
    /// Not yet loaded
    Queued,
}

/// Snapshot of one queue position
#[derive(Debug, Clone, serde::Serialize)]
pub struct QueueItem {
    #[serde(serialize_with = "serialize_entry_id")]
    pub entry_id: EntryId,
    pub track_id: String,
    #[serde(serialize_with = "serialize_state")]
    pub state: EntryState,
    pub role: EntryRole,
}

fn serialize_entry_id<S: serde::Serializer>(id: &EntryId, s: S) -> std::result::Result<S::Ok, S::Error> {
    s.collect_str(id)
}

fn serialize_state<S: serde::Serializer>(state: &EntryState, s: S) -> std::result::Result<S::Ok, S::Error> {
    s.serialize_str(state.name())
}

#[derive(Debug)]
pub(crate) struct QueueSlot {
    pub entry: Arc<QueueEntry>,
    /// Playhead handed to the renderer and not yet returned
    pub staged: bool,
}

#[derive(Debug, Default)]
pub(crate) struct MixerQueue {
    slots: Vec<QueueSlot>,
}

impl MixerQueue {
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn slots(&self) -> &[QueueSlot] {
        &self.slots
    }

    pub fn slot_mut(&mut self, index: usize) -> Option<&mut QueueSlot> {
        self.slots.get_mut(index)
    }

    pub fn push(&mut self, entry: Arc<QueueEntry>) {
        self.slots.push(QueueSlot {
            entry,
            staged: false,
        });
    }

    /// Number of leading slots that belong to the active pair
    pub fn active_len(&self) -> usize {
        match self.slots.as_slice() {
            [first, second, ..] if first.staged => {
                if second.staged && second.entry.state().is_audible() {
                    2
                } else {
                    1
                }
            }
            [first, ..] if first.staged => 1,
            _ => 0,
        }
    }

    /// Index at which a new entry may be inserted
    pub fn check_insert(&self, index: usize) -> Result<()> {
        let active = self.active_len();
        if index < active || index > self.slots.len() {
            return Err(EngineError::InvalidIndex(format!(
                "cannot insert at {} (queue length {}, active {})",
                index,
                self.slots.len(),
                active
            )));
        }
        Ok(())
    }

    /// Index of an existing entry that may be replaced or removed
    pub fn check_existing(&self, index: usize) -> Result<()> {
        let active = self.active_len();
        if index < active || index >= self.slots.len() {
            return Err(EngineError::InvalidIndex(format!(
                "no replaceable entry at {} (queue length {}, active {})",
                index,
                self.slots.len(),
                active
            )));
        }
        Ok(())
    }

    pub fn insert(&mut self, index: usize, entry: Arc<QueueEntry>) {
        self.slots.insert(
            index,
            QueueSlot {
                entry,
                staged: false,
            },
        );
    }

    pub fn remove(&mut self, index: usize) -> QueueSlot {
        self.slots.remove(index)
    }

    pub fn replace(&mut self, index: usize, entry: Arc<QueueEntry>) -> QueueSlot {
        std::mem::replace(
            &mut self.slots[index],
            QueueSlot {
                entry,
                staged: false,
            },
        )
    }

    pub fn position_of(&self, id: EntryId) -> Option<usize> {
        self.slots.iter().position(|s| s.entry.id() == id)
    }

    /// First live entry for `track_id`
    pub fn position_of_track(&self, track_id: &str) -> Option<usize> {
        self.slots
            .iter()
            .position(|s| s.entry.track_id() == track_id && !s.entry.state().is_terminal())
    }

    pub fn find(&self, id: EntryId) -> Option<&Arc<QueueEntry>> {
        self.slots.iter().find(|s| s.entry.id() == id).map(|s| &s.entry)
    }

    /// Remove every unstaged entry in a terminal state
    pub fn take_ended(&mut self) -> Vec<Arc<QueueEntry>> {
        let mut ended = Vec::new();
        self.slots.retain(|slot| {
            if !slot.staged && slot.entry.state().is_terminal() {
                ended.push(Arc::clone(&slot.entry));
                false
            } else {
                true
            }
        });
        ended
    }

    pub fn drain(&mut self) -> Vec<QueueSlot> {
        std::mem::take(&mut self.slots)
    }

    pub fn snapshot(&self) -> Vec<QueueItem> {
        self.slots
            .iter()
            .enumerate()
            .map(|(index, slot)| {
                let state = slot.entry.state();
                let role = match (index, slot.staged) {
                    (0, true) => EntryRole::Current,
                    (_, true) if state.is_audible() => EntryRole::Incoming,
                    (_, true) => EntryRole::Upcoming,
                    _ => EntryRole::Queued,
                };
                QueueItem {
                    entry_id: slot.entry.id(),
                    track_id: slot.entry.track_id().to_string(),
                    state,
                    role,
                }
            })
            .collect()
    }
}

// ============================================================================
// Tests
// ============================================================================

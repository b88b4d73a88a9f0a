//! # qmix Engine Library (qmix-engine)
//!
//! Streaming playback engine with sample-accurate crossfading.
//!
//! **Purpose:** Fetch audio over HTTP, decode it ahead of playback into
//! per-entry PCM ring buffers drawn from a shared block pool, and mix a queue
//! of entries into one stereo output with fades and crossfades.
//!
//! **Architecture:** reqwest transport + symphonia + rubato, feeding a
//! lock-free render path. The host owns the output device and calls
//! [`MixerRenderer::render`] from its audio callback.
//!
//! ```text
//! DataSource ─▶ decode thread ─▶ PcmRingBuffer ─▶ EntryPlayhead ─▶ MixerRenderer
//!   (source)       (entry)          (pool blocks)      (entry)          (mixer)
//! ```

pub mod decode;
pub mod entry;
pub mod error;
pub mod mixer;
pub mod pool;
pub mod source;

pub use entry::{EntryId, EntryState, QueueEntry, TrackRequest};
pub use error::{EngineError, Result};
pub use mixer::{
    EntryRole, EventChannelDelegate, MixerDelegate, MixerRenderer, NoopDelegate, QueueItem,
    QueueMixer,
};
pub use pool::{BufferPool, PoolStats};
pub use source::{DataSource, MetadataEvent};

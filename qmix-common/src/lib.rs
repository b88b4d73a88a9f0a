//! # qmix Common Library
//!
//! Shared code for the qmix streaming mixer crates:
//! - Mixer state flags and host-facing events (MixerEvent)
//! - Configuration loading (MixerConfig)
//! - Fade curve definitions and calculations
//! - Frame / byte / duration conversions

pub mod config;
pub mod error;
pub mod events;
pub mod fade_curves;
pub mod timing;

pub use config::{HttpConfig, MixerConfig, SourceKind};
pub use error::{Error, Result};
pub use events::{MixerEvent, MixerState};
pub use fade_curves::FadeCurve;

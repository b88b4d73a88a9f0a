//! Mixer configuration
//!
//! All settings carry built-in defaults so an empty TOML document (or no file
//! at all) yields a working configuration. Buffering thresholds are expressed
//! in seconds of decoded audio at the output sample rate.
//!
//! ```toml
//! output_sample_rate = 48000
//! pcm_buffer_seconds = 8.0
//! fade_curve = "equal_power"
//!
//! [http]
//! user_agent = "my-player/1.0"
//! ```

use crate::fade_curves::FadeCurve;
use crate::{Error, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

/// Which data source variant the engine builds for each entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// Plain HTTP byte stream
    Plain,
    /// HTTP stream with interleaved ICY metadata stripped out
    #[default]
    Metadata,
    /// Metadata stream that can also hot-swap its URL
    Adaptive,
}

/// HTTP transport settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    /// Connection establishment timeout
    pub connect_timeout_ms: u64,

    /// User-Agent header sent with every request
    pub user_agent: String,

    /// Chunks buffered between a connection pump and the reader
    pub chunk_queue_depth: usize,

    /// Ask servers for interleaved metadata (`Icy-MetaData: 1`)
    pub request_icy_metadata: bool,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 10_000,
            user_agent: concat!("qmix/", env!("CARGO_PKG_VERSION")).to_string(),
            chunk_queue_depth: 32,
            request_icy_metadata: true,
        }
    }
}

impl HttpConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Engine configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MixerConfig {
    /// Sample rate the renderer produces; decoded audio is resampled to it
    pub output_sample_rate: u32,

    /// PCM ring buffer capacity per entry
    pub pcm_buffer_seconds: f64,

    /// Decoded audio an entry needs before it is ready to start
    pub seconds_required_to_start_playing: f64,

    /// Decoded audio needed to leave the buffering state after an underrun
    pub seconds_required_to_start_playing_after_underrun: f64,

    /// Bytes requested from a data source per read
    pub read_buffer_size: usize,

    /// Byte size of each pool block
    pub pool_block_bytes: usize,

    /// Upper bound on blocks the pool will ever have alive
    pub pool_max_blocks: usize,

    /// Open attempts per entry when the source reports a transient failure
    pub max_open_retries: u32,

    /// Pause between open attempts
    pub open_retry_backoff_ms: u64,

    /// Service passes an entry may wait on an exhausted pool before failing
    pub max_load_attempts: u32,

    /// Capacity of the renderer/decoder → control notice channel
    pub notice_capacity: usize,

    /// Capacity of the control → renderer command ring
    pub command_capacity: usize,

    /// Master output gain
    pub master_volume: f32,

    /// Curve used by fade envelopes
    pub fade_curve: FadeCurve,

    /// Data source variant built for queued tracks
    pub source_kind: SourceKind,

    pub http: HttpConfig,
}

impl Default for MixerConfig {
    fn default() -> Self {
        Self {
            output_sample_rate: 44_100,
            pcm_buffer_seconds: 10.0,
            seconds_required_to_start_playing: 1.0,
            seconds_required_to_start_playing_after_underrun: 7.5,
            read_buffer_size: 64 * 1024,
            pool_block_bytes: 128 * 1024,
            pool_max_blocks: 96,
            max_open_retries: 3,
            open_retry_backoff_ms: 500,
            max_load_attempts: 5,
            notice_capacity: 1024,
            command_capacity: 64,
            master_volume: 1.0,
            fade_curve: FadeCurve::Linear,
            source_kind: SourceKind::Metadata,
            http: HttpConfig::default(),
        }
    }
}

impl MixerConfig {
    /// Parse configuration from TOML text and validate it
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: MixerConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file
    ///
    /// # Arguments
    /// * `path` - File to read
    ///
    /// # Returns
    /// Validated configuration, or `Error::Io` / `Error::Config`
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        debug!("Loading mixer configuration from {}", path.display());
        let text = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&text)?;
        info!(
            "Mixer configuration loaded: {} Hz, {:.1}s PCM buffers, pool {} x {} bytes",
            config.output_sample_rate,
            config.pcm_buffer_seconds,
            config.pool_max_blocks,
            config.pool_block_bytes
        );
        Ok(config)
    }

    /// Reject settings the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.output_sample_rate == 0 {
            return Err(Error::Config("output_sample_rate must be positive".into()));
        }
        if !(self.pcm_buffer_seconds > 0.0) {
            return Err(Error::Config("pcm_buffer_seconds must be positive".into()));
        }
        if self.seconds_required_to_start_playing < 0.0
            || self.seconds_required_to_start_playing_after_underrun < 0.0
        {
            return Err(Error::Config("start thresholds must not be negative".into()));
        }
        if self.pool_block_bytes == 0 || self.pool_block_bytes % 4 != 0 {
            return Err(Error::Config(format!(
                "pool_block_bytes must be a positive multiple of 4, got {}",
                self.pool_block_bytes
            )));
        }
        if self.pool_max_blocks == 0 {
            return Err(Error::Config("pool_max_blocks must be positive".into()));
        }
        if self.read_buffer_size == 0 {
            return Err(Error::Config("read_buffer_size must be positive".into()));
        }
        if self.notice_capacity == 0 || self.command_capacity == 0 {
            return Err(Error::Config("channel capacities must be positive".into()));
        }
        if self.http.chunk_queue_depth == 0 {
            return Err(Error::Config("http.chunk_queue_depth must be positive".into()));
        }
        if !(0.0..=1.0).contains(&self.master_volume) {
            return Err(Error::Config(format!(
                "master_volume out of range: {}",
                self.master_volume
            )));
        }
        Ok(())
    }

    /// Frame capacity of one entry's PCM ring buffer
    pub fn pcm_buffer_frames(&self) -> u64 {
        crate::timing::seconds_to_frames(self.pcm_buffer_seconds, self.output_sample_rate)
    }

    /// Buffered frames an entry needs before it is ready to start
    ///
    /// Capped at the ring capacity so a large threshold can still be met.
    pub fn start_threshold_frames(&self) -> u64 {
        crate::timing::seconds_to_frames(
            self.seconds_required_to_start_playing,
            self.output_sample_rate,
        )
        .min(self.pcm_buffer_frames())
    }

    /// Buffered frames needed to resume after an underrun
    pub fn underrun_threshold_frames(&self) -> u64 {
        crate::timing::seconds_to_frames(
            self.seconds_required_to_start_playing_after_underrun,
            self.output_sample_rate,
        )
        .min(self.pcm_buffer_frames())
    }

    pub fn open_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.open_retry_backoff_ms)
    }
}

// ============================================================================
// Tests
// ============================================================================

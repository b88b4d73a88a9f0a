//! ICY interleaved metadata
//!
//! Servers that honor `Icy-MetaData: 1` announce an interval `N` in the
//! `icy-metaint` response header and then send
//!
//! ```text
//! [N audio bytes][L][L × 16 metadata bytes][N audio bytes][L]...
//! ```
//!
//! where `L` is a single length byte. `L = 0` means no metadata this round.
//! Metadata is NUL-padded to a multiple of 16 bytes. The stripper is a
//! streaming state machine, so block boundaries may fall anywhere inside a
//! network chunk.

/// Metadata length byte multiplier
pub const METADATA_LENGTH_MULTIPLIER: usize = 16;

/// Response header announcing the metadata interval
pub const ICY_METAINT_HEADER: &str = "icy-metaint";

/// Response header announcing the stream bitrate in kbit/s
pub const ICY_BITRATE_HEADER: &str = "icy-br";

/// One run of output from the stripper, in stream order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IcyPiece {
    Audio(Vec<u8>),
    /// Non-empty metadata payload with NUL padding removed
    Metadata(Vec<u8>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Audio { remaining: usize },
    Length,
    Payload { remaining: usize },
}

/// Separates audio bytes from interleaved metadata blocks
#[derive(Debug)]
pub struct IcyStripper {
    interval: usize,
    state: State,
    payload: Vec<u8>,
}

impl IcyStripper {
    /// # Arguments
    /// * `interval` - Audio bytes between metadata blocks (`icy-metaint`); must be positive
    pub fn new(interval: usize) -> Self {
        let interval = interval.max(1);
        Self {
            interval,
            state: State::Audio {
                remaining: interval,
            },
            payload: Vec::new(),
        }
    }

    pub fn interval(&self) -> usize {
        self.interval
    }

    /// Split `chunk` into audio and metadata pieces
    ///
    /// Pieces are appended to `out` in stream order. Consecutive audio bytes
    /// inside one chunk come out as a single piece.
    pub fn feed(&mut self, mut chunk: &[u8], out: &mut Vec<IcyPiece>) {
        while !chunk.is_empty() {
            match self.state {
                State::Audio { remaining } => {
                    let take = remaining.min(chunk.len());
                    match out.last_mut() {
                        Some(IcyPiece::Audio(run)) => run.extend_from_slice(&chunk[..take]),
                        _ => out.push(IcyPiece::Audio(chunk[..take].to_vec())),
                    }
                    chunk = &chunk[take..];
                    self.state = if take == remaining {
                        State::Length
                    } else {
                        State::Audio {
                            remaining: remaining - take,
                        }
                    };
                }
                State::Length => {
                    let len = chunk[0] as usize * METADATA_LENGTH_MULTIPLIER;
                    chunk = &chunk[1..];
                    self.state = if len == 0 {
                        State::Audio {
                            remaining: self.interval,
                        }
                    } else {
                        self.payload.clear();
                        State::Payload { remaining: len }
                    };
                }
                State::Payload { remaining } => {
                    let take = remaining.min(chunk.len());
                    self.payload.extend_from_slice(&chunk[..take]);
                    chunk = &chunk[take..];
                    if take == remaining {
                        let end = self
                            .payload
                            .iter()
                            .rposition(|&b| b != 0)
                            .map_or(0, |i| i + 1);
                        if end > 0 {
                            out.push(IcyPiece::Metadata(self.payload[..end].to_vec()));
                        }
                        self.payload.clear();
                        self.state = State::Audio {
                            remaining: self.interval,
                        };
                    } else {
                        self.state = State::Payload {
                            remaining: remaining - take,
                        };
                    }
                }
            }
        }
    }
}

/// Parse `Key='Value';` pairs from a metadata payload
///
/// ```ignore
/// let fields = parse_icy_fields("StreamTitle='Artist - Song';StreamUrl='';");
/// assert_eq!(fields[0], ("StreamTitle".into(), "Artist - Song".into()));
/// ```
pub fn parse_icy_fields(payload: &str) -> Vec<(String, String)> {
    let mut fields = Vec::new();
    let mut rest = payload;
    while let Some(eq) = rest.find('=') {
        let key = rest[..eq].trim().trim_start_matches(';').trim().to_string();
        let after = &rest[eq + 1..];
        let (value, remainder) = if let Some(quoted) = after.strip_prefix('\'') {
            // Titles may contain quotes; only `';` ends a value
            match quoted.find("';") {
                Some(end) => (&quoted[..end], &quoted[end + 2..]),
                None => (quoted.strip_suffix('\'').unwrap_or(quoted), ""),
            }
        } else {
            match after.find(';') {
                Some(end) => (&after[..end], &after[end + 1..]),
                None => (after, ""),
            }
        };
        if !key.is_empty() {
            fields.push((key, value.to_string()));
        }
        rest = remainder;
    }
    fields
}

// ============================================================================
// Tests
// ============================================================================

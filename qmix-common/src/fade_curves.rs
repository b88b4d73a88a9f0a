//! Fade curve shapes used by entry fade envelopes
//!
//! A curve maps normalized fade progress `t` in `[0, 1]` to a gain. Fade-in
//! curves rise from 0.0 to 1.0, fade-out curves fall from 1.0 to 0.0, and both
//! are monotonic so the envelope built on top of them is monotonic too.

use serde::{Deserialize, Serialize};
use std::f32::consts::{FRAC_PI_2, PI};
use std::fmt;
use std::str::FromStr;

/// Curve shape applied across a fade
///
/// - Linear: constant rate of change (default, exact gains are easy to verify)
/// - Exponential: slow start, fast finish
/// - Logarithmic: fast start, slow finish
/// - SCurve: smooth acceleration and deceleration
/// - EqualPower: constant perceived loudness when paired in a crossfade
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FadeCurve {
    /// v(t) = t
    #[default]
    Linear,
    /// v(t) = t²
    Exponential,
    /// v(t) = √t
    Logarithmic,
    /// v(t) = 0.5 × (1 − cos(π t))
    SCurve,
    /// v(t) = sin(t × π/2)
    EqualPower,
}

impl FadeCurve {
    /// Gain for a fade-in at normalized position `t`
    ///
    /// # Arguments
    /// * `t` - Progress through the fade, clamped to 0.0..=1.0
    ///
    /// # Returns
    /// 0.0 at the start of the fade, 1.0 at the end
    pub fn fade_in(&self, t: f32) -> f32 {
        let t = t.clamp(0.0, 1.0);
        match self {
            FadeCurve::Linear => t,
            FadeCurve::Exponential => t * t,
            FadeCurve::Logarithmic => t.sqrt(),
            FadeCurve::SCurve => 0.5 * (1.0 - (PI * t).cos()),
            FadeCurve::EqualPower => (t * FRAC_PI_2).sin(),
        }
    }

    /// Gain for a fade-out at normalized position `t`
    ///
    /// Mirror image of [`FadeCurve::fade_in`]: 1.0 at the start, 0.0 at the end.
    pub fn fade_out(&self, t: f32) -> f32 {
        let t = t.clamp(0.0, 1.0);
        match self {
            // Written out so linear fade-out is exactly 1 - t
            FadeCurve::Linear => 1.0 - t,
            FadeCurve::EqualPower => (t * FRAC_PI_2).cos(),
            other => other.fade_in(1.0 - t),
        }
    }

    /// Name used in configuration files
    pub fn as_str(&self) -> &'static str {
        match self {
            FadeCurve::Linear => "linear",
            FadeCurve::Exponential => "exponential",
            FadeCurve::Logarithmic => "logarithmic",
            FadeCurve::SCurve => "s_curve",
            FadeCurve::EqualPower => "equal_power",
        }
    }
}

impl fmt::Display for FadeCurve {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FadeCurve {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "linear" => Ok(FadeCurve::Linear),
            "exponential" => Ok(FadeCurve::Exponential),
            "logarithmic" => Ok(FadeCurve::Logarithmic),
            "s_curve" | "scurve" | "cosine" => Ok(FadeCurve::SCurve),
            "equal_power" | "equalpower" => Ok(FadeCurve::EqualPower),
            other => Err(crate::Error::InvalidInput(format!(
                "unknown fade curve '{}'",
                other
            ))),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

//! Vibration pattern engine
//!
//! Every pattern is a short, finite sequence of (intensity, hold) steps and
//! always ends with the motor at 0%.

use super::{HapticOutput, Step};
use std::time::Duration;

/// Intensity for taps
const TAP_INTENSITY: u8 = 60;
/// Single tap duration
const GENTLE_TAP_HOLD: Duration = Duration::from_millis(80);
/// Each tap of a double tap
const DOUBLE_TAP_HOLD: Duration = Duration::from_millis(60);
/// Gap between the two taps
const DOUBLE_TAP_GAP: Duration = Duration::from_millis(80);
/// Soft pulse step interval
const SOFT_PULSE_STEP: Duration = Duration::from_millis(60);

/// Vibration feedback patterns
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HapticPattern {
    Off,
    /// Single short tap - threshold crossed
    GentleTap,
    /// Two taps
    DoubleTap,
    /// Ramp 10% to 50% and back down
    SoftPulse,
}

/// Step sequencer for the vibration motor
pub struct HapticEngine {
    output: Box<dyn HapticOutput>,
    pattern: HapticPattern,
    step: u32,
}

impl HapticEngine {
    /// Create an engine with the motor off
    pub fn new(mut output: Box<dyn HapticOutput>) -> Self {
        output.set_intensity(0);
        Self {
            output,
            pattern: HapticPattern::Off,
            step: 0,
        }
    }

    /// Switch to a pattern and run its step 0
    pub fn select(&mut self, pattern: HapticPattern) -> Step {
        self.output.set_intensity(0);
        self.pattern = pattern;
        self.step = 0;
        tracing::debug!(?pattern, "Vibration pattern selected");
        self.advance()
    }

    /// Motor off immediately
    pub fn stop(&mut self) {
        self.pattern = HapticPattern::Off;
        self.step = 0;
        self.output.set_intensity(0);
    }

    /// Run the current step and move to the next one
    pub fn advance(&mut self) -> Step {
        let step = self.step;
        self.step = step.saturating_add(1);

        let (intensity, hold) = match (self.pattern, step) {
            (HapticPattern::GentleTap, 0) => (TAP_INTENSITY, Some(GENTLE_TAP_HOLD)),
            (HapticPattern::DoubleTap, 0 | 2) => (TAP_INTENSITY, Some(DOUBLE_TAP_HOLD)),
            (HapticPattern::DoubleTap, 1) => (0, Some(DOUBLE_TAP_GAP)),
            (HapticPattern::SoftPulse, 0..=4) => ((step as u8 + 1) * 10, Some(SOFT_PULSE_STEP)),
            (HapticPattern::SoftPulse, 5..=8) => ((9 - step as u8) * 10, Some(SOFT_PULSE_STEP)),
            _ => (0, None),
        };

        self.output.set_intensity(intensity);
        match hold {
            Some(hold) => Step::Continue(hold),
            None => {
                self.pattern = HapticPattern::Off;
                self.step = 0;
                Step::Finished
            }
        }
    }

    /// Active pattern (`Off` once a pattern has finished)
    pub fn pattern(&self) -> HapticPattern {
        self.pattern
    }
}

//! LED pattern engine
//!
//! Patterns on the RGB indicator:
//! - `PulseWarm`: red on/off every 250 ms until replaced (over threshold)
//! - `BreatheCalm`: green on 700 ms / off 300 ms, indefinitely (idle)
//! - `FlashAccent`: three blue flashes at 100 ms steps, then back to
//!   `BreatheCalm` after a 200 ms pause (companion connected)

use super::{LedColor, Step, VisualOutput};
use std::time::Duration;

/// Pulse half-period
const PULSE_STEP: Duration = Duration::from_millis(250);
/// Breathe on-phase
const BREATHE_ON: Duration = Duration::from_millis(700);
/// Breathe off-phase
const BREATHE_OFF: Duration = Duration::from_millis(300);
/// Flash half-period
const FLASH_STEP: Duration = Duration::from_millis(100);
/// Pause between the last flash and the return to breathe
const FLASH_SETTLE: Duration = Duration::from_millis(200);
/// Number of flash steps (three on/off pairs)
const FLASH_STEPS: u32 = 6;

/// LED feedback patterns
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VisualPattern {
    Off,
    /// Warm red pulse - over threshold
    PulseWarm,
    /// Slow green breathe - idle / under threshold
    BreatheCalm,
    /// Quick blue flashes - wireless event
    FlashAccent,
}

/// Step sequencer for the LED channels
pub struct VisualEngine {
    output: Box<dyn VisualOutput>,
    pattern: VisualPattern,
    step: u32,
}

impl VisualEngine {
    /// Create an engine, switching every channel off
    pub fn new(mut output: Box<dyn VisualOutput>) -> Self {
        for color in LedColor::ALL {
            output.set_led(color, false);
        }
        Self {
            output,
            pattern: VisualPattern::Off,
            step: 0,
        }
    }

    /// Switch to a pattern and run its step 0
    ///
    /// The caller must have dropped any pending continuation of the previous
    /// pattern; the deferred domain does this in the same unit of work.
    pub fn select(&mut self, pattern: VisualPattern) -> Step {
        self.all_off();
        self.pattern = pattern;
        self.step = 0;
        tracing::debug!(?pattern, "LED pattern selected");
        self.advance()
    }

    /// Turn everything off
    pub fn stop(&mut self) {
        self.all_off();
        self.pattern = VisualPattern::Off;
        self.step = 0;
    }

    /// Run the current step and move to the next one
    pub fn advance(&mut self) -> Step {
        let step = self.step;

        match self.pattern {
            VisualPattern::Off => {
                self.all_off();
                Step::Finished
            }
            VisualPattern::PulseWarm => {
                self.output.set_led(LedColor::Red, step % 2 == 1);
                self.step = step.wrapping_add(1);
                Step::Continue(PULSE_STEP)
            }
            VisualPattern::BreatheCalm => {
                let on = step % 2 == 0;
                self.output.set_led(LedColor::Green, on);
                self.step = step.wrapping_add(1);
                Step::Continue(if on { BREATHE_ON } else { BREATHE_OFF })
            }
            VisualPattern::FlashAccent => {
                if step < FLASH_STEPS {
                    self.output.set_led(LedColor::Blue, step % 2 == 1);
                    self.step = step + 1;
                    Step::Continue(FLASH_STEP)
                } else {
                    self.output.set_led(LedColor::Blue, false);
                    self.pattern = VisualPattern::BreatheCalm;
                    self.step = 0;
                    Step::Continue(FLASH_SETTLE)
                }
            }
        }
    }

    /// Active pattern
    pub fn pattern(&self) -> VisualPattern {
        self.pattern
    }

    /// Index of the next step to run
    pub fn step(&self) -> u32 {
        self.step
    }

    fn all_off(&mut self) {
        for color in LedColor::ALL {
            self.output.set_led(color, false);
        }
    }
}

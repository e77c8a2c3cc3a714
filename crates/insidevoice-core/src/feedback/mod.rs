//! Feedback pattern engines and output driver boundary
//!
//! Contains:
//! - LED patterns driving three boolean channels ([`led`])
//! - Vibration patterns driving one PWM intensity ([`vibration`])
//!
//! Engines are step sequencers. Each step sets the outputs and returns a
//! [`Step`] telling the deferred domain when to run the next one. Engines
//! never sleep or spawn; timing belongs to [`crate::deferred`].

pub mod led;
pub mod vibration;

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// What a pattern step asks for next
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Run the next step after this delay
    Continue(Duration),
    /// Pattern finished, outputs are neutral
    Finished,
}

impl Step {
    /// Delay before the next step, if any
    pub fn delay(self) -> Option<Duration> {
        match self {
            Step::Continue(delay) => Some(delay),
            Step::Finished => None,
        }
    }
}

/// LED channel on the RGB indicator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LedColor {
    Red,
    Green,
    Blue,
}

impl LedColor {
    /// Every channel, in driver order
    pub const ALL: [LedColor; 3] = [LedColor::Red, LedColor::Green, LedColor::Blue];

    fn index(self) -> usize {
        match self {
            LedColor::Red => 0,
            LedColor::Green => 1,
            LedColor::Blue => 2,
        }
    }
}

/// GPIO driver for the visual channels
pub trait VisualOutput: Send {
    /// Switch one LED channel on or off
    fn set_led(&mut self, color: LedColor, on: bool);
}

/// PWM driver for the vibration motor
pub trait HapticOutput: Send {
    /// Set motor intensity in percent (0 = off, clamped to 100)
    fn set_intensity(&mut self, percent: u8);
}

/// PWM period for coin vibration motors (20 ms, 50 Hz)
pub const VIBRATION_PERIOD_NS: u32 = 20_000_000;

/// Pulse width for an intensity percentage over [`VIBRATION_PERIOD_NS`]
pub fn duty_cycle_ns(percent: u8) -> u32 {
    (u64::from(VIBRATION_PERIOD_NS) * u64::from(percent.min(100)) / 100) as u32
}

/// LED driver that mirrors channel state into shared memory
///
/// Used on hosts without GPIO and to observe the engines from outside.
#[derive(Debug, Clone, Default)]
pub struct SharedLeds {
    state: Arc<Mutex<[bool; 3]>>,
}

impl SharedLeds {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current state of one channel
    pub fn is_on(&self, color: LedColor) -> bool {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)[color.index()]
    }

    /// Whether every channel is off
    pub fn all_off(&self) -> bool {
        LedColor::ALL.iter().all(|&c| !self.is_on(c))
    }
}

impl VisualOutput for SharedLeds {
    fn set_led(&mut self, color: LedColor, on: bool) {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)[color.index()] = on;
        tracing::trace!(?color, on, "led");
    }
}

/// Motor driver that mirrors intensity into shared memory
#[derive(Debug, Clone, Default)]
pub struct SharedMotor {
    state: Arc<Mutex<MotorTrace>>,
}

#[derive(Debug, Default)]
struct MotorTrace {
    intensity: u8,
    history: Vec<u8>,
}

impl SharedMotor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current intensity in percent
    pub fn intensity(&self) -> u8 {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .intensity
    }

    /// Every intensity written so far, in order
    pub fn history(&self) -> Vec<u8> {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .history
            .clone()
    }
}

impl HapticOutput for SharedMotor {
    fn set_intensity(&mut self, percent: u8) {
        let percent = percent.min(100);
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.intensity = percent;
        state.history.push(percent);
        tracing::trace!(percent, duty_ns = duty_cycle_ns(percent), "vibration");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duty_cycle() {
        assert_eq!(duty_cycle_ns(0), 0);
        assert_eq!(duty_cycle_ns(60), 12_000_000);
        assert_eq!(duty_cycle_ns(100), VIBRATION_PERIOD_NS);
        assert_eq!(duty_cycle_ns(250), VIBRATION_PERIOD_NS);
    }

    #[test]
    fn test_shared_leds_mirror_state() {
        let leds = SharedLeds::new();
        let mut driver = leds.clone();
        assert!(leds.all_off());

        driver.set_led(LedColor::Green, true);
        assert!(leds.is_on(LedColor::Green));
        assert!(!leds.is_on(LedColor::Red));
        assert!(!leds.all_off());
    }

    #[test]
    fn test_shared_motor_records_history() {
        let motor = SharedMotor::new();
        let mut driver = motor.clone();
        driver.set_intensity(60);
        driver.set_intensity(0);
        driver.set_intensity(140);

        assert_eq!(motor.intensity(), 100);
        assert_eq!(motor.history(), vec![60, 0, 100]);
    }

    #[test]
    fn test_step_delay() {
        let step = Step::Continue(Duration::from_millis(80));
        assert_eq!(step.delay(), Some(Duration::from_millis(80)));
        assert_eq!(Step::Finished.delay(), None);
    }
}

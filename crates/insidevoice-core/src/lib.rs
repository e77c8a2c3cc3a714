//! InsideVoice Core - sound level monitoring, feedback and history sync
//!
//! This library is the control core of the InsideVoice wearable. It estimates
//! ambient loudness from microphone blocks, decides with hysteresis whether the
//! wearer is too loud, drives LED and vibration feedback, keeps a bounded
//! history of one-second averages and streams that history to a companion app.
//!
//! Two execution contexts run side by side:
//! - the acquisition thread ([`monitor`]) owning the per-block decision loop
//! - the deferred domain ([`deferred`]) owning every timed state machine

pub mod audio;
pub mod config;
pub mod deferred;
pub mod device;
pub mod feedback;
pub mod history;
pub mod monitor;
pub mod service;
pub mod sync;

pub use audio::level::estimate_level;
pub use config::{ConfigStore, FeedbackMode, ThresholdConfig};
pub use deferred::{DeferredDomain, DeferredHandle, Request};
pub use device::{Device, DeviceParts};
pub use feedback::led::{VisualEngine, VisualPattern};
pub use feedback::vibration::{HapticEngine, HapticPattern};
pub use history::{LoudnessSample, SampleHistory};
pub use monitor::{Hysteresis, MonitorHandle, ThresholdMonitor};
pub use service::{Characteristic, ConfigService, Delivery, Transport};
pub use sync::walker::SyncWalker;

/// Application version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build date (YYYY-MM-DD) stamped by build.rs
pub const BUILD_DATE: &str = env!("BUILD_DATE");

/// Microphone sample rate in Hz
pub const SAMPLE_RATE: u32 = 16000;

/// Samples per acquisition block (100 ms at 16 kHz)
pub const BLOCK_SAMPLES: usize = 1600;

/// Upper bound of the pseudo-SPL scale
pub const MAX_LEVEL_DB: u8 = 90;

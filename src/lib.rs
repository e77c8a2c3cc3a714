//! InsideVoice - host-side simulator for the InsideVoice wearable
//!
//! This library re-exports the device core from `insidevoice-core` and adds
//! the companion side of the sync protocol: decoding streamed records and
//! exporting them with wall-clock timestamps.

pub mod companion;
#[cfg(feature = "mic")]
pub mod mic;

pub use insidevoice_core::{audio, config, deferred, device, feedback, history, monitor};
pub use insidevoice_core::{service, sync};

pub use insidevoice_core::{ConfigStore, Device, DeviceParts, FeedbackMode, ThresholdConfig};
pub use insidevoice_core::{LoudnessSample, SampleHistory};
pub use insidevoice_core::{BLOCK_SAMPLES, BUILD_DATE, MAX_LEVEL_DB, SAMPLE_RATE, VERSION};

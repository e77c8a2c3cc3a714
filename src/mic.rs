//! Default input device as a block source
//!
//! Opens the system's default microphone with cpal, keeps channel 0 and
//! decimates to 16 kHz when the device rate is an integer multiple. Samples
//! are pushed into a [`RingCapture`] ring from the audio callback.

use crate::audio::capture::RingCapture;
use anyhow::{anyhow, Context, Result};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, Stream, StreamConfig};

/// Ring capacity: one second of 16 kHz audio
const RING_SAMPLES: usize = crate::SAMPLE_RATE as usize;

/// A running input stream
///
/// The stream stops when dropped; keep this alive for as long as the
/// capture half is read.
pub struct Microphone {
    _stream: Stream,
    pub device_name: String,
    pub device_rate: u32,
}

/// Open the default input device
pub fn open_default(block_samples: usize) -> Result<(Microphone, RingCapture)> {
    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .ok_or_else(|| anyhow!("No default input device"))?;
    let device_name = device.name().unwrap_or_else(|_| "unknown".to_string());

    let default_config = device
        .default_input_config()
        .context("Failed to query input config")?;
    let device_rate = default_config.sample_rate().0;
    let channels = usize::from(default_config.channels().max(1));
    let decimation = if device_rate % crate::SAMPLE_RATE == 0 {
        (device_rate / crate::SAMPLE_RATE) as usize
    } else {
        tracing::warn!(
            device_rate,
            "Input rate is not a multiple of 16 kHz, levels use the native rate"
        );
        1
    };

    let config = StreamConfig {
        channels: default_config.channels(),
        sample_rate: SampleRate(device_rate),
        buffer_size: cpal::BufferSize::Default,
    };

    let (mut producer, capture) = RingCapture::new(RING_SAMPLES, block_samples);
    let mut scratch: Vec<i16> = Vec::with_capacity(4096);
    let mut phase = 0usize;

    let stream = device
        .build_input_stream(
            &config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                scratch.clear();
                for frame in data.chunks(channels) {
                    if phase == 0 {
                        let sample = (frame[0].clamp(-1.0, 1.0) * f32::from(i16::MAX)) as i16;
                        scratch.push(sample);
                    }
                    phase = (phase + 1) % decimation;
                }
                producer.push(&scratch);
            },
            |err| tracing::error!(error = %err, "Input stream error"),
            None,
        )
        .context("Failed to build input stream")?;
    stream.play().context("Failed to start input stream")?;

    tracing::info!(device = %device_name, device_rate, decimation, "Microphone opened");

    Ok((
        Microphone {
            _stream: stream,
            device_name,
            device_rate,
        },
        capture,
    ))
}

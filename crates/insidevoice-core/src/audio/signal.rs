//! Deterministic integer test signals
//!
//! Generates microphone-like blocks at a scripted loudness so the monitor can
//! be exercised without hardware. Two waveforms are available:
//! - square wave: RMS equals the amplitude exactly, so the resulting level is
//!   predictable to the dB
//! - white noise: LCG noise scaled to the amplitude, closer to a real room
//!
//! [`ScriptedSource`] plays a list of [`Segment`]s as a [`BlockSource`].

use super::capture::{Block, BlockPool, BlockSource, CaptureError, POOL_BLOCKS};
use super::level::rms_to_db;
use std::time::Duration;

/// Waveform used to fill a block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Waveform {
    /// Alternating +A / -A
    Square,
    /// Uniform LCG noise in -A..=A
    Noise,
}

/// A run of blocks at one amplitude
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    /// Peak amplitude
    pub amplitude: u16,
    /// Number of blocks to emit
    pub blocks: usize,
}

impl Segment {
    /// Segment of `blocks` blocks whose square-wave level is `db`
    pub fn at_db(db: u8, blocks: usize) -> Self {
        Self {
            amplitude: amplitude_for_db(db),
            blocks,
        }
    }
}

/// Smallest amplitude whose RMS maps to at least `db`
///
/// Uses the monotonicity of [`rms_to_db`] to binary search `0..=32767`.
pub fn amplitude_for_db(db: u8) -> u16 {
    let (mut lo, mut hi) = (0u16, i16::MAX as u16);
    if rms_to_db(hi) < db {
        return hi;
    }
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        if rms_to_db(mid) >= db {
            hi = mid;
        } else {
            lo = mid + 1;
        }
    }
    lo
}

/// Block generator for a single waveform
#[derive(Debug)]
pub struct SignalGenerator {
    waveform: Waveform,
    /// PRNG state for noise generation
    noise_seed: u32,
    /// Square-wave phase
    phase: bool,
}

impl SignalGenerator {
    /// Create a generator for the given waveform
    pub fn new(waveform: Waveform) -> Self {
        Self {
            waveform,
            noise_seed: 0xDEADBEEF,
            phase: false,
        }
    }

    /// Fill a buffer at the given peak amplitude
    pub fn fill(&mut self, buffer: &mut [i16], amplitude: u16) {
        let amplitude = i32::from(amplitude.min(i16::MAX as u16));
        for sample in buffer.iter_mut() {
            *sample = match self.waveform {
                Waveform::Square => {
                    self.phase = !self.phase;
                    if self.phase {
                        amplitude as i16
                    } else {
                        -amplitude as i16
                    }
                }
                Waveform::Noise => {
                    let unit = self.next_noise();
                    (unit * amplitude / 16384) as i16
                }
            };
        }
    }

    /// Next noise value in -16384..16384
    fn next_noise(&mut self) -> i32 {
        // LCG parameters (same as glibc)
        self.noise_seed = self.noise_seed.wrapping_mul(1103515245).wrapping_add(12345);
        let bits = (self.noise_seed >> 16) & 0x7FFF;
        bits as i32 - 16384
    }

    /// Reset the generator state
    pub fn reset(&mut self) {
        self.noise_seed = 0xDEADBEEF;
        self.phase = false;
    }
}

/// [`BlockSource`] that plays a loudness script
pub struct ScriptedSource {
    segments: Vec<Segment>,
    segment: usize,
    emitted: usize,
    generator: SignalGenerator,
    pool: BlockPool,
    pacing: Option<Duration>,
    repeat: bool,
}

impl ScriptedSource {
    /// Create a source producing `block_samples`-sized blocks
    pub fn new(segments: Vec<Segment>, waveform: Waveform, block_samples: usize) -> Self {
        Self {
            segments,
            segment: 0,
            emitted: 0,
            generator: SignalGenerator::new(waveform),
            pool: BlockPool::new(POOL_BLOCKS, block_samples),
            pacing: None,
            repeat: false,
        }
    }

    /// Sleep this long before each block, like a real-time microphone
    pub fn paced(mut self, interval: Duration) -> Self {
        self.pacing = Some(interval);
        self
    }

    /// Start over once the script is exhausted
    pub fn repeating(mut self) -> Self {
        self.repeat = true;
        self
    }

    /// Whether every segment has been played (never true when repeating)
    pub fn is_finished(&self) -> bool {
        if self.repeat {
            return false;
        }
        self.segments
            .iter()
            .skip(self.segment)
            .enumerate()
            .all(|(i, segment)| {
                let played = if i == 0 { self.emitted } else { 0 };
                played >= segment.blocks
            })
    }

    fn current_amplitude(&mut self) -> Option<u16> {
        loop {
            if self.segment >= self.segments.len() {
                if !self.repeat || self.segments.is_empty() {
                    return None;
                }
                self.segment = 0;
                self.emitted = 0;
            }

            let segment = self.segments[self.segment];
            if self.emitted < segment.blocks {
                self.emitted += 1;
                return Some(segment.amplitude);
            }

            self.segment += 1;
            self.emitted = 0;
        }
    }
}

impl BlockSource for ScriptedSource {
    fn read_block(&mut self) -> Result<Block, CaptureError> {
        if let Some(interval) = self.pacing {
            std::thread::sleep(interval);
        }

        let amplitude = self.current_amplitude().ok_or(CaptureError::Closed)?;
        let mut block = self.pool.acquire().ok_or(CaptureError::PoolExhausted)?;
        self.generator.fill(block.samples_mut(), amplitude);
        Ok(block)
    }
}

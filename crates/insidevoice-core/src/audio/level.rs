//! Integer-only sound level estimation
//!
//! Converts a block of signed 16-bit samples into a single pseudo-SPL value
//! in `0..=90`:
//!
//! 1. Mean of squares with 64-bit accumulation
//! 2. Integer square root (Newton's method) for the RMS amplitude
//! 3. Fixed-point log2 with 4 integer + 4 fractional bits
//! 4. `dB = ((log2(rms) - log2(32767)) * 6) >> 4`, offset by +90
//!
//! The fractional part of the log2 is the 4 bits following the leading one,
//! taken linearly. This is a coarse approximation of the real log curve and
//! is kept as such: readings are compared against thresholds stored on the
//! companion side, so the curve must not change.
//!
//! Everything here is pure and allocation-free.

use crate::MAX_LEVEL_DB;

/// Offset added to dBFS to land in a pseudo-SPL range
pub const SPL_OFFSET_DB: i32 = 90;

/// Full-scale reference amplitude (0 dBFS)
pub const FULL_SCALE: u16 = 32767;

/// Fractional log2 lookup, indexed by the 4 bits after the leading one.
/// Linear on purpose; see the module docs.
const LOG2_FRAC_LUT: [u8; 16] = [0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15];

/// Root-mean-square amplitude of a sample block
///
/// Returns 0 for an empty block or pure silence. The result is clamped to
/// `u16::MAX` (a block of constant `-32768` yields 32768).
///
/// # Example
/// ```
/// use insidevoice_core::audio::level::rms;
///
/// assert_eq!(rms(&[1000; 64]), 1000);
/// assert_eq!(rms(&[]), 0);
/// ```
pub fn rms(samples: &[i16]) -> u16 {
    if samples.is_empty() {
        return 0;
    }

    let sum_sq: u64 = samples
        .iter()
        .map(|&s| {
            let s = i64::from(s);
            (s * s) as u64
        })
        .sum();

    let mean_sq = sum_sq / samples.len() as u64;
    isqrt(mean_sq).min(u64::from(u16::MAX)) as u16
}

/// Integer square root via Newton's method
///
/// Starts from the value itself and iterates while the candidate strictly
/// decreases, which lands on `floor(sqrt(value))`.
fn isqrt(value: u64) -> u64 {
    if value == 0 {
        return 0;
    }

    let mut y = value;
    loop {
        let next = (y + value / y) / 2;
        if next >= y {
            return y;
        }
        y = next;
    }
}

/// log2 of an amplitude in 4.4 fixed point
///
/// Integer part is the position of the highest set bit, fractional part the
/// next 4 bits. `log2_fixed4(0)` is 0.
pub fn log2_fixed4(value: u16) -> u16 {
    if value == 0 {
        return 0;
    }

    let int_part = 15 - value.leading_zeros() as u16;

    let frac_bits = if int_part >= 4 {
        (value >> (int_part - 4)) & 0x0F
    } else {
        (value << (4 - int_part)) & 0x0F
    };

    (int_part << 4) | u16::from(LOG2_FRAC_LUT[frac_bits as usize])
}

/// Convert an RMS amplitude to pseudo-SPL dB, clamped to `0..=90`
///
/// # Example
/// ```
/// use insidevoice_core::audio::level::rms_to_db;
///
/// assert_eq!(rms_to_db(0), 0);
/// assert_eq!(rms_to_db(32767), 90);
/// assert_eq!(rms_to_db(1000), 60);
/// ```
pub fn rms_to_db(rms: u16) -> u8 {
    if rms == 0 {
        return 0;
    }

    let dbfs_fixed = i32::from(log2_fixed4(rms)) - i32::from(log2_fixed4(FULL_SCALE));

    // 6 approximates 20*log10(2); the shift drops the 4 fractional bits.
    let db = ((dbfs_fixed * 6) >> 4) + SPL_OFFSET_DB;

    db.clamp(0, i32::from(MAX_LEVEL_DB)) as u8
}

/// Estimate the loudness of one audio block
///
/// Shorthand for `rms_to_db(rms(samples))`.
pub fn estimate_level(samples: &[i16]) -> u8 {
    rms_to_db(rms(samples))
}

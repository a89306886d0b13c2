//! Loudness estimation for captured audio blocks.
//!
//! Converts a block of PCM samples into a single dBFS-like reading via
//! root-mean-square. The value is a threshold signal for the segmenter, not
//! a calibrated acoustic measurement.

use crate::audio::AudioBlock;

/// Floor applied to the RMS before taking the logarithm, so silence maps to
/// a large negative number instead of -inf.
const RMS_EPSILON: f64 = 1e-10;

/// One loudness reading derived from one audio block.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VolumeSample {
    /// Stream time of the block this reading was taken from.
    pub timestamp_ms: u64,

    /// RMS level in dBFS (<= 0 for normalized input).
    pub level_db: f32,
}

/// Estimate the loudness of a block.
///
/// Pure and total: always returns a finite level, with empty blocks pinned
/// to the floor.
pub fn estimate(block: &AudioBlock) -> VolumeSample {
    let rms = if block.samples.is_empty() {
        0.0
    } else {
        let sum_squares: f64 = block
            .samples
            .iter()
            .map(|&s| {
                let normalized = f64::from(s) / f64::from(i16::MAX);
                normalized * normalized
            })
            .sum();
        (sum_squares / block.samples.len() as f64).sqrt()
    };

    let level_db = 20.0 * rms.max(RMS_EPSILON).log10();

    VolumeSample {
        timestamp_ms: block.timestamp_ms,
        level_db: level_db as f32,
    }
}

//! Core PCM audio types shared across the engine.
//!
//! All audio in the engine is 16-bit signed little-endian mono PCM. Blocks
//! arrive from the capture source already timestamped so the segmenter can
//! run on stream time rather than wall-clock time.

/// One block of captured audio: a short run of samples plus the stream
/// timestamp of its first sample.
#[derive(Debug, Clone)]
pub struct AudioBlock {
    /// Signed 16-bit mono samples.
    pub samples: Vec<i16>,

    /// Samples per second (typically 16000).
    pub sample_rate: u32,

    /// Stream time of the first sample, in milliseconds.
    pub timestamp_ms: u64,
}

impl AudioBlock {
    pub fn new(samples: Vec<i16>, sample_rate: u32, timestamp_ms: u64) -> Self {
        Self {
            samples,
            sample_rate,
            timestamp_ms,
        }
    }

    /// Duration of this block in milliseconds.
    pub fn duration_ms(&self) -> u64 {
        if self.sample_rate == 0 {
            return 0;
        }
        self.samples.len() as u64 * 1000 / self.sample_rate as u64
    }

    /// Stream time just past the last sample of this block.
    pub fn end_ms(&self) -> u64 {
        self.timestamp_ms + self.duration_ms()
    }
}

/// Convert i16 PCM samples to little-endian bytes (for network payloads).
pub fn i16_slice_to_u8(samples: &[i16]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        bytes.extend_from_slice(&sample.to_le_bytes());
    }
    bytes
}

/// Convert little-endian bytes back to i16 PCM samples.
pub fn u8_to_i16_slice(bytes: &[u8]) -> Vec<i16> {
    let mut samples = Vec::with_capacity(bytes.len() / 2);
    for chunk in bytes.chunks_exact(2) {
        samples.push(i16::from_le_bytes([chunk[0], chunk[1]]));
    }
    samples
}

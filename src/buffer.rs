//! Accumulation buffer for the utterance currently open in the segmenter.

use crate::audio::{i16_slice_to_u8, AudioBlock};

/// Pre-allocation for roughly ten seconds of 16 kHz 16-bit PCM.
const INITIAL_CAPACITY: usize = 16000 * 2 * 10;

/// Collects the raw PCM bytes of one in-progress utterance.
///
/// Appends are ignored unless the buffer has been opened by the segmenter,
/// and both `seal` and `discard` fully reset it, so no audio ever leaks
/// from one utterance into the next.
#[derive(Debug, Default)]
pub struct UtteranceBuffer {
    pcm: Vec<u8>,
    open: bool,
}

impl UtteranceBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Begin accumulating a new utterance.
    pub fn open(&mut self) {
        self.open = true;
        if self.pcm.capacity() == 0 {
            self.pcm.reserve(INITIAL_CAPACITY);
        }
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    /// Append a block's samples. No-op while the buffer is closed.
    pub fn append(&mut self, block: &AudioBlock) {
        if !self.open {
            return;
        }
        self.pcm.extend_from_slice(&i16_slice_to_u8(&block.samples));
    }

    /// Number of accumulated bytes.
    pub fn len(&self) -> usize {
        self.pcm.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pcm.is_empty()
    }

    /// Hand off the accumulated bytes and reset.
    pub fn seal(&mut self) -> Vec<u8> {
        self.open = false;
        std::mem::take(&mut self.pcm)
    }

    /// Drop the accumulated bytes and reset.
    pub fn discard(&mut self) {
        self.open = false;
        self.pcm.clear();
    }
}

//! Speech segmentation over a stream of loudness readings.
//!
//! The segmenter is a small state machine fed one [`VolumeSample`] per audio
//! block. It decides where utterances begin and end using four knobs: a
//! speech threshold in dBFS, the run of continuous silence that closes an
//! utterance, a minimum length below which a sealed utterance is treated as
//! noise (a click, a breath) and discarded, and a hard maximum that closes
//! a turn even if the speaker never pauses.
//!
//! All timing is derived from block timestamps, not wall-clock time, so the
//! segmenter is deterministic and can be driven from recorded audio.

use serde::Deserialize;
use tracing::debug;

use crate::audio::AudioBlock;
use crate::buffer::UtteranceBuffer;
use crate::config::ConfigError;
use crate::events::{EndReason, Utterance};
use crate::volume::VolumeSample;

/// Voice-activity detection tuning. All fields are required; there is no
/// default silence window because no single value could be recovered from
/// real deployments.
#[derive(Debug, Clone, Deserialize)]
pub struct SegmenterConfig {
    /// Level at or above which a block counts as speech, in dBFS.
    pub speech_threshold_db: f32,

    /// Continuous sub-threshold time required to close an utterance.
    pub silence_duration_ms: u64,

    /// Sealed utterances shorter than this are discarded as noise.
    pub min_speech_duration_ms: u64,

    /// Hard cutoff forcing an utterance to close even without silence.
    pub max_speech_duration_ms: u64,
}

impl SegmenterConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.speech_threshold_db.is_finite() || self.speech_threshold_db >= 0.0 {
            return Err(ConfigError::InvalidThreshold(self.speech_threshold_db));
        }
        if self.silence_duration_ms == 0 {
            return Err(ConfigError::ZeroSilenceDuration);
        }
        if self.max_speech_duration_ms <= self.min_speech_duration_ms {
            return Err(ConfigError::SpeechDurationRange {
                min: self.min_speech_duration_ms,
                max: self.max_speech_duration_ms,
            });
        }
        Ok(())
    }
}

/// Segmenter lifecycle. Audio accumulates only in `Speaking` and
/// `TrailingSilence`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmenterState {
    /// No samples seen yet (or just sealed an utterance).
    Idle,

    /// Consuming silence, waiting for speech to open a turn.
    Listening,

    /// Actively accumulating an utterance.
    Speaking,

    /// Speech paused; the utterance stays open until the silence run
    /// reaches the configured window, in case the speaker resumes.
    TrailingSilence,
}

/// Transitions reported by the segmenter.
#[derive(Debug, Clone)]
pub enum SegmenterEvent {
    SpeechStarted { at_ms: u64 },

    /// An utterance was sealed and ownership of its audio handed off.
    UtteranceReady(Utterance),

    /// A sealed utterance was too short and dropped. Observability only.
    UtteranceDiscarded { duration_ms: u64 },
}

pub struct SpeechSegmenter {
    cfg: SegmenterConfig,
    state: SegmenterState,
    buffer: UtteranceBuffer,

    /// Stream time speech was first detected in the open utterance.
    started_at_ms: u64,

    /// Start of the current sub-threshold run.
    trailing_since_ms: u64,

    /// End of the most recently pushed block.
    last_end_ms: u64,
}

impl SpeechSegmenter {
    pub fn new(cfg: SegmenterConfig) -> Self {
        Self {
            cfg,
            state: SegmenterState::Idle,
            buffer: UtteranceBuffer::new(),
            started_at_ms: 0,
            trailing_since_ms: 0,
            last_end_ms: 0,
        }
    }

    pub fn state(&self) -> SegmenterState {
        self.state
    }

    /// Whether an utterance is currently open.
    pub fn is_open(&self) -> bool {
        matches!(
            self.state,
            SegmenterState::Speaking | SegmenterState::TrailingSilence
        )
    }

    /// Feed one block and its loudness reading through the state machine.
    ///
    /// At most one event is produced per block.
    pub fn push(&mut self, sample: VolumeSample, block: &AudioBlock) -> Option<SegmenterEvent> {
        let voiced = sample.level_db >= self.cfg.speech_threshold_db;
        self.last_end_ms = block.end_ms();

        match self.state {
            SegmenterState::Idle | SegmenterState::Listening => {
                if voiced {
                    self.state = SegmenterState::Speaking;
                    self.started_at_ms = sample.timestamp_ms;
                    self.buffer.open();
                    self.buffer.append(block);
                    debug!(at_ms = sample.timestamp_ms, "speech opened");
                    Some(SegmenterEvent::SpeechStarted {
                        at_ms: sample.timestamp_ms,
                    })
                } else {
                    self.state = SegmenterState::Listening;
                    None
                }
            }
            SegmenterState::Speaking | SegmenterState::TrailingSilence => {
                self.buffer.append(block);

                if voiced {
                    // Brief pause ended; the silence run resets.
                    self.state = SegmenterState::Speaking;
                } else if self.state == SegmenterState::Speaking {
                    self.state = SegmenterState::TrailingSilence;
                    self.trailing_since_ms = sample.timestamp_ms;
                }

                if self.state == SegmenterState::TrailingSilence {
                    let silence_run = block.end_ms().saturating_sub(self.trailing_since_ms);
                    if silence_run >= self.cfg.silence_duration_ms {
                        // The utterance ends where speech did, not where the
                        // silence window ran out.
                        return self.close(EndReason::SilenceTimeout, self.trailing_since_ms);
                    }
                }

                let elapsed = block.end_ms().saturating_sub(self.started_at_ms);
                if elapsed >= self.cfg.max_speech_duration_ms {
                    return self.close(EndReason::MaxDurationExceeded, block.end_ms());
                }

                None
            }
        }
    }

    /// Force-close the open utterance, sealing whatever has been buffered
    /// regardless of the minimum-length filter. No-op when nothing is open.
    pub fn stop(&mut self) -> Option<SegmenterEvent> {
        match self.state {
            SegmenterState::Speaking => self.close(EndReason::ManualStop, self.last_end_ms),
            SegmenterState::TrailingSilence => {
                self.close(EndReason::ManualStop, self.trailing_since_ms)
            }
            _ => None,
        }
    }

    /// Drop any open utterance and return to `Idle` without emitting events.
    pub fn reset(&mut self) {
        self.state = SegmenterState::Idle;
        self.buffer.discard();
    }

    fn close(&mut self, reason: EndReason, ended_at_ms: u64) -> Option<SegmenterEvent> {
        let duration_ms = ended_at_ms.saturating_sub(self.started_at_ms);
        self.state = SegmenterState::Idle;

        if reason != EndReason::ManualStop && duration_ms < self.cfg.min_speech_duration_ms {
            self.buffer.discard();
            debug!(duration_ms, "utterance discarded as noise");
            return Some(SegmenterEvent::UtteranceDiscarded { duration_ms });
        }

        let audio = self.buffer.seal();
        debug!(duration_ms, ?reason, bytes = audio.len(), "utterance sealed");
        Some(SegmenterEvent::UtteranceReady(Utterance {
            audio,
            started_at_ms: self.started_at_ms,
            ended_at_ms,
            end_reason: reason,
        }))
    }
}

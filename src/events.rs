//! Engine event types shared between the segmenter, the turn state machine
//! and embedding applications.

use crate::turn_fsm::TurnState;

/// Why an utterance was sealed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    /// Closed after the configured run of continuous silence.
    SilenceTimeout,

    /// Closed by the hard duration cutoff, regardless of current volume.
    MaxDurationExceeded,

    /// Closed by an explicit stop.
    ManualStop,
}

/// One continuous span of detected speech, sealed and ready for submission.
#[derive(Debug, Clone)]
pub struct Utterance {
    /// Raw 16-bit little-endian mono PCM.
    pub audio: Vec<u8>,

    /// Stream time at which speech was first detected.
    pub started_at_ms: u64,

    /// Stream time at which the utterance was considered finished.
    pub ended_at_ms: u64,

    pub end_reason: EndReason,
}

impl Utterance {
    pub fn duration_ms(&self) -> u64 {
        self.ended_at_ms.saturating_sub(self.started_at_ms)
    }
}

/// Classification of per-turn failures. These are absorbed by the engine and
/// only surface through [`EngineEvent::TurnError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnErrorKind {
    /// Submission failed or timed out; the utterance was dropped.
    Network,

    /// The response audio could not be decoded or played.
    Decode,
}

/// Record of one full capture -> submit -> playback cycle.
#[derive(Debug, Clone)]
pub struct ConversationTurn {
    pub utterance: Utterance,

    /// The spoken response, when one was received.
    pub response_audio: Option<Vec<u8>>,

    /// Wall-clock time spent waiting on the backend.
    pub network_latency_ms: u64,

    pub error: Option<TurnErrorKind>,
}

/// Observable engine activity, delivered over a broadcast channel so a UI
/// can subscribe without sharing any mutable state with the engine.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    StateChanged(TurnState),
    SpeechStarted { at_ms: u64 },
    UtteranceCaptured { duration_ms: u64, end_reason: EndReason },
    UtteranceDiscarded { duration_ms: u64 },
    TurnCompleted(ConversationTurn),
    TurnError { kind: TurnErrorKind, detail: String },
}

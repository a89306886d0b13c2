//! AuraCall - turn-taking engine for a conversational voice companion
//!
//! This crate owns the full lifecycle of one conversational turn: detecting
//! when the user starts and stops speaking from a live audio stream,
//! buffering the captured utterance, submitting it to a remote conversation
//! backend and playing back the spoken response - all while keeping capture
//! suspended during playback so the engine never hears its own voice.
//!
//! Platform audio I/O and the network backend are injected at construction
//! behind small traits; the engine itself is channel-driven state machine
//! logic with no platform dependencies.

#![forbid(unsafe_code)]

/// Core PCM audio types and conversions
pub mod audio;
/// Accumulation buffer for the open utterance
pub mod buffer;
/// Capture source trait and WAV-file source
pub mod capture;
/// Conversation backend trait and HTTP client
pub mod client;
/// Engine configuration and validation
pub mod config;
/// Event and record types shared with embedders
pub mod events;
/// Playback sink trait and file-backed sink
pub mod playback;
/// Voice-activity segmentation state machine
pub mod segmenter;
/// Pure turn-taking state machine
pub mod turn_fsm;
/// The control task wiring everything together
pub mod turn_runner;
/// RMS loudness estimation
pub mod volume;

pub use client::{ConversationClient, ConversationReply, HttpConversationClient, NetworkError};
pub use config::{ConfigError, EngineConfig};
pub use events::{ConversationTurn, EndReason, EngineEvent, TurnErrorKind, Utterance};
pub use segmenter::{SegmenterConfig, SegmenterEvent, SegmenterState, SpeechSegmenter};
pub use turn_fsm::TurnState;
pub use turn_runner::{EngineCommand, EngineHandle, TurnRunner};

//! Turn-taking state machine.
//!
//! Pure event-in / actions-out logic with no I/O, clocks or channels; the
//! runner owns all of those and feeds results back in as events. Every
//! async operation the machine requests (a submission, a playback, a resume
//! timer) is tagged with a generation number, and a completion whose
//! generation no longer matches is ignored. That guard is what makes a late
//! network response after `Stop` or `Mute` a no-op instead of a ghost
//! playback.
//!
//! The core invariant: capture is only ever armed in `Listening`, and it is
//! torn down before a submission or playback starts, so the engine can
//! never record its own voice response.

use tracing::debug;

use crate::events::{ConversationTurn, EngineEvent, TurnErrorKind, Utterance};

/// Coordinator lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnState {
    /// Capture armed, segmenter running.
    Listening,

    /// Utterance submitted, network round trip in flight. Capture is down.
    /// Also covers the short backoff window after a failed submission.
    AwaitingResponse,

    /// Response audio playing. Capture is down.
    Playing,

    /// Explicitly muted; only an explicit unmute re-arms capture.
    Muted,

    /// Terminal.
    Stopped,
}

/// Inputs to the state machine.
#[derive(Debug)]
pub enum TurnEvent {
    /// The segmenter sealed an utterance while listening.
    UtteranceSealed(Utterance),

    /// Submission finished; `audio` is `None` for a success carrying no
    /// playable response.
    SubmitResolved {
        generation: u64,
        audio: Option<Vec<u8>>,
        latency_ms: u64,
    },

    /// Submission failed or timed out.
    SubmitFailed {
        generation: u64,
        detail: String,
        latency_ms: u64,
    },

    /// The playback sink finished (or failed to decode) the response.
    PlaybackFinished { generation: u64, success: bool },

    /// The post-failure backoff timer fired.
    BackoffElapsed { generation: u64 },

    Mute,
    Unmute,
    Stop,
}

/// Effects for the runner to execute, in order.
#[derive(Debug)]
pub enum TurnAction {
    StartCapture,
    StopCapture,
    Submit { audio: Vec<u8>, generation: u64 },
    Play { audio: Vec<u8>, generation: u64 },
    StopPlayback,
    /// Best-effort cancellation of the in-flight submission.
    AbortSubmit,
    /// Sleep for the configured backoff, then feed back `BackoffElapsed`.
    ScheduleResume { generation: u64 },
    Emit(EngineEvent),
}

/// Bookkeeping for the turn currently in flight.
#[derive(Debug)]
struct PendingTurn {
    utterance: Utterance,
    response_audio: Option<Vec<u8>>,
    latency_ms: u64,
}

#[derive(Debug)]
pub struct TurnFsm {
    state: TurnState,
    generation: u64,
    pending: Option<PendingTurn>,
}

impl TurnFsm {
    pub fn new() -> Self {
        Self {
            state: TurnState::Listening,
            generation: 0,
            pending: None,
        }
    }

    pub fn state(&self) -> TurnState {
        self.state
    }

    /// Actions that arm the engine when the runner first starts.
    pub fn start(&mut self) -> Vec<TurnAction> {
        vec![
            TurnAction::Emit(EngineEvent::StateChanged(TurnState::Listening)),
            TurnAction::StartCapture,
        ]
    }

    pub fn on_event(&mut self, event: TurnEvent) -> Vec<TurnAction> {
        match event {
            TurnEvent::UtteranceSealed(utterance) => self.on_utterance(utterance),
            TurnEvent::SubmitResolved {
                generation,
                audio,
                latency_ms,
            } => self.on_submit_resolved(generation, audio, latency_ms),
            TurnEvent::SubmitFailed {
                generation,
                detail,
                latency_ms,
            } => self.on_submit_failed(generation, detail, latency_ms),
            TurnEvent::PlaybackFinished {
                generation,
                success,
            } => self.on_playback_finished(generation, success),
            TurnEvent::BackoffElapsed { generation } => self.on_backoff_elapsed(generation),
            TurnEvent::Mute => self.on_mute(),
            TurnEvent::Unmute => self.on_unmute(),
            TurnEvent::Stop => self.on_stop(),
        }
    }

    fn on_utterance(&mut self, utterance: Utterance) -> Vec<TurnAction> {
        if self.state != TurnState::Listening {
            return vec![];
        }

        // Capture goes down before anything else happens with this turn.
        let mut actions = vec![TurnAction::StopCapture];
        actions.push(TurnAction::Emit(EngineEvent::UtteranceCaptured {
            duration_ms: utterance.duration_ms(),
            end_reason: utterance.end_reason,
        }));

        let generation = self.next_generation();
        actions.push(TurnAction::Submit {
            audio: utterance.audio.clone(),
            generation,
        });
        self.pending = Some(PendingTurn {
            utterance,
            response_audio: None,
            latency_ms: 0,
        });
        self.transition(TurnState::AwaitingResponse, &mut actions);
        actions
    }

    fn on_submit_resolved(
        &mut self,
        generation: u64,
        audio: Option<Vec<u8>>,
        latency_ms: u64,
    ) -> Vec<TurnAction> {
        if self.state != TurnState::AwaitingResponse || self.is_stale(generation) {
            debug!(generation, "dropping stale submission result");
            return vec![];
        }
        if let Some(pending) = self.pending.as_mut() {
            pending.latency_ms = latency_ms;
        }

        let mut actions = Vec::new();
        match audio {
            Some(bytes) => {
                if let Some(pending) = self.pending.as_mut() {
                    pending.response_audio = Some(bytes.clone());
                }
                let generation = self.next_generation();
                self.transition(TurnState::Playing, &mut actions);
                actions.push(TurnAction::Play {
                    audio: bytes,
                    generation,
                });
            }
            None => {
                // Success with nothing to play; go straight back to
                // listening.
                debug!("response carried no playable audio");
                if let Some(turn) = self.take_turn(None) {
                    actions.push(TurnAction::Emit(EngineEvent::TurnCompleted(turn)));
                }
                self.transition(TurnState::Listening, &mut actions);
                actions.push(TurnAction::StartCapture);
            }
        }
        actions
    }

    fn on_submit_failed(
        &mut self,
        generation: u64,
        detail: String,
        latency_ms: u64,
    ) -> Vec<TurnAction> {
        if self.state != TurnState::AwaitingResponse || self.is_stale(generation) {
            debug!(generation, "dropping stale submission failure");
            return vec![];
        }
        if let Some(pending) = self.pending.as_mut() {
            pending.latency_ms = latency_ms;
        }

        // The utterance is dropped, never re-sent: replaying stale audio
        // after a delay deskews the conversation.
        let mut actions = vec![TurnAction::Emit(EngineEvent::TurnError {
            kind: TurnErrorKind::Network,
            detail,
        })];
        if let Some(turn) = self.take_turn(Some(TurnErrorKind::Network)) {
            actions.push(TurnAction::Emit(EngineEvent::TurnCompleted(turn)));
        }
        let generation = self.next_generation();
        actions.push(TurnAction::ScheduleResume { generation });
        actions
    }

    fn on_backoff_elapsed(&mut self, generation: u64) -> Vec<TurnAction> {
        if self.state != TurnState::AwaitingResponse || self.is_stale(generation) {
            return vec![];
        }
        let mut actions = Vec::new();
        self.transition(TurnState::Listening, &mut actions);
        actions.push(TurnAction::StartCapture);
        actions
    }

    fn on_playback_finished(&mut self, generation: u64, success: bool) -> Vec<TurnAction> {
        if self.state != TurnState::Playing || self.is_stale(generation) {
            debug!(generation, "dropping stale playback completion");
            return vec![];
        }

        let mut actions = Vec::new();
        // A corrupt response must not wedge the conversation; a decode
        // failure resumes listening exactly like a clean completion.
        if !success {
            actions.push(TurnAction::Emit(EngineEvent::TurnError {
                kind: TurnErrorKind::Decode,
                detail: "response audio could not be played".to_string(),
            }));
        }
        let error = if success {
            None
        } else {
            Some(TurnErrorKind::Decode)
        };
        if let Some(turn) = self.take_turn(error) {
            actions.push(TurnAction::Emit(EngineEvent::TurnCompleted(turn)));
        }
        self.transition(TurnState::Listening, &mut actions);
        actions.push(TurnAction::StartCapture);
        actions
    }

    fn on_mute(&mut self) -> Vec<TurnAction> {
        if matches!(self.state, TurnState::Muted | TurnState::Stopped) {
            return vec![];
        }
        let mut actions = vec![TurnAction::StopCapture, TurnAction::StopPlayback];
        self.pending = None;
        self.next_generation();
        self.transition(TurnState::Muted, &mut actions);
        actions
    }

    fn on_unmute(&mut self) -> Vec<TurnAction> {
        if self.state != TurnState::Muted {
            return vec![];
        }
        let mut actions = Vec::new();
        self.transition(TurnState::Listening, &mut actions);
        actions.push(TurnAction::StartCapture);
        actions
    }

    fn on_stop(&mut self) -> Vec<TurnAction> {
        if self.state == TurnState::Stopped {
            return vec![];
        }
        let mut actions = vec![
            TurnAction::StopCapture,
            TurnAction::AbortSubmit,
            TurnAction::StopPlayback,
        ];
        self.pending = None;
        self.next_generation();
        self.transition(TurnState::Stopped, &mut actions);
        actions
    }

    fn transition(&mut self, state: TurnState, actions: &mut Vec<TurnAction>) {
        debug!(from = ?self.state, to = ?state, "turn state transition");
        self.state = state;
        actions.push(TurnAction::Emit(EngineEvent::StateChanged(state)));
    }

    fn next_generation(&mut self) -> u64 {
        self.generation += 1;
        self.generation
    }

    fn is_stale(&self, generation: u64) -> bool {
        generation != self.generation
    }

    fn take_turn(&mut self, error: Option<TurnErrorKind>) -> Option<ConversationTurn> {
        self.pending.take().map(|pending| ConversationTurn {
            utterance: pending.utterance,
            response_audio: pending.response_audio,
            network_latency_ms: pending.latency_ms,
            error,
        })
    }
}

impl Default for TurnFsm {
    fn default() -> Self {
        Self::new()
    }
}

//! Turn engine runner.
//!
//! Owns the segmenter and the turn state machine and executes the machine's
//! actions against the injected collaborators. All outside activity (audio
//! blocks from the capture source, network completions, playback
//! completions, control commands) is marshalled over channels into one
//! `tokio::select!` loop, so no engine state is ever touched from two tasks
//! at once. Commands are polled ahead of audio so a mute or stop takes
//! effect before the next block is processed.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::audio::AudioBlock;
use crate::capture::{AudioCaptureSource, CaptureError};
use crate::client::{ConversationClient, ConversationReply, NetworkError};
use crate::config::{ConfigError, EngineConfig};
use crate::events::{ConversationTurn, EngineEvent};
use crate::playback::AudioPlaybackSink;
use crate::segmenter::{SegmenterEvent, SpeechSegmenter};
use crate::turn_fsm::{TurnAction, TurnEvent, TurnFsm};
use crate::volume;

/// Control commands accepted by a running engine.
#[derive(Debug, Clone, Copy)]
pub enum EngineCommand {
    Mute,
    Unmute,
    Stop,
}

/// Cloneable handle for controlling and observing a running engine.
#[derive(Clone)]
pub struct EngineHandle {
    cmd_tx: mpsc::UnboundedSender<EngineCommand>,
    events: broadcast::Sender<EngineEvent>,
}

impl EngineHandle {
    pub fn mute(&self) {
        let _ = self.cmd_tx.send(EngineCommand::Mute);
    }

    pub fn unmute(&self) {
        let _ = self.cmd_tx.send(EngineCommand::Unmute);
    }

    /// End the call. The runner tears down capture and playback, discards
    /// any in-flight response and returns its turn history.
    pub fn stop(&self) {
        let _ = self.cmd_tx.send(EngineCommand::Stop);
    }

    /// Subscribe to engine activity. Slow subscribers lag, they never stall
    /// the engine.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }
}

/// Result of one submission task.
struct NetOutcome {
    generation: u64,
    result: Result<Option<Vec<u8>>, NetworkError>,
    latency_ms: u64,
}

/// Result of one playback.
struct PlayOutcome {
    generation: u64,
    success: bool,
}

/// The engine's control task. Construct with [`TurnRunner::new`], then
/// drive with [`TurnRunner::run`].
pub struct TurnRunner {
    cfg: EngineConfig,
    client: Arc<dyn ConversationClient>,
    capture: Box<dyn AudioCaptureSource>,
    sink: Box<dyn AudioPlaybackSink>,

    fsm: TurnFsm,
    segmenter: SpeechSegmenter,
    history: Vec<ConversationTurn>,

    events_tx: broadcast::Sender<EngineEvent>,
    cmd_rx: mpsc::UnboundedReceiver<EngineCommand>,

    /// Live capture channel; `None` whenever capture is torn down.
    block_rx: Option<mpsc::UnboundedReceiver<AudioBlock>>,

    inflight: Option<JoinHandle<()>>,
    net_tx: mpsc::UnboundedSender<NetOutcome>,
    net_rx: mpsc::UnboundedReceiver<NetOutcome>,
    play_tx: mpsc::UnboundedSender<PlayOutcome>,
    play_rx: mpsc::UnboundedReceiver<PlayOutcome>,
    timer_tx: mpsc::UnboundedSender<u64>,
    timer_rx: mpsc::UnboundedReceiver<u64>,
}

impl TurnRunner {
    /// Validate the configuration and build a runner plus its handle.
    pub fn new(
        cfg: EngineConfig,
        client: Arc<dyn ConversationClient>,
        capture: Box<dyn AudioCaptureSource>,
        sink: Box<dyn AudioPlaybackSink>,
    ) -> Result<(Self, EngineHandle), ConfigError> {
        cfg.validate()?;

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (events_tx, _) = broadcast::channel(64);
        let (net_tx, net_rx) = mpsc::unbounded_channel();
        let (play_tx, play_rx) = mpsc::unbounded_channel();
        let (timer_tx, timer_rx) = mpsc::unbounded_channel();

        let segmenter = SpeechSegmenter::new(cfg.vad.clone());
        let handle = EngineHandle {
            cmd_tx,
            events: events_tx.clone(),
        };

        Ok((
            Self {
                cfg,
                client,
                capture,
                sink,
                fsm: TurnFsm::new(),
                segmenter,
                history: Vec::new(),
                events_tx,
                cmd_rx,
                block_rx: None,
                inflight: None,
                net_tx,
                net_rx,
                play_tx,
                play_rx,
                timer_tx,
                timer_rx,
            },
            handle,
        ))
    }

    /// Run until stopped. Returns the conversation history on a clean stop;
    /// a capture failure tears the engine down and is surfaced as an error.
    pub async fn run(mut self) -> Result<Vec<ConversationTurn>, CaptureError> {
        info!(user_id = %self.cfg.user_id, "turn engine starting");

        match self.run_loop().await {
            Ok(()) => {
                info!(turns = self.history.len(), "turn engine stopped");
                Ok(std::mem::take(&mut self.history))
            }
            Err(err) => {
                warn!(error = %err, "fatal capture failure, stopping engine");
                let actions = self.fsm.on_event(TurnEvent::Stop);
                let _ = self.run_actions(actions);
                Err(err)
            }
        }
    }

    async fn run_loop(&mut self) -> Result<(), CaptureError> {
        let actions = self.fsm.start();
        self.run_actions(actions)?;

        loop {
            tokio::select! {
                biased;

                cmd = self.cmd_rx.recv() => {
                    // A dropped handle ends the call like an explicit stop.
                    let cmd = cmd.unwrap_or(EngineCommand::Stop);
                    let stopping = matches!(cmd, EngineCommand::Stop);
                    let event = match cmd {
                        EngineCommand::Mute => TurnEvent::Mute,
                        EngineCommand::Unmute => TurnEvent::Unmute,
                        EngineCommand::Stop => TurnEvent::Stop,
                    };
                    self.apply(event)?;
                    if stopping {
                        return Ok(());
                    }
                }

                Some(outcome) = self.net_rx.recv() => {
                    let event = match outcome.result {
                        Ok(audio) => TurnEvent::SubmitResolved {
                            generation: outcome.generation,
                            audio,
                            latency_ms: outcome.latency_ms,
                        },
                        Err(err) => TurnEvent::SubmitFailed {
                            generation: outcome.generation,
                            detail: err.to_string(),
                            latency_ms: outcome.latency_ms,
                        },
                    };
                    self.apply(event)?;
                }

                Some(outcome) = self.play_rx.recv() => {
                    self.apply(TurnEvent::PlaybackFinished {
                        generation: outcome.generation,
                        success: outcome.success,
                    })?;
                }

                Some(generation) = self.timer_rx.recv() => {
                    self.apply(TurnEvent::BackoffElapsed { generation })?;
                }

                block = next_block(&mut self.block_rx) => {
                    match block {
                        Some(block) => self.on_block(block)?,
                        None => {
                            // Source went quiet for good (file exhausted or
                            // producer died): flush the open utterance.
                            debug!("capture stream ended");
                            self.block_rx = None;
                            if let Some(event) = self.segmenter.stop() {
                                self.on_segmenter_event(event)?;
                            }
                        }
                    }
                }
            }
        }
    }

    /// Per-block work, kept O(block size): one RMS pass and a state update.
    fn on_block(&mut self, block: AudioBlock) -> Result<(), CaptureError> {
        let sample = volume::estimate(&block);
        if let Some(event) = self.segmenter.push(sample, &block) {
            self.on_segmenter_event(event)?;
        }
        Ok(())
    }

    fn on_segmenter_event(&mut self, event: SegmenterEvent) -> Result<(), CaptureError> {
        match event {
            SegmenterEvent::SpeechStarted { at_ms } => {
                self.emit(EngineEvent::SpeechStarted { at_ms });
                Ok(())
            }
            SegmenterEvent::UtteranceDiscarded { duration_ms } => {
                self.emit(EngineEvent::UtteranceDiscarded { duration_ms });
                Ok(())
            }
            SegmenterEvent::UtteranceReady(utterance) => {
                self.apply(TurnEvent::UtteranceSealed(utterance))
            }
        }
    }

    fn apply(&mut self, event: TurnEvent) -> Result<(), CaptureError> {
        let actions = self.fsm.on_event(event);
        self.run_actions(actions)
    }

    /// Execute a batch of actions, feeding any synchronously-produced
    /// follow-up events (an immediate playback failure, say) back through
    /// the state machine.
    fn run_actions(&mut self, mut actions: Vec<TurnAction>) -> Result<(), CaptureError> {
        let mut followups = VecDeque::new();
        loop {
            for action in actions {
                self.exec_action(action, &mut followups)?;
            }
            match followups.pop_front() {
                Some(event) => actions = self.fsm.on_event(event),
                None => return Ok(()),
            }
        }
    }

    fn exec_action(
        &mut self,
        action: TurnAction,
        followups: &mut VecDeque<TurnEvent>,
    ) -> Result<(), CaptureError> {
        match action {
            TurnAction::StartCapture => self.arm_capture(),
            TurnAction::StopCapture => {
                self.disarm_capture();
                Ok(())
            }
            TurnAction::Submit { audio, generation } => {
                self.spawn_submit(audio, generation);
                Ok(())
            }
            TurnAction::Play { audio, generation } => {
                self.start_playback(audio, generation, followups);
                Ok(())
            }
            TurnAction::StopPlayback => {
                self.sink.stop();
                Ok(())
            }
            TurnAction::AbortSubmit => {
                if let Some(task) = self.inflight.take() {
                    task.abort();
                }
                Ok(())
            }
            TurnAction::ScheduleResume { generation } => {
                self.spawn_backoff(generation);
                Ok(())
            }
            TurnAction::Emit(event) => {
                self.emit(event);
                Ok(())
            }
        }
    }

    fn arm_capture(&mut self) -> Result<(), CaptureError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.capture.start(tx)?;
        self.block_rx = Some(rx);
        Ok(())
    }

    fn disarm_capture(&mut self) {
        // Dropping the receiver first makes any still-queued blocks
        // unreachable before the source is asked to stop.
        self.block_rx = None;
        self.capture.stop();
        self.segmenter.reset();
    }

    fn spawn_submit(&mut self, audio: Vec<u8>, generation: u64) {
        let client = Arc::clone(&self.client);
        let user_id = self.cfg.user_id.clone();
        let timeout = self.cfg.network_timeout();
        let tx = self.net_tx.clone();

        self.inflight = Some(tokio::spawn(async move {
            let started = Instant::now();
            let result = match tokio::time::timeout(
                timeout,
                resolve_reply(client, audio, user_id),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(NetworkError::Timeout),
            };
            let latency_ms = started.elapsed().as_millis() as u64;
            let _ = tx.send(NetOutcome {
                generation,
                result,
                latency_ms,
            });
        }));
    }

    fn start_playback(
        &mut self,
        audio: Vec<u8>,
        generation: u64,
        followups: &mut VecDeque<TurnEvent>,
    ) {
        let (done_tx, done_rx) = oneshot::channel();
        match self.sink.play(audio, done_tx) {
            Ok(()) => {
                let tx = self.play_tx.clone();
                tokio::spawn(async move {
                    // A sink that drops the sender without reporting counts
                    // as a failed playback.
                    let success = done_rx.await.unwrap_or(false);
                    let _ = tx.send(PlayOutcome {
                        generation,
                        success,
                    });
                });
            }
            Err(err) => {
                warn!(error = %err, "playback failed to start");
                followups.push_back(TurnEvent::PlaybackFinished {
                    generation,
                    success: false,
                });
            }
        }
    }

    fn spawn_backoff(&mut self, generation: u64) {
        let delay = self.cfg.retry_backoff();
        let tx = self.timer_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(generation);
        });
    }

    fn emit(&mut self, event: EngineEvent) {
        if let EngineEvent::TurnCompleted(turn) = &event {
            self.history.push(turn.clone());
        }
        let _ = self.events_tx.send(event);
    }
}

/// Submit an utterance and resolve the reply down to playable bytes.
async fn resolve_reply(
    client: Arc<dyn ConversationClient>,
    audio: Vec<u8>,
    user_id: String,
) -> Result<Option<Vec<u8>>, NetworkError> {
    match client.submit(&audio, &user_id).await? {
        ConversationReply::Audio(bytes) if bytes.is_empty() => Ok(None),
        ConversationReply::Audio(bytes) => Ok(Some(bytes)),
        ConversationReply::AudioUrl(url) => client.fetch_audio(&url).await.map(Some),
        ConversationReply::Empty => Ok(None),
    }
}

async fn next_block(rx: &mut Option<mpsc::UnboundedReceiver<AudioBlock>>) -> Option<AudioBlock> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::TurnErrorKind;
    use crate::playback::PlaybackError;
    use crate::segmenter::SegmenterConfig;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tokio::sync::mpsc::UnboundedSender;
    use tokio::time::{timeout, Duration};

    fn config() -> EngineConfig {
        EngineConfig {
            vad: SegmenterConfig {
                speech_threshold_db: -40.0,
                silence_duration_ms: 300,
                min_speech_duration_ms: 100,
                max_speech_duration_ms: 10_000,
            },
            network_timeout_ms: 1000,
            retry_backoff_ms: 50,
            user_id: "user_001".to_string(),
        }
    }

    /// 400ms of loud speech followed by 600ms of silence, in 100ms blocks.
    fn speech_script() -> Vec<AudioBlock> {
        let mut blocks = Vec::new();
        for i in 0..4u64 {
            blocks.push(AudioBlock::new(vec![10362; 1600], 16000, i * 100));
        }
        for i in 4..10u64 {
            blocks.push(AudioBlock::new(vec![0; 1600], 16000, i * 100));
        }
        blocks
    }

    /// Sends a prebaked script on the first start, then stays silent while
    /// keeping later channels open.
    struct ScriptedSource {
        script: Vec<AudioBlock>,
        starts: usize,
        held: Vec<UnboundedSender<AudioBlock>>,
    }

    impl ScriptedSource {
        fn new(script: Vec<AudioBlock>) -> Self {
            Self {
                script,
                starts: 0,
                held: Vec::new(),
            }
        }
    }

    impl AudioCaptureSource for ScriptedSource {
        fn start(&mut self, tx: UnboundedSender<AudioBlock>) -> Result<(), CaptureError> {
            self.starts += 1;
            if self.starts == 1 {
                for block in self.script.drain(..) {
                    let _ = tx.send(block);
                }
            }
            self.held.push(tx);
            Ok(())
        }

        fn stop(&mut self) {}
    }

    struct FailingSource;

    impl AudioCaptureSource for FailingSource {
        fn start(&mut self, _tx: UnboundedSender<AudioBlock>) -> Result<(), CaptureError> {
            Err(CaptureError::DeviceUnavailable("no microphone".to_string()))
        }

        fn stop(&mut self) {}
    }

    struct MockClient {
        response: Result<ConversationReply, NetworkError>,
        delay: Duration,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl ConversationClient for MockClient {
        async fn submit(
            &self,
            _audio: &[u8],
            _user_id: &str,
        ) -> Result<ConversationReply, NetworkError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.response.clone()
        }

        async fn fetch_audio(&self, _url: &str) -> Result<Vec<u8>, NetworkError> {
            Ok(vec![0xAA; 4])
        }
    }

    struct MockSink {
        plays: Arc<Mutex<Vec<Vec<u8>>>>,
    }

    impl AudioPlaybackSink for MockSink {
        fn play(
            &mut self,
            audio: Vec<u8>,
            done: oneshot::Sender<bool>,
        ) -> Result<(), PlaybackError> {
            self.plays.lock().unwrap().push(audio);
            let _ = done.send(true);
            Ok(())
        }

        fn stop(&mut self) {}
    }

    async fn wait_for(
        events: &mut broadcast::Receiver<EngineEvent>,
        mut pred: impl FnMut(&EngineEvent) -> bool,
    ) {
        timeout(Duration::from_secs(5), async {
            loop {
                let event = events.recv().await.expect("event stream closed");
                if pred(&event) {
                    return;
                }
            }
        })
        .await
        .expect("timed out waiting for engine event");
    }

    #[tokio::test]
    async fn test_full_turn_round_trip() {
        let plays = Arc::new(Mutex::new(Vec::new()));
        let calls = Arc::new(AtomicUsize::new(0));
        let client = Arc::new(MockClient {
            response: Ok(ConversationReply::Audio(vec![5, 6, 7])),
            delay: Duration::ZERO,
            calls: calls.clone(),
        });

        let (runner, handle) = TurnRunner::new(
            config(),
            client,
            Box::new(ScriptedSource::new(speech_script())),
            Box::new(MockSink {
                plays: plays.clone(),
            }),
        )
        .unwrap();

        let mut events = handle.subscribe();
        let run = tokio::spawn(runner.run());

        wait_for(&mut events, |e| {
            matches!(e, EngineEvent::TurnCompleted(_))
        })
        .await;
        handle.stop();

        let history = run.await.unwrap().unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].response_audio.as_deref(), Some(&[5u8, 6, 7][..]));
        assert!(history[0].error.is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(plays.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_url_reply_is_fetched_before_playback() {
        let plays = Arc::new(Mutex::new(Vec::new()));
        let client = Arc::new(MockClient {
            response: Ok(ConversationReply::AudioUrl(
                "https://example.com/reply.mp3".to_string(),
            )),
            delay: Duration::ZERO,
            calls: Arc::new(AtomicUsize::new(0)),
        });

        let (runner, handle) = TurnRunner::new(
            config(),
            client,
            Box::new(ScriptedSource::new(speech_script())),
            Box::new(MockSink {
                plays: plays.clone(),
            }),
        )
        .unwrap();

        let mut events = handle.subscribe();
        let run = tokio::spawn(runner.run());
        wait_for(&mut events, |e| {
            matches!(e, EngineEvent::TurnCompleted(_))
        })
        .await;
        handle.stop();

        let history = run.await.unwrap().unwrap();
        assert_eq!(history[0].response_audio.as_deref(), Some(&[0xAAu8; 4][..]));
        assert_eq!(plays.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_network_failure_reports_and_resumes() {
        let plays = Arc::new(Mutex::new(Vec::new()));
        let client = Arc::new(MockClient {
            response: Err(NetworkError::Transport("connection refused".to_string())),
            delay: Duration::ZERO,
            calls: Arc::new(AtomicUsize::new(0)),
        });

        let (runner, handle) = TurnRunner::new(
            config(),
            client,
            Box::new(ScriptedSource::new(speech_script())),
            Box::new(MockSink {
                plays: plays.clone(),
            }),
        )
        .unwrap();

        let mut events = handle.subscribe();
        let run = tokio::spawn(runner.run());

        wait_for(&mut events, |e| {
            matches!(
                e,
                EngineEvent::TurnError {
                    kind: TurnErrorKind::Network,
                    ..
                }
            )
        })
        .await;
        // Listening resumes on its own once the backoff elapses.
        wait_for(&mut events, |e| {
            matches!(
                e,
                EngineEvent::StateChanged(crate::turn_fsm::TurnState::Listening)
            )
        })
        .await;
        handle.stop();

        let history = run.await.unwrap().unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].error, Some(TurnErrorKind::Network));
        assert!(history[0].response_audio.is_none());
        assert!(plays.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_slow_backend_times_out_and_resumes() {
        let plays = Arc::new(Mutex::new(Vec::new()));
        let client = Arc::new(MockClient {
            response: Ok(ConversationReply::Audio(vec![1])),
            delay: Duration::from_millis(400),
            calls: Arc::new(AtomicUsize::new(0)),
        });

        let mut cfg = config();
        cfg.network_timeout_ms = 100;

        let (runner, handle) = TurnRunner::new(
            cfg,
            client,
            Box::new(ScriptedSource::new(speech_script())),
            Box::new(MockSink {
                plays: plays.clone(),
            }),
        )
        .unwrap();

        let mut events = handle.subscribe();
        let run = tokio::spawn(runner.run());

        wait_for(&mut events, |e| {
            matches!(
                e,
                EngineEvent::TurnError {
                    kind: TurnErrorKind::Network,
                    ..
                }
            )
        })
        .await;
        wait_for(&mut events, |e| {
            matches!(
                e,
                EngineEvent::StateChanged(crate::turn_fsm::TurnState::Listening)
            )
        })
        .await;
        handle.stop();

        let history = run.await.unwrap().unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].error, Some(TurnErrorKind::Network));
        assert!(plays.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stop_while_awaiting_response_never_plays() {
        let plays = Arc::new(Mutex::new(Vec::new()));
        let client = Arc::new(MockClient {
            response: Ok(ConversationReply::Audio(vec![1, 2, 3])),
            delay: Duration::from_millis(300),
            calls: Arc::new(AtomicUsize::new(0)),
        });

        let (runner, handle) = TurnRunner::new(
            config(),
            client,
            Box::new(ScriptedSource::new(speech_script())),
            Box::new(MockSink {
                plays: plays.clone(),
            }),
        )
        .unwrap();

        let mut events = handle.subscribe();
        let run = tokio::spawn(runner.run());

        wait_for(&mut events, |e| {
            matches!(
                e,
                EngineEvent::StateChanged(crate::turn_fsm::TurnState::AwaitingResponse)
            )
        })
        .await;
        handle.stop();

        let history = run.await.unwrap().unwrap();
        assert!(history.is_empty());

        // Give the (aborted) submission plenty of time to have resolved.
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(plays.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_capture_failure_is_fatal() {
        let client = Arc::new(MockClient {
            response: Ok(ConversationReply::Empty),
            delay: Duration::ZERO,
            calls: Arc::new(AtomicUsize::new(0)),
        });
        let (runner, _handle) = TurnRunner::new(
            config(),
            client,
            Box::new(FailingSource),
            Box::new(MockSink {
                plays: Arc::new(Mutex::new(Vec::new())),
            }),
        )
        .unwrap();

        let result = runner.run().await;
        assert!(matches!(result, Err(CaptureError::DeviceUnavailable(_))));
    }

    #[tokio::test]
    async fn test_invalid_config_fails_at_construction() {
        let mut cfg = config();
        cfg.vad.silence_duration_ms = 0;
        let client = Arc::new(MockClient {
            response: Ok(ConversationReply::Empty),
            delay: Duration::ZERO,
            calls: Arc::new(AtomicUsize::new(0)),
        });
        let result = TurnRunner::new(
            cfg,
            client,
            Box::new(ScriptedSource::new(Vec::new())),
            Box::new(MockSink {
                plays: Arc::new(Mutex::new(Vec::new())),
            }),
        );
        assert!(matches!(result, Err(ConfigError::ZeroSilenceDuration)));
    }
}

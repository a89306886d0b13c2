//! AuraCall demo - drive the turn engine from a WAV file against the
//! conversation backend.
//!
//! Replays a recorded session through the full engine: segmentation, backend
//! submission and response "playback" into ./responses/. The backend
//! endpoint comes from AURA_API_URL and the user id from AURA_USER_ID.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use auracall::capture::WavFileSource;
use auracall::playback::FileResponseSink;
use auracall::segmenter::SegmenterConfig;
use auracall::{EngineConfig, EngineEvent, HttpConversationClient, TurnRunner};

const DEFAULT_ENDPOINT: &str =
    "https://emohunter-api-6106408799.us-central1.run.app/api/v1/voice_conversation";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    info!("Starting auracall demo");

    let wav_path = std::env::args()
        .nth(1)
        .context("usage: auracall <session.wav>")?;
    let endpoint =
        std::env::var("AURA_API_URL").unwrap_or_else(|_| DEFAULT_ENDPOINT.to_string());
    let user_id = std::env::var("AURA_USER_ID").unwrap_or_else(|_| "user_001".to_string());

    let config = EngineConfig {
        vad: SegmenterConfig {
            speech_threshold_db: -40.0,
            silence_duration_ms: 1500,
            min_speech_duration_ms: 500,
            max_speech_duration_ms: 10_000,
        },
        network_timeout_ms: 30_000,
        retry_backoff_ms: 500,
        user_id,
    };

    let capture = WavFileSource::load(&wav_path, true)
        .with_context(|| format!("failed to load {wav_path}"))?;
    let sink = FileResponseSink::new("responses").context("failed to create responses dir")?;
    let client = Arc::new(HttpConversationClient::new(endpoint));

    let (runner, handle) = TurnRunner::new(config, client, Box::new(capture), Box::new(sink))?;

    // Narrate engine activity on stdout while the call runs.
    let mut events = handle.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                EngineEvent::StateChanged(state) => {
                    info!("state -> {:?}", state);
                }
                EngineEvent::SpeechStarted { at_ms } => {
                    println!("🎤 speech detected at {}ms", at_ms);
                }
                EngineEvent::UtteranceCaptured {
                    duration_ms,
                    end_reason,
                } => {
                    println!("🎯 utterance sealed: {}ms ({:?})", duration_ms, end_reason);
                }
                EngineEvent::UtteranceDiscarded { duration_ms } => {
                    println!("🗑  discarded {}ms of noise", duration_ms);
                }
                EngineEvent::TurnCompleted(turn) => {
                    println!("\n========== TURN REPORT ==========");
                    println!("Utterance:  {}ms", turn.utterance.duration_ms());
                    println!("Latency:    {}ms", turn.network_latency_ms);
                    match &turn.response_audio {
                        Some(audio) => println!("Response:   {} KB", audio.len() / 1024),
                        None => println!("Response:   <none>"),
                    }
                    if let Some(error) = turn.error {
                        println!("Error:      {:?}", error);
                    }
                    println!("=================================\n");
                }
                EngineEvent::TurnError { kind, detail } => {
                    println!("⚠️  turn failed ({:?}): {}", kind, detail);
                }
            }
        }
    });

    // Ctrl+C ends the call.
    let stop_handle = handle.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl+C received, ending call");
            stop_handle.stop();
        }
    });

    println!("Replaying {wav_path} through the engine. Press Ctrl+C to end the call.\n");
    let history = runner.run().await?;

    println!("\n########## CALL SUMMARY ##########");
    println!("Turns completed: {}", history.len());
    let failed = history.iter().filter(|t| t.error.is_some()).count();
    if failed > 0 {
        println!("Failed turns:    {}", failed);
    }
    if !history.is_empty() {
        let total: u64 = history.iter().map(|t| t.network_latency_ms).sum();
        println!("Average latency: {}ms", total / history.len() as u64);
    }
    println!("##################################");

    Ok(())
}

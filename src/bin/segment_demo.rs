/// Offline segmentation demo
/// Shows how a recorded session is broken into utterances by the VAD.
use std::path::Path;

use anyhow::{Context, Result};
use hound::{SampleFormat, WavSpec, WavWriter};

use auracall::audio::{u8_to_i16_slice, AudioBlock};
use auracall::segmenter::{SegmenterConfig, SegmenterEvent, SpeechSegmenter};
use auracall::volume;

/// Save PCM audio bytes to a WAV file.
fn save_pcm_to_wav(pcm: &[u8], filename: &str) -> Result<()> {
    let spec = WavSpec {
        channels: 1,
        sample_rate: 16000,
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    };
    let mut writer = WavWriter::create(filename, spec)?;
    for sample in u8_to_i16_slice(pcm) {
        writer.write_sample(sample)?;
    }
    writer.finalize()?;
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let wav_path = std::env::args()
        .nth(1)
        .context("usage: segment_demo <session.wav>")?;

    println!("🎤 Offline Segmentation Demo");
    println!("Feeds {wav_path} through the VAD and reports each utterance.");
    println!();

    let mut reader = hound::WavReader::open(Path::new(&wav_path))
        .with_context(|| format!("failed to open {wav_path}"))?;
    let spec = reader.spec();
    anyhow::ensure!(
        spec.channels == 1 && spec.bits_per_sample == 16,
        "expected mono 16-bit PCM, got {} channels at {} bits",
        spec.channels,
        spec.bits_per_sample
    );
    let samples: Vec<i16> = reader.samples::<i16>().collect::<Result<_, _>>()?;

    let config = SegmenterConfig {
        speech_threshold_db: -40.0,
        silence_duration_ms: 600,
        min_speech_duration_ms: 300,
        max_speech_duration_ms: 8000,
    };
    let mut segmenter = SpeechSegmenter::new(config);

    let block_len = spec.sample_rate as usize / 10; // 100ms blocks
    let mut segments_completed = 0;
    let mut discarded = 0;

    for (index, chunk) in samples.chunks(block_len).enumerate() {
        let timestamp_ms = index as u64 * 100;
        let block = AudioBlock::new(chunk.to_vec(), spec.sample_rate, timestamp_ms);
        let sample = volume::estimate(&block);

        match segmenter.push(sample, &block) {
            Some(SegmenterEvent::SpeechStarted { at_ms }) => {
                println!("🔊 speech opened at {}ms", at_ms);
            }
            Some(SegmenterEvent::UtteranceDiscarded { duration_ms }) => {
                discarded += 1;
                println!("🗑  {}ms segment discarded as noise", duration_ms);
            }
            Some(SegmenterEvent::UtteranceReady(utterance)) => {
                segments_completed += 1;
                let duration_sec = utterance.duration_ms() as f32 / 1000.0;

                println!(
                    "\n🎯 SEGMENT #{} - closed by {:?}",
                    segments_completed, utterance.end_reason
                );
                println!(
                    "⏱  {}ms - {}ms ({:.2}s, {} KB)",
                    utterance.started_at_ms,
                    utterance.ended_at_ms,
                    duration_sec,
                    utterance.audio.len() / 1024
                );

                let filename = format!(
                    "demo_segment_{:03}_{:.1}s.wav",
                    segments_completed, duration_sec
                );
                match save_pcm_to_wav(&utterance.audio, &filename) {
                    Ok(_) => println!("💾 Saved: {}", filename),
                    Err(e) => eprintln!("❌ Save error: {}", e),
                }
                println!("{}", "─".repeat(60));
            }
            None => {}
        }
    }

    // Flush whatever is still open at end of file.
    if let Some(SegmenterEvent::UtteranceReady(utterance)) = segmenter.stop() {
        segments_completed += 1;
        println!(
            "\n🎯 SEGMENT #{} - closed by {:?} at end of file ({}ms)",
            segments_completed,
            utterance.end_reason,
            utterance.duration_ms()
        );
    }

    println!();
    println!(
        "Done: {} segments, {} discarded",
        segments_completed, discarded
    );
    Ok(())
}

//! Audio capture abstraction and a WAV-file source.
//!
//! The engine consumes audio through a push channel: a capture source sends
//! timestamped [`AudioBlock`]s into an `mpsc` sender handed to it at start.
//! Each time the engine re-arms capture it passes a fresh channel, so blocks
//! from a stopped source can only land in a dead channel and never leak into
//! a later turn's buffer.

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{debug, info};

use crate::audio::AudioBlock;

/// Capture failures are fatal to the session: the engine tears down and
/// surfaces them to the embedding application.
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("audio device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed audio file: {0}")]
    BadFile(String),
}

/// A push-based source of audio blocks.
pub trait AudioCaptureSource: Send {
    /// Begin pushing blocks into `tx`. Called again with a fresh channel
    /// each time the engine resumes listening.
    fn start(&mut self, tx: UnboundedSender<AudioBlock>) -> Result<(), CaptureError>;

    /// Stop pushing. Late blocks from a lagging producer are tolerated; the
    /// engine has already dropped its receiver.
    fn stop(&mut self);
}

/// Samples per block pushed by [`WavFileSource`] (100ms worth).
const BLOCK_MS: u64 = 100;

/// Replays a mono 16-bit WAV file as a capture source.
///
/// The read cursor survives stop/start cycles, so the file behaves like one
/// continuous session: capture suspended during playback resumes where it
/// left off. With `realtime` set, blocks are paced at their natural rate;
/// otherwise they are pushed as fast as the receiver drains them.
pub struct WavFileSource {
    samples: Arc<Vec<i16>>,
    sample_rate: u32,
    cursor: Arc<AtomicUsize>,
    realtime: bool,
    stop_flag: Arc<AtomicBool>,
    task: Option<JoinHandle<()>>,
}

impl WavFileSource {
    pub fn load(path: impl AsRef<Path>, realtime: bool) -> Result<Self, CaptureError> {
        let path = path.as_ref();
        let mut reader =
            hound::WavReader::open(path).map_err(|e| CaptureError::BadFile(e.to_string()))?;
        let spec = reader.spec();
        if spec.channels != 1 || spec.bits_per_sample != 16 {
            return Err(CaptureError::BadFile(format!(
                "expected mono 16-bit PCM, got {} channels at {} bits",
                spec.channels, spec.bits_per_sample
            )));
        }

        let samples: Vec<i16> = reader
            .samples::<i16>()
            .collect::<Result<_, _>>()
            .map_err(|e| CaptureError::BadFile(e.to_string()))?;

        info!(
            path = %path.display(),
            samples = samples.len(),
            rate = spec.sample_rate,
            "loaded capture file"
        );

        Ok(Self {
            samples: Arc::new(samples),
            sample_rate: spec.sample_rate,
            cursor: Arc::new(AtomicUsize::new(0)),
            realtime,
            stop_flag: Arc::new(AtomicBool::new(false)),
            task: None,
        })
    }

    /// Whether the file has been fully consumed.
    pub fn exhausted(&self) -> bool {
        self.cursor.load(Ordering::Relaxed) >= self.samples.len()
    }
}

impl AudioCaptureSource for WavFileSource {
    fn start(&mut self, tx: UnboundedSender<AudioBlock>) -> Result<(), CaptureError> {
        self.stop();

        let samples = Arc::clone(&self.samples);
        let cursor = Arc::clone(&self.cursor);
        let stop_flag = Arc::new(AtomicBool::new(false));
        self.stop_flag = Arc::clone(&stop_flag);

        let rate = self.sample_rate;
        let realtime = self.realtime;
        let block_len = (rate as u64 * BLOCK_MS / 1000) as usize;

        self.task = Some(tokio::spawn(async move {
            let mut ticker = interval(Duration::from_millis(BLOCK_MS));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                if realtime {
                    ticker.tick().await;
                }
                if stop_flag.load(Ordering::Relaxed) {
                    break;
                }

                let start = cursor.load(Ordering::Relaxed);
                if start >= samples.len() {
                    debug!("capture file exhausted");
                    break;
                }
                let end = (start + block_len).min(samples.len());
                cursor.store(end, Ordering::Relaxed);

                let timestamp_ms = start as u64 * 1000 / rate as u64;
                let block = AudioBlock::new(samples[start..end].to_vec(), rate, timestamp_ms);
                if tx.send(block).is_err() {
                    break;
                }

                if !realtime {
                    // Let the receiver keep up instead of flooding it.
                    tokio::task::yield_now().await;
                }
            }
        }));

        Ok(())
    }

    fn stop(&mut self) {
        self.stop_flag.store(true, Ordering::Relaxed);
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;
    use std::path::PathBuf;

    fn write_test_wav(samples: &[i16], rate: u32) -> PathBuf {
        let path = std::env::temp_dir().join(format!(
            "auracall_capture_test_{}_{}.wav",
            std::process::id(),
            rand::rng().random::<u32>()
        ));
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(&path, spec).unwrap();
        for &s in samples {
            writer.write_sample(s).unwrap();
        }
        writer.finalize().unwrap();
        path
    }

    #[tokio::test]
    async fn test_wav_source_pushes_timestamped_blocks() {
        let samples: Vec<i16> = (0..4000).map(|i| (i % 100) as i16).collect();
        let path = write_test_wav(&samples, 16000);

        let mut source = WavFileSource::load(&path, false).unwrap();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        source.start(tx).unwrap();

        let mut blocks = Vec::new();
        while let Some(block) = rx.recv().await {
            blocks.push(block);
        }

        // 4000 samples at 1600 per block: two full blocks and a remainder.
        assert_eq!(blocks.len(), 3);
        assert_eq!(blocks[0].timestamp_ms, 0);
        assert_eq!(blocks[1].timestamp_ms, 100);
        assert_eq!(blocks[2].samples.len(), 800);
        assert!(source.exhausted());

        let total: usize = blocks.iter().map(|b| b.samples.len()).sum();
        assert_eq!(total, samples.len());

        std::fs::remove_file(path).ok();
    }

    #[tokio::test]
    async fn test_cursor_survives_restart() {
        // One second of audio, paced in real time so only the first block
        // or two are pushed before the source is stopped.
        let samples: Vec<i16> = vec![42; 16000];
        let path = write_test_wav(&samples, 16000);

        let mut source = WavFileSource::load(&path, true).unwrap();

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        source.start(tx).unwrap();
        let first = rx.recv().await.unwrap();
        source.stop();
        drop(rx);

        // Re-arm with a fresh channel; the file continues, not restarts.
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        source.start(tx).unwrap();
        let next = rx.recv().await.unwrap();

        assert_eq!(first.timestamp_ms, 0);
        assert!(next.timestamp_ms >= 100);
        assert!(next.timestamp_ms < 1000);

        std::fs::remove_file(path).ok();
    }

    #[test]
    fn test_stereo_file_is_rejected() {
        let path = std::env::temp_dir().join(format!(
            "auracall_stereo_test_{}.wav",
            std::process::id()
        ));
        let spec = hound::WavSpec {
            channels: 2,
            sample_rate: 16000,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(&path, spec).unwrap();
        for _ in 0..100 {
            writer.write_sample(0i16).unwrap();
            writer.write_sample(0i16).unwrap();
        }
        writer.finalize().unwrap();

        assert!(matches!(
            WavFileSource::load(&path, false),
            Err(CaptureError::BadFile(_))
        ));
        std::fs::remove_file(path).ok();
    }
}

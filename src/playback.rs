//! Audio playback abstraction and a file-backed sink.
//!
//! The engine hands response audio to a sink together with a oneshot
//! completion sender; the sink reports `true` for a clean finish and `false`
//! for a decode or device failure. Either way the engine resumes listening;
//! a corrupt response must never wedge the conversation.

use std::fs;
use std::path::PathBuf;

use thiserror::Error;
use tokio::sync::oneshot;
use tracing::info;

#[derive(Debug, Error)]
pub enum PlaybackError {
    #[error("audio output unavailable: {0}")]
    SinkUnavailable(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A sink that plays one response buffer at a time.
pub trait AudioPlaybackSink: Send {
    /// Start playing `audio`, reporting completion (or failure) on `done`.
    /// An `Err` return means playback never started; the engine treats that
    /// like a failed completion.
    fn play(&mut self, audio: Vec<u8>, done: oneshot::Sender<bool>) -> Result<(), PlaybackError>;

    /// Cut off any in-progress playback.
    fn stop(&mut self);
}

/// "Plays" responses by writing each one to a numbered file.
///
/// Used by the demo binary and anywhere a real audio device is unavailable;
/// completion is signalled as soon as the bytes are on disk.
pub struct FileResponseSink {
    dir: PathBuf,
    count: usize,
}

impl FileResponseSink {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, PlaybackError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir, count: 0 })
    }
}

impl AudioPlaybackSink for FileResponseSink {
    fn play(&mut self, audio: Vec<u8>, done: oneshot::Sender<bool>) -> Result<(), PlaybackError> {
        self.count += 1;
        let path = self.dir.join(format!("response_{:03}.mp3", self.count));
        fs::write(&path, &audio)?;
        info!(path = %path.display(), bytes = audio.len(), "saved response audio");
        let _ = done.send(true);
        Ok(())
    }

    fn stop(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_file_sink_writes_and_completes() {
        let dir = std::env::temp_dir().join(format!(
            "auracall_sink_test_{}",
            std::process::id()
        ));
        let mut sink = FileResponseSink::new(&dir).unwrap();

        let (done_tx, done_rx) = oneshot::channel();
        sink.play(vec![1, 2, 3], done_tx).unwrap();
        assert_eq!(done_rx.await, Ok(true));

        let written = fs::read(dir.join("response_001.mp3")).unwrap();
        assert_eq!(written, vec![1, 2, 3]);

        fs::remove_dir_all(dir).ok();
    }
}

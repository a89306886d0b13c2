//! Engine configuration.
//!
//! Every knob is explicit: there is no `Default` implementation, because the
//! right silence window and thresholds depend on the deployment (headset vs.
//! speakerphone) and a wrong guess here makes the whole conversation feel
//! broken. Invalid values are rejected at construction, never at runtime.

use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::segmenter::SegmenterConfig;

/// Error raised for invalid configuration at construction time.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("speech threshold must be a finite negative dBFS value, got {0}")]
    InvalidThreshold(f32),

    #[error("silence duration must be greater than zero")]
    ZeroSilenceDuration,

    #[error("max speech duration ({max} ms) must exceed min speech duration ({min} ms)")]
    SpeechDurationRange { min: u64, max: u64 },

    #[error("network timeout must be greater than zero")]
    ZeroNetworkTimeout,

    #[error("user id must not be empty")]
    EmptyUserId,
}

/// Full configuration record for one engine instance.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Voice-activity detection tuning.
    #[serde(flatten)]
    pub vad: SegmenterConfig,

    /// Client-side ceiling on one backend round trip, in milliseconds.
    pub network_timeout_ms: u64,

    /// Delay before listening resumes after a failed submission.
    pub retry_backoff_ms: u64,

    /// Identifier forwarded to the conversation backend with every turn.
    pub user_id: String,
}

impl EngineConfig {
    /// Check every field, failing fast on the first invalid one.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.vad.validate()?;
        if self.network_timeout_ms == 0 {
            return Err(ConfigError::ZeroNetworkTimeout);
        }
        if self.user_id.trim().is_empty() {
            return Err(ConfigError::EmptyUserId);
        }
        Ok(())
    }

    pub fn network_timeout(&self) -> Duration {
        Duration::from_millis(self.network_timeout_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}
